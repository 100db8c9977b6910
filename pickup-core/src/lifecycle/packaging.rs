//! Package types and the surcharges they add to an order's price.
//!
//! A package code names one rule (`box`) or several joined with `+`
//! (`bag+film`). Every component must be a known rule, no component may
//! repeat, and at most one rigid container may appear in the combination.

use super::LifecycleError;
use rust_decimal::Decimal;
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PackageRule {
    pub code: String,
    /// Heaviest order this package can hold. `None` means no limit.
    #[serde(default)]
    pub max_weight: Option<Decimal>,
    pub surcharge: Decimal,
    /// Rigid containers (bag, box) cannot be combined with each other.
    #[serde(default)]
    pub rigid: bool,
}

impl PackageRule {
    fn new(code: &str, max_weight: Option<Decimal>, surcharge: Decimal, rigid: bool) -> Self {
        Self {
            code: code.to_string(),
            max_weight,
            surcharge,
            rigid,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PackagingPolicy {
    pub rules: Vec<PackageRule>,
}

impl Default for PackagingPolicy {
    fn default() -> Self {
        Self {
            rules: vec![
                PackageRule::new("bag", Some(Decimal::from(10)), Decimal::from(5), true),
                PackageRule::new("box", Some(Decimal::from(30)), Decimal::from(20), true),
                PackageRule::new("film", None, Decimal::from(1), false),
            ],
        }
    }
}

impl PackagingPolicy {
    fn rule(&self, code: &str) -> Option<&PackageRule> {
        self.rules.iter().find(|r| r.code == code)
    }

    /// Resolve a package code into its rules.
    pub fn resolve(&self, package_code: &str) -> Result<Vec<&PackageRule>, LifecycleError> {
        let mut resolved: Vec<&PackageRule> = Vec::new();
        for component in package_code.split('+').map(str::trim) {
            let rule = self.rule(component).ok_or_else(|| {
                LifecycleError::Validation(format!("unknown package type: {package_code:?}"))
            })?;
            if resolved.iter().any(|r| r.code == rule.code) {
                return Err(LifecycleError::Validation(format!(
                    "package type {component} repeated in {package_code:?}"
                )));
            }
            resolved.push(rule);
        }
        if resolved.iter().filter(|r| r.rigid).count() > 1 {
            return Err(LifecycleError::Validation(format!(
                "package {package_code:?} combines more than one container"
            )));
        }
        Ok(resolved)
    }

    /// The price to charge for an order of `weight` packed as `package_code`.
    pub fn total_price(
        &self,
        package_code: &str,
        weight: Decimal,
        price: Decimal,
    ) -> Result<Decimal, LifecycleError> {
        let mut total = price;
        for rule in self.resolve(package_code)? {
            if let Some(max) = rule.max_weight
                && weight > max
            {
                return Err(LifecycleError::WeightTooHeavy {
                    package: rule.code.clone(),
                    weight,
                    max,
                });
            }
            total += rule.surcharge;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(v: i64) -> Decimal {
        Decimal::from(v)
    }

    #[test]
    fn test_single_package_surcharge() {
        let policy = PackagingPolicy::default();
        assert_eq!(policy.total_price("bag", d(5), d(100)).unwrap(), d(105));
        assert_eq!(policy.total_price("box", d(30), d(100)).unwrap(), d(120));
        assert_eq!(policy.total_price("film", d(500), d(100)).unwrap(), d(101));
    }

    #[test]
    fn test_composite_package() {
        let policy = PackagingPolicy::default();
        assert_eq!(policy.total_price("bag+film", d(5), d(100)).unwrap(), d(106));
        assert!(matches!(
            policy.total_price("bag+box", d(5), d(100)),
            Err(LifecycleError::Validation(_))
        ));
        assert!(matches!(
            policy.total_price("film+film", d(5), d(100)),
            Err(LifecycleError::Validation(_))
        ));
    }

    #[test]
    fn test_weight_limit() {
        let policy = PackagingPolicy::default();
        let err = policy.total_price("bag+film", d(11), d(100)).unwrap_err();
        assert!(matches!(err, LifecycleError::WeightTooHeavy { ref package, .. } if package == "bag"));
    }

    #[test]
    fn test_unknown_package() {
        let policy = PackagingPolicy::default();
        assert!(matches!(
            policy.total_price("crate", d(1), d(1)),
            Err(LifecycleError::Validation(_))
        ));
        assert!(matches!(
            policy.total_price("", d(1), d(1)),
            Err(LifecycleError::Validation(_))
        ));
    }

    #[test]
    fn test_policy_from_config() {
        let policy: PackagingPolicy = serde_json::from_value(serde_json::json!({
            "rules": [
                {"code": "crate", "max_weight": "100", "surcharge": "50", "rigid": true},
                {"code": "tape", "surcharge": "0.5"}
            ]
        }))
        .unwrap();
        assert_eq!(
            policy.total_price("crate+tape", d(80), d(10)).unwrap(),
            Decimal::new(605, 1)
        );
    }
}
