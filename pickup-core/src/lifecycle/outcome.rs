use super::LifecycleError;

/// One order a bulk operation could not move.
#[derive(Debug)]
pub struct FailedItem {
    pub order_id: i64,
    pub reason: LifecycleError,
}

/// Result of a bulk operation. Successes are already committed, whatever
/// happened to the other IDs.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub succeeded: Vec<i64>,
    pub failed: Vec<FailedItem>,
}

impl BatchOutcome {
    pub fn record(&mut self, order_id: i64, result: Result<(), LifecycleError>) {
        match result {
            Ok(()) => self.succeeded.push(order_id),
            Err(reason) => self.failed.push(FailedItem { order_id, reason }),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn failed_ids(&self) -> Vec<i64> {
        self.failed.iter().map(|f| f.order_id).collect()
    }
}
