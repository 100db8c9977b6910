use crate::entities::InvalidTransition;
use crate::store::StoreError;
use rust_decimal::Decimal;
use thiserror::Error;

/// Coarse classification of [`LifecycleError`], for transport adapters that
/// map errors to status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Precondition,
    Infrastructure,
}

/// Errors returned by the order lifecycle operations.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Malformed input
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("order {0} not found")]
    NotFound(i64),

    #[error("order {0} already exists")]
    AlreadyExists(i64),

    #[error("order {0} is already given to the client")]
    AlreadyGiven(i64),

    #[error("order {0} is still in storage")]
    AlreadyInStorage(i64),

    #[error("order {order_id} belongs to a different receiver")]
    BelongsToDifferentReceiver { order_id: i64 },

    #[error("storage period of order {0} has expired")]
    StorageExpired(i64),

    #[error("storage period of order {0} has not expired yet")]
    StorageNotExpired(i64),

    #[error("return period of order {0} has expired")]
    ReturnPeriodExpired(i64),

    /// The order was returned by the client and can no longer be issued.
    #[error("order {0} is unavailable")]
    Unavailable(i64),

    #[error("weight {weight} exceeds the {package} limit of {max}")]
    WeightTooHeavy {
        package: String,
        weight: Decimal,
        max: Decimal,
    },

    /// Status change rejected by the transition table
    #[error("order {order_id}: {source}")]
    InvalidTransition {
        order_id: i64,
        #[source]
        source: InvalidTransition,
    },

    #[error("storage error: {0}")]
    Infrastructure(#[from] StoreError),

    /// Event payload could not be encoded
    #[error("event encoding failed: {0}")]
    Encoding(#[from] pickup_sdk::objects::PayloadError),
}

impl LifecycleError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LifecycleError::Validation(_) | LifecycleError::InvalidTransition { .. } => {
                ErrorKind::Validation
            }
            LifecycleError::NotFound(_) => ErrorKind::NotFound,
            LifecycleError::AlreadyExists(_)
            | LifecycleError::AlreadyGiven(_)
            | LifecycleError::AlreadyInStorage(_) => ErrorKind::Conflict,
            LifecycleError::BelongsToDifferentReceiver { .. }
            | LifecycleError::StorageExpired(_)
            | LifecycleError::StorageNotExpired(_)
            | LifecycleError::ReturnPeriodExpired(_)
            | LifecycleError::Unavailable(_)
            | LifecycleError::WeightTooHeavy { .. } => ErrorKind::Precondition,
            // the row vanished between read and update
            LifecycleError::Infrastructure(StoreError::NotFound { .. }) => ErrorKind::NotFound,
            LifecycleError::Infrastructure(_) | LifecycleError::Encoding(_) => {
                ErrorKind::Infrastructure
            }
        }
    }
}
