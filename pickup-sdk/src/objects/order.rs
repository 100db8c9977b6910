//! Order status as seen by event consumers.

use serde::{Deserialize, Serialize};

/// Order status for wire payloads.
///
/// This is the DTO version without sqlx::Type.
/// For database operations, use the version in `pickup-core::entities`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    InStorage,
    GivenToClient,
    ReturnedFromClient,
    ReturnedWithoutClient,
    GivenToCourier,
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderStatus::InStorage => write!(f, "in_storage"),
            OrderStatus::GivenToClient => write!(f, "given_to_client"),
            OrderStatus::ReturnedFromClient => write!(f, "returned_from_client"),
            OrderStatus::ReturnedWithoutClient => write!(f, "returned_without_client"),
            OrderStatus::GivenToCourier => write!(f, "given_to_courier"),
        }
    }
}
