pub mod dlq;
pub mod order;
pub mod outbox;

use pickup_sdk::objects::OrderStatus as SdkOrderStatus;
use thiserror::Error;

/// Order status for database operations.
///
/// This is the sqlx::Type version. For wire payloads, see `pickup_sdk::objects::OrderStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, sqlx::Type)]
#[sqlx(rename_all = "snake_case", type_name = "order_status")]
pub enum OrderStatus {
    InStorage,
    GivenToClient,
    ReturnedFromClient,
    ReturnedWithoutClient,
    GivenToCourier,
}

/// Every legal status change. Anything not listed here is rejected.
const TRANSITIONS: &[(OrderStatus, OrderStatus)] = &[
    (OrderStatus::InStorage, OrderStatus::GivenToClient),
    (OrderStatus::InStorage, OrderStatus::ReturnedWithoutClient),
    (OrderStatus::GivenToClient, OrderStatus::ReturnedFromClient),
    (OrderStatus::ReturnedFromClient, OrderStatus::GivenToCourier),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("order status cannot move from {from} to {to}")]
pub struct InvalidTransition {
    pub from: OrderStatus,
    pub to: OrderStatus,
}

impl OrderStatus {
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        TRANSITIONS.contains(&(self, next))
    }

    /// Validate `self -> next` against the transition table.
    pub fn transition(self, next: OrderStatus) -> Result<OrderStatus, InvalidTransition> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(InvalidTransition {
                from: self,
                to: next,
            })
        }
    }

    /// The order has left the pickup point's custody.
    pub fn is_terminal(self) -> bool {
        !TRANSITIONS.iter().any(|(from, _)| *from == self)
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        SdkOrderStatus::from(*self).fmt(f)
    }
}

impl From<OrderStatus> for SdkOrderStatus {
    fn from(value: OrderStatus) -> Self {
        match value {
            OrderStatus::InStorage => SdkOrderStatus::InStorage,
            OrderStatus::GivenToClient => SdkOrderStatus::GivenToClient,
            OrderStatus::ReturnedFromClient => SdkOrderStatus::ReturnedFromClient,
            OrderStatus::ReturnedWithoutClient => SdkOrderStatus::ReturnedWithoutClient,
            OrderStatus::GivenToCourier => SdkOrderStatus::GivenToCourier,
        }
    }
}

impl From<SdkOrderStatus> for OrderStatus {
    fn from(value: SdkOrderStatus) -> Self {
        match value {
            SdkOrderStatus::InStorage => OrderStatus::InStorage,
            SdkOrderStatus::GivenToClient => OrderStatus::GivenToClient,
            SdkOrderStatus::ReturnedFromClient => OrderStatus::ReturnedFromClient,
            SdkOrderStatus::ReturnedWithoutClient => OrderStatus::ReturnedWithoutClient,
            SdkOrderStatus::GivenToCourier => OrderStatus::GivenToCourier,
        }
    }
}
