//! Domain events published to the broker.
//!
//! The JSON produced here is the broker message body:
//!
//! ```text
//! {"event_id": "...", "event_type": "order_issued", "timestamp": "...",
//!  "actor": {"type": "client", "id": 100},
//!  "order": {"id": 1, "user_id": 100, "status": "given_to_client"},
//!  "source": "pickup-point"}
//! ```
//!
//! Delivery is at-least-once, so consumers must deduplicate on `event_id`.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

use super::order::OrderStatus;

/// What happened to the order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "order_accepted")]
    Accepted,
    #[serde(rename = "order_issued")]
    Issued,
    #[serde(rename = "order_returned_by_client")]
    ReturnedByClient,
    #[serde(rename = "order_returned_to_courier")]
    ReturnedToCourier,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Accepted => "order_accepted",
            EventType::Issued => "order_issued",
            EventType::ReturnedByClient => "order_returned_by_client",
            EventType::ReturnedToCourier => "order_returned_to_courier",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who caused the transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    Client,
    PickupPoint,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    #[serde(rename = "type")]
    pub actor_type: ActorType,
    pub id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderInfo {
    pub id: i64,
    pub user_id: i64,
    pub status: OrderStatus,
}

/// An immutable record of one order transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainEvent {
    pub event_id: Uuid,
    pub event_type: EventType,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub actor: Actor,
    pub order: OrderInfo,
    pub source: String,
}

/// Errors raised while encoding or decoding a broker payload.
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("invalid event payload: {0}")]
    Json(#[from] serde_json::Error),
}

impl DomainEvent {
    /// Build a new event with a fresh time-ordered ID.
    pub fn new(
        event_type: EventType,
        timestamp: OffsetDateTime,
        actor: Actor,
        order: OrderInfo,
        source: impl Into<String>,
    ) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            event_type,
            timestamp,
            actor,
            order,
            source: source.into(),
        }
    }

    /// Serialize into the broker message body.
    pub fn to_payload(&self) -> Result<Vec<u8>, PayloadError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a broker message body.
    pub fn from_payload(payload: &[u8]) -> Result<Self, PayloadError> {
        Ok(serde_json::from_slice(payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn sample() -> DomainEvent {
        DomainEvent::new(
            EventType::ReturnedToCourier,
            datetime!(2026-03-01 12:00 UTC),
            Actor {
                actor_type: ActorType::PickupPoint,
                id: 7,
            },
            OrderInfo {
                id: 1,
                user_id: 100,
                status: OrderStatus::GivenToCourier,
            },
            "pickup-point",
        )
    }

    #[test]
    fn test_payload_shape() {
        let event = sample();
        let value: serde_json::Value =
            serde_json::from_slice(&event.to_payload().unwrap()).unwrap();

        assert_eq!(value["event_type"], "order_returned_to_courier");
        assert_eq!(value["actor"]["type"], "pickup_point");
        assert_eq!(value["actor"]["id"], 7);
        assert_eq!(value["order"]["user_id"], 100);
        assert_eq!(value["order"]["status"], "given_to_courier");
        assert_eq!(value["source"], "pickup-point");
        assert_eq!(value["timestamp"], "2026-03-01T12:00:00Z");
        assert_eq!(value["event_id"], event.event_id.to_string());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(DomainEvent::from_payload(b"not json").is_err());
    }

    #[test]
    fn test_event_ids_are_unique() {
        assert_ne!(sample().event_id, sample().event_id);
    }
}
