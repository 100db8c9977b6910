pub mod event;
pub mod order;

pub use event::{Actor, ActorType, DomainEvent, EventType, OrderInfo, PayloadError};
pub use order::OrderStatus;
