//! Message broker client.
//!
//! - [`Producer`]: synchronous publish with cancellation. Implemented by
//!   [`RestProxyProducer`] (Kafka REST proxy) and [`MemoryBroker`].
//! - [`GroupConsumer`]: consumer-group delivery on top of a [`GroupSource`],
//!   committing each record only after its handler succeeded. Sources are
//!   [`RestProxyGroupSource`] (Kafka REST proxy) and [`MemoryBroker`].
//!
//! Producers never retry internally. Retrying is the outbox relay's and the
//! DLQ worker's job.

mod consumer;
mod dedup;
mod memory;
mod rest_proxy;
mod rest_proxy_source;

pub use consumer::{ConsumerSettings, GroupConsumer, HandlerError, MessageHandler};
pub use dedup::Deduplicate;
pub use memory::MemoryBroker;
pub use rest_proxy::RestProxyProducer;
pub use rest_proxy_source::RestProxyGroupSource;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum BrokerError {
    /// Cancelled before or during the send
    #[error("operation cancelled")]
    Cancelled,

    /// HTTP request error
    #[error("HTTP request error: {0}")]
    Request(#[from] reqwest::Error),

    /// The broker answered with a non-success status
    #[error("broker rejected the request with status {status}: {body}")]
    Rejected { status: u16, body: String },

    /// The broker accepted the request but refused the record
    #[error("record rejected with error code {code}: {message}")]
    RecordRejected { code: i64, message: String },

    /// Payload is not a JSON document
    #[error("invalid payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    #[error("invalid broker endpoint: {0}")]
    InvalidEndpoint(#[from] url::ParseError),

    #[error("broker unavailable: {0}")]
    Unavailable(String),

    /// Commit from a member whose generation was superseded by a rebalance
    #[error("consumer generation {0} is no longer current")]
    StaleGeneration(u64),

    #[error("unknown partition {0}")]
    UnknownPartition(i32),
}

#[async_trait]
pub trait Producer: Send + Sync + 'static {
    /// Publish one message. Returns [`BrokerError::Cancelled`] without doing
    /// any I/O if `cancel` is already cancelled.
    async fn send(&self, cancel: &CancellationToken, payload: &[u8]) -> Result<(), BrokerError>;
}

#[async_trait]
impl<P: Producer + ?Sized> Producer for Arc<P> {
    async fn send(&self, cancel: &CancellationToken, payload: &[u8]) -> Result<(), BrokerError> {
        (**self).send(cancel, payload).await
    }
}

/// A message read from one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub partition: i32,
    pub offset: i64,
    pub payload: Vec<u8>,
}

/// Partitions owned by one group member for one generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub generation: u64,
    pub partitions: Vec<i32>,
}

/// Consumer-group side of a broker.
///
/// Membership changes bump the group generation. Commits made under an
/// older generation are refused, so a member that lost a partition cannot
/// move its offset.
#[async_trait]
pub trait GroupSource: Clone + Send + Sync + 'static {
    /// Join `group` and return the new member's ID.
    async fn join(&self, group: &str) -> Result<u64, BrokerError>;

    async fn leave(&self, group: &str, member_id: u64) -> Result<(), BrokerError>;

    async fn assignment(&self, group: &str, member_id: u64) -> Result<Assignment, BrokerError>;

    /// Watch the group's generation.
    fn generation(&self, group: &str) -> watch::Receiver<u64>;

    /// Next offset to read for `partition`. `0` if nothing was committed.
    async fn committed(&self, group: &str, partition: i32) -> Result<i64, BrokerError>;

    /// Record that every offset below `next_offset` has been handled.
    async fn commit(
        &self,
        group: &str,
        generation: u64,
        partition: i32,
        next_offset: i64,
    ) -> Result<(), BrokerError>;

    /// Up to `max` records starting at `offset`. Waits until at least one
    /// is available.
    async fn fetch(&self, partition: i32, offset: i64, max: usize)
    -> Result<Vec<Record>, BrokerError>;
}
