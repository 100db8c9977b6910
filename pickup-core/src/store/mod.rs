//! Storage seams for the delivery pipeline.
//!
//! Three stores share one database in production:
//!
//! - [`OrderStore`]: orders and their history, plus the transaction handle
//!   ([`OrderTx`]) that also appends outbox rows.
//! - [`OutboxStore`]: claims `CREATED` outbox rows for the relay.
//! - [`DlqStore`]: holds failed publications and claims the ones due for retry.
//!
//! Claims ([`OutboxBatch`], [`DlqBatch`]) lock their rows until `finish`, so
//! replicated workers never process the same row twice.

mod memory;
mod postgres;

pub use memory::{MemoryDlqBatch, MemoryFaults, MemoryOutboxBatch, MemoryStore, MemoryTx};
pub use postgres::{PgDlqBatch, PgOutboxBatch, PgStore};

use crate::entities::dlq::{DlqMessage, NewDlqMessage};
use crate::entities::order::{Order, OrderFilter, OrderHistory};
use crate::entities::outbox::{NewOutboxEvent, OutboxEvent};
use async_trait::async_trait;
use thiserror::Error;
use time::OffsetDateTime;

/// Errors raised by any store implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error
    #[error("database error: {0}")]
    Database(sqlx::Error),

    /// Row to update or delete does not exist
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    /// Row to insert already exists
    #[error("{entity} {id} already exists")]
    Conflict { entity: &'static str, id: i64 },

    /// Store refused the operation (in-memory fault injection)
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Database(e)
    }
}

/// Read side of the order store, and the entry point for writes.
#[async_trait]
pub trait OrderStore: Clone + Send + Sync + 'static {
    type Tx: OrderTx;

    async fn begin(&self) -> Result<Self::Tx, StoreError>;

    async fn get_order(&self, order_id: i64) -> Result<Option<Order>, StoreError>;

    /// Up to `limit` orders with `id > last_id` matching `filter`, ascending.
    async fn scroll_orders(
        &self,
        filter: &OrderFilter,
        last_id: i64,
        limit: i64,
    ) -> Result<Vec<Order>, StoreError>;

    async fn order_history(&self, order_id: i64) -> Result<Vec<OrderHistory>, StoreError>;
}

/// One open transaction. Nothing is visible to readers until `commit`.
#[async_trait]
pub trait OrderTx: Send {
    /// Fails with [`StoreError::Conflict`] if the order ID is taken.
    async fn insert_order(&mut self, order: &Order) -> Result<(), StoreError>;

    /// Fails with [`StoreError::NotFound`] if no row was updated.
    async fn update_order(&mut self, order: &Order) -> Result<(), StoreError>;

    async fn append_history(&mut self, entry: &OrderHistory) -> Result<(), StoreError>;

    /// Returns the ID assigned to the new outbox row.
    async fn insert_outbox(&mut self, event: &NewOutboxEvent) -> Result<i64, StoreError>;

    async fn commit(self) -> Result<(), StoreError>;

    async fn rollback(self) -> Result<(), StoreError>;
}

#[async_trait]
pub trait OutboxStore: Clone + Send + Sync + 'static {
    type Batch: OutboxBatch;

    /// Claim up to `limit` `CREATED` rows, oldest first, skipping rows held
    /// by other claims.
    async fn claim_created(&self, limit: i64) -> Result<Self::Batch, StoreError>;

    async fn get_outbox_event(&self, id: i64) -> Result<Option<OutboxEvent>, StoreError>;
}

/// Claimed outbox rows. Status updates and DLQ hand-offs made through the
/// batch become durable on [`finish`](OutboxBatch::finish).
#[async_trait]
pub trait OutboxBatch: Send {
    fn events(&self) -> &[OutboxEvent];

    async fn mark_processing(&mut self, id: i64) -> Result<(), StoreError>;

    async fn mark_completed(&mut self, id: i64, sent_at: OffsetDateTime)
    -> Result<(), StoreError>;

    async fn mark_failed(&mut self, id: i64, error: &str) -> Result<(), StoreError>;

    async fn dead_letter(&mut self, message: &NewDlqMessage) -> Result<i64, StoreError>;

    async fn finish(self) -> Result<(), StoreError>;
}

#[async_trait]
pub trait DlqStore: Clone + Send + Sync + 'static {
    type Batch: DlqBatch;

    async fn insert_dlq(&self, message: &NewDlqMessage) -> Result<i64, StoreError>;

    /// Claim up to `limit` messages with `process_count < max_retries` and
    /// `retry_after <= now`, skipping rows held by other claims.
    async fn claim_due(&self, now: OffsetDateTime, limit: i64) -> Result<Self::Batch, StoreError>;

    async fn get_dlq_message(&self, id: i64) -> Result<Option<DlqMessage>, StoreError>;

    /// Exhausted messages, most recently failed first.
    async fn list_parked(&self, limit: i64) -> Result<Vec<DlqMessage>, StoreError>;
}

#[async_trait]
pub trait DlqBatch: Send {
    fn messages(&self) -> &[DlqMessage];

    async fn delete(&mut self, id: i64) -> Result<(), StoreError>;

    async fn record_failure(
        &mut self,
        id: i64,
        error: &str,
        failed_at: OffsetDateTime,
        retry_after: OffsetDateTime,
    ) -> Result<(), StoreError>;

    async fn finish(self) -> Result<(), StoreError>;
}
