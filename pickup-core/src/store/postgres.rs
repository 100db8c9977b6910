//! Postgres-backed stores.

use super::{
    DlqBatch, DlqStore, OrderStore, OrderTx, OutboxBatch, OutboxStore, StoreError,
};
use crate::entities::dlq::{DlqMessage, GetDlqMessage, ListParkedDlqMessages, NewDlqMessage};
use crate::entities::order::{
    GetOrderById, ListOrderHistory, Order, OrderFilter, OrderHistory, ScrollOrders,
};
use crate::entities::outbox::{GetOutboxEvent, NewOutboxEvent, OutboxEvent};
use crate::framework::{DatabaseProcessor, TransactionProcessor};
use async_trait::async_trait;
use kanau::processor::Processor;
use sqlx::PgPool;
use time::OffsetDateTime;

/// All three stores over one connection pool.
#[derive(Clone)]
pub struct PgStore {
    db: DatabaseProcessor,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            db: DatabaseProcessor { pool },
        }
    }

    pub fn processor(&self) -> &DatabaseProcessor {
        &self.db
    }
}

fn zero_rows_is_not_found(rows: u64, entity: &'static str, id: i64) -> Result<(), StoreError> {
    if rows == 0 {
        Err(StoreError::NotFound { entity, id })
    } else {
        Ok(())
    }
}

#[async_trait]
impl OrderStore for PgStore {
    type Tx = TransactionProcessor<'static>;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        Ok(self.db.begin().await?)
    }

    async fn get_order(&self, order_id: i64) -> Result<Option<Order>, StoreError> {
        Ok(self.db.process(GetOrderById { order_id }).await?)
    }

    async fn scroll_orders(
        &self,
        filter: &OrderFilter,
        last_id: i64,
        limit: i64,
    ) -> Result<Vec<Order>, StoreError> {
        let query = ScrollOrders {
            filter: filter.clone(),
            last_id,
            limit,
        };
        Ok(self.db.process(query).await?)
    }

    async fn order_history(&self, order_id: i64) -> Result<Vec<OrderHistory>, StoreError> {
        Ok(self.db.process(ListOrderHistory { order_id }).await?)
    }
}

#[async_trait]
impl OrderTx for TransactionProcessor<'static> {
    async fn insert_order(&mut self, order: &Order) -> Result<(), StoreError> {
        Order::insert_tx(self, order).await.map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => StoreError::Conflict {
                entity: "order",
                id: order.id,
            },
            other => StoreError::Database(other),
        })
    }

    async fn update_order(&mut self, order: &Order) -> Result<(), StoreError> {
        let rows = Order::update_tx(self, order).await?;
        zero_rows_is_not_found(rows, "order", order.id)
    }

    async fn append_history(&mut self, entry: &OrderHistory) -> Result<(), StoreError> {
        Ok(OrderHistory::append_tx(self, entry).await?)
    }

    async fn insert_outbox(&mut self, event: &NewOutboxEvent) -> Result<i64, StoreError> {
        Ok(OutboxEvent::insert_tx(self, event).await?)
    }

    async fn commit(self) -> Result<(), StoreError> {
        Ok(TransactionProcessor::commit(self).await?)
    }

    async fn rollback(self) -> Result<(), StoreError> {
        Ok(TransactionProcessor::rollback(self).await?)
    }
}

/// Outbox rows locked by one relay tick.
pub struct PgOutboxBatch {
    db: TransactionProcessor<'static>,
    events: Vec<OutboxEvent>,
}

#[async_trait]
impl OutboxStore for PgStore {
    type Batch = PgOutboxBatch;

    async fn claim_created(&self, limit: i64) -> Result<PgOutboxBatch, StoreError> {
        let mut db = self.db.begin().await?;
        let events = OutboxEvent::claim_created_tx(&mut db, limit).await?;
        Ok(PgOutboxBatch { db, events })
    }

    async fn get_outbox_event(&self, id: i64) -> Result<Option<OutboxEvent>, StoreError> {
        Ok(self.db.process(GetOutboxEvent { id }).await?)
    }
}

#[async_trait]
impl OutboxBatch for PgOutboxBatch {
    fn events(&self) -> &[OutboxEvent] {
        &self.events
    }

    async fn mark_processing(&mut self, id: i64) -> Result<(), StoreError> {
        let rows = OutboxEvent::mark_processing_tx(&mut self.db, id).await?;
        zero_rows_is_not_found(rows, "created outbox event", id)
    }

    async fn mark_completed(
        &mut self,
        id: i64,
        sent_at: OffsetDateTime,
    ) -> Result<(), StoreError> {
        let rows = OutboxEvent::mark_completed_tx(&mut self.db, id, sent_at).await?;
        zero_rows_is_not_found(rows, "processing outbox event", id)
    }

    async fn mark_failed(&mut self, id: i64, error: &str) -> Result<(), StoreError> {
        let rows = OutboxEvent::mark_failed_tx(&mut self.db, id, error).await?;
        zero_rows_is_not_found(rows, "processing outbox event", id)
    }

    async fn dead_letter(&mut self, message: &NewDlqMessage) -> Result<i64, StoreError> {
        Ok(DlqMessage::insert_tx(&mut self.db, message).await?)
    }

    async fn finish(self) -> Result<(), StoreError> {
        Ok(self.db.commit().await?)
    }
}

/// DLQ rows locked by one worker tick.
pub struct PgDlqBatch {
    db: TransactionProcessor<'static>,
    messages: Vec<DlqMessage>,
}

#[async_trait]
impl DlqStore for PgStore {
    type Batch = PgDlqBatch;

    async fn insert_dlq(&self, message: &NewDlqMessage) -> Result<i64, StoreError> {
        let mut db = self.db.begin().await?;
        let id = DlqMessage::insert_tx(&mut db, message).await?;
        db.commit().await?;
        Ok(id)
    }

    async fn claim_due(&self, now: OffsetDateTime, limit: i64) -> Result<PgDlqBatch, StoreError> {
        let mut db = self.db.begin().await?;
        let messages = DlqMessage::claim_due_tx(&mut db, now, limit).await?;
        Ok(PgDlqBatch { db, messages })
    }

    async fn get_dlq_message(&self, id: i64) -> Result<Option<DlqMessage>, StoreError> {
        Ok(self.db.process(GetDlqMessage { id }).await?)
    }

    async fn list_parked(&self, limit: i64) -> Result<Vec<DlqMessage>, StoreError> {
        Ok(self.db.process(ListParkedDlqMessages { limit }).await?)
    }
}

#[async_trait]
impl DlqBatch for PgDlqBatch {
    fn messages(&self) -> &[DlqMessage] {
        &self.messages
    }

    async fn delete(&mut self, id: i64) -> Result<(), StoreError> {
        let rows = DlqMessage::delete_tx(&mut self.db, id).await?;
        zero_rows_is_not_found(rows, "dlq message", id)
    }

    async fn record_failure(
        &mut self,
        id: i64,
        error: &str,
        failed_at: OffsetDateTime,
        retry_after: OffsetDateTime,
    ) -> Result<(), StoreError> {
        let rows =
            DlqMessage::record_failure_tx(&mut self.db, id, error, failed_at, retry_after).await?;
        zero_rows_is_not_found(rows, "dlq message", id)
    }

    async fn finish(self) -> Result<(), StoreError> {
        Ok(self.db.commit().await?)
    }
}
