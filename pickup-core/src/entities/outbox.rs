use crate::framework::{DatabaseProcessor, TransactionProcessor};
use kanau::processor::Processor;
use thiserror::Error;
use time::OffsetDateTime;

/// Delivery state of an outbox row.
///
/// Only moves forward: `Created -> Processing -> {Completed, Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, sqlx::Type)]
#[sqlx(rename_all = "UPPERCASE", type_name = "outbox_status")]
pub enum OutboxStatus {
    Created,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("outbox status cannot move from {from:?} to {to:?}")]
pub struct InvalidOutboxTransition {
    pub from: OutboxStatus,
    pub to: OutboxStatus,
}

impl OutboxStatus {
    pub fn can_advance_to(self, next: OutboxStatus) -> bool {
        matches!(
            (self, next),
            (OutboxStatus::Created, OutboxStatus::Processing)
                | (OutboxStatus::Processing, OutboxStatus::Completed)
                | (OutboxStatus::Processing, OutboxStatus::Failed)
        )
    }

    pub fn advance(self, next: OutboxStatus) -> Result<OutboxStatus, InvalidOutboxTransition> {
        if self.can_advance_to(next) {
            Ok(next)
        } else {
            Err(InvalidOutboxTransition {
                from: self,
                to: next,
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct OutboxEvent {
    pub id: i64,
    /// Serialized `pickup_sdk::objects::DomainEvent`.
    pub payload: Vec<u8>,
    pub status: OutboxStatus,
    pub error: Option<String>,
    pub created_at: OffsetDateTime,
    pub sent_at: Option<OffsetDateTime>,
}

/// Data for inserting a new outbox row. The ID is assigned by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOutboxEvent {
    pub payload: Vec<u8>,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
/// Get one outbox row by ID.
pub struct GetOutboxEvent {
    pub id: i64,
}

impl Processor<GetOutboxEvent> for DatabaseProcessor {
    type Output = Option<OutboxEvent>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:GetOutboxEvent")]
    async fn process(&self, query: GetOutboxEvent) -> Result<Option<OutboxEvent>, sqlx::Error> {
        sqlx::query_as::<_, OutboxEvent>(
            r#"
            SELECT id, payload, status, error, created_at, sent_at
            FROM outbox
            WHERE id = $1
            "#,
        )
        .bind(query.id)
        .fetch_optional(&self.pool)
        .await
    }
}

#[derive(Debug, Clone)]
/// Count outbox rows in one status. Used for readiness and backlog reporting.
pub struct CountOutboxByStatus {
    pub status: OutboxStatus,
}

impl Processor<CountOutboxByStatus> for DatabaseProcessor {
    type Output = i64;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:CountOutboxByStatus")]
    async fn process(&self, query: CountOutboxByStatus) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM outbox WHERE status = $1")
            .bind(query.status)
            .fetch_one(&self.pool)
            .await
    }
}

impl OutboxEvent {
    /// Insert a new row in `CREATED` within the caller's transaction.
    pub async fn insert_tx(
        db: &mut TransactionProcessor<'_>,
        event: &NewOutboxEvent,
    ) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO outbox (payload, status, created_at)
            VALUES ($1, 'CREATED', $2)
            RETURNING id
            "#,
        )
        .bind(&event.payload)
        .bind(event.created_at)
        .fetch_one(&mut *db.tx)
        .await
    }

    /// Lock up to `limit` `CREATED` rows, oldest first.
    ///
    /// Rows already locked by another relay are skipped, so concurrent relays
    /// each get a disjoint batch. The locks live until the transaction ends.
    pub async fn claim_created_tx(
        db: &mut TransactionProcessor<'_>,
        limit: i64,
    ) -> Result<Vec<OutboxEvent>, sqlx::Error> {
        sqlx::query_as::<_, OutboxEvent>(
            r#"
            SELECT id, payload, status, error, created_at, sent_at
            FROM outbox
            WHERE status = 'CREATED'
            ORDER BY created_at ASC, id ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(limit)
        .fetch_all(&mut *db.tx)
        .await
    }

    pub async fn mark_processing_tx(
        db: &mut TransactionProcessor<'_>,
        id: i64,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE outbox
            SET status = 'PROCESSING'
            WHERE id = $1 AND status = 'CREATED'
            "#,
        )
        .bind(id)
        .execute(&mut *db.tx)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn mark_completed_tx(
        db: &mut TransactionProcessor<'_>,
        id: i64,
        sent_at: OffsetDateTime,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE outbox
            SET status = 'COMPLETED', sent_at = $2, error = NULL
            WHERE id = $1 AND status = 'PROCESSING'
            "#,
        )
        .bind(id)
        .bind(sent_at)
        .execute(&mut *db.tx)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn mark_failed_tx(
        db: &mut TransactionProcessor<'_>,
        id: i64,
        error: &str,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE outbox
            SET status = 'FAILED', error = $2
            WHERE id = $1 AND status = 'PROCESSING'
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&mut *db.tx)
        .await?;
        Ok(result.rows_affected())
    }
}
