use crate::framework::{DatabaseProcessor, TransactionProcessor};
use kanau::processor::Processor;
use time::{Duration, OffsetDateTime};

/// A publication the relay gave up on, waiting for a resend.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct DlqMessage {
    pub id: i64,
    /// The outbox row this message came from.
    pub original_id: i64,
    pub payload: Vec<u8>,
    pub error: String,
    /// Publish attempts made by the relay before the hand-off.
    pub attempts: i32,
    pub created_at: OffsetDateTime,
    pub failed_at: OffsetDateTime,
    pub retry_after: OffsetDateTime,
    /// Failed resends made by the DLQ worker.
    pub process_count: i32,
    pub max_retries: i32,
}

impl DlqMessage {
    pub fn is_retry_eligible(&self, now: OffsetDateTime) -> bool {
        self.process_count < self.max_retries && now >= self.retry_after
    }

    /// Retry budget exhausted; the message waits for manual intervention.
    pub fn is_parked(&self) -> bool {
        self.process_count >= self.max_retries
    }
}

/// Data for inserting a new DLQ row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDlqMessage {
    pub original_id: i64,
    pub payload: Vec<u8>,
    pub error: String,
    pub attempts: i32,
    pub created_at: OffsetDateTime,
    pub retry_after: OffsetDateTime,
    pub max_retries: i32,
}

/// Longest wait between two resends.
pub const MAX_RETRY_DELAY: Duration = Duration::days(30);

/// Linear backoff: `base * attempt`, capped at [`MAX_RETRY_DELAY`].
pub fn retry_delay(base: Duration, attempt: i32) -> Duration {
    base.checked_mul(attempt.max(1))
        .map_or(MAX_RETRY_DELAY, |delay| delay.min(MAX_RETRY_DELAY))
}

#[derive(Debug, Clone)]
/// Get one DLQ row by ID.
pub struct GetDlqMessage {
    pub id: i64,
}

impl Processor<GetDlqMessage> for DatabaseProcessor {
    type Output = Option<DlqMessage>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:GetDlqMessage")]
    async fn process(&self, query: GetDlqMessage) -> Result<Option<DlqMessage>, sqlx::Error> {
        sqlx::query_as::<_, DlqMessage>(
            r#"
            SELECT id, original_id, payload, error, attempts, created_at,
                   failed_at, retry_after, process_count, max_retries
            FROM dlq
            WHERE id = $1
            "#,
        )
        .bind(query.id)
        .fetch_optional(&self.pool)
        .await
    }
}

#[derive(Debug, Clone)]
/// Messages whose retry budget is exhausted, most recently failed first.
pub struct ListParkedDlqMessages {
    pub limit: i64,
}

impl Processor<ListParkedDlqMessages> for DatabaseProcessor {
    type Output = Vec<DlqMessage>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:ListParkedDlqMessages")]
    async fn process(&self, query: ListParkedDlqMessages) -> Result<Vec<DlqMessage>, sqlx::Error> {
        sqlx::query_as::<_, DlqMessage>(
            r#"
            SELECT id, original_id, payload, error, attempts, created_at,
                   failed_at, retry_after, process_count, max_retries
            FROM dlq
            WHERE process_count >= max_retries
            ORDER BY failed_at DESC, id DESC
            LIMIT $1
            "#,
        )
        .bind(query.limit)
        .fetch_all(&self.pool)
        .await
    }
}

impl DlqMessage {
    pub async fn insert_tx(
        db: &mut TransactionProcessor<'_>,
        message: &NewDlqMessage,
    ) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO dlq
            (original_id, payload, error, attempts, created_at, failed_at, retry_after, process_count, max_retries)
            VALUES ($1, $2, $3, $4, $5, $5, $6, 0, $7)
            RETURNING id
            "#,
        )
        .bind(message.original_id)
        .bind(&message.payload)
        .bind(&message.error)
        .bind(message.attempts)
        .bind(message.created_at)
        .bind(message.retry_after)
        .bind(message.max_retries)
        .fetch_one(&mut *db.tx)
        .await
    }

    /// Lock up to `limit` retry-eligible messages, skipping rows another
    /// worker holds.
    pub async fn claim_due_tx(
        db: &mut TransactionProcessor<'_>,
        now: OffsetDateTime,
        limit: i64,
    ) -> Result<Vec<DlqMessage>, sqlx::Error> {
        sqlx::query_as::<_, DlqMessage>(
            r#"
            SELECT id, original_id, payload, error, attempts, created_at,
                   failed_at, retry_after, process_count, max_retries
            FROM dlq
            WHERE process_count < max_retries
              AND retry_after <= $1
            ORDER BY retry_after ASC, id ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&mut *db.tx)
        .await
    }

    pub async fn delete_tx(db: &mut TransactionProcessor<'_>, id: i64) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM dlq WHERE id = $1")
            .bind(id)
            .execute(&mut *db.tx)
            .await?;
        Ok(result.rows_affected())
    }

    /// Count one more failed resend and push the next attempt out.
    pub async fn record_failure_tx(
        db: &mut TransactionProcessor<'_>,
        id: i64,
        error: &str,
        failed_at: OffsetDateTime,
        retry_after: OffsetDateTime,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE dlq
            SET process_count = process_count + 1,
                error = $2,
                failed_at = $3,
                retry_after = $4
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(failed_at)
        .bind(retry_after)
        .execute(&mut *db.tx)
        .await?;
        Ok(result.rows_affected())
    }
}
