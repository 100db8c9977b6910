use sqlx::PgPool;

/// Runs read queries directly against the pool.
///
/// Each query is a plain struct with a `kanau::processor::Processor` impl on
/// this type, see `entities`.
#[derive(Clone)]
pub struct DatabaseProcessor {
    pub pool: PgPool,
}

/// An open Postgres transaction.
///
/// Writes that must commit together (order row, history row, outbox row)
/// all go through the same `TransactionProcessor`. Dropping it without
/// calling [`commit`](TransactionProcessor::commit) rolls back.
pub struct TransactionProcessor<'b> {
    pub tx: sqlx::Transaction<'b, sqlx::Postgres>,
}

impl DatabaseProcessor {
    pub async fn begin(&self) -> Result<TransactionProcessor<'static>, sqlx::Error> {
        Ok(TransactionProcessor {
            tx: self.pool.begin().await?,
        })
    }
}

impl<'b> TransactionProcessor<'b> {
    pub async fn commit(self) -> Result<(), sqlx::Error> {
        self.tx.commit().await
    }

    pub async fn rollback(self) -> Result<(), sqlx::Error> {
        self.tx.rollback().await
    }
}
