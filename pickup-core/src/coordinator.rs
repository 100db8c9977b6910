use crate::store::{OrderStore, OrderTx, StoreError};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use std::panic::AssertUnwindSafe;

/// Runs a group of writes inside one store transaction.
///
/// The closure receives the open transaction. On `Ok` the transaction is
/// committed; on `Err` or panic it is rolled back first and the failure is
/// passed on. Nothing the closure wrote is visible unless `run_atomic`
/// returns `Ok`.
#[derive(Clone)]
pub struct TransactionCoordinator<S> {
    store: S,
}

impl<S: OrderStore> TransactionCoordinator<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub async fn run_atomic<T, E, F>(&self, f: F) -> Result<T, E>
    where
        T: Send,
        E: From<StoreError> + Send,
        F: for<'t> FnOnce(&'t mut S::Tx) -> BoxFuture<'t, Result<T, E>> + Send,
    {
        let mut tx = self.store.begin().await?;
        let result = AssertUnwindSafe(f(&mut tx)).catch_unwind().await;
        match result {
            Ok(Ok(value)) => {
                tx.commit().await?;
                Ok(value)
            }
            Ok(Err(e)) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!(error = %rollback_err, "Rollback failed");
                }
                Err(e)
            }
            Err(payload) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!(error = %rollback_err, "Rollback after panic failed");
                }
                std::panic::resume_unwind(payload)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::OrderStatus;
    use crate::entities::order::Order;
    use crate::entities::outbox::NewOutboxEvent;
    use crate::store::{MemoryFaults, MemoryStore};
    use rust_decimal::Decimal;
    use time::macros::datetime;

    fn order() -> Order {
        let t = datetime!(2026-01-01 0:00 UTC);
        Order {
            id: 1,
            receiver_id: 7,
            status: OrderStatus::InStorage,
            storage_until: t,
            accept_time: t,
            last_update_time: t,
            package_code: "film".to_string(),
            weight: Decimal::ONE,
            price: Decimal::ONE,
        }
    }

    fn outbox() -> NewOutboxEvent {
        NewOutboxEvent {
            payload: b"{}".to_vec(),
            created_at: datetime!(2026-01-01 0:00 UTC),
        }
    }

    fn explode() -> Result<(), StoreError> {
        panic!("writer crashed")
    }

    #[tokio::test]
    async fn test_commit_on_success() {
        let store = MemoryStore::new();
        let coordinator = TransactionCoordinator::new(store.clone());
        let order = order();

        let outbox_id = coordinator
            .run_atomic(|tx| {
                Box::pin(async move {
                    tx.insert_order(&order).await?;
                    tx.append_history(&order.history_entry()).await?;
                    tx.insert_outbox(&outbox()).await
                })
            })
            .await
            .unwrap();

        assert_eq!(outbox_id, 1);
        assert_eq!(store.order_count(), 1);
        assert_eq!(store.order_history(1).await.unwrap().len(), 1);
        assert_eq!(store.outbox_events().len(), 1);
    }

    #[tokio::test]
    async fn test_rollback_on_error() {
        let store = MemoryStore::new();
        store.inject(MemoryFaults {
            fail_history_appends: 1,
            ..Default::default()
        });
        let coordinator = TransactionCoordinator::new(store.clone());
        let order = order();

        let err = coordinator
            .run_atomic(|tx| {
                Box::pin(async move {
                    tx.insert_order(&order).await?;
                    tx.append_history(&order.history_entry()).await?;
                    tx.insert_outbox(&outbox()).await
                })
            })
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::Unavailable(_)));
        assert_eq!(store.order_count(), 0);
        assert!(store.outbox_events().is_empty());
    }

    #[tokio::test]
    async fn test_rollback_on_panic() {
        let store = MemoryStore::new();
        let coordinator = TransactionCoordinator::new(store.clone());
        let order = order();

        let result = AssertUnwindSafe(coordinator.run_atomic(|tx| {
            Box::pin(async move {
                tx.insert_order(&order).await?;
                explode()
            })
        }))
        .catch_unwind()
        .await;

        assert!(result.is_err());
        assert_eq!(store.order_count(), 0);
    }
}
