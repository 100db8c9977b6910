//! OutboxRelay processor.
//!
//! Every tick the relay:
//! - claims up to `batch_size` `CREATED` outbox rows, oldest first, skipping
//!   rows another relay holds
//! - marks each row `PROCESSING` and publishes its payload
//! - marks it `COMPLETED` on success, or `FAILED` with the error and hands a
//!   copy to the DLQ
//! - commits the whole claim at once
//!
//! A crash before the commit returns every claimed row to `CREATED`, so
//! delivery is at-least-once.

use super::RelayError;
use crate::broker::Producer;
use crate::clock::Clock;
use crate::config::{RelaySettings, SettingsStore};
use crate::entities::dlq::{NewDlqMessage, retry_delay};
use crate::store::{OutboxBatch, OutboxStore};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayReport {
    pub claimed: usize,
    pub published: usize,
    pub failed: usize,
    pub dead_lettered: usize,
}

pub struct OutboxRelay<S, P> {
    store: S,
    producer: P,
    clock: Arc<dyn Clock>,
}

impl<S: OutboxStore, P: Producer> OutboxRelay<S, P> {
    pub fn new(store: S, producer: P, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            producer,
            clock,
        }
    }

    /// Poll until `shutdown` is cancelled. Settings are re-read every tick.
    pub async fn run(self, shutdown: CancellationToken, settings: SettingsStore<RelaySettings>) {
        let mut watcher = settings.subscribe();
        info!("OutboxRelay started");

        loop {
            let current = settings.current().await;
            match self.relay_once(&current, &shutdown).await {
                Ok(report) if report.claimed > 0 => {
                    info!(
                        claimed = report.claimed,
                        published = report.published,
                        failed = report.failed,
                        dead_lettered = report.dead_lettered,
                        "Relayed outbox batch"
                    );
                }
                Ok(_) => debug!("No pending outbox events"),
                Err(e) => error!(error = %e, "Outbox relay tick failed"),
            }

            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("OutboxRelay received shutdown signal");
                    break;
                }

                Ok(()) = watcher.changed() => {
                    info!(version = settings.version(), "OutboxRelay settings reloaded");
                }

                _ = tokio::time::sleep(current.interval) => {}
            }
        }

        info!("OutboxRelay shutdown complete");
    }

    /// Claim and publish one batch.
    ///
    /// `cancel` is passed to the producer. Rows not yet attempted when it
    /// fires are left `CREATED` for the next run.
    pub async fn relay_once(
        &self,
        settings: &RelaySettings,
        cancel: &CancellationToken,
    ) -> Result<RelayReport, RelayError> {
        let mut batch = self.store.claim_created(settings.batch_size).await?;
        let events = batch.events().to_vec();
        let mut report = RelayReport {
            claimed: events.len(),
            ..Default::default()
        };

        for event in events {
            if cancel.is_cancelled() {
                break;
            }
            batch.mark_processing(event.id).await?;

            match self.producer.send(cancel, &event.payload).await {
                Ok(()) => {
                    batch.mark_completed(event.id, self.clock.now()).await?;
                    report.published += 1;
                    debug!(outbox_id = event.id, "Outbox event published");
                }
                Err(e) => {
                    let error = e.to_string();
                    warn!(outbox_id = event.id, error = %error, "Failed to publish outbox event");
                    batch.mark_failed(event.id, &error).await?;
                    report.failed += 1;

                    if settings.dead_letter_on_failure {
                        let now = self.clock.now();
                        let dlq_id = batch
                            .dead_letter(&NewDlqMessage {
                                original_id: event.id,
                                payload: event.payload,
                                error,
                                attempts: 1,
                                created_at: now,
                                retry_after: now + retry_delay(settings.dlq_base_delay, 1),
                                max_retries: settings.dlq_max_retries,
                            })
                            .await?;
                        report.dead_lettered += 1;
                        info!(outbox_id = event.id, dlq_id, "Outbox event moved to DLQ");
                    }
                }
            }
        }

        batch.finish().await?;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::clock::ManualClock;
    use crate::entities::outbox::{NewOutboxEvent, OutboxStatus};
    use crate::store::{DlqStore, MemoryStore, OrderStore, OrderTx};
    use std::time::Duration;
    use time::OffsetDateTime;
    use time::macros::datetime;

    const T0: OffsetDateTime = datetime!(2026-02-01 8:00 UTC);

    async fn seed(store: &MemoryStore, count: usize) {
        let mut tx = store.begin().await.unwrap();
        for i in 0..count {
            tx.insert_outbox(&NewOutboxEvent {
                payload: format!(r#"{{"n":{i}}}"#).into_bytes(),
                created_at: T0 + time::Duration::seconds(i as i64),
            })
            .await
            .unwrap();
        }
        tx.commit().await.unwrap();
    }

    fn relay(store: &MemoryStore, broker: &MemoryBroker) -> OutboxRelay<MemoryStore, MemoryBroker> {
        OutboxRelay::new(store.clone(), broker.clone(), Arc::new(ManualClock::new(T0)))
    }

    fn statuses(store: &MemoryStore) -> Vec<OutboxStatus> {
        store.outbox_events().iter().map(|e| e.status).collect()
    }

    #[tokio::test]
    async fn test_publishes_in_created_order() {
        let store = MemoryStore::new();
        let broker = MemoryBroker::new(1);
        seed(&store, 3).await;

        let report = relay(&store, &broker)
            .relay_once(&RelaySettings::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.published, 3);
        assert_eq!(statuses(&store), vec![OutboxStatus::Completed; 3]);
        assert!(store.outbox_events().iter().all(|e| e.sent_at == Some(T0)));
        assert_eq!(
            broker.payloads(),
            vec![
                br#"{"n":0}"#.to_vec(),
                br#"{"n":1}"#.to_vec(),
                br#"{"n":2}"#.to_vec()
            ]
        );
    }

    #[tokio::test]
    async fn test_respects_batch_size() {
        let store = MemoryStore::new();
        let broker = MemoryBroker::new(1);
        seed(&store, 5).await;
        let settings = RelaySettings {
            batch_size: 2,
            ..Default::default()
        };

        let report = relay(&store, &broker)
            .relay_once(&settings, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.claimed, 2);
        assert_eq!(broker.message_count(), 2);
    }

    #[tokio::test]
    async fn test_failures_go_to_dlq() {
        let store = MemoryStore::new();
        let broker = MemoryBroker::new(1);
        seed(&store, 2).await;
        broker.fail_next_sends(1);
        let settings = RelaySettings::default();

        let report = relay(&store, &broker)
            .relay_once(&settings, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(
            statuses(&store),
            vec![OutboxStatus::Failed, OutboxStatus::Completed]
        );
        let failed = &store.outbox_events()[0];
        assert!(failed.error.as_deref().unwrap().contains("injected"));

        let dlq = store.dlq_messages();
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq[0].original_id, failed.id);
        assert_eq!(dlq[0].payload, failed.payload);
        assert_eq!(dlq[0].attempts, 1);
        assert_eq!(dlq[0].process_count, 0);
        assert_eq!(dlq[0].max_retries, settings.dlq_max_retries);
        assert_eq!(dlq[0].retry_after, T0 + settings.dlq_base_delay);
        assert!(store.get_dlq_message(dlq[0].id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_dead_lettering_can_be_disabled() {
        let store = MemoryStore::new();
        let broker = MemoryBroker::new(1);
        seed(&store, 1).await;
        broker.set_down(true);
        let settings = RelaySettings {
            dead_letter_on_failure: false,
            ..Default::default()
        };

        relay(&store, &broker)
            .relay_once(&settings, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(statuses(&store), vec![OutboxStatus::Failed]);
        assert!(store.dlq_messages().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_relays_never_double_publish() {
        let store = MemoryStore::new();
        let broker = MemoryBroker::new(1);
        seed(&store, 10).await;
        let settings = RelaySettings {
            batch_size: 4,
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        let a = relay(&store, &broker);
        let b = relay(&store, &broker);

        loop {
            let (ra, rb) = tokio::join!(
                a.relay_once(&settings, &cancel),
                b.relay_once(&settings, &cancel)
            );
            if ra.unwrap().claimed + rb.unwrap().claimed == 0 {
                break;
            }
        }

        assert_eq!(broker.message_count(), 10);
        assert_eq!(statuses(&store), vec![OutboxStatus::Completed; 10]);
    }

    #[tokio::test]
    async fn test_cancelled_relay_leaves_rows_created() {
        let store = MemoryStore::new();
        let broker = MemoryBroker::new(1);
        seed(&store, 2).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = relay(&store, &broker)
            .relay_once(&RelaySettings::default(), &cancel)
            .await
            .unwrap();

        assert_eq!(report.published, 0);
        assert_eq!(statuses(&store), vec![OutboxStatus::Created; 2]);
    }

    #[tokio::test]
    async fn test_abandoned_claim_is_relayed_later() {
        let store = MemoryStore::new();
        let broker = MemoryBroker::new(1);
        seed(&store, 1).await;

        // a relay that dies between marking and committing
        let mut batch = store.claim_created(10).await.unwrap();
        let id = batch.events()[0].id;
        batch.mark_processing(id).await.unwrap();
        drop(batch);
        assert_eq!(statuses(&store), vec![OutboxStatus::Created]);

        let report = relay(&store, &broker)
            .relay_once(&RelaySettings::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.published, 1);
        assert_eq!(statuses(&store), vec![OutboxStatus::Completed]);
    }

    #[tokio::test]
    async fn test_run_until_shutdown() {
        let store = MemoryStore::new();
        let broker = MemoryBroker::new(1);
        let shutdown = CancellationToken::new();
        let settings = SettingsStore::new(RelaySettings {
            interval: Duration::from_millis(10),
            ..Default::default()
        });
        let task = tokio::spawn(relay(&store, &broker).run(shutdown.clone(), settings.clone()));

        seed(&store, 2).await;
        for _ in 0..200 {
            if broker.message_count() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        settings
            .update(RelaySettings {
                batch_size: 1,
                interval: Duration::from_millis(10),
                ..Default::default()
            })
            .await;

        shutdown.cancel();
        task.await.unwrap();
        assert_eq!(broker.message_count(), 2);
    }
}
