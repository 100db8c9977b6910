//! DlqWorker processor.
//!
//! Resends dead-lettered publications. A message is picked up once
//! `retry_after` has passed and while `process_count < max_retries`. A
//! successful resend deletes it; a failed one bumps `process_count` and
//! pushes `retry_after` out by `base_delay * process_count`. Messages whose
//! budget is spent stay in the table as parked.

use super::RelayError;
use crate::broker::Producer;
use crate::clock::Clock;
use crate::config::{DlqSettings, SettingsStore};
use crate::entities::dlq::retry_delay;
use crate::store::{DlqBatch, DlqStore};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DlqReport {
    pub claimed: usize,
    pub resent: usize,
    /// Failed and scheduled for another attempt.
    pub rescheduled: usize,
    /// Failed with no attempts left.
    pub parked: usize,
}

pub struct DlqWorker<S, P> {
    store: S,
    producer: P,
    clock: Arc<dyn Clock>,
}

impl<S: DlqStore, P: Producer> DlqWorker<S, P> {
    pub fn new(store: S, producer: P, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            producer,
            clock,
        }
    }

    pub async fn run(self, shutdown: CancellationToken, settings: SettingsStore<DlqSettings>) {
        let mut watcher = settings.subscribe();
        info!("DlqWorker started");

        loop {
            let current = settings.current().await;
            match self.retry_once(&current, &shutdown).await {
                Ok(report) if report.claimed > 0 => {
                    info!(
                        claimed = report.claimed,
                        resent = report.resent,
                        rescheduled = report.rescheduled,
                        parked = report.parked,
                        "Processed DLQ batch"
                    );
                }
                Ok(_) => debug!("No DLQ messages due"),
                Err(e) => error!(error = %e, "DLQ tick failed"),
            }

            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("DlqWorker received shutdown signal");
                    break;
                }

                Ok(()) = watcher.changed() => {
                    info!(version = settings.version(), "DlqWorker settings reloaded");
                }

                _ = tokio::time::sleep(current.interval) => {}
            }
        }

        info!("DlqWorker shutdown complete");
    }

    /// Resend one batch of due messages.
    pub async fn retry_once(
        &self,
        settings: &DlqSettings,
        cancel: &CancellationToken,
    ) -> Result<DlqReport, RelayError> {
        let mut batch = self
            .store
            .claim_due(self.clock.now(), settings.batch_size)
            .await?;
        let messages = batch.messages().to_vec();
        let mut report = DlqReport {
            claimed: messages.len(),
            ..Default::default()
        };

        for message in messages {
            if cancel.is_cancelled() {
                break;
            }
            match self.producer.send(cancel, &message.payload).await {
                Ok(()) => {
                    batch.delete(message.id).await?;
                    report.resent += 1;
                    info!(
                        dlq_id = message.id,
                        outbox_id = message.original_id,
                        "DLQ message resent"
                    );
                }
                Err(e) => {
                    let attempt = message.process_count + 1;
                    let failed_at = self.clock.now();
                    let retry_after = failed_at + retry_delay(settings.base_delay, attempt);
                    batch
                        .record_failure(message.id, &e.to_string(), failed_at, retry_after)
                        .await?;

                    if attempt >= message.max_retries {
                        report.parked += 1;
                        warn!(
                            dlq_id = message.id,
                            outbox_id = message.original_id,
                            attempts = attempt,
                            error = %e,
                            "DLQ message parked, retries exhausted"
                        );
                    } else {
                        report.rescheduled += 1;
                        debug!(
                            dlq_id = message.id,
                            attempt,
                            retry_after = %retry_after,
                            error = %e,
                            "DLQ resend failed"
                        );
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
    use crate::entities::dlq::NewDlqMessage;
    use crate::store::MemoryStore;
    use time::macros::datetime;
    use time::{Duration, OffsetDateTime};

    const T0: OffsetDateTime = datetime!(2026-02-01 8:00 UTC);

    struct Fixture {
        store: MemoryStore,
        broker: MemoryBroker,
        clock: ManualClock,
        worker: DlqWorker<MemoryStore, MemoryBroker>,
        settings: DlqSettings,
    }

    fn fixture() -> Fixture {
        let store = MemoryStore::new();
        let broker = MemoryBroker::new(1);
        let clock = ManualClock::new(T0);
        let worker = DlqWorker::new(store.clone(), broker.clone(), Arc::new(clock.clone()));
        Fixture {
            store,
            broker,
            clock,
            worker,
            settings: DlqSettings {
                base_delay: Duration::seconds(10),
                ..Default::default()
            },
        }
    }

    async fn dead_letter(store: &MemoryStore, max_retries: i32) -> i64 {
        store
            .insert_dlq(&NewDlqMessage {
                original_id: 7,
                payload: br#"{"n":7}"#.to_vec(),
                error: "broker unavailable".to_string(),
                attempts: 1,
                created_at: T0,
                retry_after: T0,
                max_retries,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_successful_resend_deletes() {
        let f = fixture();
        dead_letter(&f.store, 3).await;

        let report = f
            .worker
            .retry_once(&f.settings, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.resent, 1);
        assert!(f.store.dlq_messages().is_empty());
        assert_eq!(f.broker.payloads(), vec![br#"{"n":7}"#.to_vec()]);
    }

    #[tokio::test]
    async fn test_backoff_then_park() {
        let f = fixture();
        let id = dead_letter(&f.store, 2).await;
        f.broker.set_down(true);
        let cancel = CancellationToken::new();

        let report = f.worker.retry_once(&f.settings, &cancel).await.unwrap();
        assert_eq!(report.rescheduled, 1);
        let message = f.store.get_dlq_message(id).await.unwrap().unwrap();
        assert_eq!(message.process_count, 1);
        assert_eq!(message.retry_after, T0 + Duration::seconds(10));

        // not due yet
        f.clock.advance(Duration::seconds(5));
        let report = f.worker.retry_once(&f.settings, &cancel).await.unwrap();
        assert_eq!(report.claimed, 0);

        f.clock.advance(Duration::seconds(5));
        let report = f.worker.retry_once(&f.settings, &cancel).await.unwrap();
        assert_eq!(report.parked, 1);
        let message = f.store.get_dlq_message(id).await.unwrap().unwrap();
        assert_eq!(message.process_count, 2);
        assert_eq!(message.retry_after, T0 + Duration::seconds(10 + 20));

        // parked messages are never picked up again
        f.broker.set_down(false);
        f.clock.advance(Duration::hours(1));
        let report = f.worker.retry_once(&f.settings, &cancel).await.unwrap();
        assert_eq!(report.claimed, 0);
        assert_eq!(f.store.list_parked(10).await.unwrap().len(), 1);
        assert_eq!(f.broker.message_count(), 0);
    }

    #[tokio::test]
    async fn test_run_until_shutdown() {
        let f = fixture();
        dead_letter(&f.store, 3).await;
        let shutdown = CancellationToken::new();
        let settings = SettingsStore::new(DlqSettings {
            interval: std::time::Duration::from_millis(10),
            ..f.settings.clone()
        });
        let task = tokio::spawn(f.worker.run(shutdown.clone(), settings));

        for _ in 0..200 {
            if f.broker.message_count() == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        shutdown.cancel();
        task.await.unwrap();

        assert!(f.store.dlq_messages().is_empty());
    }
}
