//! Consumer-group delivery with commit-after-handle.
//!
//! A [`GroupConsumer`] joins a group, then runs one task per assigned
//! partition. Each task reads from the group's committed offset and hands
//! records to the [`MessageHandler`] one at a time. The offset only moves
//! after the handler returns `Ok`, so a crash or a handler error means the
//! record is delivered again. When the group generation changes every task
//! is stopped and the claims restart from the committed offsets.

use super::{BrokerError, GroupSource, Record};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, record: &Record) -> Result<(), HandlerError>;
}

#[async_trait]
impl<H: MessageHandler + ?Sized> MessageHandler for Arc<H> {
    async fn handle(&self, record: &Record) -> Result<(), HandlerError> {
        (**self).handle(record).await
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub group: String,
    /// Records fetched per read.
    pub max_batch: usize,
    /// Pause after a handler or broker error before re-reading.
    pub retry_backoff: Duration,
}

impl ConsumerSettings {
    pub fn new(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            max_batch: 100,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

pub struct GroupConsumer<B, H> {
    source: B,
    handler: Arc<H>,
    settings: ConsumerSettings,
}

impl<B: GroupSource, H: MessageHandler> GroupConsumer<B, H> {
    pub fn new(source: B, handler: H, settings: ConsumerSettings) -> Self {
        Self {
            source,
            handler: Arc::new(handler),
            settings,
        }
    }

    /// Consume until `shutdown` is cancelled, then leave the group.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), BrokerError> {
        let group = self.settings.group.clone();
        let member_id = self.source.join(&group).await?;
        info!(group = %group, member_id, "Consumer joined group");

        let result = self.consume(member_id, &shutdown).await;

        if let Err(e) = self.source.leave(&group, member_id).await {
            warn!(group = %group, member_id, error = %e, "Failed to leave group");
        }
        info!(group = %group, member_id, "Consumer stopped");
        result
    }

    async fn consume(&self, member_id: u64, shutdown: &CancellationToken) -> Result<(), BrokerError> {
        let group = self.settings.group.as_str();
        let mut generation_rx = self.source.generation(group);

        loop {
            let assignment = self.source.assignment(group, member_id).await?;
            let current = assignment.generation;
            info!(
                group,
                member_id,
                generation = current,
                partitions = ?assignment.partitions,
                "Claimed partitions"
            );

            let session = shutdown.child_token();
            let mut claims = JoinSet::new();
            for &partition in &assignment.partitions {
                claims.spawn(claim_partition(
                    self.source.clone(),
                    Arc::clone(&self.handler),
                    self.settings.clone(),
                    current,
                    partition,
                    session.clone(),
                ));
            }

            let rebalanced = tokio::select! {
                biased;
                _ = shutdown.cancelled() => false,
                changed = generation_rx.wait_for(|g| *g != current) => changed.is_ok(),
            };

            session.cancel();
            while let Some(joined) = claims.join_next().await {
                if let Err(e) = joined {
                    error!(group, error = %e, "Partition task failed");
                }
            }

            if !rebalanced {
                return Ok(());
            }
            info!(group, member_id, "Group rebalanced, restarting claims");
        }
    }
}

/// Sleep for `duration` unless the session ends first.
async fn pause(session: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = session.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

async fn claim_partition<B: GroupSource, H: MessageHandler>(
    source: B,
    handler: Arc<H>,
    settings: ConsumerSettings,
    generation: u64,
    partition: i32,
    session: CancellationToken,
) {
    let group = settings.group.as_str();

    'claim: loop {
        let committed = tokio::select! {
            biased;
            _ = session.cancelled() => return,
            committed = source.committed(group, partition) => committed,
        };
        let mut offset = match committed {
            Ok(offset) => offset,
            Err(e) => {
                warn!(group, partition, error = %e, "Failed to read committed offset");
                if !pause(&session, settings.retry_backoff).await {
                    return;
                }
                continue 'claim;
            }
        };

        loop {
            let fetched = tokio::select! {
                biased;
                _ = session.cancelled() => return,
                fetched = source.fetch(partition, offset, settings.max_batch) => fetched,
            };
            let records = match fetched {
                Ok(records) => records,
                Err(e) => {
                    warn!(group, partition, offset, error = %e, "Fetch failed");
                    if !pause(&session, settings.retry_backoff).await {
                        return;
                    }
                    continue 'claim;
                }
            };

            for record in records {
                if session.is_cancelled() {
                    return;
                }
                if let Err(e) = handler.handle(&record).await {
                    warn!(
                        group,
                        partition,
                        offset = record.offset,
                        error = %e,
                        "Handler failed, record will be redelivered"
                    );
                    if !pause(&session, settings.retry_backoff).await {
                        return;
                    }
                    continue 'claim;
                }
                match source
                    .commit(group, generation, partition, record.offset + 1)
                    .await
                {
                    Ok(()) => offset = record.offset + 1,
                    Err(BrokerError::StaleGeneration(_)) => {
                        debug!(group, partition, generation, "Lost partition to rebalance");
                        return;
                    }
                    Err(e) => {
                        warn!(group, partition, offset = record.offset, error = %e, "Commit failed");
                        if !pause(&session, settings.retry_backoff).await {
                            return;
                        }
                        continue 'claim;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{MemoryBroker, Producer};
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Records every payload it accepts. Fails the first `fail_first` calls.
    #[derive(Default)]
    struct Recorder {
        handled: Mutex<Vec<Vec<u8>>>,
        calls: Mutex<u32>,
        fail_first: u32,
    }

    impl Recorder {
        fn handled(&self) -> Vec<Vec<u8>> {
            self.handled.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MessageHandler for Recorder {
        async fn handle(&self, record: &Record) -> Result<(), HandlerError> {
            let call = {
                let mut calls = self.calls.lock().unwrap();
                *calls += 1;
                *calls
            };
            if call <= self.fail_first {
                return Err("downstream unavailable".into());
            }
            self.handled.lock().unwrap().push(record.payload.clone());
            Ok(())
        }
    }

    fn settings() -> ConsumerSettings {
        ConsumerSettings {
            group: "notifications".to_string(),
            max_batch: 10,
            retry_backoff: Duration::from_millis(10),
        }
    }

    async fn committed_total(broker: &MemoryBroker) -> i64 {
        let mut total = 0;
        for p in 0..broker.partition_count() as i32 {
            total += broker.committed("notifications", p).await.unwrap();
        }
        total
    }

    async fn eventually(mut check: impl AsyncFnMut() -> bool) {
        for _ in 0..500 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    async fn publish(broker: &MemoryBroker, payloads: &[&str]) {
        let cancel = CancellationToken::new();
        for p in payloads {
            broker.send(&cancel, p.as_bytes()).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_delivers_and_commits() {
        let broker = MemoryBroker::new(2);
        let recorder = Arc::new(Recorder::default());
        let shutdown = CancellationToken::new();
        let consumer = GroupConsumer::new(broker.clone(), Arc::clone(&recorder), settings());
        let task = tokio::spawn(consumer.run(shutdown.clone()));

        publish(&broker, &["a", "b", "c", "d"]).await;
        eventually(async || committed_total(&broker).await == 4).await;

        shutdown.cancel();
        task.await.unwrap().unwrap();
        let handled: HashSet<_> = recorder.handled().into_iter().collect();
        assert_eq!(handled.len(), 4);
    }

    #[tokio::test]
    async fn test_handler_error_redelivers() {
        let broker = MemoryBroker::new(1);
        let recorder = Arc::new(Recorder {
            fail_first: 2,
            ..Default::default()
        });
        let shutdown = CancellationToken::new();
        let consumer = GroupConsumer::new(broker.clone(), Arc::clone(&recorder), settings());
        let task = tokio::spawn(consumer.run(shutdown.clone()));

        publish(&broker, &["a", "b"]).await;
        eventually(async || committed_total(&broker).await == 2).await;

        shutdown.cancel();
        task.await.unwrap().unwrap();
        // nothing skipped, order kept within the partition
        assert_eq!(recorder.handled(), vec![b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(*recorder.calls.lock().unwrap(), 4);
    }

    #[tokio::test]
    async fn test_rebalance_keeps_every_record() {
        let broker = MemoryBroker::new(4);
        let recorder = Arc::new(Recorder::default());
        let shutdown = CancellationToken::new();

        let first = tokio::spawn(
            GroupConsumer::new(broker.clone(), Arc::clone(&recorder), settings())
                .run(shutdown.clone()),
        );
        publish(&broker, &["1", "2", "3"]).await;
        eventually(async || committed_total(&broker).await == 3).await;

        let second = tokio::spawn(
            GroupConsumer::new(broker.clone(), Arc::clone(&recorder), settings())
                .run(shutdown.clone()),
        );
        publish(&broker, &["4", "5", "6", "7", "8"]).await;
        eventually(async || committed_total(&broker).await == 8).await;

        shutdown.cancel();
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        let handled: HashSet<_> = recorder.handled().into_iter().collect();
        assert_eq!(handled.len(), 8);
    }
}
