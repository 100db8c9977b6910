//! In-process partitioned topic with consumer groups.
//!
//! Messages are spread over partitions round-robin and kept forever. Each
//! group tracks its members, a generation counter and committed offsets.
//! Partition `p` belongs to the `p % n`-th member in join order.

use super::{Assignment, BrokerError, GroupSource, Producer, Record};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<BrokerState>,
    /// Bumped on every append so waiting fetches wake up.
    appended: watch::Sender<u64>,
}

struct BrokerState {
    partitions: Vec<Vec<Vec<u8>>>,
    next_partition: usize,
    next_member: u64,
    groups: HashMap<String, GroupState>,
    failing_sends: u32,
    down: bool,
}

struct GroupState {
    members: Vec<u64>,
    generation: watch::Sender<u64>,
    committed: HashMap<i32, i64>,
}

impl GroupState {
    fn new() -> Self {
        Self {
            members: Vec::new(),
            generation: watch::Sender::new(0),
            committed: HashMap::new(),
        }
    }

    fn bump(&self) {
        self.generation.send_modify(|g| *g += 1);
    }
}

impl MemoryBroker {
    pub fn new(partitions: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(BrokerState {
                    partitions: vec![Vec::new(); partitions.max(1)],
                    next_partition: 0,
                    next_member: 0,
                    groups: HashMap::new(),
                    failing_sends: 0,
                    down: false,
                }),
                appended: watch::Sender::new(0),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn partition_count(&self) -> usize {
        self.lock().partitions.len()
    }

    /// Make the next `n` sends fail.
    pub fn fail_next_sends(&self, n: u32) {
        self.lock().failing_sends = n;
    }

    /// While down, every send fails.
    pub fn set_down(&self, down: bool) {
        self.lock().down = down;
    }

    /// Every payload ever published, partition by partition.
    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.lock().partitions.iter().flatten().cloned().collect()
    }

    pub fn message_count(&self) -> usize {
        self.lock().partitions.iter().map(Vec::len).sum()
    }

    fn check_partition(state: &BrokerState, partition: i32) -> Result<usize, BrokerError> {
        usize::try_from(partition)
            .ok()
            .filter(|p| *p < state.partitions.len())
            .ok_or(BrokerError::UnknownPartition(partition))
    }
}

#[async_trait]
impl Producer for MemoryBroker {
    async fn send(&self, cancel: &CancellationToken, payload: &[u8]) -> Result<(), BrokerError> {
        if cancel.is_cancelled() {
            return Err(BrokerError::Cancelled);
        }
        {
            let mut state = self.lock();
            if state.down {
                return Err(BrokerError::Unavailable("broker is down".to_string()));
            }
            if state.failing_sends > 0 {
                state.failing_sends -= 1;
                return Err(BrokerError::Unavailable("injected send failure".to_string()));
            }
            let partition = state.next_partition;
            state.next_partition = (partition + 1) % state.partitions.len();
            state.partitions[partition].push(payload.to_vec());
        }
        self.inner.appended.send_modify(|n| *n += 1);
        Ok(())
    }
}

#[async_trait]
impl GroupSource for MemoryBroker {
    async fn join(&self, group: &str) -> Result<u64, BrokerError> {
        let mut state = self.lock();
        state.next_member += 1;
        let member_id = state.next_member;
        let group = state
            .groups
            .entry(group.to_string())
            .or_insert_with(GroupState::new);
        group.members.push(member_id);
        group.bump();
        Ok(member_id)
    }

    async fn leave(&self, group: &str, member_id: u64) -> Result<(), BrokerError> {
        let mut state = self.lock();
        if let Some(group) = state.groups.get_mut(group)
            && let Some(pos) = group.members.iter().position(|m| *m == member_id)
        {
            group.members.remove(pos);
            group.bump();
        }
        Ok(())
    }

    async fn assignment(&self, group: &str, member_id: u64) -> Result<Assignment, BrokerError> {
        let state = self.lock();
        let Some(group) = state.groups.get(group) else {
            return Ok(Assignment {
                generation: 0,
                partitions: Vec::new(),
            });
        };
        let generation = *group.generation.borrow();
        let Some(index) = group.members.iter().position(|m| *m == member_id) else {
            return Ok(Assignment {
                generation,
                partitions: Vec::new(),
            });
        };
        let members = group.members.len();
        let partitions = (0..state.partitions.len())
            .filter(|p| p % members == index)
            .filter_map(|p| i32::try_from(p).ok())
            .collect();
        Ok(Assignment {
            generation,
            partitions,
        })
    }

    fn generation(&self, group: &str) -> watch::Receiver<u64> {
        self.lock()
            .groups
            .entry(group.to_string())
            .or_insert_with(GroupState::new)
            .generation
            .subscribe()
    }

    async fn committed(&self, group: &str, partition: i32) -> Result<i64, BrokerError> {
        let state = self.lock();
        Self::check_partition(&state, partition)?;
        Ok(state
            .groups
            .get(group)
            .and_then(|g| g.committed.get(&partition).copied())
            .unwrap_or(0))
    }

    async fn commit(
        &self,
        group: &str,
        generation: u64,
        partition: i32,
        next_offset: i64,
    ) -> Result<(), BrokerError> {
        let mut state = self.lock();
        Self::check_partition(&state, partition)?;
        let group = state
            .groups
            .get_mut(group)
            .ok_or(BrokerError::StaleGeneration(generation))?;
        if *group.generation.borrow() != generation {
            return Err(BrokerError::StaleGeneration(generation));
        }
        let offset = group.committed.entry(partition).or_insert(0);
        *offset = (*offset).max(next_offset);
        Ok(())
    }

    async fn fetch(
        &self,
        partition: i32,
        offset: i64,
        max: usize,
    ) -> Result<Vec<Record>, BrokerError> {
        let mut appended = self.inner.appended.subscribe();
        loop {
            {
                let state = self.lock();
                let index = Self::check_partition(&state, partition)?;
                let start = usize::try_from(offset).unwrap_or(0);
                let log = &state.partitions[index];
                if start < log.len() {
                    return Ok(log[start..]
                        .iter()
                        .take(max.max(1))
                        .zip(offset..)
                        .map(|(payload, offset)| Record {
                            partition,
                            offset,
                            payload: payload.clone(),
                        })
                        .collect());
                }
            }
            if appended.changed().await.is_err() {
                return Err(BrokerError::Unavailable("broker closed".to_string()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_round_robin_and_fetch() {
        let broker = MemoryBroker::new(2);
        let cancel = CancellationToken::new();
        for payload in [b"a", b"b", b"c"] {
            broker.send(&cancel, payload).await.unwrap();
        }

        let p0 = broker.fetch(0, 0, 10).await.unwrap();
        let p1 = broker.fetch(1, 0, 10).await.unwrap();
        assert_eq!(p0.len(), 2);
        assert_eq!(p0[1].offset, 1);
        assert_eq!(p0[1].payload, b"c");
        assert_eq!(p1[0].payload, b"b");
    }

    #[tokio::test]
    async fn test_fetch_waits_for_new_records() {
        let broker = MemoryBroker::new(1);
        let waiting = tokio::spawn({
            let broker = broker.clone();
            async move { broker.fetch(0, 0, 10).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiting.is_finished());

        broker.send(&CancellationToken::new(), b"x").await.unwrap();
        let records = waiting.await.unwrap().unwrap();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let broker = MemoryBroker::new(1);
        let cancel = CancellationToken::new();
        broker.fail_next_sends(1);
        assert!(broker.send(&cancel, b"x").await.is_err());
        assert!(broker.send(&cancel, b"x").await.is_ok());

        broker.set_down(true);
        assert!(broker.send(&cancel, b"x").await.is_err());
        assert_eq!(broker.message_count(), 1);

        cancel.cancel();
        broker.set_down(false);
        assert!(matches!(
            broker.send(&cancel, b"x").await,
            Err(BrokerError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_rebalance_splits_partitions_and_fences_commits() {
        let broker = MemoryBroker::new(4);
        let first = broker.join("g").await.unwrap();
        let solo = broker.assignment("g", first).await.unwrap();
        assert_eq!(solo.partitions, vec![0, 1, 2, 3]);

        let second = broker.join("g").await.unwrap();
        let a = broker.assignment("g", first).await.unwrap();
        let b = broker.assignment("g", second).await.unwrap();
        assert_eq!(a.partitions, vec![0, 2]);
        assert_eq!(b.partitions, vec![1, 3]);
        assert_eq!(a.generation, solo.generation + 1);

        let err = broker.commit("g", solo.generation, 0, 5).await.unwrap_err();
        assert!(matches!(err, BrokerError::StaleGeneration(_)));
        broker.commit("g", a.generation, 0, 5).await.unwrap();
        assert_eq!(broker.committed("g", 0).await.unwrap(), 5);

        broker.leave("g", second).await.unwrap();
        let after = broker.assignment("g", first).await.unwrap();
        assert_eq!(after.partitions, vec![0, 1, 2, 3]);
    }
}
