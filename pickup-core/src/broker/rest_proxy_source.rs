//! Consumer-group source for a Kafka REST proxy (v2 API).
//!
//! One source is one consumer instance on the proxy, created on
//! [`GroupSource::join`] with auto-commit off. The proxy returns records for
//! every assigned partition in one stream, so a background poller splits
//! them into per-partition buffers and [`GroupSource::fetch`] serves from
//! those. The poller also re-reads the assignment after each read and bumps
//! the generation when it changed.

use super::rest_proxy::{API_CONTENT_TYPE, read_body};
use super::{Assignment, BrokerError, GroupSource, Record};
use async_trait::async_trait;
use reqwest::Method;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

const RECORDS_CONTENT_TYPE: &str = "application/vnd.kafka.json.v2+json";
/// Long-poll timeout handed to the records endpoint.
const RECORDS_TIMEOUT_MS: u64 = 1000;
/// Reading pauses while this many records wait in the buffers.
const MAX_BUFFERED: usize = 1000;
const POLL_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct RestProxyGroupSource {
    inner: Arc<Inner>,
}

struct Inner {
    client: reqwest::Client,
    base_url: String,
    topic: String,
    state: Mutex<SourceState>,
    /// Held across record reads, seeks and assignment refreshes so the
    /// proxy's positions never move under a read in flight.
    io: tokio::sync::Mutex<()>,
    generation: watch::Sender<u64>,
    /// Bumped whenever the poller stashes records.
    appended: watch::Sender<u64>,
}

#[derive(Default)]
struct SourceState {
    next_member: u64,
    member: Option<Member>,
    partitions: Vec<i32>,
    buffers: BTreeMap<i32, PartitionBuffer>,
}

struct Member {
    id: u64,
    group: String,
    /// `base_uri` of the proxy's consumer instance
    instance: String,
    poller: CancellationToken,
}

struct PartitionBuffer {
    /// Lowest offset this buffer can serve.
    low: i64,
    /// Next offset expected from the proxy.
    position: i64,
    /// The proxy's position is unknown until the next seek.
    needs_seek: bool,
    records: VecDeque<Record>,
}

impl PartitionBuffer {
    fn unpositioned() -> Self {
        Self {
            low: 0,
            position: 0,
            needs_seek: true,
            records: VecDeque::new(),
        }
    }

    fn at(offset: i64) -> Self {
        Self {
            low: offset,
            position: offset,
            needs_seek: false,
            records: VecDeque::new(),
        }
    }
}

#[derive(Serialize)]
struct CreateInstance<'a> {
    name: &'a str,
    format: &'a str,
    #[serde(rename = "auto.offset.reset")]
    auto_offset_reset: &'a str,
    #[serde(rename = "auto.commit.enable")]
    auto_commit_enable: &'a str,
}

#[derive(Deserialize)]
struct InstanceResponse {
    instance_id: String,
    base_uri: String,
}

#[derive(Serialize)]
struct Subscription<'a> {
    topics: [&'a str; 1],
}

#[derive(Debug, Serialize, Deserialize)]
struct TopicPartition {
    topic: String,
    partition: i32,
}

#[derive(Serialize)]
struct PartitionsRequest {
    partitions: Vec<TopicPartition>,
}

#[derive(Deserialize)]
struct AssignmentsResponse {
    #[serde(default)]
    partitions: Vec<TopicPartition>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PartitionOffset {
    topic: String,
    partition: i32,
    offset: i64,
}

#[derive(Serialize, Deserialize)]
struct OffsetsBody {
    #[serde(default)]
    offsets: Vec<PartitionOffset>,
}

#[derive(Deserialize)]
struct ProxyRecord {
    topic: String,
    partition: i32,
    offset: i64,
    #[serde(default)]
    value: serde_json::Value,
}

impl RestProxyGroupSource {
    pub fn new(base_url: &Url, topic: &str, timeout: Duration) -> Self {
        // the records long-poll must finish inside the client timeout
        let timeout = timeout.max(Duration::from_millis(RECORDS_TIMEOUT_MS * 2));
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            inner: Arc::new(Inner {
                client,
                base_url: base_url.as_str().trim_end_matches('/').to_string(),
                topic: topic.to_string(),
                state: Mutex::new(SourceState::default()),
                io: tokio::sync::Mutex::new(()),
                generation: watch::Sender::new(0),
                appended: watch::Sender::new(0),
            }),
        }
    }

    fn instance(&self, group: &str) -> Result<String, BrokerError> {
        self.inner
            .lock()
            .member
            .as_ref()
            .filter(|m| m.group == group)
            .map(|m| m.instance.clone())
            .ok_or_else(|| BrokerError::Unavailable(format!("not a member of group {group}")))
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, SourceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn request(&self, method: Method, url: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .header(CONTENT_TYPE, API_CONTENT_TYPE)
            .header(ACCEPT, API_CONTENT_TYPE)
    }

    async fn send_json<B: Serialize>(
        &self,
        method: Method,
        url: &str,
        body: &B,
    ) -> Result<String, BrokerError> {
        let response = self
            .request(method, url)
            .body(serde_json::to_string(body)?)
            .send()
            .await?;
        read_body(response).await
    }

    fn partition_offset(&self, partition: i32, offset: i64) -> OffsetsBody {
        OffsetsBody {
            offsets: vec![PartitionOffset {
                topic: self.topic.clone(),
                partition,
                offset,
            }],
        }
    }

    /// Caller holds the io lock.
    async fn refresh_assignment(&self, instance: &str) -> Result<Assignment, BrokerError> {
        let response = self
            .request(Method::GET, &format!("{instance}/assignments"))
            .send()
            .await?;
        let assigned: AssignmentsResponse = serde_json::from_str(&read_body(response).await?)?;
        let mut partitions: Vec<i32> = assigned
            .partitions
            .into_iter()
            .filter(|p| p.topic == self.topic)
            .map(|p| p.partition)
            .collect();
        partitions.sort_unstable();

        let mut state = self.lock();
        if state.partitions != partitions {
            info!(partitions = ?partitions, "REST proxy assignment changed");
            state.buffers = partitions
                .iter()
                .map(|&p| (p, PartitionBuffer::unpositioned()))
                .collect();
            state.partitions = partitions.clone();
            self.generation.send_modify(|g| *g += 1);
        }
        Ok(Assignment {
            generation: *self.generation.borrow(),
            partitions,
        })
    }

    async fn seek(&self, instance: &str, partition: i32, offset: i64) -> Result<(), BrokerError> {
        let _io = self.io.lock().await;
        self.send_json(
            Method::POST,
            &format!("{instance}/positions"),
            &self.partition_offset(partition, offset),
        )
        .await?;
        if let Some(buffer) = self.lock().buffers.get_mut(&partition) {
            *buffer = PartitionBuffer::at(offset);
        }
        debug!(partition, offset, "Moved REST proxy position");
        Ok(())
    }

    async fn poll_once(&self, instance: &str) -> Result<(), BrokerError> {
        let buffered: usize = self.lock().buffers.values().map(|b| b.records.len()).sum();
        let full = buffered >= MAX_BUFFERED;
        if full {
            tokio::time::sleep(Duration::from_millis(RECORDS_TIMEOUT_MS)).await;
        }

        let _io = self.io.lock().await;
        if !full {
            let response = self
                .client
                .get(format!("{instance}/records?timeout={RECORDS_TIMEOUT_MS}"))
                .header(ACCEPT, RECORDS_CONTENT_TYPE)
                .send()
                .await?;
            let records: Vec<ProxyRecord> = serde_json::from_str(&read_body(response).await?)?;
            self.stash(records)?;
        }
        self.refresh_assignment(instance).await?;
        Ok(())
    }

    fn stash(&self, records: Vec<ProxyRecord>) -> Result<(), BrokerError> {
        if records.is_empty() {
            return Ok(());
        }
        let mut state = self.lock();
        for record in records {
            if record.topic != self.topic {
                continue;
            }
            let Some(buffer) = state.buffers.get_mut(&record.partition) else {
                continue;
            };
            if buffer.needs_seek || record.offset < buffer.position {
                continue;
            }
            buffer.position = record.offset + 1;
            buffer.records.push_back(Record {
                partition: record.partition,
                offset: record.offset,
                payload: serde_json::to_vec(&record.value)?,
            });
        }
        self.appended.send_modify(|n| *n += 1);
        Ok(())
    }
}

async fn poll_records(inner: Arc<Inner>, instance: String, stop: CancellationToken) {
    loop {
        let polled = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            polled = inner.poll_once(&instance) => polled,
        };
        if let Err(e) = polled {
            warn!(error = %e, "REST proxy poll failed");
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(POLL_BACKOFF) => {}
            }
        }
    }
    debug!("REST proxy poller stopped");
}

enum NextStep {
    Wait,
    Seek(String),
}

#[async_trait]
impl GroupSource for RestProxyGroupSource {
    /// Creates the consumer instance and subscribes it to the topic. A
    /// source holds one membership at a time.
    async fn join(&self, group: &str) -> Result<u64, BrokerError> {
        if self.inner.lock().member.is_some() {
            return Err(BrokerError::Unavailable(
                "source already joined a group".to_string(),
            ));
        }

        let name = format!("pickup-{}", Uuid::now_v7());
        let body = self
            .inner
            .send_json(
                Method::POST,
                &format!("{}/consumers/{group}", self.inner.base_url),
                &CreateInstance {
                    name: &name,
                    format: "json",
                    auto_offset_reset: "earliest",
                    auto_commit_enable: "false",
                },
            )
            .await?;
        let created: InstanceResponse = serde_json::from_str(&body)?;
        let instance = created.base_uri.trim_end_matches('/').to_string();

        let subscribed = self
            .inner
            .send_json(
                Method::POST,
                &format!("{instance}/subscription"),
                &Subscription {
                    topics: [self.inner.topic.as_str()],
                },
            )
            .await;
        if let Err(e) = subscribed {
            let _ = self.inner.request(Method::DELETE, &instance).send().await;
            return Err(e);
        }

        let poller = CancellationToken::new();
        let member_id = {
            let mut state = self.inner.lock();
            state.next_member += 1;
            let id = state.next_member;
            state.member = Some(Member {
                id,
                group: group.to_string(),
                instance: instance.clone(),
                poller: poller.clone(),
            });
            id
        };
        tokio::spawn(poll_records(Arc::clone(&self.inner), instance, poller));
        info!(group, instance_id = %created.instance_id, "Created REST proxy consumer");
        Ok(member_id)
    }

    async fn leave(&self, group: &str, member_id: u64) -> Result<(), BrokerError> {
        let member = {
            let mut state = self.inner.lock();
            let member = state
                .member
                .take_if(|m| m.id == member_id && m.group == group);
            if member.is_some() {
                state.partitions.clear();
                state.buffers.clear();
            }
            member
        };
        let Some(member) = member else {
            return Ok(());
        };
        member.poller.cancel();

        let _io = self.inner.io.lock().await;
        let response = self
            .inner
            .request(Method::DELETE, &member.instance)
            .send()
            .await?;
        read_body(response).await?;
        Ok(())
    }

    async fn assignment(&self, group: &str, member_id: u64) -> Result<Assignment, BrokerError> {
        let instance = {
            let state = self.inner.lock();
            state
                .member
                .as_ref()
                .filter(|m| m.id == member_id && m.group == group)
                .map(|m| m.instance.clone())
        };
        let Some(instance) = instance else {
            return Ok(Assignment {
                generation: *self.inner.generation.borrow(),
                partitions: Vec::new(),
            });
        };
        let _io = self.inner.io.lock().await;
        self.inner.refresh_assignment(&instance).await
    }

    fn generation(&self, _group: &str) -> watch::Receiver<u64> {
        self.inner.generation.subscribe()
    }

    async fn committed(&self, group: &str, partition: i32) -> Result<i64, BrokerError> {
        let instance = self.instance(group)?;
        let body = self
            .inner
            .send_json(
                Method::GET,
                &format!("{instance}/offsets"),
                &PartitionsRequest {
                    partitions: vec![TopicPartition {
                        topic: self.inner.topic.clone(),
                        partition,
                    }],
                },
            )
            .await?;
        let committed: OffsetsBody = serde_json::from_str(&body)?;
        // nothing committed comes back missing or as -1
        Ok(committed
            .offsets
            .into_iter()
            .find(|o| o.partition == partition)
            .map(|o| o.offset.max(0))
            .unwrap_or(0))
    }

    async fn commit(
        &self,
        group: &str,
        generation: u64,
        partition: i32,
        next_offset: i64,
    ) -> Result<(), BrokerError> {
        if *self.inner.generation.borrow() != generation {
            return Err(BrokerError::StaleGeneration(generation));
        }
        let instance = self.instance(group)?;
        // the proxy stores the offset it is given plus one
        self.inner
            .send_json(
                Method::POST,
                &format!("{instance}/offsets"),
                &self.inner.partition_offset(partition, next_offset - 1),
            )
            .await?;
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
            let next = {
                let mut state = self.inner.lock();
                let instance = state.member.as_ref().map(|m| m.instance.clone());
                let buffer = state
                    .buffers
                    .get_mut(&partition)
                    .ok_or(BrokerError::UnknownPartition(partition))?;
                if buffer.needs_seek || offset < buffer.low || offset > buffer.position {
                    let instance = instance.ok_or_else(|| {
                        BrokerError::Unavailable("source is not a group member".to_string())
                    })?;
                    NextStep::Seek(instance)
                } else {
                    while buffer.records.front().is_some_and(|r| r.offset < offset) {
                        buffer.records.pop_front();
                    }
                    buffer.low = offset;
                    if !buffer.records.is_empty() {
                        return Ok(buffer.records.iter().take(max.max(1)).cloned().collect());
                    }
                    NextStep::Wait
                }
            };

            match next {
                NextStep::Seek(instance) => self.inner.seek(&instance, partition, offset).await?,
                NextStep::Wait => {
                    if appended.changed().await.is_err() {
                        return Err(BrokerError::Unavailable("poller closed".to_string()));
                    }
                }
            }
        }
    }
}
