//! Test doubles: a recording broker reader and a recording handler.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rdkafka::error::{KafkaError, KafkaResult};
use rdkafka::message::{OwnedHeaders, OwnedMessage, Timestamp};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::ClientConfig;
use tokio::sync::mpsc;

use crate::config::ConsumerConfig;
use crate::error::ConsumerError;
use crate::handler::{ConsumerHandler, Sleeper};
use crate::reader::{Reader, ReaderEvent, EVENT_CHANNEL_CAPACITY};
use crate::types::{Partition, PartitionOffset, UNSET_OFFSET};

/// Every control operation a consumer issued against a [`MockReader`], in
/// call order. Pause/resume/metadata carry their call instant so tests can
/// assert timing.
#[derive(Debug, Clone)]
pub enum ReaderCall {
    Subscribe(Vec<String>),
    Unsubscribe,
    Assign(Vec<PartitionOffset>),
    Unassign,
    Committed(Vec<PartitionOffset>),
    Commit(Vec<PartitionOffset>),
    Pause(Vec<Partition>, Instant),
    Resume(Vec<Partition>, Instant),
    FetchMetadata(String, Instant),
    Close,
}

/// In-memory [`Reader`]: records every call, serves committed offsets from
/// a configurable store, and exposes the event-channel sender so tests can
/// play the broker.
pub struct MockReader {
    events_tx: Mutex<Option<mpsc::Sender<ReaderEvent>>>,
    events_rx: Mutex<Option<mpsc::Receiver<ReaderEvent>>>,
    calls: Mutex<Vec<ReaderCall>>,
    committed_store: Mutex<HashMap<Partition, i64>>,
    commit_failure: Mutex<Option<RDKafkaErrorCode>>,
}

impl Default for MockReader {
    fn default() -> Self {
        Self::new()
    }
}

impl MockReader {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            events_tx: Mutex::new(Some(tx)),
            events_rx: Mutex::new(Some(rx)),
            calls: Mutex::new(Vec::new()),
            committed_store: Mutex::new(HashMap::new()),
            commit_failure: Mutex::new(None),
        }
    }

    /// Sender half of the event stream; use it to inject broker events.
    /// Hands out the only copy, so dropping it terminates the stream.
    pub fn event_sender(&self) -> mpsc::Sender<ReaderEvent> {
        self.events_tx
            .lock()
            .unwrap()
            .take()
            .expect("event sender already taken")
    }

    /// Seed the broker-side committed offset for a partition.
    pub fn set_committed(&self, partition: Partition, offset: i64) {
        self.committed_store.lock().unwrap().insert(partition, offset);
    }

    /// Make every commit RPC fail with the given code until cleared.
    pub fn fail_commits_with(&self, code: RDKafkaErrorCode) {
        *self.commit_failure.lock().unwrap() = Some(code);
    }

    pub fn clear_commit_failure(&self) {
        *self.commit_failure.lock().unwrap() = None;
    }

    pub fn calls(&self) -> Vec<ReaderCall> {
        self.calls.lock().unwrap().clone()
    }

    /// The offset lists of all successful commit calls, in order.
    pub fn commits(&self) -> Vec<Vec<PartitionOffset>> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                ReaderCall::Commit(offsets) => Some(offsets),
                _ => None,
            })
            .collect()
    }

    /// The partition lists of all assign calls, in order.
    pub fn assigns(&self) -> Vec<Vec<PartitionOffset>> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                ReaderCall::Assign(partitions) => Some(partitions),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: ReaderCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl Reader for MockReader {
    fn take_events(&self) -> Option<mpsc::Receiver<ReaderEvent>> {
        self.events_rx.lock().unwrap().take()
    }

    fn subscribe(&self, topics: &[String]) -> KafkaResult<()> {
        self.record(ReaderCall::Subscribe(topics.to_vec()));
        Ok(())
    }

    fn unsubscribe(&self) -> KafkaResult<()> {
        self.record(ReaderCall::Unsubscribe);
        Ok(())
    }

    fn assign(&self, partitions: &[PartitionOffset]) -> KafkaResult<()> {
        self.record(ReaderCall::Assign(partitions.to_vec()));
        Ok(())
    }

    fn unassign(&self) -> KafkaResult<()> {
        self.record(ReaderCall::Unassign);
        Ok(())
    }

    fn committed(
        &self,
        partitions: &[PartitionOffset],
        _timeout: Duration,
    ) -> KafkaResult<Vec<PartitionOffset>> {
        self.record(ReaderCall::Committed(partitions.to_vec()));
        let store = self.committed_store.lock().unwrap();
        Ok(partitions
            .iter()
            .map(|po| {
                let offset = store.get(po.partition()).copied().unwrap_or(UNSET_OFFSET);
                PartitionOffset::new(po.partition().clone(), offset)
            })
            .collect())
    }

    fn commit(&self, offsets: &[PartitionOffset]) -> KafkaResult<Vec<PartitionOffset>> {
        if let Some(code) = *self.commit_failure.lock().unwrap() {
            return Err(KafkaError::ConsumerCommit(code));
        }
        self.record(ReaderCall::Commit(offsets.to_vec()));
        Ok(offsets.to_vec())
    }

    fn pause(&self, partitions: &[Partition]) -> KafkaResult<()> {
        self.record(ReaderCall::Pause(partitions.to_vec(), Instant::now()));
        Ok(())
    }

    fn resume(&self, partitions: &[Partition]) -> KafkaResult<()> {
        self.record(ReaderCall::Resume(partitions.to_vec(), Instant::now()));
        Ok(())
    }

    fn fetch_metadata(&self, topic: &str, _timeout: Duration) -> KafkaResult<()> {
        self.record(ReaderCall::FetchMetadata(topic.to_string(), Instant::now()));
        Ok(())
    }

    fn close(&self) -> KafkaResult<()> {
        self.record(ReaderCall::Close);
        Ok(())
    }
}

/// Handler that counts and records everything it sees. Failure, panic and
/// sleep behavior are scripted through the public fields.
#[derive(Default)]
pub struct RecordingHandler {
    pub processed: AtomicUsize,
    pub errors: AtomicUsize,
    pub commits: Mutex<Vec<(String, i32, i64, usize)>>,
    pub revoked: Mutex<Vec<Vec<PartitionOffset>>>,
    pub rebalanced: Mutex<Vec<Vec<PartitionOffset>>>,
    /// Fail processing of the n-th message (1-based).
    pub fail_on: Option<usize>,
    /// Panic while processing the n-th message (1-based).
    pub panic_on: Option<usize>,
    /// Call the sleeper with this request while processing the first message.
    pub sleep_request: Option<(Duration, Vec<Partition>)>,
}

#[async_trait]
impl ConsumerHandler for RecordingHandler {
    async fn on_process(&self, _msg: &OwnedMessage, sleeper: &dyn Sleeper) -> anyhow::Result<()> {
        let n = self.processed.fetch_add(1, Ordering::SeqCst) + 1;
        if self.panic_on == Some(n) {
            panic!("handler panic for test");
        }
        if let Some((delay, partitions)) = &self.sleep_request {
            if n == 1 {
                sleeper.sleep(*delay, partitions).await?;
            }
        }
        if self.fail_on == Some(n) {
            anyhow::bail!("handler failed on message {n}");
        }
        Ok(())
    }

    async fn on_error(&self, _err: &ConsumerError) {
        self.errors.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_commit(&self, topic: &str, partition: i32, offset: i64, committed: usize) {
        self.commits
            .lock()
            .unwrap()
            .push((topic.to_string(), partition, offset, committed));
    }

    async fn on_revoke(&self, partitions: &[PartitionOffset]) {
        self.revoked.lock().unwrap().push(partitions.to_vec());
    }

    async fn on_rebalance(&self, partitions: &[PartitionOffset]) {
        self.rebalanced.lock().unwrap().push(partitions.to_vec());
    }
}

/// Consumer config for tests: one topic, ticker effectively disabled so
/// only explicit triggers commit.
pub fn test_config() -> ConsumerConfig {
    ConsumerConfig::new(ClientConfig::new(), vec!["events".to_string()])
        .with_commit_offset_duration(Duration::from_secs(3600))
}

pub fn test_message(topic: &str, partition: i32, offset: i64) -> OwnedMessage {
    OwnedMessage::new(
        Some(b"payload".to_vec()),
        Some(b"key".to_vec()),
        topic.to_string(),
        Timestamp::now(),
        partition,
        offset,
        Some(OwnedHeaders::new()),
    )
}

/// Install a test subscriber so a failing test prints the loop's tracing
/// output. Safe to call from every fixture; only the first call wins.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll `cond` until it holds or the deadline passes.
pub async fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) {
    let start = Instant::now();
    while !cond() {
        if start.elapsed() > deadline {
            panic!("condition not met within {deadline:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
