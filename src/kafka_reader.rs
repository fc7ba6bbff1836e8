use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext};
use rdkafka::error::{KafkaError, KafkaResult};
use rdkafka::types::{RDKafkaErrorCode, RDKafkaRespErr};
use rdkafka::{ClientConfig, ClientContext, TopicPartitionList};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::reader::{Reader, ReaderEvent, EVENT_CHANNEL_CAPACITY};
use crate::types::{self, Partition, PartitionOffset, UNSET_OFFSET};

/// Client context that turns librdkafka callbacks into [`ReaderEvent`]s.
///
/// The rebalance override deliberately does NOT apply the assignment - the
/// event loop assigns after reconciling committed offsets, which is the
/// whole point of application-handled rebalancing.
struct ReaderContext {
    events: mpsc::Sender<ReaderEvent>,
}

impl ReaderContext {
    fn forward(&self, event: ReaderEvent) {
        // Callbacks fire on the poll thread, never inside the async runtime.
        if self.events.blocking_send(event).is_err() {
            debug!("event stream receiver gone, discarding event");
        }
    }
}

impl ClientContext for ReaderContext {
    fn error(&self, error: KafkaError, reason: &str) {
        warn!(error = %error, reason, "client error event");
        self.forward(ReaderEvent::Error(error));
    }
}

impl ConsumerContext for ReaderContext {
    fn rebalance(
        &self,
        _base_consumer: &BaseConsumer<Self>,
        err: RDKafkaRespErr,
        tpl: &mut TopicPartitionList,
    ) {
        match err {
            RDKafkaRespErr::RD_KAFKA_RESP_ERR__ASSIGN_PARTITIONS => {
                self.forward(ReaderEvent::Assigned(types::partition_offsets(tpl)));
            }
            RDKafkaRespErr::RD_KAFKA_RESP_ERR__REVOKE_PARTITIONS => {
                self.forward(ReaderEvent::Revoked(types::partition_offsets(tpl)));
            }
            other => {
                self.forward(ReaderEvent::Error(KafkaError::Rebalance(other.into())));
            }
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        self.forward(ReaderEvent::OffsetsCommitted {
            error: result.err(),
            offsets: types::partition_offsets(offsets),
        });
    }
}

/// [`Reader`] over an rdkafka `BaseConsumer`.
///
/// A dedicated poll thread pumps the client; messages, EOFs and poll errors
/// flow into the event channel alongside the callback-driven events. The
/// owning consumer must drop the event receiver before calling [`close`],
/// otherwise the poll thread can stay parked on a full channel.
///
/// [`close`]: Reader::close
pub struct KafkaReader {
    consumer: Arc<BaseConsumer<ReaderContext>>,
    events: Mutex<Option<mpsc::Receiver<ReaderEvent>>>,
    shutdown: Arc<AtomicBool>,
    poll_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl KafkaReader {
    pub fn new(client_config: &ClientConfig) -> KafkaResult<Self> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let consumer: BaseConsumer<ReaderContext> =
            client_config.create_with_context(ReaderContext { events: tx.clone() })?;
        let consumer = Arc::new(consumer);
        let shutdown = Arc::new(AtomicBool::new(false));

        let poll_consumer = consumer.clone();
        let poll_shutdown = shutdown.clone();
        let poll_thread = thread::Builder::new()
            .name("kafka-reader-poll".to_string())
            .spawn(move || Self::poll_loop(poll_consumer, tx, poll_shutdown))
            .map_err(|e| KafkaError::ClientCreation(e.to_string()))?;

        Ok(Self {
            consumer,
            events: Mutex::new(Some(rx)),
            shutdown,
            poll_thread: Mutex::new(Some(poll_thread)),
        })
    }

    fn poll_loop(
        consumer: Arc<BaseConsumer<ReaderContext>>,
        events: mpsc::Sender<ReaderEvent>,
        shutdown: Arc<AtomicBool>,
    ) {
        while !shutdown.load(Ordering::Acquire) {
            // Polling also drives the rebalance and commit callbacks.
            let event = match consumer.poll(Duration::from_millis(100)) {
                None => continue,
                Some(Ok(msg)) => ReaderEvent::Message(msg.detach()),
                Some(Err(KafkaError::PartitionEOF(partition))) => {
                    // The client reports EOF without the topic name.
                    ReaderEvent::PartitionEof(
                        PartitionOffset::new(Partition::new(String::new(), partition), UNSET_OFFSET)
                            .with_error(RDKafkaErrorCode::PartitionEOF),
                    )
                }
                Some(Err(e)) => ReaderEvent::Error(e),
            };
            if events.blocking_send(event).is_err() {
                break;
            }
        }
        debug!("kafka reader poll thread done");
    }
}

impl Reader for KafkaReader {
    fn take_events(&self) -> Option<mpsc::Receiver<ReaderEvent>> {
        self.events.lock().expect("events lock poisoned").take()
    }

    fn subscribe(&self, topics: &[String]) -> KafkaResult<()> {
        let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer.subscribe(&topics)
    }

    fn unsubscribe(&self) -> KafkaResult<()> {
        self.consumer.unsubscribe();
        Ok(())
    }

    fn assign(&self, partitions: &[PartitionOffset]) -> KafkaResult<()> {
        let tpl = types::topic_partition_list(partitions)?;
        self.consumer.assign(&tpl)
    }

    fn unassign(&self) -> KafkaResult<()> {
        self.consumer.unassign()
    }

    fn committed(
        &self,
        partitions: &[PartitionOffset],
        timeout: Duration,
    ) -> KafkaResult<Vec<PartitionOffset>> {
        let tpl = types::topic_partition_list(partitions)?;
        let committed = self.consumer.committed_offsets(tpl, timeout)?;
        Ok(types::partition_offsets(&committed))
    }

    fn commit(&self, offsets: &[PartitionOffset]) -> KafkaResult<Vec<PartitionOffset>> {
        let tpl = types::topic_partition_list(offsets)?;
        self.consumer.commit(&tpl, CommitMode::Sync)?;
        // A sync commit reports per-partition failures through the commit
        // callback; the committed set itself is what we sent.
        Ok(offsets.to_vec())
    }

    fn pause(&self, partitions: &[Partition]) -> KafkaResult<()> {
        self.consumer.pause(&partition_list(partitions))
    }

    fn resume(&self, partitions: &[Partition]) -> KafkaResult<()> {
        self.consumer.resume(&partition_list(partitions))
    }

    fn fetch_metadata(&self, topic: &str, timeout: Duration) -> KafkaResult<()> {
        self.consumer.fetch_metadata(Some(topic), timeout).map(|_| ())
    }

    fn close(&self) -> KafkaResult<()> {
        self.shutdown.store(true, Ordering::Release);
        let handle = self
            .poll_thread
            .lock()
            .expect("poll thread lock poisoned")
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("kafka reader poll thread panicked");
            }
        }
        Ok(())
    }
}

impl Drop for KafkaReader {
    fn drop(&mut self) {
        // Let the poll thread wind down on its own if close was never called.
        self.shutdown.store(true, Ordering::Release);
    }
}

fn partition_list(partitions: &[Partition]) -> TopicPartitionList {
    let mut tpl = TopicPartitionList::with_capacity(partitions.len());
    for p in partitions {
        tpl.add_partition(p.topic(), p.partition_number());
    }
    tpl
}
