use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use rdkafka::error::KafkaError;
use rdkafka::message::OwnedMessage;
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::Message;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::config::ConsumerConfig;
use crate::error::ConsumerError;
use crate::handler::{ConsumerHandler, Sleeper};
use crate::kafka_reader::KafkaReader;
use crate::metrics_consts::{
    BROKER_ERRORS, MESSAGES_PROCESSED, OFFSETS_COMMITTED, PARTITIONS_PAUSED, REBALANCE_EVENTS,
};
use crate::observable::{ConsumerState, Observable};
use crate::offset_tracker::OffsetTracker;
use crate::reader::{Reader, ReaderEvent};
use crate::types::{self, Partition, PartitionOffset};

const STATE_IDLE: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// How long to wait for the broker's committed offsets during a rebalance.
const COMMITTED_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// How long the post-resume metadata probe may take per topic.
const METADATA_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// One consumer-group worker: a single-threaded event loop that serializes
/// message delivery, rebalance handling, periodic commits and shutdown.
///
/// The lifecycle is `Idle -> Run -> Closed`, driven by [`start`] and
/// [`stop`]; `Closed` is reached exactly once whatever ends the loop.
/// Subscribe to the state stream with [`subscribe`].
///
/// [`start`]: Consumer::start
/// [`stop`]: Consumer::stop
/// [`subscribe`]: Consumer::subscribe
pub struct Consumer {
    id: Uuid,
    topics: Vec<String>,
    commit_offset_count: usize,
    commit_interval: Duration,
    handler: Arc<dyn ConsumerHandler>,
    reader: Arc<dyn Reader>,
    events: Mutex<Option<mpsc::Receiver<ReaderEvent>>>,
    token: CancellationToken,
    state: AtomicU8,
    loop_task: Mutex<Option<tokio::task::Id>>,
    observable: Observable,
}

impl Consumer {
    /// Create a worker connected to the broker.
    ///
    /// The supplied client config is taken as-is except for the keys the
    /// loop owns, which are forced: auto-commit and offset store off (the
    /// loop commits), partition EOF reporting on, protocol version
    /// negotiation on, and `client.id` set to this worker's identity.
    pub fn new(
        config: &ConsumerConfig,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<Self, ConsumerError> {
        config.check()?;

        let id = Uuid::new_v4();
        let mut client_config = config.client_config.clone();
        client_config
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("enable.partition.eof", "true")
            .set("api.version.request", "true")
            .set("client.id", id.to_string());

        let reader = Arc::new(KafkaReader::new(&client_config)?);
        Self::with_reader(config, handler, reader, id)
    }

    pub(crate) fn with_reader(
        config: &ConsumerConfig,
        handler: Arc<dyn ConsumerHandler>,
        reader: Arc<dyn Reader>,
        id: Uuid,
    ) -> Result<Self, ConsumerError> {
        config.check()?;
        let events = reader.take_events();
        Ok(Self {
            id,
            topics: config.topics.clone(),
            commit_offset_count: config.commit_offset_count,
            commit_interval: config.commit_interval(),
            handler,
            reader,
            events: Mutex::new(events),
            token: CancellationToken::new(),
            state: AtomicU8::new(STATE_IDLE),
            loop_task: Mutex::new(None),
            observable: Observable::new(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Lifecycle state stream. The receiver always holds the latest state;
    /// dropping it unsubscribes.
    pub fn subscribe(&self) -> watch::Receiver<ConsumerState> {
        self.observable.subscribe()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConsumerState {
        self.observable.state()
    }

    /// Run the event loop until cancellation (returns `Ok`), a terminal
    /// broker/rebalance/commit-report failure, a handler error, or a panic
    /// inside the loop (both returned as errors).
    ///
    /// A consumer runs at most once: starting a closed consumer returns
    /// [`ConsumerError::AlreadyClosed`], starting a running one
    /// [`ConsumerError::AlreadyRunning`].
    pub async fn start(&self) -> Result<(), ConsumerError> {
        match self.state.compare_exchange(
            STATE_IDLE,
            STATE_RUNNING,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {}
            Err(STATE_RUNNING) => return Err(ConsumerError::AlreadyRunning),
            Err(_) => return Err(ConsumerError::AlreadyClosed),
        }

        let span = tracing::info_span!("consumer", id = %self.id);
        async {
            if self.token.is_cancelled() {
                // Stopped before it ever ran.
                self.close();
                return Err(ConsumerError::AlreadyClosed);
            }

            let events = self.events.lock().expect("events lock poisoned").take();
            let Some(mut events) = events else {
                self.close();
                return Err(ConsumerError::EventStreamClosed);
            };

            *self.loop_task.lock().expect("loop task lock poisoned") = tokio::task::try_id();

            info!("start");
            self.observable.notify(ConsumerState::Run);

            let offsets = OffsetTracker::new();
            let result = match AssertUnwindSafe(self.run_loop(&mut events, &offsets))
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(panic) => {
                    let reason = panic_message(panic);
                    error!(reason = %reason, "panic in consumer loop");
                    Err(ConsumerError::Panic(reason))
                }
            };

            self.shutdown(events, &offsets).await;
            *self.loop_task.lock().expect("loop task lock poisoned") = None;
            self.close();

            match &result {
                Ok(()) => info!("done"),
                Err(err) => error!(error = %err, "consumer terminated"),
            }
            result
        }
        .instrument(span)
        .await
    }

    /// Cancel the event loop and wait for it to finish. Idempotent and safe
    /// to call from anywhere - when called from inside a handler callback
    /// (which runs on the loop task itself) it only cancels, and the loop
    /// winds down as soon as the callback returns.
    pub async fn stop(&self) {
        self.token.cancel();

        let current = tokio::task::try_id();
        if current.is_some()
            && current == *self.loop_task.lock().expect("loop task lock poisoned")
        {
            return;
        }

        let mut state_stream = self.observable.subscribe();
        while self.state.load(Ordering::Acquire) == STATE_RUNNING {
            if state_stream.changed().await.is_err() {
                break;
            }
        }
    }

    /// Transition into the closed state and notify, exactly once.
    fn close(&self) {
        if self.state.swap(STATE_CLOSED, Ordering::AcqRel) != STATE_CLOSED {
            self.token.cancel();
            self.observable.notify(ConsumerState::Closed);
        }
    }

    async fn run_loop(
        &self,
        events: &mut mpsc::Receiver<ReaderEvent>,
        offsets: &OffsetTracker,
    ) -> Result<(), ConsumerError> {
        info!(topics = ?self.topics, "start listener");
        self.reader
            .subscribe(&self.topics)
            .map_err(ConsumerError::Subscribe)?;

        let mut ticker = tokio::time::interval(self.commit_interval);
        // The first tick completes immediately; swallow it so the ticker
        // only fires after a full interval.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.token.cancelled() => return Ok(()),

                _ = ticker.tick() => self.flush_offsets(offsets).await,

                event = events.recv() => match event {
                    Some(event) => self.dispatch(event, offsets).await?,
                    None => return Err(ConsumerError::EventStreamClosed),
                },
            }
        }
    }

    async fn dispatch(
        &self,
        event: ReaderEvent,
        offsets: &OffsetTracker,
    ) -> Result<(), ConsumerError> {
        match event {
            ReaderEvent::Assigned(partitions) => self.handle_assigned(partitions, offsets).await,
            ReaderEvent::Revoked(partitions) => self.handle_revoked(partitions, offsets).await,
            ReaderEvent::Message(msg) => self.handle_message(msg, offsets).await,
            ReaderEvent::PartitionEof(partition) => {
                self.handle_partition_eof(partition, offsets).await
            }
            ReaderEvent::OffsetsCommitted { error, offsets: committed } => {
                self.handle_offsets_committed(error, committed).await
            }
            ReaderEvent::Error(e) => {
                // Informational: the client recovers from these on its own.
                error!(error = %e, operation = "error event", "broker error");
                metrics::counter!(BROKER_ERRORS).increment(1);
                self.handler.on_error(&ConsumerError::Kafka(e)).await;
                Ok(())
            }
        }
    }

    async fn handle_assigned(
        &self,
        partitions: Vec<PartitionOffset>,
        offsets: &OffsetTracker,
    ) -> Result<(), ConsumerError> {
        self.flush_offsets(offsets).await;
        offsets.clear();

        info!(partitions = ?partitions, operation = "rebalance", "partitions assigned");

        if let Err(err) = types::check_partitions(&partitions) {
            error!(error = %err, "failed to check assigned partitions");
            self.handler.on_error(&err).await;
            return Err(err);
        }

        // Fresh assignments usually carry the unset offset sentinel because
        // the client has not yet learned the committed position; assigning
        // them verbatim replays already-processed messages. Fetch the
        // committed offsets and start one past each (commits name the last
        // processed message, the next to read is one higher).
        let committed = match self.reader.committed(&partitions, COMMITTED_FETCH_TIMEOUT) {
            Ok(committed) => committed,
            Err(e) => {
                let err = ConsumerError::Kafka(e);
                error!(error = %err, "failed to read committed offsets");
                self.handler.on_error(&err).await;
                return Err(err);
            }
        };

        let reconciled: Vec<PartitionOffset> = committed
            .into_iter()
            .map(|po| {
                if po.offset() >= 0 {
                    PartitionOffset::new(po.partition().clone(), po.offset() + 1)
                } else {
                    po
                }
            })
            .collect();

        if let Err(e) = self.reader.assign(&reconciled) {
            let err = ConsumerError::Kafka(e);
            error!(error = %err, "failed to set assignment");
            self.handler.on_error(&err).await;
            return Err(err);
        }

        metrics::counter!(REBALANCE_EVENTS, "operation" => "assign").increment(1);
        self.handler.on_rebalance(&partitions).await;
        Ok(())
    }

    async fn handle_revoked(
        &self,
        partitions: Vec<PartitionOffset>,
        offsets: &OffsetTracker,
    ) -> Result<(), ConsumerError> {
        self.flush_offsets(offsets).await;
        offsets.clear();

        info!(partitions = ?partitions, operation = "revoked", "partitions revoked");

        if let Err(err) = types::check_partitions(&partitions) {
            error!(error = %err, "failed to check revoked partitions");
            self.handler.on_error(&err).await;
            return Err(err);
        }

        if let Err(e) = self.reader.unassign() {
            let err = ConsumerError::Kafka(e);
            error!(error = %err, "failed to unassign");
            self.handler.on_error(&err).await;
            return Err(err);
        }

        metrics::counter!(REBALANCE_EVENTS, "operation" => "revoke").increment(1);
        self.handler.on_revoke(&partitions).await;
        Ok(())
    }

    async fn handle_message(
        &self,
        msg: OwnedMessage,
        offsets: &OffsetTracker,
    ) -> Result<(), ConsumerError> {
        if let Err(e) = self.handler.on_process(&msg, self).await {
            let err = ConsumerError::Process(e);
            error!(
                topic = msg.topic(),
                partition = msg.partition(),
                offset = msg.offset(),
                error = %err,
                "failed to process message"
            );
            return Err(err);
        }

        // Track the next-to-read position so snapshots can be committed
        // verbatim.
        offsets.add(PartitionOffset::new(
            Partition::new(msg.topic().to_string(), msg.partition()),
            msg.offset() + 1,
        ));
        metrics::counter!(MESSAGES_PROCESSED).increment(1);

        if self.commit_offset_count > 0 && offsets.counter() >= self.commit_offset_count {
            self.flush_offsets(offsets).await;
        }

        debug!(
            topic = msg.topic(),
            partition = msg.partition(),
            offset = msg.offset(),
            operation = "message",
            "processed"
        );
        Ok(())
    }

    async fn handle_partition_eof(
        &self,
        partition: PartitionOffset,
        offsets: &OffsetTracker,
    ) -> Result<(), ConsumerError> {
        self.flush_offsets(offsets).await;
        offsets.clear();

        // The EOF notification itself arrives as an embedded error code;
        // anything else embedded there is a real failure.
        // NOTE: events from a live broker carry an empty topic here - the
        // client reports EOF by partition id only (see KafkaReader).
        if let Some(code) = partition.error() {
            if code != RDKafkaErrorCode::PartitionEOF {
                let err = ConsumerError::Partition {
                    topic: partition.topic().to_string(),
                    partition: partition.partition_number(),
                    code,
                };
                error!(error = %err, "failed to check partition EOF");
                self.handler.on_error(&err).await;
                return Err(err);
            }
        }

        info!(
            topic = partition.topic(),
            partition = partition.partition_number(),
            operation = "partition EOF",
            "reached end of partition"
        );
        Ok(())
    }

    async fn handle_offsets_committed(
        &self,
        error: Option<KafkaError>,
        committed: Vec<PartitionOffset>,
    ) -> Result<(), ConsumerError> {
        if let Some(e) = error {
            let err = ConsumerError::Kafka(e);
            error!(error = %err, operation = "committed offsets", "commit report failed");
            self.handler.on_error(&err).await;
            return Err(err);
        }

        if let Err(err) = types::check_partitions(&committed) {
            error!(error = %err, operation = "committed offsets", "commit report failed");
            self.handler.on_error(&err).await;
            return Err(err);
        }

        debug!(offsets = ?committed, operation = "committed offsets", "commit report");
        Ok(())
    }

    /// Commit everything the tracker holds. A failed commit RPC leaves the
    /// offsets tracked for the next flush and never terminates the loop.
    async fn flush_offsets(&self, offsets: &OffsetTracker) {
        let (list, counts) = offsets.snapshot();
        if list.is_empty() {
            return;
        }

        let committed = match self.reader.commit(&list) {
            Ok(committed) => committed,
            Err(e) => {
                let err = ConsumerError::Kafka(e);
                error!(error = %err, operation = "commit offsets", "failed to commit");
                self.handler.on_error(&err).await;
                return;
            }
        };

        if let Err(err) = types::check_partitions(&committed) {
            error!(error = %err, operation = "commit offsets", "failed to commit");
            self.handler.on_error(&err).await;
            return;
        }

        debug!(offsets = ?committed, operation = "commit offsets", "committed");

        for po in &committed {
            offsets.remove(po);
            let count = counts.get(po.partition()).copied().unwrap_or(0);
            metrics::counter!(OFFSETS_COMMITTED).increment(1);
            self.handler
                .on_commit(po.topic(), po.partition_number(), po.offset(), count)
                .await;
        }
    }

    /// Ordered teardown after the loop exits, whatever ended it. Every step
    /// logs its own failure; the next step still runs.
    async fn shutdown(&self, events: mpsc::Receiver<ReaderEvent>, offsets: &OffsetTracker) {
        info!("closing");

        self.flush_offsets(offsets).await;

        if let Err(e) = self.reader.unsubscribe() {
            error!(error = %e, "failed to unsubscribe");
        } else if let Err(e) = self.reader.unassign() {
            error!(error = %e, "failed to unassign");
        }

        // Release the event stream before closing: the reader side may be
        // parked on a full channel.
        drop(events);

        if let Err(e) = self.reader.close() {
            error!(error = %e, "failed to close reader");
        }

        info!("closed");
    }
}

#[async_trait]
impl Sleeper for Consumer {
    async fn sleep(
        &self,
        delay: Duration,
        partitions: &[Partition],
    ) -> Result<(), ConsumerError> {
        if partitions.is_empty() {
            return Ok(());
        }

        if let Err(e) = self.reader.pause(partitions) {
            warn!(partitions = ?partitions, error = %e, "failed to pause consumer");
            return Err(ConsumerError::Kafka(e));
        }
        metrics::counter!(PARTITIONS_PAUSED).increment(partitions.len() as u64);

        let reader = self.reader.clone();
        let token = self.token.clone();
        let partitions = partitions.to_vec();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            if token.is_cancelled() {
                warn!("consumer already stopped, skipping resume");
                return;
            }

            if let Err(e) = reader.resume(&partitions) {
                warn!(partitions = ?partitions, error = %e, "failed to resume consumer");
            }

            if token.is_cancelled() {
                return;
            }

            // Resume reports success even when the broker is unreachable;
            // probe metadata to notice that case. Failures are logged only.
            for partition in &partitions {
                if let Err(e) = reader.fetch_metadata(partition.topic(), METADATA_PROBE_TIMEOUT) {
                    warn!(
                        topic = partition.topic(),
                        partition = partition.partition_number(),
                        error = %e,
                        "partition may not have been resumed"
                    );
                }
            }
        });

        Ok(())
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
