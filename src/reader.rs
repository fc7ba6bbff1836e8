use std::time::Duration;

use rdkafka::error::{KafkaError, KafkaResult};
use rdkafka::message::OwnedMessage;
use tokio::sync::mpsc;

use crate::types::{Partition, PartitionOffset};

/// The event stream carries one in-flight event at a time, mirroring the
/// unbuffered delivery of the underlying client's event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 1;

/// Everything the broker pushes at a consumer, as one tagged union.
#[derive(Debug)]
pub enum ReaderEvent {
    /// Group rebalance: this worker gained the listed partitions. Offsets
    /// are frequently `UNSET_OFFSET` and must be reconciled before assign.
    Assigned(Vec<PartitionOffset>),
    /// Group rebalance: this worker lost the listed partitions.
    Revoked(Vec<PartitionOffset>),
    Message(OwnedMessage),
    /// Reached the end of a partition (`enable.partition.eof`).
    PartitionEof(PartitionOffset),
    /// Commit report from the broker, with per-partition results.
    OffsetsCommitted {
        error: Option<KafkaError>,
        offsets: Vec<PartitionOffset>,
    },
    /// Informational client error; the client recovers on its own.
    Error(KafkaError),
}

/// Broker reader seam between the event loop and the Kafka client.
///
/// Control operations are synchronous, matching the underlying client;
/// events arrive over a channel taken once by the owning consumer. Each
/// reader belongs to exactly one consumer for its whole lifetime.
pub trait Reader: Send + Sync + 'static {
    /// Hand over the event stream. Returns `None` on every call after the
    /// first.
    fn take_events(&self) -> Option<mpsc::Receiver<ReaderEvent>>;

    fn subscribe(&self, topics: &[String]) -> KafkaResult<()>;

    fn unsubscribe(&self) -> KafkaResult<()>;

    /// Apply a partition assignment with explicit starting offsets.
    fn assign(&self, partitions: &[PartitionOffset]) -> KafkaResult<()>;

    fn unassign(&self) -> KafkaResult<()>;

    /// Fetch the broker's committed offsets for the given partitions.
    fn committed(
        &self,
        partitions: &[PartitionOffset],
        timeout: Duration,
    ) -> KafkaResult<Vec<PartitionOffset>>;

    /// Commit the given offsets synchronously; returns the committed set
    /// with any per-partition errors embedded.
    fn commit(&self, offsets: &[PartitionOffset]) -> KafkaResult<Vec<PartitionOffset>>;

    fn pause(&self, partitions: &[Partition]) -> KafkaResult<()>;

    fn resume(&self, partitions: &[Partition]) -> KafkaResult<()>;

    /// Probe broker metadata for a topic. Used after resume, which does not
    /// itself signal broker unavailability.
    fn fetch_metadata(&self, topic: &str, timeout: Duration) -> KafkaResult<()>;

    /// Tear down the connection to the broker. Idempotent.
    fn close(&self) -> KafkaResult<()>;
}
