// Kafka consumer pool - multiplexes a pool of consumer-group workers over a
// topic subscription with manual offset accumulation and commit.
pub mod config;
pub mod consumer;
pub mod error;
pub mod group;
pub mod handler;
pub mod kafka_reader;
pub mod metrics_consts;
pub mod observable;
pub mod offset_tracker;
pub mod reader;
pub mod types;

#[cfg(test)]
pub mod test_utils;

// Public API - what users of the library should use
pub use config::{ConsumerConfig, GroupConfig, KafkaConfig};
pub use consumer::Consumer;
pub use error::ConsumerError;
pub use group::ConsumerGroup;
pub use handler::{ConsumerHandler, Sleeper};
pub use kafka_reader::KafkaReader;
pub use observable::ConsumerState;
pub use reader::{Reader, ReaderEvent};
pub use types::{Partition, PartitionOffset, UNSET_OFFSET};
