use rdkafka::error::KafkaError;
use rdkafka::types::RDKafkaErrorCode;
use thiserror::Error;

/// Errors surfaced by consumers and groups.
///
/// Informational broker errors never appear here - they go through
/// [`ConsumerHandler::on_error`](crate::handler::ConsumerHandler::on_error)
/// while the event loop keeps running. Everything in this enum is terminal
/// for the worker that returns it.
#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("invalid consumer config: {0}")]
    Config(String),

    #[error("consumer already closed")]
    AlreadyClosed,

    #[error("consumer already running")]
    AlreadyRunning,

    #[error("subscribe to topics failed: {0}")]
    Subscribe(#[source] KafkaError),

    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),

    /// An error embedded in a partition descriptor carried by an event
    /// payload (assignment, revocation or commit report).
    #[error("partition error on {topic}[{partition}]: {code}")]
    Partition {
        topic: String,
        partition: i32,
        code: RDKafkaErrorCode,
    },

    /// The broker reader's event stream terminated underneath the loop.
    #[error("reader event stream closed")]
    EventStreamClosed,

    #[error("message processing failed: {0}")]
    Process(#[source] anyhow::Error),

    #[error("consumer loop panicked: {0}")]
    Panic(String),
}
