use std::time::Duration;

use envconfig::Envconfig;
use rdkafka::ClientConfig;

use crate::error::ConsumerError;

/// Flush cadence used when no commit interval is configured.
pub const DEFAULT_COMMIT_INTERVAL: Duration = Duration::from_secs(5);

/// Environment-level Kafka settings.
#[derive(Envconfig, Clone)]
pub struct KafkaConfig {
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    pub kafka_consumer_group: String,

    pub kafka_consumer_topic: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String, // earliest, latest

    // 0 disables count-based flushing; offsets still flush on the ticker.
    #[envconfig(default = "0")]
    pub kafka_commit_offset_count: usize,

    #[envconfig(default = "5000")]
    pub kafka_commit_offset_duration_ms: u64,

    // 0 means one worker per logical CPU.
    #[envconfig(default = "0")]
    pub kafka_consumer_workers: usize,
}

/// Configuration for a single consumer worker.
///
/// `client_config` is passed through to the Kafka client; the consumer
/// force-overrides the keys it owns (auto-commit, offset store, partition
/// EOF, protocol negotiation, client id) at construction.
#[derive(Clone)]
pub struct ConsumerConfig {
    pub client_config: ClientConfig,
    pub topics: Vec<String>,
    /// Flush the tracker once this many messages accumulated; 0 disables
    /// count-based flushing.
    pub commit_offset_count: usize,
    /// Flush cadence; zero falls back to [`DEFAULT_COMMIT_INTERVAL`].
    pub commit_offset_duration: Duration,
}

impl ConsumerConfig {
    pub fn new(client_config: ClientConfig, topics: Vec<String>) -> Self {
        Self {
            client_config,
            topics,
            commit_offset_count: 0,
            commit_offset_duration: DEFAULT_COMMIT_INTERVAL,
        }
    }

    /// Build a consumer config with the standard client defaults from
    /// environment-level settings.
    pub fn from_kafka_config(config: &KafkaConfig) -> Self {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.kafka_hosts)
            .set("group.id", &config.kafka_consumer_group)
            .set("auto.offset.reset", &config.kafka_consumer_offset_reset)
            .set("socket.timeout.ms", "10000")
            .set("session.timeout.ms", "30000")
            .set("heartbeat.interval.ms", "5000")
            .set("max.poll.interval.ms", "300000");

        if config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }

        Self {
            client_config,
            topics: vec![config.kafka_consumer_topic.clone()],
            commit_offset_count: config.kafka_commit_offset_count,
            commit_offset_duration: Duration::from_millis(config.kafka_commit_offset_duration_ms),
        }
    }

    pub fn with_commit_offset_count(mut self, count: usize) -> Self {
        self.commit_offset_count = count;
        self
    }

    pub fn with_commit_offset_duration(mut self, duration: Duration) -> Self {
        self.commit_offset_duration = duration;
        self
    }

    pub(crate) fn check(&self) -> Result<(), ConsumerError> {
        if self.topics.is_empty() {
            return Err(ConsumerError::Config("topic list is empty".to_string()));
        }
        if self.topics.iter().any(|t| t.is_empty()) {
            return Err(ConsumerError::Config("empty topic name".to_string()));
        }
        Ok(())
    }

    pub(crate) fn commit_interval(&self) -> Duration {
        if self.commit_offset_duration.is_zero() {
            DEFAULT_COMMIT_INTERVAL
        } else {
            self.commit_offset_duration
        }
    }
}

/// Configuration for a worker group.
#[derive(Clone)]
pub struct GroupConfig {
    pub consumer: ConsumerConfig,
    /// Number of workers; 0 means one per logical CPU.
    pub workers: usize,
}

impl GroupConfig {
    pub fn new(consumer: ConsumerConfig, workers: usize) -> Self {
        Self { consumer, workers }
    }

    pub fn from_kafka_config(config: &KafkaConfig) -> Self {
        Self {
            consumer: ConsumerConfig::from_kafka_config(config),
            workers: config.kafka_consumer_workers,
        }
    }

    pub(crate) fn effective_workers(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get()
        } else {
            self.workers
        }
    }
}
