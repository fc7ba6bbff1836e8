// ==== Consumer pool metrics ====

/// Counter for messages successfully processed by handlers
pub const MESSAGES_PROCESSED: &str = "kafka_consumer_pool_messages_processed_total";

/// Counter for offsets committed to the broker, one increment per partition per flush
pub const OFFSETS_COMMITTED: &str = "kafka_consumer_pool_offsets_committed_total";

/// Counter for rebalance events, labeled by operation (assign/revoke)
pub const REBALANCE_EVENTS: &str = "kafka_consumer_pool_rebalance_events_total";

/// Counter for informational broker errors the client recovered from
pub const BROKER_ERRORS: &str = "kafka_consumer_pool_broker_errors_total";

/// Counter for partitions paused through the sleep capability
pub const PARTITIONS_PAUSED: &str = "kafka_consumer_pool_partitions_paused_total";
