use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use rdkafka::message::OwnedMessage;

use crate::error::ConsumerError;
use crate::types::{Partition, PartitionOffset};

/// Backpressure capability handed to [`ConsumerHandler::on_process`].
///
/// This is the narrow slice of the consumer a handler is allowed to touch:
/// pausing fetches on specific partitions and scheduling their resume. The
/// consumer itself implements it; handlers never see the full consumer.
#[async_trait]
pub trait Sleeper: Send + Sync {
    /// Pause fetches on `partitions`, then resume them after `delay` from a
    /// background task. An empty partition list is a no-op. Resume failures
    /// are logged, not propagated - only the initial pause can fail here.
    async fn sleep(&self, delay: Duration, partitions: &[Partition]) -> Result<(), ConsumerError>;
}

/// User-supplied callbacks driven by a consumer's event loop.
///
/// `on_process` and `on_error` carry the business logic and must be
/// implemented; the remaining notifications default to no-ops. All
/// callbacks run inline on the consumer's event-loop task - blocking here
/// stalls message delivery and starves the commit ticker.
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    /// Process one message. Returning an error terminates the worker and
    /// propagates out of its `start`.
    async fn on_process(&self, msg: &OwnedMessage, sleeper: &dyn Sleeper) -> Result<()>;

    /// Informational failure report. Never terminates the worker by itself.
    async fn on_error(&self, err: &ConsumerError);

    /// One call per partition per successful commit batch. `committed` is
    /// the number of messages the batch covered for this partition.
    async fn on_commit(&self, _topic: &str, _partition: i32, _offset: i64, _committed: usize) {}

    /// Invoked after a revoked partition set has been unassigned.
    async fn on_revoke(&self, _partitions: &[PartitionOffset]) {}

    /// Invoked after an assigned partition set has been applied.
    async fn on_rebalance(&self, _partitions: &[PartitionOffset]) {}
}
