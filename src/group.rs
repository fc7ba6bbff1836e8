use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Instrument};
use uuid::Uuid;

use crate::config::GroupConfig;
use crate::consumer::Consumer;
use crate::error::ConsumerError;
use crate::handler::ConsumerHandler;

/// Supervisor for a pool of identical workers sharing one consumer-group
/// identity.
///
/// All workers are constructed up front - a construction failure aborts and
/// no partial group is ever handed out. [`start`] runs the pool until the
/// first worker terminates or the group is cancelled, and stops every
/// worker before returning; [`stop`] cancels the group and joins all
/// worker tasks. A group runs at most once.
///
/// [`start`]: ConsumerGroup::start
/// [`stop`]: ConsumerGroup::stop
pub struct ConsumerGroup {
    id: Uuid,
    consumers: Vec<Arc<Consumer>>,
    token: CancellationToken,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConsumerGroup {
    /// Build `workers` consumers from the shared config (0 workers means
    /// one per logical CPU).
    pub fn new(
        config: &GroupConfig,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<Self, ConsumerError> {
        let workers = config.effective_workers();
        let mut consumers = Vec::with_capacity(workers);
        for _ in 0..workers {
            consumers.push(Arc::new(Consumer::new(&config.consumer, handler.clone())?));
        }
        Ok(Self::from_consumers(consumers))
    }

    pub(crate) fn from_consumers(consumers: Vec<Arc<Consumer>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            consumers,
            token: CancellationToken::new(),
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn workers(&self) -> usize {
        self.consumers.len()
    }

    /// Launch every worker and block until the first terminal result: a
    /// worker's error, a worker finishing cleanly, or `Ok` when the group
    /// is cancelled. Every worker is stopped before this returns.
    pub async fn start(&self) -> Result<(), ConsumerError> {
        if self.token.is_cancelled() {
            return Err(ConsumerError::AlreadyClosed);
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(ConsumerError::AlreadyRunning);
        }

        let span = tracing::info_span!("consumer_group", id = %self.id, workers = self.consumers.len());
        async {
            info!("starting workers");

            // Capacity covers every worker result plus the cancellation
            // signal, so no sender ever blocks during teardown.
            let (results_tx, mut results_rx) = mpsc::channel(self.consumers.len() + 1);

            {
                let results_tx = results_tx.clone();
                let token = self.token.clone();
                tokio::spawn(async move {
                    token.cancelled().await;
                    let _ = results_tx.send(Ok(())).await;
                });
            }

            for consumer in &self.consumers {
                let consumer = consumer.clone();
                let results_tx = results_tx.clone();
                let task = tokio::spawn(async move {
                    let _ = results_tx.send(consumer.start().await).await;
                });
                self.tasks.lock().expect("tasks lock poisoned").push(task);
            }

            let first = results_rx.recv().await.unwrap_or(Ok(()));

            for consumer in &self.consumers {
                consumer.stop().await;
            }
            // The group is terminal now; release the cancellation watcher
            // and make further starts fail as closed.
            self.token.cancel();

            match &first {
                Ok(()) => info!("group stopped"),
                Err(err) => error!(error = %err, "worker terminated the group"),
            }
            first
        }
        .instrument(span)
        .await
    }

    /// Cancel the group and wait for every worker task to finish.
    /// Idempotent.
    pub async fn stop(&self) {
        self.token.cancel();

        let tasks: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().expect("tasks lock poisoned");
            tasks.drain(..).collect()
        };
        for task in tasks {
            let _ = task.await;
        }
    }
}
