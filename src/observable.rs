use tokio::sync::watch;

/// Lifecycle states a consumer broadcasts to its subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// Constructed but not yet started.
    Idle,
    /// Event loop running.
    Run,
    /// Event loop exited; reached exactly once per lifecycle.
    Closed,
}

/// Broadcasts lifecycle transitions over a watch channel.
///
/// Subscribers always observe the latest state; a slow subscriber never
/// blocks the notifier (intermediate states are simply overwritten).
/// Unsubscribing is dropping the receiver.
pub(crate) struct Observable {
    tx: watch::Sender<ConsumerState>,
}

impl Observable {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ConsumerState::Idle);
        Self { tx }
    }

    /// Hand out a fresh state stream positioned at the current state.
    pub fn subscribe(&self) -> watch::Receiver<ConsumerState> {
        self.tx.subscribe()
    }

    pub fn notify(&self, state: ConsumerState) {
        // send_replace never fails, receivers or not.
        self.tx.send_replace(state);
    }

    pub fn state(&self) -> ConsumerState {
        *self.tx.borrow()
    }
}
