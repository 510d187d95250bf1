//! Process-wide cancellation.
//!
//! `Shutdown` is the trigger side (held by the signal handler and `app`),
//! `ShutdownSignal` the observing side handed to every long-running task.

use std::sync::Arc;

use tokio::sync::watch;

#[derive(Clone, Debug)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Requests shutdown. Safe to call any number of times, from any thread.
    ///
    /// Returns `true` only for the call that actually flipped the state.
    pub fn trigger(&self) -> bool {
        !self.tx.send_replace(true)
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown has been requested (immediately if it already was).
    pub async fn wait(&mut self) {
        // `wait_for` only fails if every `Shutdown` handle is gone, which we
        // treat the same as a trigger.
        let _ = self.rx.wait_for(|triggered| *triggered).await;
    }
}
