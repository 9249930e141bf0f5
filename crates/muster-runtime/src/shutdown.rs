//! Idempotent shutdown gate

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;

/// Boxed shutdown future
pub type ShutdownFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// A component that can be torn down exactly once.
///
/// Calling [`Shutdownable::shutdown`] twice is a no-op: the second caller
/// waits for the first teardown to complete.
pub trait Shutdownable: Send + Sync {
    /// Begin (or join) the teardown and wait for it to complete
    fn shutdown(&self) -> ShutdownFuture<'_>;
}

/// Tracks the started/finished shutdown state of a component.
pub struct ShutdownGate {
    started: AtomicBool,
    finished_tx: watch::Sender<bool>,
    finished_rx: watch::Receiver<bool>,
}

impl ShutdownGate {
    /// Create a gate in the running state
    pub fn new() -> Self {
        let (finished_tx, finished_rx) = watch::channel(false);
        Self {
            started: AtomicBool::new(false),
            finished_tx,
            finished_rx,
        }
    }

    /// Claim the teardown; true for the first caller only
    pub fn begin(&self) -> bool {
        !self.started.swap(true, Ordering::SeqCst)
    }

    /// Whether teardown has been claimed
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Whether teardown has completed
    pub fn is_finished(&self) -> bool {
        *self.finished_rx.borrow()
    }

    /// Mark teardown complete, releasing every waiter
    pub fn finish(&self) {
        let _ = self.finished_tx.send(true);
    }

    /// Wait until teardown completes
    pub async fn wait(&self) {
        let mut rx = self.finished_rx.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for ShutdownGate {
    fn default() -> Self {
        Self::new()
    }
}
