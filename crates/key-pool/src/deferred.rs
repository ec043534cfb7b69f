//! Deferred background writes
//!
//! Persistence that should not hold up the request path (blocking a key,
//! starting a cooldown) is spawned through a [`DeferredTracker`]. The caller
//! gets a [`Deferred`] handle and must say what it wants: `detach()` to let it
//! run on its own, or `wait()` to block on completion. The tracker counts
//! pending tasks so shutdown can wait for them to drain.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::error;

#[derive(Default)]
struct Pending {
    count: AtomicUsize,
    idle: Notify,
}

/// Spawns deferred tasks and tracks how many are still running.
#[derive(Clone, Default)]
pub struct DeferredTracker {
    pending: Arc<Pending>,
}

/// Decrements the pending count even if the task panics or is aborted.
struct PendingGuard(Arc<Pending>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

impl DeferredTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `task` on the runtime. `label` names the write in error logs.
    pub fn spawn<F>(&self, label: &'static str, task: F) -> Deferred
    where
        F: Future<Output = crate::Result<()>> + Send + 'static,
    {
        self.pending.count.fetch_add(1, Ordering::AcqRel);
        let guard = PendingGuard(Arc::clone(&self.pending));
        let handle = tokio::spawn(async move {
            let _guard = guard;
            if let Err(e) = task.await {
                error!(task = label, error = %e, "deferred write failed");
            }
        });
        Deferred { handle }
    }

    /// Number of deferred tasks not yet finished.
    pub fn pending(&self) -> usize {
        self.pending.count.load(Ordering::Acquire)
    }

    /// Resolve once no deferred task is pending.
    pub async fn drained(&self) {
        loop {
            let notified = self.pending.idle.notified();
            tokio::pin!(notified);
            // Register before checking so a completion in between is not missed.
            notified.as_mut().enable();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Handle to one deferred write.
#[must_use = "call detach() or wait() to make the fire-and-forget decision explicit"]
pub struct Deferred {
    handle: JoinHandle<()>,
}

impl Deferred {
    /// Let the task finish in the background.
    pub fn detach(self) {
        drop(self.handle);
    }

    /// Wait for the task to finish. Failures are already logged.
    pub async fn wait(self) {
        if let Err(e) = self.handle.await {
            error!(error = %e, "deferred task did not complete");
        }
    }
}
