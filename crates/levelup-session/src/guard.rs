//! Watchdog for the connecting state.
//!
//! At most one callback is pending per guard. Arming again replaces the
//! previous callback, and cancelling aborts it, so a callback that has been
//! cancelled can never run.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

/// A single pending callback tied to one connection attempt.
#[derive(Debug, Default)]
pub struct TimeoutGuard {
    pending: Option<Pending>,
}

#[derive(Debug)]
struct Pending {
    attempt: u64,
    task: JoinHandle<()>,
}

impl TimeoutGuard {
    /// Creates an unarmed guard.
    #[must_use]
    pub const fn new() -> Self {
        Self { pending: None }
    }

    /// Schedules `on_fire` to run after `after`, replacing any pending
    /// callback.
    pub fn arm<F, Fut>(&mut self, attempt: u64, after: Duration, on_fire: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.cancel();
        debug!(attempt, timeout_secs = after.as_secs(), "Connect watchdog armed");
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            on_fire().await;
        });
        self.pending = Some(Pending { attempt, task });
    }

    /// Aborts the pending callback. Returns `true` if one was pending.
    pub fn cancel(&mut self) -> bool {
        match self.pending.take() {
            Some(pending) => {
                pending.task.abort();
                debug!(attempt = pending.attempt, "Connect watchdog cancelled");
                true
            }
            None => false,
        }
    }

    /// Forgets the pending callback without aborting it.
    ///
    /// Called by the callback itself once it has fired.
    pub fn disarm(&mut self, attempt: u64) {
        if self
            .pending
            .as_ref()
            .is_some_and(|pending| pending.attempt == attempt)
        {
            self.pending = None;
        }
    }

    /// Returns `true` if a callback is pending.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.pending
            .as_ref()
            .is_some_and(|pending| !pending.task.is_finished())
    }

    /// Attempt the pending callback belongs to.
    #[must_use]
    pub fn pending_attempt(&self) -> Option<u64> {
        self.pending.as_ref().map(|pending| pending.attempt)
    }
}

impl Drop for TimeoutGuard {
    fn drop(&mut self) {
        self.cancel();
    }
}
