//! Per-second clock for active calls.
//!
//! The tick task exists only while a call is active. Stopping tears it down
//! completely, so the next start always counts from the first second again.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::debug;

/// Tick period.
pub const TICK: Duration = Duration::from_secs(1);

/// Drives the duration counter of an active call.
#[derive(Debug, Default)]
pub struct DurationTracker {
    task: Option<JoinHandle<()>>,
}

impl DurationTracker {
    /// Creates a stopped tracker.
    #[must_use]
    pub const fn new() -> Self {
        Self { task: None }
    }

    /// Starts ticking. `on_tick` runs once per elapsed second, the first time
    /// one second after this call; returning `false` ends the task.
    ///
    /// A running tick task is replaced.
    pub fn start<F, Fut>(&mut self, mut on_tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        self.stop();
        debug!("Duration tracker started");
        self.task = Some(tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + TICK, TICK);
            loop {
                ticks.tick().await;
                if !on_tick().await {
                    break;
                }
            }
        }));
    }

    /// Tears the tick task down.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("Duration tracker stopped");
        }
    }

    /// Returns `true` while the tick task runs.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Drop for DurationTracker {
    fn drop(&mut self) {
        self.stop();
    }
}
