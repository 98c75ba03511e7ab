//! Event bridge from the voice engine to the session controller.
//!
//! The bridge owns the single listener task of a session. Events are handed
//! to the sink one at a time, in the order the engine emitted them.

use std::sync::Weak;

use async_trait::async_trait;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::{EngineEvent, EngineSubscription};

/// Receiver of engine events.
#[async_trait]
pub trait EngineEventSink: Send + Sync + 'static {
    /// Handles one event. The next event is not delivered until this returns.
    async fn on_engine_event(&self, event: EngineEvent);
}

/// Listener registration for one session lifetime.
#[derive(Debug, Default)]
pub struct EventBridge {
    task: Option<JoinHandle<()>>,
}

impl EventBridge {
    /// Creates a detached bridge.
    #[must_use]
    pub const fn new() -> Self {
        Self { task: None }
    }

    /// Returns `true` while the listener task is running.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Starts forwarding events from `subscription` to `sink`.
    ///
    /// Returns `false` without doing anything if already attached; the
    /// subscription is dropped in that case. The sink is held weakly, so the
    /// task ends once the sink is gone.
    pub fn attach<S>(&mut self, subscription: EngineSubscription, sink: Weak<S>) -> bool
    where
        S: EngineEventSink,
    {
        if self.is_attached() {
            debug!("Engine listeners already attached");
            return false;
        }

        self.task = Some(tokio::spawn(forward(subscription, sink)));
        info!("Engine listeners attached");
        true
    }

    /// Stops the listener task and releases the subscription.
    pub fn detach(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            info!("Engine listeners detached");
        }
    }
}

impl Drop for EventBridge {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn forward<S>(mut subscription: EngineSubscription, sink: Weak<S>)
where
    S: EngineEventSink,
{
    loop {
        match subscription.recv().await {
            Ok(event) => {
                let Some(sink) = sink.upgrade() else {
                    debug!("Event sink dropped, stopping listener");
                    break;
                };
                debug!(event = event.name(), "Engine event");
                sink.on_engine_event(event).await;
            }
            Err(RecvError::Lagged(n)) => {
                warn!(missed = n, "Engine listener lagged, events dropped");
            }
            Err(RecvError::Closed) => {
                info!("Engine event stream closed");
                break;
            }
        }
    }
}
