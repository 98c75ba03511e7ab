//! Session events and their WebSocket stream.
//!
//! Observers (the CLI, a browser tab) follow a call through these events.
//! Every connected client receives them as JSON objects with `event` and
//! `payload` fields.
//!
//! # Event Types
//!
//! - `connected` - Sent when a client connects, includes a session snapshot
//! - `status_changed` - The call moved to another status
//! - `tick` - One more second of an active call
//! - `navigate` - The post-call redirect resolved a target
//! - `error` - A failure worth showing to the user

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use chrono::{DateTime, Utc};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::api::AppState;
use crate::call_state::{format_duration, CallSession, CallStatus};
use crate::controller::SessionController;
use crate::redirect::Navigation;

// ============================================================================
// Snapshot
// ============================================================================

/// Read-only view of a session for observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Current status.
    pub status: CallStatus,
    /// Whole seconds of the active call.
    pub duration_seconds: u64,
    /// Duration as `m:ss`.
    pub formatted_duration: String,
    /// Error to display, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Label of the call button.
    pub button_label: String,
    /// Current attempt number.
    pub attempt: u64,
    /// Whether engine listeners are attached.
    pub listeners_attached: bool,
    /// When the call became active.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Last redirect target.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub navigation: Option<Navigation>,
}

impl SessionSnapshot {
    /// Builds a snapshot of `session`.
    #[must_use]
    pub fn new(session: &CallSession, navigation: Option<Navigation>) -> Self {
        Self {
            status: session.status,
            duration_seconds: session.duration_seconds,
            formatted_duration: session.formatted_duration(),
            last_error: session.last_error.clone(),
            button_label: session.status.button_label().to_string(),
            attempt: session.attempt,
            listeners_attached: session.listeners_attached,
            started_at: session.started_at,
            navigation,
        }
    }
}

// ============================================================================
// Event Payloads
// ============================================================================

/// Payload for the `connected` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectedPayload {
    /// The current session.
    pub session: SessionSnapshot,
}

/// Payload for the `status_changed` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChangedPayload {
    /// Previous status.
    pub from: CallStatus,
    /// New status.
    pub to: CallStatus,
    /// Attempt the change belongs to.
    pub attempt: u64,
    /// Error recorded with the change.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// When the change happened.
    pub timestamp: DateTime<Utc>,
}

/// Payload for the `tick` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickPayload {
    /// Whole seconds of the active call.
    pub duration_seconds: u64,
    /// Duration as `m:ss`.
    pub formatted: String,
}

/// Payload for the `error` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Human-readable error message.
    pub message: String,
}

// ============================================================================
// Event Enum
// ============================================================================

/// Events describing a session's progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Sent when a client connects.
    Connected(ConnectedPayload),
    /// Sent on every status change.
    StatusChanged(StatusChangedPayload),
    /// Sent once per second of an active call.
    Tick(TickPayload),
    /// Sent when the post-call redirect resolved.
    Navigate(Navigation),
    /// Sent when something failed.
    Error(ErrorPayload),
}

impl SessionEvent {
    /// Creates a `Connected` event.
    #[must_use]
    pub const fn connected(session: SessionSnapshot) -> Self {
        Self::Connected(ConnectedPayload { session })
    }

    /// Creates a `StatusChanged` event from the session after the change.
    #[must_use]
    pub fn status_changed(from: CallStatus, session: &CallSession) -> Self {
        Self::StatusChanged(StatusChangedPayload {
            from,
            to: session.status,
            attempt: session.attempt,
            last_error: session.last_error.clone(),
            timestamp: Utc::now(),
        })
    }

    /// Creates a `Tick` event.
    #[must_use]
    pub fn tick(duration_seconds: u64) -> Self {
        Self::Tick(TickPayload {
            duration_seconds,
            formatted: format_duration(duration_seconds),
        })
    }

    /// Creates an `Error` event.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(ErrorPayload {
            message: message.into(),
        })
    }

    /// Returns the event name as a string.
    #[must_use]
    pub const fn event_name(&self) -> &'static str {
        match self {
            Self::Connected(_) => "connected",
            Self::StatusChanged(_) => "status_changed",
            Self::Tick(_) => "tick",
            Self::Navigate(_) => "navigate",
            Self::Error(_) => "error",
        }
    }
}

// ============================================================================
// Event Broadcaster
// ============================================================================

/// Broadcasts session events to all observers.
///
/// Events are not persisted for disconnected clients.
#[derive(Debug, Clone)]
pub struct SessionEvents {
    sender: broadcast::Sender<SessionEvent>,
}

impl SessionEvents {
    /// Creates a broadcaster with the given per-subscriber buffer.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Creates a new subscriber.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    /// Broadcasts an event. Returns the number of receivers; 0 means nobody
    /// is watching.
    pub fn send(&self, event: SessionEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    /// Returns the number of active subscribers.
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for SessionEvents {
    fn default() -> Self {
        Self::new(100)
    }
}

// ============================================================================
// Observer socket
// ============================================================================

/// Ping period for observer sockets.
const PING_EVERY: Duration = Duration::from_secs(30);

/// Unanswered pings tolerated before an observer is dropped.
const PING_TOLERANCE: u8 = 3;

/// Upgrades `/ws` into a session event stream.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    debug!("Observer socket requested");
    let controller = state.controller.clone();
    ws.on_upgrade(move |socket| stream_session(socket, controller))
}

/// What a frame from the observer asks the stream to do.
#[derive(Debug, PartialEq, Eq)]
enum Inbound {
    Continue,
    Reply(Message),
    Hangup,
}

/// Observers are read-only: only control frames matter.
fn inbound(frame: Option<Result<Message, axum::Error>>, unanswered: &mut u8) -> Inbound {
    match frame {
        Some(Ok(Message::Pong(_))) => {
            *unanswered = 0;
            Inbound::Continue
        }
        Some(Ok(Message::Ping(data))) => Inbound::Reply(Message::Pong(data)),
        Some(Ok(Message::Text(_) | Message::Binary(_))) => Inbound::Continue,
        Some(Ok(Message::Close(_))) | None => Inbound::Hangup,
        Some(Err(e)) => {
            debug!(error = %e, "Observer socket error");
            Inbound::Hangup
        }
    }
}

/// Sends one event. Returns `false` once the observer is gone.
async fn push(sink: &mut SplitSink<WebSocket, Message>, event: &SessionEvent) -> bool {
    match serde_json::to_string(event) {
        Ok(json) => sink.send(Message::Text(json)).await.is_ok(),
        Err(e) => {
            warn!(event = event.event_name(), error = %e, "Cannot encode session event");
            true
        }
    }
}

/// Streams the session to one observer: a `connected` snapshot, then every
/// session event until the observer leaves or stops answering pings.
async fn stream_session(socket: WebSocket, controller: SessionController) {
    let (mut sink, mut source) = socket.split();

    // Subscribed before the snapshot so no transition falls in between.
    let mut events = controller.subscribe();
    let snapshot = controller.snapshot().await;
    let status = snapshot.status;
    if !push(&mut sink, &SessionEvent::connected(snapshot)).await {
        return;
    }
    info!(status = %status, "Observer attached");

    let mut pings = interval(PING_EVERY);
    let mut unanswered = 0u8;
    loop {
        let open = tokio::select! {
            frame = source.next() => match inbound(frame, &mut unanswered) {
                Inbound::Continue => true,
                Inbound::Reply(reply) => sink.send(reply).await.is_ok(),
                Inbound::Hangup => false,
            },
            event = events.recv() => match event {
                Ok(event) => push(&mut sink, &event).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Observer fell behind");
                    true
                }
                Err(broadcast::error::RecvError::Closed) => false,
            },
            _ = pings.tick() => {
                unanswered += 1;
                unanswered <= PING_TOLERANCE
                    && sink.send(Message::Ping(Vec::new())).await.is_ok()
            }
        };
        if !open {
            break;
        }
    }

    info!(unanswered, "Observer detached");
}

// ============================================================================
// Tests
// ============================================================================
