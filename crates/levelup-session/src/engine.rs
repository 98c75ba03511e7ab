//! Voice engine contract.
//!
//! The voice engine is an external collaborator reached through the
//! [`VoiceEngine`] trait. Its events form a closed, versioned set
//! ([`EngineEvent`]); nothing probes the engine at runtime for what it
//! supports.
//!
//! One engine serves the whole process. [`EngineService`] owns it, builds it
//! lazily on first use, and counts the subscriptions handed out so teardown
//! can be checked.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex, PoisonError,
};

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::error::{Result, SessionError};

/// Version of the engine event contract.
pub const ENGINE_EVENT_VERSION: u32 = 1;

// ============================================================================
// Events
// ============================================================================

/// An application-level message carried by the engine during a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineMessage {
    /// Message type, e.g. `transcript` or `api-endpoint-called`.
    #[serde(rename = "type")]
    pub kind: String,

    /// Remaining message fields.
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl EngineMessage {
    /// Creates a message with no payload.
    #[must_use]
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            payload: Map::new(),
        }
    }
}

/// Events emitted by the voice engine.
///
/// Serialized with a `type` tag: `call-start`, `call-end`, `error`,
/// `message`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EngineEvent {
    /// The call is connected.
    CallStart,
    /// The call is over.
    CallEnd,
    /// The engine reported an error.
    Error {
        /// Engine-provided description.
        message: String,
    },
    /// An application-level message.
    Message {
        /// The message.
        message: EngineMessage,
    },
}

impl EngineEvent {
    /// Creates an `Error` event.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Creates a `Message` event with no payload.
    #[must_use]
    pub fn message(kind: impl Into<String>) -> Self {
        Self::Message {
            message: EngineMessage::new(kind),
        }
    }

    /// Returns the event name as used on the wire.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::CallStart => "call-start",
            Self::CallEnd => "call-end",
            Self::Error { .. } => "error",
            Self::Message { .. } => "message",
        }
    }

    /// Returns `true` for errors that only mean the call is over, such as
    /// the remote side ending the meeting.
    #[must_use]
    pub fn is_expected_termination(&self) -> bool {
        match self {
            Self::Error { message } => {
                let message = message.to_lowercase();
                message.contains("meeting ended")
                    || message.contains("meeting has ended")
                    || message.contains("ejected")
            }
            _ => false,
        }
    }
}

/// Fan-out of engine events to subscribers.
#[derive(Debug, Clone)]
pub struct EngineEventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EngineEventBus {
    /// Creates a bus with the given per-subscriber buffer.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Creates a new subscriber.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Publishes an event. Returns the number of receivers.
    pub fn publish(&self, event: EngineEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    /// Returns the number of active subscribers.
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EngineEventBus {
    fn default() -> Self {
        Self::new(100)
    }
}

// ============================================================================
// Start parameters
// ============================================================================

/// Parameters passed with the engine's start command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartParams {
    /// Template variables for the assistant.
    #[serde(default)]
    pub variable_values: Map<String, Value>,
}

impl StartParams {
    /// Parameters for asking a stored interview's questions.
    ///
    /// The assistant receives the questions as one JSON-encoded string.
    pub fn interview(questions: &[String]) -> Result<Self> {
        let mut variable_values = Map::new();
        variable_values.insert(
            "questions".to_string(),
            Value::String(serde_json::to_string(questions)?),
        );
        Ok(Self { variable_values })
    }

    /// Parameters for an open mock interview.
    ///
    /// The assistant gets the user's name and token so it can create the
    /// interview record on the backend itself.
    #[must_use]
    pub fn mock(username: Option<&str>, auth_token: &str) -> Self {
        let mut variable_values = Map::new();
        variable_values.insert(
            "username".to_string(),
            Value::String(username.unwrap_or("User").to_string()),
        );
        variable_values.insert(
            "authToken".to_string(),
            Value::String(auth_token.to_string()),
        );
        Self { variable_values }
    }
}

// ============================================================================
// VoiceEngine trait
// ============================================================================

/// The external voice engine.
#[async_trait]
pub trait VoiceEngine: Send + Sync {
    /// Requests a call with the given assistant. Resolves when the engine has
    /// accepted the request; the call is confirmed later by
    /// [`EngineEvent::CallStart`].
    async fn start(&self, assistant_id: &str, params: &StartParams) -> Result<()>;

    /// Requests termination. Confirmed later by [`EngineEvent::CallEnd`].
    async fn stop(&self) -> Result<()>;

    /// Subscribes to the engine's events.
    fn subscribe(&self) -> broadcast::Receiver<EngineEvent>;
}

type EngineFactory = Box<dyn Fn() -> Arc<dyn VoiceEngine> + Send + Sync>;

/// Owner of the process-wide engine.
pub struct EngineService {
    factory: EngineFactory,
    engine: OnceCell<Arc<dyn VoiceEngine>>,
    leases: Arc<AtomicUsize>,
}

impl std::fmt::Debug for EngineService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineService")
            .field("initialized", &self.is_initialized())
            .field("leases", &self.active_subscriptions())
            .finish_non_exhaustive()
    }
}

impl EngineService {
    /// Creates a service that builds the engine on first use.
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> Arc<dyn VoiceEngine> + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
            engine: OnceCell::new(),
            leases: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Creates a service around an already built engine.
    #[must_use]
    pub fn from_engine(engine: Arc<dyn VoiceEngine>) -> Self {
        Self::new(move || Arc::clone(&engine))
    }

    /// Returns the engine, building it if needed.
    pub fn engine(&self) -> Arc<dyn VoiceEngine> {
        Arc::clone(self.engine.get_or_init(|| {
            info!("Initializing voice engine");
            (self.factory)()
        }))
    }

    /// Returns `true` once the engine has been built.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.engine.get().is_some()
    }

    /// Subscribes to engine events. The lease is released on drop.
    pub fn subscribe(&self) -> EngineSubscription {
        let receiver = self.engine().subscribe();
        let count = self.leases.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(leases = count, "Engine subscription leased");
        EngineSubscription {
            receiver,
            leases: Arc::clone(&self.leases),
        }
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn active_subscriptions(&self) -> usize {
        self.leases.load(Ordering::SeqCst)
    }
}

/// A counted subscription to engine events.
#[derive(Debug)]
pub struct EngineSubscription {
    receiver: broadcast::Receiver<EngineEvent>,
    leases: Arc<AtomicUsize>,
}

impl EngineSubscription {
    /// Receives the next event.
    pub async fn recv(&mut self) -> std::result::Result<EngineEvent, broadcast::error::RecvError> {
        self.receiver.recv().await
    }
}

impl Drop for EngineSubscription {
    fn drop(&mut self) {
        let remaining = self.leases.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        debug!(leases = remaining, "Engine subscription released");
    }
}

// ============================================================================
// LoopbackEngine
// ============================================================================

/// How a [`LoopbackEngine`] answers the start command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StartBehavior {
    /// Accept and wait for events to be injected.
    #[default]
    Accept,
    /// Accept and immediately confirm with `call-start`.
    Connect,
    /// Reject with the given message.
    Reject(String),
    /// Never answer.
    Hang,
}

/// How a [`LoopbackEngine`] answers the stop command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StopBehavior {
    /// Accept and confirm with `call-end`.
    #[default]
    Confirm,
    /// Accept without confirming.
    Accept,
    /// Reject with the given message.
    Reject(String),
}

/// A command received by a [`LoopbackEngine`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCommand {
    /// `start(assistant_id, params)`.
    Start {
        /// Assistant requested.
        assistant_id: String,
        /// Parameters sent.
        params: StartParams,
    },
    /// `stop()`.
    Stop,
}

#[derive(Debug, Default)]
struct LoopbackState {
    start: StartBehavior,
    stop: StopBehavior,
    commands: Vec<EngineCommand>,
}

/// An in-process engine whose events are injected by hand.
///
/// Used for rehearsing the session flow without a gateway, and by tests.
#[derive(Debug, Default)]
pub struct LoopbackEngine {
    bus: EngineEventBus,
    state: Mutex<LoopbackState>,
}

impl LoopbackEngine {
    /// Creates an engine that accepts start and confirms stop.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, LoopbackState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sets how the start command is answered.
    pub fn set_start_behavior(&self, behavior: StartBehavior) {
        self.state().start = behavior;
    }

    /// Sets how the stop command is answered.
    pub fn set_stop_behavior(&self, behavior: StopBehavior) {
        self.state().stop = behavior;
    }

    /// Injects an event as if the engine had emitted it.
    pub fn emit(&self, event: EngineEvent) -> usize {
        self.bus.publish(event)
    }

    /// Commands received so far.
    #[must_use]
    pub fn commands(&self) -> Vec<EngineCommand> {
        self.state().commands.clone()
    }

    /// Number of stop commands received so far.
    #[must_use]
    pub fn stop_count(&self) -> usize {
        self.state()
            .commands
            .iter()
            .filter(|c| matches!(c, EngineCommand::Stop))
            .count()
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.bus.receiver_count()
    }
}

#[async_trait]
impl VoiceEngine for LoopbackEngine {
    async fn start(&self, assistant_id: &str, params: &StartParams) -> Result<()> {
        let behavior = {
            let mut state = self.state();
            state.commands.push(EngineCommand::Start {
                assistant_id: assistant_id.to_string(),
                params: params.clone(),
            });
            state.start.clone()
        };

        match behavior {
            StartBehavior::Accept => Ok(()),
            StartBehavior::Connect => {
                self.bus.publish(EngineEvent::CallStart);
                Ok(())
            }
            StartBehavior::Reject(message) => Err(SessionError::start_failed(message)),
            StartBehavior::Hang => {
                std::future::pending::<()>().await;
                Ok(())
            }
        }
    }

    async fn stop(&self) -> Result<()> {
        let behavior = {
            let mut state = self.state();
            state.commands.push(EngineCommand::Stop);
            state.stop.clone()
        };

        match behavior {
            StopBehavior::Confirm => {
                self.bus.publish(EngineEvent::CallEnd);
                Ok(())
            }
            StopBehavior::Accept => Ok(()),
            StopBehavior::Reject(message) => Err(SessionError::stop_failed(message)),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.bus.subscribe()
    }
}

// ============================================================================
// Tests
// ============================================================================
