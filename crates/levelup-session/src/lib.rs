//! LevelUp call session
//!
//! Drives one voice interview call: lifecycle state machine, connect
//! watchdog, duration clock, post-call redirect, HTTP API and WebSocket
//! events.

pub mod api;
pub mod bridge;
pub mod call_state;
pub mod config;
pub mod controller;
pub mod duration;
pub mod engine;
pub mod error;
pub mod events;
pub mod gateway;
pub mod guard;
pub mod redirect;

pub use api::{create_router, AppState, ErrorResponse, StartResponse};
pub use bridge::{EngineEventSink, EventBridge};
pub use call_state::{format_duration, CallSession, CallStatus};
pub use config::{BackendConfig, Config, EngineConfig, SessionConfig, CONFIG_FILE_NAME};
pub use controller::SessionController;
pub use duration::DurationTracker;
pub use engine::{
    EngineCommand, EngineEvent, EngineEventBus, EngineMessage, EngineService,
    EngineSubscription, LoopbackEngine, StartBehavior, StartParams, StopBehavior, VoiceEngine,
    ENGINE_EVENT_VERSION,
};
pub use error::{
    Result, SessionError, CONNECT_TIMEOUT_MESSAGE, START_FAILED_MESSAGE, STOP_FAILED_MESSAGE,
};
pub use events::{SessionEvent, SessionEvents, SessionSnapshot};
pub use gateway::GatewayEngine;
pub use guard::TimeoutGuard;
pub use redirect::{InterviewSource, Navigation, RedirectFlags, Redirector};
