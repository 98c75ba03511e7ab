//! HTTP API for driving and observing a call session.
//!
//! # Endpoints
//!
//! - `GET /api/session` - Current session snapshot
//! - `POST /api/session/start` - Start the configured call
//! - `POST /api/session/end` - End or cancel the call
//! - `POST /api/session/dismiss` - Clear a displayed error
//! - `GET /ws` - Session event stream
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use levelup_session::{
//!     create_router, AppState, Config, EngineService, LoopbackEngine, SessionController,
//!     StartParams,
//! };
//!
//! # async fn example() {
//! let config = Config::default();
//! let engine = EngineService::from_engine(Arc::new(LoopbackEngine::new()));
//! let controller = SessionController::new(engine, config.session.clone(), None);
//! let state = AppState::new(config, controller, "assistant-id", StartParams::default());
//!
//! let router = create_router(state);
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:3000").await.unwrap();
//! axum::serve(listener, router).await.unwrap();
//! # }
//! ```

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

use crate::events::{ws_handler, SessionSnapshot};
use crate::{Config, SessionController, SessionError, StartParams};

// ============================================================================
// Request/Response Types
// ============================================================================

/// Response body for the start endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartResponse {
    /// Attempt number of the new call.
    pub attempt: u64,
    /// Session right after the engine accepted the request.
    pub session: SessionSnapshot,
}

/// Error response body returned on failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Description of the error.
    pub error: String,
}

// ============================================================================
// Application State
// ============================================================================

/// Shared application state for the HTTP server.
///
/// One server drives one call target: the assistant and parameters chosen
/// when the interview page was opened.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Loaded configuration.
    pub config: Config,
    /// The session being driven.
    pub controller: SessionController,
    /// Assistant started by `POST /api/session/start`.
    pub assistant_id: String,
    /// Parameters sent with the start command.
    pub params: StartParams,
}

impl AppState {
    /// Creates the state for one call target.
    #[must_use]
    pub fn new(
        config: Config,
        controller: SessionController,
        assistant_id: impl Into<String>,
        params: StartParams,
    ) -> Self {
        Self {
            config,
            controller,
            assistant_id: assistant_id.into(),
            params,
        }
    }
}

// ============================================================================
// API Error Type
// ============================================================================

/// Internal error type for API handlers.
#[derive(Debug)]
enum ApiError {
    /// The session cannot do this right now.
    Conflict(String),
    /// The engine failed.
    Engine(String),
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        if err.is_precondition() {
            Self::Conflict(err.to_string())
        } else {
            Self::Engine(err.user_message())
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::Conflict(msg) => (StatusCode::CONFLICT, msg),
            Self::Engine(msg) => (StatusCode::BAD_GATEWAY, msg),
        };

        let body = Json(ErrorResponse { error: message });
        (status, body).into_response()
    }
}

// ============================================================================
// Router Setup
// ============================================================================

/// Creates the HTTP router with all API endpoints and the event stream.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/session", get(handle_session))
        .route("/session/start", post(handle_start))
        .route("/session/end", post(handle_end))
        .route("/session/dismiss", post(handle_dismiss));

    Router::new()
        .nest("/api", api_routes)
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(Arc::new(state))
}

// ============================================================================
// Handlers
// ============================================================================

/// Handler for `GET /api/session`.
async fn handle_session(State(state): State<Arc<AppState>>) -> Json<SessionSnapshot> {
    Json(state.controller.snapshot().await)
}

/// Handler for `POST /api/session/start`.
///
/// Resolves once the engine has accepted the request. The call becomes
/// active later, which observers see on the event stream.
async fn handle_start(
    State(state): State<Arc<AppState>>,
) -> Result<Json<StartResponse>, ApiError> {
    info!(assistant_id = %state.assistant_id, "Start requested");

    let attempt = state
        .controller
        .start_session(&state.assistant_id, state.params.clone())
        .await
        .map_err(|e| {
            warn!(error = %e, "Start request failed");
            ApiError::from(e)
        })?;

    Ok(Json(StartResponse {
        attempt,
        session: state.controller.snapshot().await,
    }))
}

/// Handler for `POST /api/session/end`.
async fn handle_end(
    State(state): State<Arc<AppState>>,
) -> Result<Json<SessionSnapshot>, ApiError> {
    info!("End requested");

    state.controller.end_session().await.map_err(|e| {
        warn!(error = %e, "End request failed");
        ApiError::from(e)
    })?;

    Ok(Json(state.controller.snapshot().await))
}

/// Handler for `POST /api/session/dismiss`.
async fn handle_dismiss(State(state): State<Arc<AppState>>) -> Json<SessionSnapshot> {
    state.controller.dismiss_error().await;
    Json(state.controller.snapshot().await)
}

// ============================================================================
// Tests
// ============================================================================
