//! Call session state for the LevelUp interview client.
//!
//! This module defines the call lifecycle state machine. The types here are
//! plain data: every mutation goes through a transition method that checks
//! the current status, and the controller serializes those calls.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError, CONNECT_TIMEOUT_MESSAGE};

// ============================================================================
// CallStatus
// ============================================================================

/// Current status of an interview call.
///
/// The status transitions through these states:
/// - `Idle` -> `Connecting` (start)
/// - From `Connecting`:
///   - `Active` (engine confirmed the call)
///   - `Error` (start failed, engine error, or connect timeout)
///   - `Ending` (cancelled while connecting)
///   - `Idle` (engine ended the call)
/// - From `Active`: `Ending` (user hung up), `Idle` (call ended), `Error`
/// - From `Ending`: `Idle` (call ended or stop acknowledged), `Error`
/// - `Error` -> `Connecting` (retry), `Idle` (trailing call-end or dismiss)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    /// No call; ready to start.
    #[default]
    Idle,
    /// Start issued, waiting for the engine to confirm.
    Connecting,
    /// Call in progress.
    Active,
    /// Stop issued, waiting for the engine to confirm.
    Ending,
    /// The last attempt failed. Not terminal; the user may retry.
    Error,
}

impl CallStatus {
    /// Returns `true` if a new call may be started from this status.
    ///
    /// # Examples
    ///
    /// ```
    /// use levelup_session::CallStatus;
    ///
    /// assert!(CallStatus::Idle.can_start());
    /// assert!(CallStatus::Error.can_start());
    /// assert!(!CallStatus::Active.can_start());
    /// ```
    #[must_use]
    pub const fn can_start(&self) -> bool {
        matches!(self, Self::Idle | Self::Error)
    }

    /// Returns `true` if the call may be ended from this status.
    #[must_use]
    pub const fn can_end(&self) -> bool {
        matches!(self, Self::Active | Self::Connecting)
    }

    /// Returns `true` while the engine owns an outstanding call.
    #[must_use]
    pub const fn is_busy(&self) -> bool {
        matches!(self, Self::Connecting | Self::Active | Self::Ending)
    }

    /// Label of the single call button for this status.
    #[must_use]
    pub const fn button_label(&self) -> &'static str {
        match self {
            Self::Connecting => "Connecting...",
            Self::Ending => "Hanging up...",
            Self::Active => "End Interview",
            Self::Idle | Self::Error => "Start Practice Interview",
        }
    }
}

impl std::fmt::Display for CallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Active => "active",
            Self::Ending => "ending",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// Formats a duration as `m:ss`.
///
/// # Examples
///
/// ```
/// use levelup_session::format_duration;
///
/// assert_eq!(format_duration(0), "0:00");
/// assert_eq!(format_duration(65), "1:05");
/// assert_eq!(format_duration(3600), "60:00");
/// ```
#[must_use]
pub fn format_duration(seconds: u64) -> String {
    format!("{}:{:02}", seconds / 60, seconds % 60)
}

// ============================================================================
// CallSession
// ============================================================================

/// State of the interview call owned by one controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSession {
    /// Current status.
    pub status: CallStatus,

    /// When the call became active.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// Whole seconds spent in `Active`; 0 in every other status.
    pub duration_seconds: u64,

    /// Message of the last failure, cleared by any successful transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    /// Whether engine listeners are attached for this session.
    pub listeners_attached: bool,

    /// Incremented on every start; stale callbacks compare against it.
    pub attempt: u64,

    /// Set when the current attempt failed only because the connecting
    /// watchdog fired.
    #[serde(default)]
    pub connect_timed_out: bool,

    /// When the session last changed.
    pub updated_at: DateTime<Utc>,
}

impl Default for CallSession {
    fn default() -> Self {
        Self::new()
    }
}

impl CallSession {
    /// Creates a new session in `Idle`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            status: CallStatus::Idle,
            started_at: None,
            duration_seconds: 0,
            last_error: None,
            listeners_attached: false,
            attempt: 0,
            connect_timed_out: false,
            updated_at: Utc::now(),
        }
    }

    /// Updates the `updated_at` timestamp to the current time.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    fn leave_active(&mut self) {
        self.started_at = None;
        self.duration_seconds = 0;
    }

    /// `Idle | Error` -> `Connecting`. Returns the new attempt number.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::SessionBusy` from any other status.
    pub fn begin_connecting(&mut self) -> Result<u64> {
        if !self.status.can_start() {
            return Err(SessionError::session_busy(self.status));
        }
        self.status = CallStatus::Connecting;
        self.last_error = None;
        self.connect_timed_out = false;
        self.attempt += 1;
        self.leave_active();
        self.touch();
        Ok(self.attempt)
    }

    /// Returns `true` if a call-start confirmation may move this session to
    /// `Active`.
    ///
    /// Besides `Connecting`, a confirmation for an attempt the watchdog has
    /// just timed out is accepted: the engine did connect, so the call exists.
    #[must_use]
    pub const fn accepts_call_start(&self) -> bool {
        match self.status {
            CallStatus::Connecting => true,
            CallStatus::Error => self.connect_timed_out,
            _ => false,
        }
    }

    /// `Connecting` -> `Active`, with the duration reset to 0.
    pub fn mark_active(&mut self) -> Result<()> {
        if !self.accepts_call_start() {
            return Err(SessionError::invalid_transition(
                self.status,
                CallStatus::Active,
            ));
        }
        self.status = CallStatus::Active;
        self.started_at = Some(Utc::now());
        self.duration_seconds = 0;
        self.last_error = None;
        self.connect_timed_out = false;
        self.touch();
        Ok(())
    }

    /// `Active | Connecting` -> `Ending`.
    pub fn begin_ending(&mut self) -> Result<()> {
        if !self.status.can_end() {
            return Err(SessionError::invalid_transition(
                self.status,
                CallStatus::Ending,
            ));
        }
        self.status = CallStatus::Ending;
        self.leave_active();
        self.touch();
        Ok(())
    }

    /// `Connecting | Active | Ending | Error` -> `Idle`, clearing the error.
    ///
    /// The engine reports a failed call as an error followed by its
    /// call-end, so `Error` is accepted too.
    pub fn mark_ended(&mut self) -> Result<()> {
        if self.status == CallStatus::Idle {
            return Err(SessionError::invalid_transition(
                self.status,
                CallStatus::Idle,
            ));
        }
        self.status = CallStatus::Idle;
        self.last_error = None;
        self.connect_timed_out = false;
        self.leave_active();
        self.touch();
        Ok(())
    }

    /// Any status -> `Error` with the given message.
    pub fn fail(&mut self, message: impl Into<String>) {
        self.status = CallStatus::Error;
        self.last_error = Some(message.into());
        self.connect_timed_out = false;
        self.leave_active();
        self.touch();
    }

    /// `Connecting` -> `Error` because no confirmation arrived in time.
    pub fn time_out(&mut self) -> Result<()> {
        if self.status != CallStatus::Connecting {
            return Err(SessionError::invalid_transition(
                self.status,
                CallStatus::Error,
            ));
        }
        self.fail(CONNECT_TIMEOUT_MESSAGE);
        self.connect_timed_out = true;
        Ok(())
    }

    /// Clears a displayed error without changing the status otherwise.
    pub fn dismiss_error(&mut self) {
        if self.last_error.take().is_some() && self.status == CallStatus::Error {
            self.status = CallStatus::Idle;
        }
        self.touch();
    }

    /// Adds one second while `Active`. Returns `true` if the duration changed.
    pub fn tick(&mut self) -> bool {
        if self.status != CallStatus::Active {
            return false;
        }
        self.duration_seconds += 1;
        true
    }

    /// Duration formatted as `m:ss`.
    #[must_use]
    pub fn formatted_duration(&self) -> String {
        format_duration(self.duration_seconds)
    }
}

// ============================================================================
// Tests
// ============================================================================
