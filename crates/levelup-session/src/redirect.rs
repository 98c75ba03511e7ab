//! Post-call redirect to a newly created interview.
//!
//! Some assistants create an interview on the backend during the call and
//! announce it with an engine message. Once such a call ends, the newest
//! interview is looked up and a navigation to its detail view is emitted.

use std::sync::Arc;

use async_trait::async_trait;
use levelup_client::{latest_by_created_at, BackendClient, InterviewRecord};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::engine::EngineMessage;

/// Where interviews are listed from.
#[async_trait]
pub trait InterviewSource: Send + Sync {
    /// Lists the current user's interviews.
    async fn list_interviews(&self) -> levelup_client::Result<Vec<InterviewRecord>>;
}

#[async_trait]
impl InterviewSource for BackendClient {
    async fn list_interviews(&self) -> levelup_client::Result<Vec<InterviewRecord>> {
        Self::list_interviews(self).await
    }
}

/// A navigation target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Navigation {
    /// Path of the detail view.
    pub path: String,
    /// Interview the path points at.
    pub interview_id: i64,
}

impl Navigation {
    /// Navigation to an interview's detail view.
    #[must_use]
    pub fn to_interview(record: &InterviewRecord) -> Self {
        Self {
            path: record.detail_path(),
            interview_id: record.id,
        }
    }
}

/// Per-attempt bookkeeping: has the signal been seen, has the redirect run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RedirectFlags {
    attempt: u64,
    signal_seen: bool,
    fired: bool,
}

impl RedirectFlags {
    /// Clears the flags for a new attempt.
    pub fn reset(&mut self, attempt: u64) {
        *self = Self {
            attempt,
            ..Self::default()
        };
    }

    /// Records `message` if it is the redirect signal for `attempt`.
    /// Returns `true` if it was.
    pub fn observe(&mut self, attempt: u64, message: &EngineMessage, signal: &str) -> bool {
        if attempt != self.attempt || message.kind != signal {
            return false;
        }
        self.signal_seen = true;
        true
    }

    /// Returns `true` exactly once per attempt, and only after the signal.
    pub fn take_trigger(&mut self, attempt: u64) -> bool {
        if attempt != self.attempt || !self.signal_seen || self.fired {
            return false;
        }
        self.fired = true;
        true
    }

    /// Whether the signal has been seen for the current attempt.
    #[must_use]
    pub const fn signal_seen(&self) -> bool {
        self.signal_seen
    }
}

/// Looks up the newest interview after a signalled call.
#[derive(Clone)]
pub struct Redirector {
    source: Arc<dyn InterviewSource>,
    signal: String,
}

impl std::fmt::Debug for Redirector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Redirector")
            .field("signal", &self.signal)
            .finish_non_exhaustive()
    }
}

impl Redirector {
    /// Creates a redirector reacting to messages of type `signal`.
    pub fn new(source: Arc<dyn InterviewSource>, signal: impl Into<String>) -> Self {
        Self {
            source,
            signal: signal.into(),
        }
    }

    /// Message type that arms the redirect.
    #[must_use]
    pub fn signal(&self) -> &str {
        &self.signal
    }

    /// Fetches the interview list and returns a navigation to the newest
    /// entry. Failures are logged and yield `None`.
    pub async fn resolve(&self) -> Option<Navigation> {
        debug!("Looking up newest interview for redirect");
        let interviews = match self.source.list_interviews().await {
            Ok(interviews) => interviews,
            Err(e) => {
                warn!(error = %e, "Redirect lookup failed");
                return None;
            }
        };

        let Some(latest) = latest_by_created_at(&interviews) else {
            warn!("Redirect lookup returned no interviews");
            return None;
        };

        let navigation = Navigation::to_interview(latest);
        info!(path = %navigation.path, "Redirecting to newest interview");
        Some(navigation)
    }
}
