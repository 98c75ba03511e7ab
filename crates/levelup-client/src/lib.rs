//! LevelUp Backend Client
//!
//! Typed access to the LevelUp REST backend: bearer-token authentication,
//! interview records, and normalization of the loosely encoded fields those
//! records carry.
//!
//! The backend owns every record; this crate only reads them (and asks the
//! backend to generate new interviews).

pub mod auth;
pub mod backend;
pub mod questions;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use auth::{AuthSession, AuthStore, AuthTokens, UserClaims};
pub use backend::{latest_by_created_at, BackendClient, CreateInterviewRequest};
pub use questions::{normalize_string_list, parse_string_list};

/// A specialized `Result` type for backend client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors that can occur while talking to the LevelUp backend.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The HTTP request could not be sent or its body could not be read.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The backend rejected the bearer token (401 or 403).
    #[error("Backend rejected the access token (HTTP {status})\n\nSuggestion: Run 'levelup login' to sign in again")]
    Unauthorized {
        /// HTTP status code returned by the backend.
        status: u16,
    },

    /// The requested resource does not exist.
    #[error("Not found: {resource}")]
    NotFound {
        /// Description of the missing resource.
        resource: String,
    },

    /// The backend answered with a status this client does not expect.
    #[error("Unexpected backend response (HTTP {status}): {body}")]
    UnexpectedStatus {
        /// HTTP status code returned by the backend.
        status: u16,
        /// Response body, possibly truncated.
        body: String,
    },

    /// Login failed because the credentials were rejected.
    #[error("Invalid credentials\n\nSuggestion: Check your username and password")]
    InvalidCredentials,

    /// Signup did not return `201 Created`.
    #[error("Signup was rejected (HTTP {status})\n\nSuggestion: The username or email may already be taken")]
    SignupRejected {
        /// HTTP status code returned by the backend.
        status: u16,
    },

    /// The stored access token could not be decoded.
    #[error("Malformed access token: {message}")]
    TokenDecode {
        /// What was wrong with the token.
        message: String,
    },

    /// The stored access token has expired.
    #[error("Your session has expired\n\nSuggestion: Run 'levelup login' to sign in again")]
    TokenExpired,

    /// No access token is stored.
    #[error("Not logged in\n\nSuggestion: Run 'levelup login' first")]
    NotLoggedIn,

    /// I/O error while reading or writing the token file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ClientError {
    /// Creates a new `NotFound` error.
    #[must_use]
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    /// Creates a new `TokenDecode` error.
    #[must_use]
    pub fn token_decode(message: impl Into<String>) -> Self {
        Self::TokenDecode {
            message: message.into(),
        }
    }

    /// Returns `true` if the error means the stored credentials are unusable.
    ///
    /// Tokens are never refreshed; callers answer these errors by logging out.
    #[must_use]
    pub const fn forces_logout(&self) -> bool {
        matches!(
            self,
            Self::Unauthorized { .. } | Self::TokenExpired | Self::TokenDecode { .. }
        )
    }

    /// Returns `true` if the request may succeed when retried.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            Self::UnexpectedStatus { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// An interview record owned by the backend.
///
/// `questions` and `techstack` are kept raw because the backend has stored
/// them in several encodings over time; use [`InterviewRecord::questions`] and
/// [`InterviewRecord::tech_stack`] to read them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterviewRecord {
    /// Backend identifier.
    pub id: i64,

    /// Role the interview targets (e.g. "Backend Engineer").
    #[serde(default)]
    pub role: Option<String>,

    /// Interview type (e.g. "technical", "behavioral").
    #[serde(default, rename = "type")]
    pub interview_type: Option<String>,

    /// Seniority level.
    #[serde(default)]
    pub level: Option<String>,

    /// Raw tech stack field.
    #[serde(default)]
    pub techstack: serde_json::Value,

    /// Raw questions field.
    #[serde(default)]
    pub questions: serde_json::Value,

    /// Owner of the record.
    #[serde(default)]
    pub user_id: Option<i64>,

    /// When the backend created the record.
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
}

impl InterviewRecord {
    /// Returns the interview questions, normalized from whatever encoding the
    /// backend stored.
    #[must_use]
    pub fn questions(&self) -> Vec<String> {
        normalize_string_list(&self.questions)
    }

    /// Returns the tech stack entries.
    #[must_use]
    pub fn tech_stack(&self) -> Vec<String> {
        normalize_string_list(&self.techstack)
    }

    /// Path of the interview's detail view.
    #[must_use]
    pub fn detail_path(&self) -> String {
        format!("/interviews/{}", self.id)
    }
}

/// Serde helpers for backend timestamps.
///
/// The backend emits naive ISO timestamps (no offset) for columns created by
/// the database; those are read as UTC. RFC 3339 strings are accepted too.
pub mod timestamp {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    /// Parses a backend timestamp.
    pub fn parse(raw: &str) -> Option<DateTime<Utc>> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Some(dt.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
            .ok()
            .map(|naive| naive.and_utc())
    }

    /// Serializes as RFC 3339.
    pub fn serialize<S>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.to_rfc3339())
    }

    /// Deserializes RFC 3339 or naive ISO timestamps.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        parse(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp '{raw}'")))
    }
}
