//! Bearer-token authentication against the LevelUp backend.
//!
//! The token obtained at login is persisted to a small JSON file so later
//! commands can reuse it. Tokens are never refreshed: once the `exp` claim has
//! passed, or the backend answers 401/403, the session is logged out and the
//! user has to sign in again.

use std::path::{Path, PathBuf};

use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{ClientError, Result};

/// Tokens returned by `POST /login/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthTokens {
    /// The JWT access token.
    pub access_token: String,

    /// Token type reported by the backend (normally "bearer").
    #[serde(default)]
    pub token_type: Option<String>,
}

/// Claims carried in the access token payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserClaims {
    /// Backend user id.
    #[serde(default)]
    pub user_id: Option<i64>,

    /// Username, when the backend includes it.
    #[serde(default)]
    pub username: Option<String>,

    /// Email, when the backend includes it.
    #[serde(default)]
    pub email: Option<String>,

    /// Expiry as seconds since the Unix epoch.
    #[serde(default)]
    pub exp: Option<i64>,
}

impl UserClaims {
    /// Returns the expiry instant, if the token carries one.
    #[must_use]
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.exp.and_then(|exp| Utc.timestamp_opt(exp, 0).single())
    }

    /// Name to show for the signed-in user.
    #[must_use]
    pub fn display_name(&self) -> String {
        self.username
            .clone()
            .or_else(|| self.user_id.map(|id| format!("user #{id}")))
            .unwrap_or_else(|| "User".to_string())
    }
}

impl AuthTokens {
    /// Creates tokens from a bare access token.
    #[must_use]
    pub fn bearer(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            token_type: Some("bearer".to_string()),
        }
    }

    /// Decodes the JWT payload without verifying the signature.
    ///
    /// Only the backend can verify the token; the client reads the claims for
    /// display and for the expiry check.
    pub fn claims(&self) -> Result<UserClaims> {
        let payload = self
            .access_token
            .split('.')
            .nth(1)
            .ok_or_else(|| ClientError::token_decode("expected three dot-separated segments"))?;

        let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(payload.trim_end_matches('='))
            .map_err(|e| ClientError::token_decode(format!("payload is not base64url: {e}")))?;

        serde_json::from_slice(&bytes)
            .map_err(|e| ClientError::token_decode(format!("payload is not JSON: {e}")))
    }

    /// Returns `true` if the token's `exp` claim is at or before `now`.
    ///
    /// Tokens without an `exp` claim never expire on the client side.
    pub fn is_expired(&self, now: DateTime<Utc>) -> Result<bool> {
        Ok(self
            .claims()?
            .expires_at()
            .is_some_and(|expires_at| expires_at <= now))
    }

    /// Value for the `Authorization` header.
    #[must_use]
    pub fn authorization_header(&self) -> String {
        format!("Bearer {}", self.access_token)
    }
}

/// On-disk storage for the access token.
#[derive(Debug, Clone)]
pub struct AuthStore {
    path: PathBuf,
}

impl AuthStore {
    /// Creates a store backed by the given file.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the token file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads stored tokens, returning `None` if nothing is stored.
    pub fn load(&self) -> Result<Option<AuthTokens>> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => Ok(Some(serde_json::from_str(&contents)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Persists tokens, creating parent directories as needed.
    pub fn save(&self, tokens: &AuthTokens) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(tokens)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }

    /// Removes stored tokens. Missing files are not an error.
    pub fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Debug, Serialize)]
struct SignupRequest<'a> {
    username: &'a str,
    email: &'a str,
    password: &'a str,
}

/// The signed-in user's session.
#[derive(Debug, Clone)]
pub struct AuthSession {
    http: reqwest::Client,
    base_url: String,
    store: AuthStore,
    tokens: Option<AuthTokens>,
}

impl AuthSession {
    /// Opens a session, loading any previously stored token.
    pub fn open(base_url: impl Into<String>, store: AuthStore) -> Result<Self> {
        let tokens = store.load()?;
        debug!(logged_in = tokens.is_some(), path = %store.path().display(), "Opened auth session");
        Ok(Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            store,
            tokens,
        })
    }

    /// Returns the stored tokens, if any.
    #[must_use]
    pub const fn tokens(&self) -> Option<&AuthTokens> {
        self.tokens.as_ref()
    }

    /// Signs in with username and password (form-encoded, as the backend's
    /// OAuth2 password flow expects) and stores the returned token.
    pub async fn login(&mut self, username: &str, password: &str) -> Result<UserClaims> {
        info!(username, "Logging in");

        let response = self
            .http
            .post(format!("{}/login/", self.base_url))
            .form(&[("username", username), ("password", password)])
            .send()
            .await?;

        let status = response.status();
        if status.is_client_error() {
            warn!(status = status.as_u16(), "Login rejected");
            return Err(ClientError::InvalidCredentials);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::UnexpectedStatus {
                status: status.as_u16(),
                body,
            });
        }

        let tokens: AuthTokens = response.json().await?;
        let mut claims = tokens.claims()?;
        if claims.username.is_none() {
            claims.username = Some(username.to_string());
        }

        self.store.save(&tokens)?;
        self.tokens = Some(tokens);
        info!(user_id = ?claims.user_id, "Login successful");
        Ok(claims)
    }

    /// Creates a new account. Only `201 Created` counts as success.
    pub async fn register(&self, username: &str, email: &str, password: &str) -> Result<()> {
        info!(username, "Registering new account");

        let response = self
            .http
            .post(format!("{}/users/", self.base_url))
            .json(&SignupRequest {
                username,
                email,
                password,
            })
            .send()
            .await?;

        let status = response.status();
        if status != reqwest::StatusCode::CREATED {
            warn!(status = status.as_u16(), "Signup rejected");
            return Err(ClientError::SignupRejected {
                status: status.as_u16(),
            });
        }
        Ok(())
    }

    /// Forgets the stored token.
    pub fn logout(&mut self) -> Result<()> {
        info!("Logging out");
        self.tokens = None;
        self.store.clear()
    }

    /// Returns the token if it is present and unexpired at `now`.
    ///
    /// An expired or undecodable token logs the session out.
    pub fn ensure_valid(&mut self, now: DateTime<Utc>) -> Result<AuthTokens> {
        let tokens = self.tokens.clone().ok_or(ClientError::NotLoggedIn)?;
        match tokens.is_expired(now) {
            Ok(false) => Ok(tokens),
            Ok(true) => {
                warn!("Access token expired, forcing logout");
                self.logout()?;
                Err(ClientError::TokenExpired)
            }
            Err(e) => {
                warn!(error = %e, "Stored token is unreadable, forcing logout");
                self.logout()?;
                Err(e)
            }
        }
    }

    /// Logs out if `error` means the credentials are unusable, then hands the
    /// error back.
    pub fn handle_error(&mut self, error: ClientError) -> ClientError {
        if error.forces_logout() {
            if let Err(e) = self.logout() {
                warn!(error = %e, "Failed to clear stored token");
            }
        }
        error
    }
}
