//! Configuration types for the LevelUp interview client.
//!
//! Settings are read from `levelup.json` (camelCase keys). A missing file
//! yields defaults; environment variables then override the engine and
//! backend settings so secrets can stay out of the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};

/// The default config file name.
pub const CONFIG_FILE_NAME: &str = "levelup.json";

/// Environment variable overriding [`EngineConfig::public_key`].
pub const ENV_ENGINE_PUBLIC_KEY: &str = "LEVELUP_ENGINE_PUBLIC_KEY";
/// Environment variable overriding [`EngineConfig::interview_assistant_id`].
pub const ENV_INTERVIEW_ASSISTANT_ID: &str = "LEVELUP_INTERVIEW_ASSISTANT_ID";
/// Environment variable overriding [`EngineConfig::mock_assistant_id`].
pub const ENV_MOCK_ASSISTANT_ID: &str = "LEVELUP_MOCK_ASSISTANT_ID";
/// Environment variable overriding [`EngineConfig::gateway_url`].
pub const ENV_GATEWAY_URL: &str = "LEVELUP_GATEWAY_URL";
/// Environment variable overriding [`BackendConfig::base_url`].
pub const ENV_BACKEND_URL: &str = "LEVELUP_BACKEND_URL";

fn default_gateway_url() -> String {
    "ws://127.0.0.1:8765/call".to_string()
}

fn default_backend_url() -> String {
    "http://localhost:8000".to_string()
}

/// Default upper bound on the engine's start acknowledgement.
const fn default_start_timeout() -> u64 {
    15
}

/// Default connecting watchdog window.
const fn default_connect_timeout() -> u64 {
    10
}

/// Message type that signals the backend created a new interview.
fn default_redirect_signal() -> String {
    "api-endpoint-called".to_string()
}

const fn default_true() -> bool {
    true
}

fn default_auth_file() -> String {
    ".levelup/auth.json".to_string()
}

/// Default port for the local control API.
const fn default_api_port() -> u16 {
    3000
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Voice engine settings.
    #[serde(default)]
    pub engine: EngineConfig,

    /// REST backend settings.
    #[serde(default)]
    pub backend: BackendConfig,

    /// Call session timing and redirect behavior.
    #[serde(default)]
    pub session: SessionConfig,

    /// Where the access token is stored.
    #[serde(default = "default_auth_file")]
    pub auth_file: String,

    /// Port for the local control API.
    #[serde(default = "default_api_port")]
    pub api_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            backend: BackendConfig::default(),
            session: SessionConfig::default(),
            auth_file: default_auth_file(),
            api_port: default_api_port(),
        }
    }
}

/// Voice engine settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Public key presented to the voice gateway.
    #[serde(default)]
    pub public_key: String,

    /// Assistant that asks a stored interview's questions.
    #[serde(default)]
    pub interview_assistant_id: String,

    /// Assistant that runs an open mock interview.
    #[serde(default)]
    pub mock_assistant_id: String,

    /// WebSocket URL of the voice gateway.
    #[serde(default = "default_gateway_url")]
    pub gateway_url: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            public_key: String::new(),
            interview_assistant_id: String::new(),
            mock_assistant_id: String::new(),
            gateway_url: default_gateway_url(),
        }
    }
}

/// REST backend settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendConfig {
    /// Base URL of the backend.
    #[serde(default = "default_backend_url")]
    pub base_url: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_backend_url(),
        }
    }
}

/// Call session timing and redirect behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    /// Upper bound in seconds on the engine's start acknowledgement.
    #[serde(default = "default_start_timeout")]
    pub start_timeout_secs: u64,

    /// Seconds a session may stay connecting before it is forced to error.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Engine message type announcing that the backend created an interview.
    #[serde(default = "default_redirect_signal")]
    pub redirect_signal: String,

    /// Whether to navigate to the newest interview after a signalled call.
    #[serde(default = "default_true")]
    pub redirect_enabled: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            start_timeout_secs: default_start_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            redirect_signal: default_redirect_signal(),
            redirect_enabled: default_true(),
        }
    }
}

impl SessionConfig {
    /// Start acknowledgement bound as a `Duration`.
    #[must_use]
    pub const fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    /// Connecting watchdog window as a `Duration`.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Config {
    /// Loads configuration from the current working directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but contains invalid JSON.
    pub fn load() -> Result<Self> {
        let current_dir = std::env::current_dir().map_err(|e| {
            SessionError::config_parse(
                "<current directory>",
                format!("cannot determine current directory: {e}"),
            )
        })?;
        Self::load_from_dir(&current_dir)
    }

    /// Loads `levelup.json` from a specific directory.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        Self::load_from_file(&dir.join(CONFIG_FILE_NAME))
    }

    /// Loads configuration from a specific file path.
    ///
    /// If the file does not exist, returns default configuration. Environment
    /// overrides are applied before validation.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::ConfigParseError` if the file exists but contains
    /// invalid JSON, and `SessionError::ConfigValidationError` if the values
    /// are invalid.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let mut config = match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents)
                .map_err(|e| SessionError::config_parse(path, e.to_string()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                return Err(SessionError::config_parse(
                    path,
                    format!("failed to read file: {e}"),
                ));
            }
        };

        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Applies environment overrides using the given lookup.
    ///
    /// Empty values are ignored.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(value) = get(ENV_ENGINE_PUBLIC_KEY) {
            self.engine.public_key = value;
        }
        if let Some(value) = get(ENV_INTERVIEW_ASSISTANT_ID) {
            self.engine.interview_assistant_id = value;
        }
        if let Some(value) = get(ENV_MOCK_ASSISTANT_ID) {
            self.engine.mock_assistant_id = value;
        }
        if let Some(value) = get(ENV_GATEWAY_URL) {
            self.engine.gateway_url = value;
        }
        if let Some(value) = get(ENV_BACKEND_URL) {
            self.backend.base_url = value;
        }
    }

    /// Resolves the auth file against a base directory.
    #[must_use]
    pub fn auth_path(&self, base: &Path) -> PathBuf {
        let path = Path::new(&self.auth_file);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            base.join(path)
        }
    }

    /// Validates the configuration values.
    ///
    /// Assistant ids and the public key are checked by the commands that need
    /// them, so a config without them still loads for `login` and friends.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::ConfigValidationError` if any check fails.
    pub fn validate(&self) -> Result<()> {
        if self.session.start_timeout_secs == 0 {
            return Err(SessionError::config_validation(
                "session.startTimeoutSecs must be greater than 0",
                "Set session.startTimeoutSecs to at least 1 second in your levelup.json",
            ));
        }

        if self.session.connect_timeout_secs == 0 {
            return Err(SessionError::config_validation(
                "session.connectTimeoutSecs must be greater than 0",
                "Set session.connectTimeoutSecs to at least 1 second in your levelup.json",
            ));
        }

        if self.session.redirect_enabled && self.session.redirect_signal.trim().is_empty() {
            return Err(SessionError::config_validation(
                "session.redirectSignal must not be empty while redirects are enabled",
                "Set session.redirectSignal (default 'api-endpoint-called') or disable session.redirectEnabled",
            ));
        }

        if !self.backend.base_url.starts_with("http://")
            && !self.backend.base_url.starts_with("https://")
        {
            return Err(SessionError::config_validation(
                format!("backend.baseUrl '{}' is not an http(s) URL", self.backend.base_url),
                format!("Set backend.baseUrl in your levelup.json or {ENV_BACKEND_URL}"),
            ));
        }

        if !self.engine.gateway_url.starts_with("ws://")
            && !self.engine.gateway_url.starts_with("wss://")
        {
            return Err(SessionError::config_validation(
                format!("engine.gatewayUrl '{}' is not a ws(s) URL", self.engine.gateway_url),
                format!("Set engine.gatewayUrl in your levelup.json or {ENV_GATEWAY_URL}"),
            ));
        }

        if self.auth_file.trim().is_empty() {
            return Err(SessionError::config_validation(
                "authFile must not be empty",
                "Provide a path for the stored access token in your levelup.json",
            ));
        }

        Ok(())
    }

    /// Returns the assistant id for a call kind, failing if it is not set.
    pub fn assistant_id(&self, mock: bool) -> Result<&str> {
        let (id, field, env) = if mock {
            (
                &self.engine.mock_assistant_id,
                "engine.mockAssistantId",
                ENV_MOCK_ASSISTANT_ID,
            )
        } else {
            (
                &self.engine.interview_assistant_id,
                "engine.interviewAssistantId",
                ENV_INTERVIEW_ASSISTANT_ID,
            )
        };

        if id.trim().is_empty() {
            return Err(SessionError::config_validation(
                format!("{field} is not set"),
                format!("Set {field} in your levelup.json or export {env}"),
            ));
        }
        Ok(id)
    }
}
