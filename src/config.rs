//! Configuration types.
//!
//! Settings are persisted by the host as a JSON object (`serverUrl`,
//! `authMode`, `apiKey`, ...). Components never read them from a global; a
//! [`ConfigStore`] is handed to each one at construction.

use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::endpoints::EndpointClass;
use crate::error::ConfigError;

/// Fallback request timeout when nothing is configured.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Fallback stream idle timeout; slow providers can take a while to emit.
pub const DEFAULT_STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(45);

/// How the server authenticates this client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMode {
    /// A shared API key sent as `X-API-KEY`.
    #[default]
    SingleUser,
    /// A per-user access token sent as a bearer token.
    MultiUser,
}

impl std::str::FromStr for AuthMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "single-user" => Ok(AuthMode::SingleUser),
            "multi-user" => Ok(AuthMode::MultiUser),
            other => Err(ConfigError::InvalidValue {
                key: "authMode".to_string(),
                message: format!("expected 'single-user' or 'multi-user', got '{other}'"),
            }),
        }
    }
}

/// Credentials and server location.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthConfig {
    #[serde(default, rename = "authMode")]
    pub mode: AuthMode,
    #[serde(default)]
    pub api_key: Option<SecretString>,
    #[serde(default)]
    pub access_token: Option<SecretString>,
    /// Exchanged for a new access token when the server answers 401.
    #[serde(default)]
    pub refresh_token: Option<SecretString>,
    #[serde(default)]
    pub server_url: String,
}

impl AuthConfig {
    /// Server URL without a trailing slash, or `None` if unset.
    pub fn base_url(&self) -> Option<&str> {
        let trimmed = self.server_url.trim().trim_end_matches('/');
        (!trimmed.is_empty()).then_some(trimmed)
    }
}

/// Timeout settings, all in milliseconds. Zero or missing means "not set".
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutConfig {
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
    #[serde(default)]
    pub chat_request_timeout_ms: Option<u64>,
    #[serde(default)]
    pub rag_request_timeout_ms: Option<u64>,
    #[serde(default)]
    pub media_request_timeout_ms: Option<u64>,
    #[serde(default)]
    pub upload_request_timeout_ms: Option<u64>,
    #[serde(default)]
    pub stream_idle_timeout_ms: Option<u64>,
    #[serde(default)]
    pub chat_stream_idle_timeout_ms: Option<u64>,
}

fn positive(ms: Option<u64>) -> Option<Duration> {
    ms.filter(|ms| *ms > 0).map(Duration::from_millis)
}

impl TimeoutConfig {
    /// Timeout for a single request/response call.
    ///
    /// Per-call override, then the class-specific setting, then the general
    /// request timeout, then [`DEFAULT_REQUEST_TIMEOUT`].
    pub fn request_timeout(&self, class: EndpointClass, override_ms: Option<u64>) -> Duration {
        let class_specific = match class {
            EndpointClass::Chat => self.chat_request_timeout_ms,
            EndpointClass::Rag => self.rag_request_timeout_ms,
            EndpointClass::Media => self.media_request_timeout_ms,
            EndpointClass::General => None,
        };
        positive(override_ms)
            .or_else(|| positive(class_specific))
            .or_else(|| positive(self.request_timeout_ms))
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT)
    }

    /// Timeout for multipart uploads.
    pub fn upload_timeout(&self) -> Duration {
        positive(self.upload_request_timeout_ms)
            .or_else(|| positive(self.request_timeout_ms))
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT)
    }

    /// Maximum silence on a stream before it is failed.
    pub fn stream_idle_timeout(&self, class: EndpointClass, override_ms: Option<u64>) -> Duration {
        let class_specific = match class {
            EndpointClass::Chat => self.chat_stream_idle_timeout_ms,
            _ => None,
        };
        positive(override_ms)
            .or_else(|| positive(class_specific))
            .or_else(|| positive(self.stream_idle_timeout_ms))
            .unwrap_or(DEFAULT_STREAM_IDLE_TIMEOUT)
    }
}

/// Everything the bridge reads from persisted configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(flatten)]
    pub auth: AuthConfig,
    #[serde(flatten)]
    pub timeouts: TimeoutConfig,
}

impl Settings {
    /// Parse the persisted JSON shape.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(raw).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Read settings from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    /// Build settings from `ASSIST_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let server_url =
            std::env::var("ASSIST_SERVER_URL").map_err(|_| ConfigError::MissingRequired {
                key: "ASSIST_SERVER_URL".to_string(),
                hint: "export ASSIST_SERVER_URL=http://127.0.0.1:8000".to_string(),
            })?;
        let mode = match std::env::var("ASSIST_AUTH_MODE") {
            Ok(raw) => raw.parse()?,
            Err(_) => AuthMode::default(),
        };
        let secret = |key: &str| std::env::var(key).ok().map(SecretString::from);

        Ok(Self {
            auth: AuthConfig {
                mode,
                api_key: secret("ASSIST_API_KEY"),
                access_token: secret("ASSIST_ACCESS_TOKEN"),
                refresh_token: secret("ASSIST_REFRESH_TOKEN"),
                server_url,
            },
            timeouts: TimeoutConfig::default(),
        })
    }
}

/// Read-only access to persisted configuration.
pub trait ConfigStore: Send + Sync {
    /// Load the current settings. Called once per operation so that updates
    /// (a fresh access token, a new server URL) are picked up immediately.
    fn load(&self) -> Result<Settings, ConfigError>;
}

/// In-process settings snapshot that its owner can replace.
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    settings: RwLock<Settings>,
}

impl MemoryConfigStore {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings: RwLock::new(settings),
        }
    }

    /// Apply an in-place update.
    pub fn update(&self, f: impl FnOnce(&mut Settings)) {
        let mut settings = self
            .settings
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut settings);
    }
}

impl ConfigStore for MemoryConfigStore {
    fn load(&self) -> Result<Settings, ConfigError> {
        Ok(self
            .settings
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone())
    }
}

/// Settings re-read from a JSON file on every load.
#[derive(Debug, Clone)]
pub struct FileConfigStore {
    path: PathBuf,
}

impl FileConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ConfigStore for FileConfigStore {
    fn load(&self) -> Result<Settings, ConfigError> {
        Settings::from_file(&self.path)
    }
}
