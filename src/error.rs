//! Error types for the assist bridge.

use std::time::Duration;

use crate::endpoints::Method;

/// Top-level error type for transport, upload, stream and queue operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("HTTP error: {0}")]
    Http(#[from] HttpError),

    #[error("Aborted: {0}")]
    Aborted(#[from] AbortedError),
}

impl Error {
    /// Whether this error is an explicit cancellation or a timeout.
    ///
    /// Aborts are not failures and are kept out of error logging.
    pub fn is_aborted(&self) -> bool {
        matches!(self, Error::Aborted(_))
    }

    /// HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Http(HttpError::Status { status, .. }) => Some(*status),
            _ => None,
        }
    }

    /// Message suitable for showing to the user.
    ///
    /// Configuration and auth errors already tell the user what to fix, so
    /// they are returned without the category prefix.
    pub fn user_message(&self) -> String {
        match self {
            Error::Config(e) => e.to_string(),
            Error::Auth(e) => e.to_string(),
            other => other.to_string(),
        }
    }
}

/// Endpoint registry violations. These are programming errors, never retried.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("{method} {path} is not a registered endpoint")]
    UnknownEndpoint { method: Method, path: String },

    #[error("Unsupported HTTP method: {0}")]
    InvalidMethod(String),

    #[error("Path must be relative to the server and start with '/': {0}")]
    InvalidPath(String),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Add or update your API key in Settings → Server, then try again.")]
    MissingApiKey,

    #[error(
        "The configured API key is a placeholder. Replace it with your server's API key in Settings → Server, then try again."
    )]
    PlaceholderApiKey,

    #[error("Server URL is not configured. Set it in Settings → Server.")]
    ServerNotConfigured,

    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Multi-user authentication errors.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Not authenticated. Please log in under Settings → Server.")]
    NotAuthenticated,

    #[error("Session refresh failed: {0}")]
    RefreshFailed(String),
}

/// Errors on the cross-context channel to the privileged process.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel {name} is not available in this context")]
    Unavailable { name: String },

    #[error("Channel {name} disconnected: {reason}")]
    Disconnected { name: String, reason: String },

    #[error("Failed to send on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Invalid message format: {0}")]
    InvalidMessage(String),
}

impl ChannelError {
    /// Whether the channel API itself is missing, which is the only case the
    /// transport client falls back to direct HTTP.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, ChannelError::Unavailable { .. })
    }
}

/// Errors reported by the external server or the HTTP layer.
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("Request failed with status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Failed to decode response: {0}")]
    Decode(String),

    #[error("Stream error: {0}")]
    Stream(String),
}

/// Explicit cancellation or timeout.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AbortedError {
    #[error("Request was cancelled")]
    Cancelled,

    #[error("Request timed out after {timeout:?}")]
    TimedOut { timeout: Duration },
}

/// Result type alias for the bridge.
pub type Result<T> = std::result::Result<T, Error>;
