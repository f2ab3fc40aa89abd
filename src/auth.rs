//! Auth header resolution.
//!
//! Computes the outbound credential header from [`AuthConfig`]. Caller-supplied
//! credential headers are always discarded first so that a UI surface can never
//! smuggle its own identity past the configured one.

use secrecy::ExposeSecret;

use crate::config::{AuthConfig, AuthMode};
use crate::error::{AuthError, ConfigError, Error};
use crate::protocol::Headers;

pub const API_KEY_HEADER: &str = "X-API-KEY";
pub const AUTHORIZATION_HEADER: &str = "Authorization";

/// Values shipped in sample configs that are never real keys.
const PLACEHOLDER_API_KEYS: &[&str] = &[
    "your-api-key",
    "your_api_key",
    "your-api-key-here",
    "<api-key>",
    "api-key",
    "changeme",
    "change-me",
    "replace-me",
    "placeholder",
];

/// Whether `key` is one of the known placeholder values.
pub fn is_placeholder_key(key: &str) -> bool {
    let key = key.trim();
    PLACEHOLDER_API_KEYS
        .iter()
        .any(|placeholder| key.eq_ignore_ascii_case(placeholder))
}

/// Remove both credential headers, whatever their casing.
pub fn strip_auth_headers(headers: &mut Headers) {
    headers.retain(|name, _| {
        !name.eq_ignore_ascii_case(API_KEY_HEADER) && !name.eq_ignore_ascii_case(AUTHORIZATION_HEADER)
    });
}

/// Return `headers` with the configured credential injected.
///
/// Fails before any network activity when the credential for the active mode
/// is missing (or, in single-user mode, a placeholder).
pub fn resolve_auth_headers(config: &AuthConfig, mut headers: Headers) -> Result<Headers, Error> {
    strip_auth_headers(&mut headers);

    match config.mode {
        AuthMode::SingleUser => {
            let key = config
                .api_key
                .as_ref()
                .map(|k| k.expose_secret().trim())
                .filter(|k| !k.is_empty())
                .ok_or(ConfigError::MissingApiKey)?;
            if is_placeholder_key(key) {
                return Err(ConfigError::PlaceholderApiKey.into());
            }
            headers.insert(API_KEY_HEADER.to_string(), key.to_string());
        }
        AuthMode::MultiUser => {
            let token = config
                .access_token
                .as_ref()
                .map(|t| t.expose_secret().trim())
                .filter(|t| !t.is_empty())
                .ok_or(AuthError::NotAuthenticated)?;
            headers.insert(AUTHORIZATION_HEADER.to_string(), format!("Bearer {token}"));
        }
    }

    Ok(headers)
}
