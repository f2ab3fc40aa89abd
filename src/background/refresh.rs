//! Access-token refresh for multi-user mode.
//!
//! When the server rejects an access token, the privileged process exchanges
//! the stored refresh token for a new one and retries the call once. Calls
//! that fail together share a single refresh.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::abort::abortable;
use crate::config::{ConfigStore, MemoryConfigStore};
use crate::endpoints::Method;
use crate::error::{AuthError, ConfigError, Error, HttpError};
use crate::http::{HttpExecutor, join_url};
use crate::protocol::Headers;

pub const REFRESH_PATH: &str = "/api/v1/auth/refresh";

const REFRESH_TIMEOUT: Duration = Duration::from_secs(10);

/// Obtains a new access token and stores it where [`ConfigStore::load`] sees it.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self) -> Result<(), Error>;
}

/// Refreshes against the server's auth endpoint and writes the new access
/// token into a [`MemoryConfigStore`].
pub struct ServerTokenRefresher {
    store: Arc<MemoryConfigStore>,
    http: HttpExecutor,
}

impl ServerTokenRefresher {
    pub fn new(store: Arc<MemoryConfigStore>) -> Self {
        Self {
            store,
            http: HttpExecutor::new(),
        }
    }
}

#[async_trait]
impl TokenRefresher for ServerTokenRefresher {
    async fn refresh(&self) -> Result<(), Error> {
        let settings = self.store.load()?;
        let base = settings
            .auth
            .base_url()
            .ok_or(ConfigError::ServerNotConfigured)?;
        let refresh_token = settings
            .auth
            .refresh_token
            .as_ref()
            .map(|t| t.expose_secret().trim())
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::NotAuthenticated)?;

        let url = join_url(base, REFRESH_PATH);
        let body = json!({ "refresh_token": refresh_token });
        let data = abortable(
            async {
                let resp = self
                    .http
                    .execute(Method::Post, &url, &Headers::new(), Some(&body))
                    .await?;
                Ok::<_, Error>(resp.into_data()?)
            },
            None,
            Some(REFRESH_TIMEOUT),
        )
        .await?;

        let access_token = data
            .get("access_token")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| HttpError::Decode("refresh response has no access_token".into()))?
            .to_string();
        self.store.update(|s| {
            s.auth.access_token = Some(SecretString::from(access_token));
        });
        info!("Access token refreshed");
        Ok(())
    }
}

/// Collapses concurrent refresh requests into one.
///
/// Callers read [`RefreshGate::epoch`] before loading the credentials they
/// send. A caller whose epoch is stale when it asks for a refresh gets the
/// outcome of the refresh that already ran instead of starting another.
pub struct RefreshGate {
    refresher: Arc<dyn TokenRefresher>,
    epoch: AtomicU64,
    last: Mutex<Option<Result<(), String>>>,
}

impl RefreshGate {
    pub fn new(refresher: Arc<dyn TokenRefresher>) -> Self {
        Self {
            refresher,
            epoch: AtomicU64::new(0),
            last: Mutex::new(None),
        }
    }

    /// Number of refreshes completed so far.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Refresh unless one finished after `seen` was read.
    pub async fn refresh(&self, seen: u64) -> Result<(), AuthError> {
        let mut last = self.last.lock().await;
        if self.epoch() != seen {
            if let Some(outcome) = last.clone() {
                debug!("Reusing result of a concurrent token refresh");
                return outcome.map_err(AuthError::RefreshFailed);
            }
        }
        let outcome = self.refresher.refresh().await.map_err(|e| e.to_string());
        *last = Some(outcome.clone());
        self.epoch.fetch_add(1, Ordering::AcqRel);
        outcome.map_err(AuthError::RefreshFailed)
    }
}
