//! Transport client — single request/response calls.
//!
//! Strategy, chosen once per call:
//! 1. post the request over the bridge to the privileged process;
//! 2. only if the bridge is *unavailable* in this context, call the server
//!    directly with locally resolved auth headers.
//!
//! Errors reported by the privileged process never trigger the fallback.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::abort::{AbortSignal, abortable, check_aborted};
use crate::auth::resolve_auth_headers;
use crate::bridge::Bridge;
use crate::config::ConfigStore;
use crate::endpoints::{self, Endpoint, Method};
use crate::error::{ConfigError, Error, HttpError, Result};
use crate::http::{HttpExecutor, join_url};
use crate::protocol::{BridgeMessage, Headers, RequestPayload};

/// Everything needed to make one call. Created per call, dropped on settle.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub path: String,
    pub method: Method,
    pub headers: Headers,
    pub body: Option<Value>,
    pub no_auth: bool,
    pub timeout: Option<Duration>,
    pub abort_signal: Option<AbortSignal>,
}

impl RequestDescriptor {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            method,
            headers: Headers::new(),
            body: None,
            no_auth: false,
            timeout: None,
            abort_signal: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::Post, path)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Skip credential injection (health checks, login).
    pub fn without_auth(mut self) -> Self {
        self.no_auth = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_abort_signal(mut self, signal: AbortSignal) -> Self {
        self.abort_signal = Some(signal);
        self
    }

    fn to_payload(&self) -> RequestPayload {
        RequestPayload {
            path: self.path.clone(),
            method: self.method,
            headers: self.headers.clone(),
            body: self.body.clone(),
            no_auth: self.no_auth,
            timeout_ms: self.timeout.map(|t| t.as_millis() as u64),
        }
    }
}

/// Request/response client for UI surfaces.
pub struct TransportClient {
    bridge: Option<Arc<dyn Bridge>>,
    config: Arc<dyn ConfigStore>,
    http: HttpExecutor,
}

impl TransportClient {
    /// `bridge` is `None` in hosts without a privileged process; every call
    /// then takes the direct path.
    pub fn new(bridge: Option<Arc<dyn Bridge>>, config: Arc<dyn ConfigStore>) -> Self {
        Self {
            bridge,
            config,
            http: HttpExecutor::new(),
        }
    }

    pub fn with_http(mut self, http: HttpExecutor) -> Self {
        self.http = http;
        self
    }

    /// Perform the call and return the response payload.
    pub async fn send(&self, descriptor: RequestDescriptor) -> Result<Value> {
        let endpoint = endpoints::resolve(descriptor.method, &descriptor.path)?;
        check_aborted(descriptor.abort_signal.as_ref())?;

        let result = match &self.bridge {
            Some(bridge) => match self.send_via_bridge(bridge.as_ref(), &descriptor).await {
                Err(Error::Channel(e)) if e.is_unavailable() => {
                    info!(path = %descriptor.path, "Bridge unavailable, calling server directly");
                    self.send_direct(endpoint, &descriptor).await
                }
                other => other,
            },
            None => self.send_direct(endpoint, &descriptor).await,
        };

        match &result {
            Ok(_) => debug!(method = %descriptor.method, path = %descriptor.path, "Request settled"),
            Err(e) if e.is_aborted() => {
                debug!(path = %descriptor.path, reason = %e, "Request aborted")
            }
            Err(e) => warn!(method = %descriptor.method, path = %descriptor.path, error = %e, "Request failed"),
        }
        result
    }

    /// [`send`](Self::send), deserializing the payload into `T`.
    pub async fn send_as<T: DeserializeOwned>(&self, descriptor: RequestDescriptor) -> Result<T> {
        let value = self.send(descriptor).await?;
        serde_json::from_value(value).map_err(|e| HttpError::Decode(e.to_string()).into())
    }

    async fn send_via_bridge(
        &self,
        bridge: &dyn Bridge,
        descriptor: &RequestDescriptor,
    ) -> Result<Value> {
        let message = BridgeMessage::Request(descriptor.to_payload());
        // The privileged process applies the timeout; only the caller's
        // signal is raced here.
        abortable(
            async {
                let envelope = bridge.send_message(message).await?;
                Ok::<_, Error>(envelope.into_result()?)
            },
            descriptor.abort_signal.as_ref(),
            None,
        )
        .await
    }

    async fn send_direct(
        &self,
        endpoint: &Endpoint,
        descriptor: &RequestDescriptor,
    ) -> Result<Value> {
        let settings = self.config.load()?;
        let base = settings
            .auth
            .base_url()
            .ok_or(ConfigError::ServerNotConfigured)?;
        let url = join_url(base, &descriptor.path);

        let headers = if descriptor.no_auth {
            descriptor.headers.clone()
        } else {
            resolve_auth_headers(&settings.auth, descriptor.headers.clone())?
        };
        let timeout = settings.timeouts.request_timeout(
            endpoint.class,
            descriptor.timeout.map(|t| t.as_millis() as u64),
        );

        abortable(
            async {
                let resp = self
                    .http
                    .execute(descriptor.method, &url, &headers, descriptor.body.as_ref())
                    .await?;
                Ok::<_, Error>(resp.into_data()?)
            },
            descriptor.abort_signal.as_ref(),
            Some(timeout),
        )
        .await
    }
}
