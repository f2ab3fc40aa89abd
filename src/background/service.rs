//! Background service — the privileged process.
//!
//! The only context that holds credentials and talks to the server. It drains
//! [`BridgeEndpoints`]: one-shot messages are answered with envelopes, stream
//! ports are served until their terminal frame or until the UI disconnects.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use reqwest::multipart::{Form, Part};
use secrecy::ExposeSecret;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::refresh::{RefreshGate, TokenRefresher};
use super::sse::{SseDecoder, SseLine};
use crate::abort::abortable;
use crate::auth::resolve_auth_headers;
use crate::bridge::{BridgeEndpoints, Envelope, ServicePort};
use crate::config::{AuthConfig, AuthMode, ConfigStore, Settings};
use crate::endpoints::{self, CRITICAL_PATHS, Method};
use crate::error::{ConfigError, Error, HttpError};
use crate::http::{HttpExecutor, HttpResponse, join_url};
use crate::protocol::{
    BridgeMessage, Headers, RequestPayload, ResponseEnvelope, STREAM_PORT, StreamFrame,
    StreamRequest, UploadPayload,
};

/// Timeout for the advisory OpenAPI fetch.
const DRIFT_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Message sent when a stream goes quiet for longer than its idle timeout.
const STREAM_IDLE_MESSAGE: &str = "Stream timeout: no updates received";

/// Serves bridge traffic against the external server.
pub struct BackgroundService {
    config: Arc<dyn ConfigStore>,
    http: HttpExecutor,
    refresh: Option<RefreshGate>,
}

impl BackgroundService {
    pub fn new(config: Arc<dyn ConfigStore>) -> Self {
        Self {
            config,
            http: HttpExecutor::new(),
            refresh: None,
        }
    }

    pub fn with_http(mut self, http: HttpExecutor) -> Self {
        self.http = http;
        self
    }

    /// Retry multi-user calls rejected with 401 once after refreshing the
    /// access token through `refresher`.
    pub fn with_token_refresher(mut self, refresher: Arc<dyn TokenRefresher>) -> Self {
        self.refresh = Some(RefreshGate::new(refresher));
        self
    }

    /// Serve `endpoints` until every bridge handle is dropped.
    ///
    /// Each message and each port is handled on its own task so a slow call
    /// never delays another.
    pub fn spawn(self: Arc<Self>, mut endpoints: BridgeEndpoints) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Background service started");
            loop {
                tokio::select! {
                    Some(envelope) = endpoints.messages.recv() => {
                        let service = Arc::clone(&self);
                        tokio::spawn(async move { service.answer(envelope).await });
                    }
                    Some(port) = endpoints.connections.recv() => {
                        let service = Arc::clone(&self);
                        tokio::spawn(async move { service.serve_port(port).await });
                    }
                    else => break,
                }
            }
            info!("Background service stopped");
        })
    }

    async fn answer(&self, envelope: Envelope) {
        let reply = self.handle_message(envelope.message).await;
        if envelope.reply.send(reply).is_err() {
            debug!("Caller went away before the reply was ready");
        }
    }

    /// Handle one one-shot message.
    pub async fn handle_message(&self, message: BridgeMessage) -> ResponseEnvelope {
        match message {
            BridgeMessage::Request(payload) => self.handle_request(payload).await,
            BridgeMessage::Upload(payload) => self.handle_upload(payload).await,
        }
    }

    async fn handle_request(&self, payload: RequestPayload) -> ResponseEnvelope {
        let endpoint = match endpoints::resolve(payload.method, &payload.path) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                warn!(path = %payload.path, error = %e, "Rejected request for unregistered endpoint");
                return ResponseEnvelope::failure(400, e.to_string());
            }
        };
        let epoch = self.refresh_epoch();
        let settings = match self.settings_for(&payload.path) {
            Ok(settings) => settings,
            Err(envelope) => return envelope,
        };
        let Some(base) = settings.auth.base_url() else {
            return ResponseEnvelope::failure(400, ConfigError::ServerNotConfigured.to_string());
        };
        let url = join_url(base, &payload.path);

        let headers = if payload.no_auth {
            payload.headers.clone()
        } else {
            match resolve_auth_headers(&settings.auth, payload.headers.clone()) {
                Ok(headers) => headers,
                Err(e) => return ResponseEnvelope::failure(401, e.user_message()),
            }
        };
        let timeout = settings
            .timeouts
            .request_timeout(endpoint.class, payload.timeout_ms);

        debug!(method = %payload.method, path = %payload.path, ?timeout, "Forwarding request");
        let result = match self.forward(&payload, &url, &headers, timeout).await {
            Ok(resp) if resp.status == 401 && !payload.no_auth => {
                match self.refreshed_auth(&settings.auth, epoch).await {
                    Some(auth) => match resolve_auth_headers(&auth, payload.headers.clone()) {
                        Ok(headers) => {
                            debug!(path = %payload.path, "Retrying request with refreshed token");
                            self.forward(&payload, &url, &headers, timeout).await
                        }
                        Err(_) => Ok(resp),
                    },
                    None => Ok(resp),
                }
            }
            other => other,
        };
        to_envelope(result)
    }

    async fn forward(
        &self,
        payload: &RequestPayload,
        url: &str,
        headers: &Headers,
        timeout: Duration,
    ) -> Result<HttpResponse, Error> {
        abortable(
            async {
                Ok::<_, Error>(
                    self.http
                        .execute(payload.method, url, headers, payload.body.as_ref())
                        .await?,
                )
            },
            None,
            Some(timeout),
        )
        .await
    }

    fn refresh_epoch(&self) -> u64 {
        self.refresh.as_ref().map_or(0, RefreshGate::epoch)
    }

    /// Refresh the access token after a 401 and return the reloaded
    /// credentials, or `None` when no retry should be made.
    async fn refreshed_auth(&self, auth: &AuthConfig, epoch: u64) -> Option<AuthConfig> {
        let gate = self.refresh.as_ref()?;
        let has_refresh_token = auth
            .refresh_token
            .as_ref()
            .is_some_and(|t| !t.expose_secret().trim().is_empty());
        if auth.mode != AuthMode::MultiUser || !has_refresh_token {
            return None;
        }
        if let Err(e) = gate.refresh(epoch).await {
            warn!(error = %e, "Token refresh failed; returning the original response");
            return None;
        }
        match self.config.load() {
            Ok(settings) => Some(settings.auth),
            Err(e) => {
                warn!(error = %e, "Failed to reload settings after token refresh");
                None
            }
        }
    }

    async fn handle_upload(&self, payload: UploadPayload) -> ResponseEnvelope {
        if let Err(e) = endpoints::resolve(payload.method, &payload.path) {
            warn!(path = %payload.path, error = %e, "Rejected upload for unregistered endpoint");
            return ResponseEnvelope::failure(400, e.to_string());
        }
        let settings = match self.settings_for(&payload.path) {
            Ok(settings) => settings,
            Err(envelope) => return envelope,
        };
        let Some(base) = settings.auth.base_url() else {
            return ResponseEnvelope::failure(400, ConfigError::ServerNotConfigured.to_string());
        };
        let url = join_url(base, &payload.path);
        let headers = match resolve_auth_headers(&settings.auth, Headers::new()) {
            Ok(headers) => headers,
            Err(e) => return ResponseEnvelope::failure(401, e.user_message()),
        };

        let form = match build_form(&payload) {
            Ok(form) => form,
            Err(e) => return ResponseEnvelope::failure(400, e.to_string()),
        };
        let timeout = settings.timeouts.upload_timeout();

        debug!(path = %payload.path, fields = payload.fields.len(), "Forwarding upload");
        let result = abortable(
            async {
                Ok::<_, Error>(
                    self.http
                        .upload(payload.method, &url, &headers, form)
                        .await?,
                )
            },
            None,
            Some(timeout),
        )
        .await;
        to_envelope(result)
    }

    fn settings_for(&self, path: &str) -> Result<Settings, ResponseEnvelope> {
        self.config.load().map_err(|e| {
            warn!(path = %path, error = %e, "Failed to load settings");
            ResponseEnvelope::failure(400, e.to_string())
        })
    }

    async fn serve_port(&self, mut port: ServicePort) {
        if port.name() != STREAM_PORT {
            debug!(port = %port.name(), "Ignoring connection on unknown port");
            return;
        }
        let Some(request) = port.next_request().await else {
            debug!("Stream port closed before a request arrived");
            return;
        };

        let path = request.path.clone();
        tokio::select! {
            _ = port.disconnected() => {
                debug!(path = %path, "Stream cancelled by caller");
            }
            terminal = self.pump_stream(&port, request) => {
                if let Some(frame) = terminal {
                    if let StreamFrame::Error { message } = &frame {
                        warn!(path = %path, error = %message, "Stream failed");
                    } else {
                        debug!(path = %path, "Stream finished");
                    }
                    port.post(frame);
                }
            }
        }
    }

    /// Forward data frames to `port`; return the terminal frame to post.
    async fn pump_stream(&self, port: &ServicePort, request: StreamRequest) -> Option<StreamFrame> {
        let endpoint = match endpoints::resolve(request.method, &request.path) {
            Ok(endpoint) => endpoint,
            Err(e) => return Some(StreamFrame::error(e.to_string())),
        };
        let epoch = self.refresh_epoch();
        let settings = match self.config.load() {
            Ok(settings) => settings,
            Err(e) => return Some(StreamFrame::error(e.to_string())),
        };
        let Some(base) = settings.auth.base_url() else {
            return Some(StreamFrame::error(ConfigError::ServerNotConfigured.to_string()));
        };
        let url = join_url(base, &request.path);

        let headers = match stream_headers(&settings.auth, request.headers.clone()) {
            Ok(headers) => headers,
            Err(e) => return Some(StreamFrame::error(e.user_message())),
        };

        let idle = settings
            .timeouts
            .stream_idle_timeout(endpoint.class, request.stream_idle_timeout_ms);

        let body = request.body.unwrap_or(Value::Null);
        let mut opened = self
            .open_within(request.method, &url, &headers, &body, idle)
            .await;
        if matches!(opened, Ok(Err(HttpError::Status { status: 401, .. }))) {
            if let Some(auth) = self.refreshed_auth(&settings.auth, epoch).await {
                if let Ok(headers) = stream_headers(&auth, request.headers.clone()) {
                    debug!(path = %request.path, "Reopening stream with refreshed token");
                    opened = self
                        .open_within(request.method, &url, &headers, &body, idle)
                        .await;
                }
            }
        }
        let resp = match opened {
            Ok(Ok(resp)) => resp,
            Ok(Err(HttpError::Status { message, .. })) => return Some(StreamFrame::error(message)),
            Ok(Err(e)) => return Some(StreamFrame::error(e.to_string())),
            Err(_) => return Some(StreamFrame::error(STREAM_IDLE_MESSAGE)),
        };

        let mut bytes = resp.bytes_stream();
        let mut decoder = SseDecoder::new();
        loop {
            let chunk = match tokio::time::timeout(idle, bytes.next()).await {
                Err(_) => return Some(StreamFrame::error(STREAM_IDLE_MESSAGE)),
                Ok(None) => break,
                Ok(Some(Err(e))) => return Some(StreamFrame::error(e.to_string())),
                Ok(Some(Ok(chunk))) => chunk,
            };
            for line in decoder.push(&chunk) {
                match line {
                    SseLine::Done => return Some(StreamFrame::Done),
                    SseLine::Data(data) => {
                        if !port.post(StreamFrame::Data { data }) {
                            return None;
                        }
                    }
                    SseLine::Event(name) => debug!(event = %name, "SSE event"),
                }
            }
        }
        match decoder.finish() {
            Some(SseLine::Data(data)) => {
                port.post(StreamFrame::Data { data });
            }
            Some(SseLine::Event(_)) | Some(SseLine::Done) | None => {}
        }
        Some(StreamFrame::Done)
    }

    async fn open_within(
        &self,
        method: Method,
        url: &str,
        headers: &Headers,
        body: &Value,
        idle: Duration,
    ) -> Result<Result<reqwest::Response, HttpError>, tokio::time::error::Elapsed> {
        tokio::time::timeout(idle, self.http.open_stream(method, url, headers, Some(body))).await
    }

    /// Compare the server's OpenAPI document against [`CRITICAL_PATHS`].
    ///
    /// Returns the missing paths. Advisory only.
    pub async fn check_api_drift(&self) -> Result<Vec<&'static str>, Error> {
        let settings = self.config.load()?;
        let base = settings
            .auth
            .base_url()
            .ok_or(ConfigError::ServerNotConfigured)?;
        let headers = resolve_auth_headers(&settings.auth, Headers::new()).unwrap_or_default();
        let url = join_url(base, "/openapi.json");

        let document = abortable(
            async {
                let resp = self.http.execute(Method::Get, &url, &headers, None).await?;
                Ok::<_, Error>(resp.into_data()?)
            },
            None,
            Some(DRIFT_CHECK_TIMEOUT),
        )
        .await?;

        let missing = missing_paths(&document);
        if missing.is_empty() {
            debug!("OpenAPI document lists every critical path");
        } else {
            warn!(missing = ?missing, "OpenAPI drift detected");
        }
        Ok(missing)
    }
}

/// Critical paths absent from an OpenAPI document's `paths` object.
pub fn missing_paths(document: &Value) -> Vec<&'static str> {
    let paths = document.get("paths").and_then(Value::as_object);
    CRITICAL_PATHS
        .iter()
        .copied()
        .filter(|p| !paths.is_some_and(|paths| paths.contains_key(*p)))
        .collect()
}

fn to_envelope(result: Result<HttpResponse, Error>) -> ResponseEnvelope {
    match result {
        Ok(resp) => {
            let retry_after_ms = resp.retry_after.map(|d| d.as_millis() as u64);
            let envelope = if resp.is_success() {
                ResponseEnvelope::success(resp.status, resp.data)
            } else {
                let message = resp.error_message();
                ResponseEnvelope {
                    data: Some(resp.data),
                    ..ResponseEnvelope::failure(resp.status, message)
                }
            };
            envelope.with_retry_after(retry_after_ms)
        }
        Err(e) => ResponseEnvelope::failure(0, e.to_string()),
    }
}

/// Auth plus the headers an SSE request always carries.
fn stream_headers(auth: &AuthConfig, headers: Headers) -> Result<Headers, Error> {
    let mut headers = resolve_auth_headers(auth, headers)?;
    headers.insert("Accept".to_string(), "text/event-stream".to_string());
    headers
        .entry("Cache-Control".to_string())
        .or_insert_with(|| "no-cache".to_string());
    Ok(headers)
}

fn build_form(payload: &UploadPayload) -> Result<Form, HttpError> {
    let mut form = Form::new();
    for (name, value) in &payload.fields {
        let text = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        form = form.text(name.clone(), text);
    }
    if let Some(file) = &payload.file {
        let part = Part::bytes(file.data.clone())
            .file_name(file.name.clone().unwrap_or_else(|| "file".to_string()))
            .mime_str(
                file.content_type
                    .as_deref()
                    .unwrap_or("application/octet-stream"),
            )
            .map_err(|e| HttpError::Decode(format!("invalid file content type: {e}")))?;
        form = form.part("file", part);
    }
    Ok(form)
}
