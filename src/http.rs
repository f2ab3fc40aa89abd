//! Direct HTTP to the external server.
//!
//! Shared by the privileged process and by the local fallback path of the
//! transport client. Knows nothing about auth; headers arrive fully resolved.

use std::time::Duration;

use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use reqwest::multipart::Form;
use serde_json::Value;

use crate::endpoints::Method;
use crate::error::HttpError;
use crate::protocol::Headers;

/// A completed HTTP exchange, any status.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub status_text: String,
    /// Parsed JSON when the content type says so, otherwise the body text.
    pub data: Value,
    pub retry_after: Option<Duration>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Human-readable failure reason: the body's `detail`/`error`/`message`,
    /// else the status text.
    pub fn error_message(&self) -> String {
        error_detail(&self.data)
            .or_else(|| (!self.status_text.is_empty()).then(|| self.status_text.clone()))
            .unwrap_or_else(|| format!("HTTP {}", self.status))
    }

    /// Payload of a 2xx response, or [`HttpError::Status`].
    pub fn into_data(self) -> Result<Value, HttpError> {
        if self.is_success() {
            Ok(self.data)
        } else {
            Err(HttpError::Status {
                status: self.status,
                message: self.error_message(),
            })
        }
    }
}

/// Thin wrapper around a shared `reqwest::Client`.
#[derive(Debug, Clone, Default)]
pub struct HttpExecutor {
    client: reqwest::Client,
}

impl HttpExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn request(&self, method: Method, url: &str, headers: &Headers) -> reqwest::RequestBuilder {
        headers
            .iter()
            .fold(self.client.request(method.to_reqwest(), url), |req, (k, v)| {
                req.header(k.as_str(), v.as_str())
            })
    }

    /// Issue a request with an optional JSON (or raw string) body.
    pub async fn execute(
        &self,
        method: Method,
        url: &str,
        headers: &Headers,
        body: Option<&Value>,
    ) -> Result<HttpResponse, HttpError> {
        let mut req = self.request(method, url, headers);
        if let Some(body) = body {
            req = with_body(req, body, headers);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| HttpError::Network(e.to_string()))?;
        read_response(resp).await
    }

    /// Issue a multipart request.
    pub async fn upload(
        &self,
        method: Method,
        url: &str,
        headers: &Headers,
        form: Form,
    ) -> Result<HttpResponse, HttpError> {
        let resp = self
            .request(method, url, headers)
            .multipart(form)
            .send()
            .await
            .map_err(|e| HttpError::Network(e.to_string()))?;
        read_response(resp).await
    }

    /// Open a streaming request and hand back the raw response.
    ///
    /// Non-2xx responses are drained and returned as [`HttpError::Status`].
    pub async fn open_stream(
        &self,
        method: Method,
        url: &str,
        headers: &Headers,
        body: Option<&Value>,
    ) -> Result<reqwest::Response, HttpError> {
        let mut req = self.request(method, url, headers);
        if let Some(body) = body {
            req = with_body(req, body, headers);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| HttpError::Network(e.to_string()))?;
        if !resp.status().is_success() {
            let failed = read_response(resp).await?;
            return Err(HttpError::Status {
                status: failed.status,
                message: failed.error_message(),
            });
        }
        Ok(resp)
    }
}

fn with_body(req: reqwest::RequestBuilder, body: &Value, headers: &Headers) -> reqwest::RequestBuilder {
    match body {
        Value::String(raw) => req.body(raw.clone()),
        other => {
            let has_content_type = headers
                .keys()
                .any(|k| k.eq_ignore_ascii_case(CONTENT_TYPE.as_str()));
            let req = if has_content_type {
                req
            } else {
                req.header(CONTENT_TYPE, "application/json")
            };
            req.body(other.to_string())
        }
    }
}

async fn read_response(resp: reqwest::Response) -> Result<HttpResponse, HttpError> {
    let status = resp.status();
    let retry_after = resp
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after);
    let is_json = resp
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("application/json"));

    let text = resp
        .text()
        .await
        .map_err(|e| HttpError::Network(e.to_string()))?;
    let data = if is_json {
        // A malformed JSON body degrades to null rather than failing the call.
        serde_json::from_str(&text).unwrap_or(Value::Null)
    } else {
        Value::String(text)
    };

    Ok(HttpResponse {
        status: status.as_u16(),
        status_text: status.canonical_reason().unwrap_or_default().to_string(),
        data,
        retry_after,
    })
}

/// Join the configured base URL and an allow-listed path.
pub fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    if path.starts_with('/') {
        format!("{base}{path}")
    } else {
        format!("{base}/{path}")
    }
}

/// First non-empty `detail`, `error` or `message` string in a JSON error body.
pub fn error_detail(data: &Value) -> Option<String> {
    ["detail", "error", "message"].iter().find_map(|key| {
        match data.get(key) {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(v @ (Value::Object(_) | Value::Array(_))) => Some(v.to_string()),
            _ => None,
        }
    })
}

/// Parse a `Retry-After` header: delay in seconds, or an HTTP date.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<f64>() {
        return (secs.is_finite()).then(|| Duration::from_secs_f64(secs.max(0.0)));
    }
    let at = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let delta = at.with_timezone(&chrono::Utc) - chrono::Utc::now();
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}
