//! Wire protocol between UI surfaces and the privileged process.
//!
//! Every value that crosses the bridge is one of the serializable types below.
//! Nothing else is shared between contexts.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::endpoints::Method;
use crate::error::HttpError;

/// Outbound header map. Names are matched case-insensitively where it matters.
pub type Headers = BTreeMap<String, String>;

/// Port name for streaming connections.
pub const STREAM_PORT: &str = "bridge:stream";

/// A single request/response call as posted to the privileged process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPayload {
    pub path: String,
    pub method: Method,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default)]
    pub no_auth: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// File part of an upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub data: Vec<u8>,
}

/// Multipart upload as posted to the privileged process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadPayload {
    pub path: String,
    pub method: Method,
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<UploadFile>,
}

/// One-shot messages to the privileged process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum BridgeMessage {
    #[serde(rename = "bridge:request")]
    Request(RequestPayload),
    #[serde(rename = "bridge:upload")]
    Upload(UploadPayload),
}

/// Reply to a [`BridgeMessage`].
///
/// `ok == false` implies a non-empty `error`; `data` must not be relied on then.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope<T = Value> {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl<T> ResponseEnvelope<T> {
    pub fn success(status: u16, data: T) -> Self {
        Self {
            ok: true,
            status: Some(status),
            error: None,
            data: Some(data),
            retry_after_ms: None,
        }
    }

    pub fn failure(status: u16, error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            ok: false,
            status: Some(status),
            error: Some(if error.is_empty() {
                format!("Request failed: {status}")
            } else {
                error
            }),
            data: None,
            retry_after_ms: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after_ms: Option<u64>) -> Self {
        self.retry_after_ms = retry_after_ms;
        self
    }

    /// Unwrap the payload, turning a failed envelope into [`HttpError::Status`].
    pub fn into_result(self) -> Result<T, HttpError>
    where
        T: Default,
    {
        if self.ok {
            return Ok(self.data.unwrap_or_default());
        }
        let status = self.status.unwrap_or(0);
        let message = self
            .error
            .filter(|e| !e.is_empty())
            .unwrap_or_else(|| format!("Request failed: {status}"));
        Err(HttpError::Status { status, message })
    }
}

/// First and only frame a UI surface posts on a stream port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamRequest {
    pub path: String,
    pub method: Method,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_idle_timeout_ms: Option<u64>,
}

/// Frames sent by the privileged process on a stream port.
///
/// Zero or more `Data` frames, then exactly one of `Done` / `Error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum StreamFrame {
    Data { data: String },
    Done,
    Error { message: String },
}

impl StreamFrame {
    pub fn data(data: impl Into<String>) -> Self {
        StreamFrame::Data { data: data.into() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        StreamFrame::Error {
            message: message.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamFrame::Data { .. })
    }
}
