//! Upload client — multipart transfer through the privileged process.
//!
//! Binary payloads need the privileged process to build the form, so there is
//! no direct fallback: an unavailable bridge is an error.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::abort::{AbortSignal, abortable, check_aborted};
use crate::bridge::Bridge;
use crate::endpoints::{self, Method};
use crate::error::{ChannelError, Error, Result};
use crate::protocol::{BridgeMessage, UploadFile, UploadPayload};

/// A multipart upload.
#[derive(Debug, Clone)]
pub struct UploadDescriptor {
    pub path: String,
    pub method: Method,
    pub fields: BTreeMap<String, Value>,
    pub file: Option<UploadFile>,
    pub abort_signal: Option<AbortSignal>,
}

impl UploadDescriptor {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            method: Method::Post,
            fields: BTreeMap::new(),
            file: None,
            abort_signal: None,
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn with_file(
        mut self,
        name: impl Into<String>,
        content_type: impl Into<String>,
        data: Vec<u8>,
    ) -> Self {
        self.file = Some(UploadFile {
            name: Some(name.into()),
            content_type: Some(content_type.into()),
            data,
        });
        self
    }

    pub fn with_abort_signal(mut self, signal: AbortSignal) -> Self {
        self.abort_signal = Some(signal);
        self
    }
}

/// Upload client for UI surfaces.
pub struct UploadClient {
    bridge: Option<Arc<dyn Bridge>>,
}

impl UploadClient {
    pub fn new(bridge: Option<Arc<dyn Bridge>>) -> Self {
        Self { bridge }
    }

    /// Send the upload and return the response payload.
    pub async fn upload(&self, descriptor: UploadDescriptor) -> Result<Value> {
        endpoints::resolve(descriptor.method, &descriptor.path)?;
        check_aborted(descriptor.abort_signal.as_ref())?;

        let bridge = self.bridge.as_ref().ok_or_else(|| ChannelError::Unavailable {
            name: "runtime".to_string(),
        })?;

        let size = descriptor.file.as_ref().map_or(0, |f| f.data.len());
        debug!(path = %descriptor.path, bytes = size, "Uploading");

        let message = BridgeMessage::Upload(UploadPayload {
            path: descriptor.path.clone(),
            method: descriptor.method,
            fields: descriptor.fields,
            file: descriptor.file,
        });
        let result = abortable(
            async {
                let envelope = bridge.send_message(message).await?;
                Ok::<_, Error>(envelope.into_result()?)
            },
            descriptor.abort_signal.as_ref(),
            None,
        )
        .await;

        if let Err(e) = &result
            && !e.is_aborted()
        {
            warn!(path = %descriptor.path, error = %e, "Upload failed");
        }
        result
    }
}
