//! Stream client — token-by-token responses over a port.
//!
//! A stream is one port carrying one request frame up and a frame sequence
//! down. It is not restartable; retrying means calling [`StreamClient::stream`]
//! again. No timeout is applied here: the privileged process enforces the idle
//! timeout, and callers wanting an overall deadline race the stream themselves.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use serde_json::Value;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::{debug, info};

use crate::bridge::{Bridge, StreamPort};
use crate::endpoints::{self, Method};
use crate::error::{ChannelError, Error, HttpError, Result};
use crate::protocol::{Headers, STREAM_PORT, StreamFrame, StreamRequest};

/// What to stream.
#[derive(Debug, Clone)]
pub struct StreamDescriptor {
    pub path: String,
    pub method: Method,
    pub headers: Headers,
    pub body: Option<Value>,
    /// Overrides the configured idle timeout for this stream.
    pub idle_timeout: Option<Duration>,
}

impl StreamDescriptor {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            method: Method::Post,
            headers: Headers::new(),
            body: None,
            idle_timeout: None,
        }
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }
}

/// Opens streams through the privileged process.
pub struct StreamClient {
    bridge: Option<Arc<dyn Bridge>>,
}

impl StreamClient {
    pub fn new(bridge: Option<Arc<dyn Bridge>>) -> Self {
        Self { bridge }
    }

    /// Open a stream of text chunks.
    ///
    /// Fails immediately for unregistered endpoints and when no bridge is
    /// reachable; streaming has no direct fallback.
    pub fn stream(&self, descriptor: StreamDescriptor) -> Result<ChunkStream> {
        endpoints::resolve(descriptor.method, &descriptor.path)?;
        let bridge = self.bridge.as_ref().ok_or_else(|| ChannelError::Unavailable {
            name: STREAM_PORT.to_string(),
        })?;

        let port = bridge.connect(STREAM_PORT)?;
        let request = StreamRequest {
            path: descriptor.path.clone(),
            method: descriptor.method,
            headers: descriptor.headers,
            body: descriptor.body,
            stream_idle_timeout_ms: descriptor.idle_timeout.map(|t| t.as_millis() as u64),
        };
        if !port.post(request) {
            return Err(ChannelError::SendFailed {
                name: STREAM_PORT.to_string(),
                reason: "port closed before the request was posted".to_string(),
            }
            .into());
        }

        info!(path = %descriptor.path, "Stream opened");
        Ok(ChunkStream::new(port))
    }
}

/// Cloneable handle that stops a [`ChunkStream`] from anywhere.
#[derive(Debug, Clone)]
pub struct StreamAbortHandle {
    token: CancellationToken,
}

impl StreamAbortHandle {
    /// Stop frame delivery; the stream ends cleanly on its next poll.
    pub fn abort(&self) {
        self.token.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Lazy sequence of text chunks.
///
/// Yields one `Ok(chunk)` per `data` frame in arrival order, then ends on
/// `done`, or yields one `Err` on an `error` frame. The port is disconnected
/// exactly once, however the stream is left (completion, abort or drop).
pub struct ChunkStream {
    port: StreamPort,
    stop: CancellationToken,
    stopped: Pin<Box<WaitForCancellationFutureOwned>>,
    finished: bool,
}

impl ChunkStream {
    fn new(port: StreamPort) -> Self {
        let stop = CancellationToken::new();
        Self {
            port,
            stopped: Box::pin(stop.clone().cancelled_owned()),
            stop,
            finished: false,
        }
    }

    pub fn abort_handle(&self) -> StreamAbortHandle {
        StreamAbortHandle {
            token: self.stop.clone(),
        }
    }

    /// Disconnect now. Buffered frames are discarded.
    pub fn close(&mut self) {
        self.stop.cancel();
        self.finish();
    }

    /// Drain the stream into one string.
    pub async fn collect_text(mut self) -> Result<String> {
        use futures::StreamExt;

        let mut text = String::new();
        while let Some(chunk) = self.next().await {
            text.push_str(&chunk?);
        }
        Ok(text)
    }

    fn finish(&mut self) {
        self.finished = true;
        if self.port.disconnect() {
            debug!("Stream closed");
        }
    }
}

impl Stream for ChunkStream {
    type Item = Result<String>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.finished {
            return Poll::Ready(None);
        }
        if this.stopped.as_mut().poll(cx).is_ready() {
            this.finish();
            return Poll::Ready(None);
        }

        match this.port.poll_frame(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(StreamFrame::Data { data })) => Poll::Ready(Some(Ok(data))),
            Poll::Ready(Some(StreamFrame::Done)) => {
                this.finish();
                Poll::Ready(None)
            }
            Poll::Ready(Some(StreamFrame::Error { message })) => {
                this.finish();
                Poll::Ready(Some(Err(HttpError::Stream(message).into())))
            }
            Poll::Ready(None) => {
                this.finish();
                Poll::Ready(Some(Err(Error::Channel(ChannelError::Disconnected {
                    name: STREAM_PORT.to_string(),
                    reason: "closed without a terminal frame".to_string(),
                }))))
            }
        }
    }
}

impl Drop for ChunkStream {
    fn drop(&mut self) {
        self.finish();
    }
}
