//! Long-lived ports for framed streaming.

use std::task::{Context, Poll};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::protocol::{StreamFrame, StreamRequest};

/// UI side of a port: posts requests, receives frames.
#[derive(Debug)]
pub struct StreamPort {
    name: String,
    requests: mpsc::UnboundedSender<StreamRequest>,
    frames: mpsc::UnboundedReceiver<StreamFrame>,
    disconnect: CancellationToken,
    connected: bool,
}

/// Privileged side of a port: receives requests, posts frames.
#[derive(Debug)]
pub struct ServicePort {
    name: String,
    requests: mpsc::UnboundedReceiver<StreamRequest>,
    frames: mpsc::UnboundedSender<StreamFrame>,
    disconnected: CancellationToken,
}

/// Create both ends of a named port.
pub fn port_pair(name: &str) -> (StreamPort, ServicePort) {
    let (request_tx, request_rx) = mpsc::unbounded_channel();
    let (frame_tx, frame_rx) = mpsc::unbounded_channel();
    let token = CancellationToken::new();

    let client = StreamPort {
        name: name.to_string(),
        requests: request_tx,
        frames: frame_rx,
        disconnect: token.clone(),
        connected: true,
    };
    let service = ServicePort {
        name: name.to_string(),
        requests: request_rx,
        frames: frame_tx,
        disconnected: token,
    };
    (client, service)
}

impl StreamPort {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Post a request frame. Returns false if the port is gone.
    pub fn post(&self, request: StreamRequest) -> bool {
        self.connected && self.requests.send(request).is_ok()
    }

    pub(crate) fn poll_frame(&mut self, cx: &mut Context<'_>) -> Poll<Option<StreamFrame>> {
        self.frames.poll_recv(cx)
    }

    /// Token that fires when this port is disconnected.
    pub fn disconnect_token(&self) -> CancellationToken {
        self.disconnect.clone()
    }

    /// Close the port. Only the first call has any effect; returns whether it
    /// was that call.
    pub fn disconnect(&mut self) -> bool {
        if !self.connected {
            return false;
        }
        self.connected = false;
        self.disconnect.cancel();
        self.frames.close();
        debug!(port = %self.name, "Port disconnected");
        true
    }
}

impl Drop for StreamPort {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl ServicePort {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.is_cancelled()
    }

    /// Resolves once the UI side disconnects.
    pub async fn disconnected(&self) {
        self.disconnected.cancelled().await
    }

    /// Next request frame, or `None` once the UI side has gone away.
    pub async fn next_request(&mut self) -> Option<StreamRequest> {
        tokio::select! {
            _ = self.disconnected.cancelled() => None,
            request = self.requests.recv() => request,
        }
    }

    /// Post a frame unless the UI side has disconnected.
    pub fn post(&self, frame: StreamFrame) -> bool {
        if self.is_disconnected() {
            return false;
        }
        self.frames.send(frame).is_ok()
    }
}
