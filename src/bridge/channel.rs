//! In-process bridge over tokio channels.
//!
//! The UI side holds a [`ChannelBridge`]; the privileged process drains the
//! matching [`BridgeEndpoints`]. Once the endpoints are dropped the bridge
//! reports itself unavailable.

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::port::{ServicePort, StreamPort, port_pair};
use super::Bridge;
use crate::error::ChannelError;
use crate::protocol::{BridgeMessage, ResponseEnvelope};

const BRIDGE_NAME: &str = "runtime";

/// A one-shot message together with its reply slot.
#[derive(Debug)]
pub struct Envelope {
    pub message: BridgeMessage,
    pub reply: oneshot::Sender<ResponseEnvelope>,
}

/// Receiving side of a [`ChannelBridge`], owned by the privileged process.
#[derive(Debug)]
pub struct BridgeEndpoints {
    pub messages: mpsc::Receiver<Envelope>,
    pub connections: mpsc::UnboundedReceiver<ServicePort>,
}

/// UI-side handle. Cheap to clone; every clone talks to the same process.
#[derive(Debug, Clone)]
pub struct ChannelBridge {
    messages: mpsc::Sender<Envelope>,
    connections: mpsc::UnboundedSender<ServicePort>,
}

/// Create a bridge and the endpoints the privileged process serves.
pub fn channel_bridge(capacity: usize) -> (ChannelBridge, BridgeEndpoints) {
    let (message_tx, message_rx) = mpsc::channel(capacity);
    let (connection_tx, connection_rx) = mpsc::unbounded_channel();
    (
        ChannelBridge {
            messages: message_tx,
            connections: connection_tx,
        },
        BridgeEndpoints {
            messages: message_rx,
            connections: connection_rx,
        },
    )
}

#[async_trait]
impl Bridge for ChannelBridge {
    async fn send_message(&self, message: BridgeMessage) -> Result<ResponseEnvelope, ChannelError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.messages
            .send(Envelope {
                message,
                reply: reply_tx,
            })
            .await
            .map_err(|_| ChannelError::Unavailable {
                name: BRIDGE_NAME.to_string(),
            })?;

        reply_rx.await.map_err(|_| ChannelError::Disconnected {
            name: BRIDGE_NAME.to_string(),
            reason: "reply dropped before it was sent".to_string(),
        })
    }

    fn connect(&self, name: &str) -> Result<StreamPort, ChannelError> {
        let (client, service) = port_pair(name);
        self.connections
            .send(service)
            .map_err(|_| ChannelError::Unavailable {
                name: name.to_string(),
            })?;
        debug!(port = %name, "Port connected");
        Ok(client)
    }
}
