//! Cross-context bridge to the privileged process.
//!
//! UI surfaces and the privileged process share no memory. They talk through:
//! - one-shot [`BridgeMessage`]s answered by a [`ResponseEnvelope`], and
//! - long-lived [`StreamPort`]s carrying framed streams.

pub mod channel;
pub mod port;

pub use channel::{BridgeEndpoints, ChannelBridge, Envelope, channel_bridge};
pub use port::{ServicePort, StreamPort, port_pair};

use async_trait::async_trait;

use crate::error::ChannelError;
use crate::protocol::{BridgeMessage, ResponseEnvelope};

/// The messaging API available to a UI surface.
///
/// [`ChannelError::Unavailable`] means the privileged process cannot be
/// reached from this context at all; every other error means a message was
/// (or may have been) delivered.
#[async_trait]
pub trait Bridge: Send + Sync {
    /// Post a one-shot message and wait for its reply.
    async fn send_message(&self, message: BridgeMessage) -> Result<ResponseEnvelope, ChannelError>;

    /// Open a named long-lived port.
    fn connect(&self, name: &str) -> Result<StreamPort, ChannelError>;
}
