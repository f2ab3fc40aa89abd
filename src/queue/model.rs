//! Send queue data model: queued messages and the events broadcast to UIs.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An outbound chat message waiting for its turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedMessage {
    /// Unique for the lifetime of the queue that created it.
    pub id: Uuid,
    pub text: String,
    /// Opaque attachment references (uploaded media ids, file names).
    #[serde(default)]
    pub attachments: Vec<String>,
}

impl QueuedMessage {
    /// Build a message with trimmed text, or `None` if there is nothing to send.
    pub fn new(text: &str, attachments: Vec<String>) -> Option<Self> {
        let text = text.trim();
        if text.is_empty() && attachments.is_empty() {
            return None;
        }
        Some(Self {
            id: Uuid::new_v4(),
            text: text.to_string(),
            attachments,
        })
    }
}

/// Queue change notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueEvent {
    Enqueued { id: Uuid },
    Updated { id: Uuid },
    Removed { id: Uuid },
    /// Popped from the queue; the send call is about to start.
    Dispatching { id: Uuid },
    Sent { id: Uuid },
    /// The send failed and the message is back at the head.
    Requeued { id: Uuid, error: String },
    /// The queue was disabled and `count` pending messages were dropped.
    Cleared { count: usize },
}
