//! Per-conversation send queue.

pub mod model;
pub mod send_queue;

pub use model::{QueueEvent, QueuedMessage};
pub use send_queue::{MessageDispatcher, SendQueue};
