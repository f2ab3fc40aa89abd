//! Send queue — per-conversation FIFO with at most one message in flight.
//!
//! Mutations are synchronous and never await while holding the state lock.
//! Flushing runs on a spawned task so that a burst of synchronous calls
//! (enqueue, enqueue, send_now) is settled before the next message is picked.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::model::{QueueEvent, QueuedMessage};
use crate::error::Error;

const EVENT_CAPACITY: usize = 256;

/// Sends one queued message and controls the conversation's active stream.
#[async_trait]
pub trait MessageDispatcher: Send + Sync {
    /// Send `message`. Any error puts the message back at the head of the queue.
    async fn send_message(&self, message: &QueuedMessage) -> Result<(), Error>;

    /// Ask the active stream, if any, to stop.
    fn stop_streaming(&self);
}

#[derive(Debug)]
struct QueueState {
    enabled: bool,
    streaming: bool,
    dispatching: bool,
    messages: VecDeque<QueuedMessage>,
    priority: Option<Uuid>,
}

impl QueueState {
    /// Pop the next message: the priority target if still queued, else the head.
    /// The priority mark is consumed either way.
    fn select(&mut self) -> Option<QueuedMessage> {
        if let Some(id) = self.priority.take()
            && let Some(pos) = self.messages.iter().position(|m| m.id == id)
        {
            return self.messages.remove(pos);
        }
        self.messages.pop_front()
    }

    fn position(&self, id: Uuid) -> Option<usize> {
        self.messages.iter().position(|m| m.id == id)
    }
}

struct Inner {
    state: Mutex<QueueState>,
    dispatcher: Arc<dyn MessageDispatcher>,
    events: broadcast::Sender<QueueEvent>,
}

/// One conversation's outbound queue. Cheap to clone; clones share state.
///
/// Methods that may start a dispatch spawn onto the current tokio runtime.
#[derive(Clone)]
pub struct SendQueue {
    inner: Arc<Inner>,
}

impl SendQueue {
    pub fn new(dispatcher: Arc<dyn MessageDispatcher>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState {
                    enabled: true,
                    streaming: false,
                    dispatching: false,
                    messages: VecDeque::new(),
                    priority: None,
                }),
                dispatcher,
                events,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: QueueEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    /// Append a message to the tail.
    ///
    /// Returns the new message id, or `None` when the queue is disabled or the
    /// message has neither text nor attachments.
    pub fn enqueue(&self, text: &str, attachments: Vec<String>) -> Option<Uuid> {
        let id = {
            let mut state = self.state();
            if !state.enabled {
                debug!("Queue disabled, message not enqueued");
                return None;
            }
            let message = QueuedMessage::new(text, attachments)?;
            let id = message.id;
            state.messages.push_back(message);
            debug!(id = %id, pending = state.messages.len(), "Message enqueued");
            id
        };
        self.emit(QueueEvent::Enqueued { id });
        self.schedule_flush();
        Some(id)
    }

    /// Remove a pending message. Returns false if it is not queued.
    pub fn delete_queued(&self, id: Uuid) -> bool {
        self.take_queued(id).is_some()
    }

    /// Replace a pending message's content.
    ///
    /// The text is trimmed; an update that leaves the message empty removes it.
    pub fn update_queued(&self, id: Uuid, text: &str, attachments: Vec<String>) -> bool {
        let event = {
            let mut state = self.state();
            let Some(pos) = state.position(id) else {
                return false;
            };
            let text = text.trim().to_string();
            if text.is_empty() && attachments.is_empty() {
                state.messages.remove(pos);
                QueueEvent::Removed { id }
            } else {
                let message = &mut state.messages[pos];
                message.text = text;
                message.attachments = attachments;
                QueueEvent::Updated { id }
            }
        };
        self.emit(event);
        true
    }

    /// Remove and return a pending message, e.g. to put it back in the composer.
    pub fn take_queued(&self, id: Uuid) -> Option<QueuedMessage> {
        let taken = {
            let mut state = self.state();
            let pos = state.position(id)?;
            state.messages.remove(pos)
        };
        if taken.is_some() {
            self.emit(QueueEvent::Removed { id });
        }
        taken
    }

    /// Send `id` next, ahead of everything else.
    ///
    /// While a stream is active this only marks the message and asks the
    /// stream to stop; dispatch resumes once streaming ends. Returns false if
    /// `id` is not queued.
    pub fn send_now(&self, id: Uuid) -> bool {
        let streaming = {
            let mut state = self.state();
            if state.position(id).is_none() {
                return false;
            }
            state.priority = Some(id);
            state.streaming
        };
        if streaming {
            info!(id = %id, "Stopping active stream to send queued message");
            self.inner.dispatcher.stop_streaming();
        } else {
            self.schedule_flush();
        }
        true
    }

    /// Enable or disable queueing. Disabling drops every pending message.
    pub fn set_enabled(&self, enabled: bool) {
        let cleared = {
            let mut state = self.state();
            state.enabled = enabled;
            if enabled {
                None
            } else {
                state.priority = None;
                let count = state.messages.len();
                state.messages.clear();
                Some(count)
            }
        };
        match cleared {
            Some(count) => {
                if count > 0 {
                    info!(count, "Queue disabled, pending messages dropped");
                }
                self.emit(QueueEvent::Cleared { count });
            }
            None => self.schedule_flush(),
        }
    }

    /// Record whether the conversation is streaming. Flushing waits for false.
    pub fn set_streaming(&self, streaming: bool) {
        self.state().streaming = streaming;
        if !streaming {
            self.schedule_flush();
        }
    }

    /// Pending messages in dispatch order (ignoring any priority mark).
    pub fn snapshot(&self) -> Vec<QueuedMessage> {
        self.state().messages.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().messages.is_empty()
    }

    pub fn is_enabled(&self) -> bool {
        self.state().enabled
    }

    pub fn is_streaming(&self) -> bool {
        self.state().streaming
    }

    /// Whether a send is in flight.
    pub fn is_dispatching(&self) -> bool {
        self.state().dispatching
    }

    fn schedule_flush(&self) {
        let queue = self.clone();
        tokio::spawn(async move { queue.drain().await });
    }

    /// Pop the next message and mark the queue as dispatching, in one step.
    fn begin_dispatch(&self) -> Option<QueuedMessage> {
        let message = {
            let mut state = self.state();
            if !state.enabled || state.streaming || state.dispatching {
                return None;
            }
            let message = state.select()?;
            state.dispatching = true;
            message
        };
        self.emit(QueueEvent::Dispatching { id: message.id });
        Some(message)
    }

    fn finish_dispatch(&self, message: QueuedMessage, result: Result<(), Error>) {
        let id = message.id;
        let event = {
            let mut state = self.state();
            state.dispatching = false;
            match result {
                Ok(()) => QueueEvent::Sent { id },
                Err(e) => {
                    if e.is_aborted() {
                        debug!(id = %id, "Queued send aborted, requeued");
                    } else {
                        error!(id = %id, error = %e, "Queued send failed, requeued");
                    }
                    state.messages.push_front(message);
                    QueueEvent::Requeued {
                        id,
                        error: e.to_string(),
                    }
                }
            }
        };
        self.emit(event);
    }

    async fn drain(self) {
        while let Some(message) = self.begin_dispatch() {
            debug!(id = %message.id, "Dispatching queued message");
            let result = self.inner.dispatcher.send_message(&message).await;
            let failed = result.is_err();
            self.finish_dispatch(message, result);
            if failed {
                // Retries are immediate; give other tasks a turn.
                tokio::task::yield_now().await;
            }
        }
    }
}
