use thiserror::Error;
use tokio::sync::broadcast;

use crate::engine::error::FormulaError;
use crate::eval::{AttrQuality, DevState, Value};
use crate::timestamp::Timestamp;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EventError {
    #[error("Send failed: {message}")]
    SendFailed { message: String },
    #[error("Lagged: {count} events skipped")]
    Lagged { count: u64 },
    #[error("Receive failed: {message}")]
    ReceiveFailed { message: String },
}

pub type EventResult<T> = Result<T, EventError>;

/// Notifications produced by an engine. How they reach remote observers is up to the
/// host.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    AttributeChanged {
        name: String,
        value: Result<Value, FormulaError>,
        quality: AttrQuality,
        timestamp: Timestamp,
    },
    StateChanged {
        previous: DevState,
        current: DevState,
    },
}

/// An attribute failed to evaluate.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorEvent {
    pub name: String,
    pub message: String,
    pub timestamp: Timestamp,
}

pub struct EventBus {
    event_sender: broadcast::Sender<Event>,
    error_sender: broadcast::Sender<ErrorEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (event_sender, _) = broadcast::channel(capacity.max(1));
        let (error_sender, _) = broadcast::channel(capacity.max(1));
        Self {
            event_sender,
            error_sender,
        }
    }

    pub fn subscribe(&self) -> (EventReceiver, ErrorReceiver) {
        let event_rx = self.event_sender.subscribe();
        let error_rx = self.error_sender.subscribe();
        (EventReceiver::new(event_rx), ErrorReceiver::new(error_rx))
    }

    pub fn has_subscribers(&self) -> bool {
        self.event_sender.receiver_count() > 0
    }

    /// Publishes to current subscribers and returns how many there were. Never blocks,
    /// so it is safe to call from inside an evaluation.
    pub fn publish(&self, event: Event) -> EventResult<usize> {
        self.event_sender
            .send(event)
            .map_err(|e| EventError::SendFailed {
                message: e.to_string(),
            })
    }

    pub fn publish_error(&self, error: ErrorEvent) -> EventResult<usize> {
        self.error_sender
            .send(error)
            .map_err(|e| EventError::SendFailed {
                message: e.to_string(),
            })
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}

pub struct EventReceiver {
    receiver: broadcast::Receiver<Event>,
}

impl EventReceiver {
    fn new(receiver: broadcast::Receiver<Event>) -> Self {
        Self { receiver }
    }

    /// Receives the next event. After falling behind, the receiver resubscribes and
    /// reports how many events were skipped; call `recv` promptly to avoid that.
    pub async fn recv(&mut self) -> EventResult<Event> {
        match self.receiver.recv().await {
            Ok(event) => Ok(event),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                self.receiver = self.receiver.resubscribe();
                Err(EventError::Lagged { count: n })
            }
            Err(e) => Err(EventError::ReceiveFailed {
                message: e.to_string(),
            }),
        }
    }

    /// Non-blocking variant for synchronous callers.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.receiver.try_recv().ok()
    }
}

pub struct ErrorReceiver {
    receiver: broadcast::Receiver<ErrorEvent>,
}

impl ErrorReceiver {
    fn new(receiver: broadcast::Receiver<ErrorEvent>) -> Self {
        Self { receiver }
    }

    pub async fn recv(&mut self) -> EventResult<ErrorEvent> {
        self.receiver
            .recv()
            .await
            .map_err(|e| EventError::ReceiveFailed {
                message: e.to_string(),
            })
    }

    pub fn try_recv(&mut self) -> Option<ErrorEvent> {
        self.receiver.try_recv().ok()
    }
}
