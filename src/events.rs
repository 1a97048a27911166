//! Pool lifecycle events

use tokio::sync::broadcast;

use crate::connection::ConnectionId;

const EVENT_CAPACITY: usize = 256;

/// Something that happened inside a pool
///
/// Subscribers that fall behind by more than the channel capacity miss the
/// oldest events (`RecvError::Lagged`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    Ready,
    Error { message: String },
    Created { id: ConnectionId },
    Acquired { id: ConnectionId },
    Released { id: ConnectionId },
    Destroyed { id: ConnectionId },
    Enqueued { pending: usize, priority: i32 },
    Draining,
    Closed,
}

pub(crate) struct EventBus {
    sender: broadcast::Sender<PoolEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    pub fn emit(&self, event: PoolEvent) {
        // No subscribers is not an error
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
