//! Update events fanned out to consumers
//!
//! One event per converged scope per synchronization round.

use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateEvent {
    FlagsUpdated { change_number: i64 },
    SegmentUpdated { name: String, change_number: i64 },
    MembershipUpdated { key: String, change_number: i64 },
}

/// Broadcast sender wrapper. Sending with no subscribers is not an error.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<UpdateEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UpdateEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: UpdateEvent) {
        tracing::debug!(?event, "Update event");
        let _ = self.tx.send(event);
    }
}
