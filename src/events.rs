//! Store lifecycle events consumed by external cache-refresh collaborators.

use tokio::sync::mpsc;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// The on-disk store was replaced by a snapshot load; in-memory mirrors
    /// must resynchronize.
    Reloaded,
    /// The local store is suspected corrupt/unreachable; the node stops
    /// serving until repaired.
    Degraded { reason: String },
}

/// Handle for publishing store events without coupling the state machine to
/// any particular consumer.
#[derive(Debug, Clone)]
pub struct EventHandle {
    tx: Option<mpsc::UnboundedSender<StoreEvent>>,
}

impl EventHandle {
    /// A handle that drops every event. Used by tests and tooling that has no
    /// cache layer to refresh.
    pub fn noop() -> Self {
        Self { tx: None }
    }

    pub fn from_sender(tx: mpsc::UnboundedSender<StoreEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<StoreEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::from_sender(tx), rx)
    }

    pub fn publish(&self, event: StoreEvent) {
        if let Some(tx) = &self.tx {
            if tx.send(event).is_err() {
                warn!("store event receiver dropped");
            }
        }
    }
}
