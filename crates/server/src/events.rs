//! Typed event bus
//!
//! All components report back through one broadcast channel of
//! [`DockEvent`]s. The bus is injected, not global; subscribers are
//! independent and laggy receivers only lose their own backlog.

use tokio::sync::broadcast;
use tracing::trace;

use drydock_protocol::DockEvent;

const DEFAULT_CAPACITY: usize = 1024;

/// Cheap-to-clone handle to the event stream
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DockEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(DEFAULT_CAPACITY);
        Self { tx }
    }

    /// Publish an event. A bus with no subscribers drops events silently;
    /// that is normal during startup and teardown.
    pub fn publish(&self, event: DockEvent) {
        trace!(component = "events", "publish");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DockEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
