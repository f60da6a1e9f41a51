//! Outbound backend events.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::backend::BackendState;
use crate::progress::BackendProgress;
use crate::watch::ServiceEntry;

const EVENT_CAPACITY: usize = 256;

/// Everything the backend reports to the UI, CLI, or control server.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum BackendEvent {
    StateChanged { state: BackendState },
    Progress { progress: BackendProgress },
    ShowNotification { title: String, body: String },
    /// The Kubernetes API is listening on a new host port.
    CurrentPortChanged { port: u16 },
    ServiceChanged { services: Vec<ServiceEntry> },
    ServiceError { message: String },
}

/// Fan-out of [`BackendEvent`]s.  Slow subscribers lose the oldest events
/// rather than blocking the backend.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BackendEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BackendEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: BackendEvent) {
        trace!(?event, "backend event");
        // No receivers is fine.
        let _ = self.tx.send(event);
    }

    pub fn notify(&self, title: impl Into<String>, body: impl Into<String>) {
        self.emit(BackendEvent::ShowNotification {
            title: title.into(),
            body: body.into(),
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
