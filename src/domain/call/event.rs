//! Call lifecycle events
//!
//! Each leg has its own publisher and every event is mirrored onto one
//! process-wide bus. Both are injected into the legs that emit on them,
//! so independent directories can run side by side in tests.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::broadcast;

use super::entity::CallLeg;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEventKind {
    New,
    Ringing,
    Answered,
    Authenticated,
    Hold,
    Unhold,
    Referred { target: String },
    Destroyed,
}

#[derive(Clone)]
pub struct CallEvent {
    pub kind: CallEventKind,
    pub leg: Arc<CallLeg>,
    pub at: DateTime<Utc>,
}

impl CallEvent {
    pub fn new(kind: CallEventKind, leg: Arc<CallLeg>) -> Self {
        Self {
            kind,
            leg,
            at: Utc::now(),
        }
    }
}

/// Process-wide event bus
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CallEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.tx.subscribe()
    }

    /// Publish; delivery to each subscriber follows emission order
    pub fn emit(&self, event: CallEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
