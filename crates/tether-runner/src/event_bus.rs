//! Broadcast-based event bus for scheduler observability.
//!
//! Wraps `tokio::sync::broadcast` so multiple consumers (SSE, CLI, logger)
//! each receive their own copy of every event. Slow consumers are dropped
//! via the channel's lag mechanism and never block the scheduler.

use std::sync::Arc;
use tether_core::event::{EventKind, LogLevel, PipelineEvent};
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 4096;

/// Central event bus.
///
/// Clones share one broadcast channel: `emit()` on any clone reaches every
/// subscriber created from any clone.
#[derive(Clone)]
pub struct EventBus {
    tx: Arc<broadcast::Sender<PipelineEvent>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx: Arc::new(tx) }
    }

    /// Emit an event to all subscribers. Dropped when nobody listens.
    pub fn emit(&self, kind: EventKind) {
        let _ = self.tx.send(PipelineEvent::new(kind));
    }

    /// Emit an operator-facing log line.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.emit(EventKind::EngineLog {
            level,
            message: message.into(),
        });
    }

    /// Subscribe to receive events.
    ///
    /// A subscriber that falls more than `capacity` events behind gets
    /// `RecvError::Lagged` on its next recv and loses the missed events.
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
