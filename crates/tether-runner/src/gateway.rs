//! Resume gateway: the external entry point that ends a suspension.
//!
//! It records the human's response and hands the task back to the queue as
//! `UserInputReceived`. It never executes anything; the scheduler picks the
//! task up on a later cycle and the engine injects the response.

use crate::event_bus::EventBus;
use anyhow::Result;
use redb::Database;
use std::sync::Arc;
use tether_core::checkpoint::ResumeValue;
use tether_core::event::EventKind;
use tether_core::task::{Task, TaskId, TaskStatus};
use tether_db::task_store::TaskStore;

#[derive(Clone)]
pub struct ResumeGateway {
    db: Arc<Database>,
    events: EventBus,
}

impl ResumeGateway {
    pub fn new(db: Arc<Database>, events: EventBus) -> Self {
        Self { db, events }
    }

    /// Record `response` for the task's pending interrupt.
    ///
    /// Rejected with `InvalidResume` (and nothing written) unless the task
    /// is `NeedsReview` with a pending interrupt that has no response yet.
    pub fn respond(&self, task_id: TaskId, response: ResumeValue) -> Result<Task> {
        let (task, checkpoint) = TaskStore::new(&self.db)
            .record_response(task_id, response)
            .inspect_err(|e| tracing::info!(%task_id, error = %e, "response rejected"))?;

        let recorded = checkpoint
            .response
            .as_ref()
            .map(ResumeValue::summary)
            .unwrap_or_default();
        tracing::info!(%task_id, response = %recorded, "response recorded");

        self.events.emit(EventKind::ResumeRecorded {
            task_id,
            response: recorded,
        });
        self.events.emit(EventKind::CheckpointSaved {
            task_id,
            version: checkpoint.version,
        });
        self.events.emit(EventKind::TaskStateChange {
            task_id,
            from: TaskStatus::NeedsReview,
            to: TaskStatus::UserInputReceived,
        });
        Ok(task)
    }
}
