//! Interrupt broker: the one path by which a run parks on a human.
//!
//! Questions and approval requests alike become a lease-conditioned
//! `InProgress -> NeedsReview` write that carries the checkpoint and a
//! comment describing what is being asked. Waiting tasks are found with
//! `list(NeedsReview)`; nothing is held in memory while they wait.

use crate::event_bus::EventBus;
use anyhow::Result;
use redb::Database;
use std::sync::Arc;
use tether_core::checkpoint::Checkpoint;
use tether_core::event::EventKind;
use tether_core::interrupt::Interrupt;
use tether_core::task::{AUTHOR_AGENT, Comment, LeaseGuard, Task, TaskStatus};
use tether_db::task_store::TaskStore;

#[derive(Clone)]
pub struct InterruptBroker {
    db: Arc<Database>,
    events: EventBus,
}

impl InterruptBroker {
    pub fn new(db: Arc<Database>, events: EventBus) -> Self {
        Self { db, events }
    }

    /// Park the task on `interrupt`.
    ///
    /// `checkpoint` is written in the same transaction when given; pass
    /// `None` to re-park a task whose stored checkpoint already holds the
    /// interrupt. A lost lease surfaces as `ClaimConflict`.
    pub fn park(
        &self,
        guard: &LeaseGuard,
        interrupt: &Interrupt,
        checkpoint: Option<&mut Checkpoint>,
    ) -> Result<Task> {
        let comment = Comment::new(AUTHOR_AGENT, interrupt.describe());
        let saved = checkpoint.is_some();
        let (task, version) = match checkpoint {
            Some(checkpoint) => {
                let task = TaskStore::new(&self.db).finish(
                    guard,
                    TaskStatus::NeedsReview,
                    Some(comment),
                    Some(&mut *checkpoint),
                )?;
                (task, checkpoint.version)
            }
            None => (
                TaskStore::new(&self.db).transition(guard, TaskStatus::NeedsReview, Some(comment))?,
                0,
            ),
        };

        tracing::info!(
            task_id = %task.id,
            kind = %interrupt.kind,
            summary = %interrupt.summary(),
            "task waiting on human input"
        );
        self.events.emit(EventKind::TaskStateChange {
            task_id: task.id,
            from: TaskStatus::InProgress,
            to: TaskStatus::NeedsReview,
        });
        if saved {
            self.events.emit(EventKind::CheckpointSaved {
                task_id: task.id,
                version,
            });
        }
        self.events.emit(EventKind::InterruptRaised {
            task_id: task.id,
            kind: interrupt.kind,
            summary: interrupt.summary(),
        });
        Ok(task)
    }
}
