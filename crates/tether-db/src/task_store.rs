use crate::checkpoint_store::{self, CHECKPOINT_TABLE};
use anyhow::{Context, Result};
use chrono::Utc;
use redb::{Database, ReadableTable, Table, TableDefinition};
use std::collections::BTreeMap;
use tether_core::TetherError;
use tether_core::checkpoint::{Checkpoint, ResumeValue};
use tether_core::task::{
    AUTHOR_HUMAN, AUTHOR_SCHEDULER, Comment, Lease, LeaseGuard, NewTask, Task, TaskId, TaskStatus,
    TaskUpdate, merge_metadata,
};

/// Tasks table: i64 task ID -> JSON-serialized Task.
pub const TASKS_TABLE: TableDefinition<i64, &str> = TableDefinition::new("tasks");

/// Auto-increment counter table: "next_task_id" -> i64.
pub const COUNTER_TABLE: TableDefinition<&str, i64> = TableDefinition::new("counters");

const NEXT_ID_KEY: &str = "next_task_id";

/// Selection retries after losing a claim race before giving up the cycle.
const MAX_CLAIM_ATTEMPTS: usize = 8;

/// A task whose lease expired and was put back in the queue.
#[derive(Debug, Clone)]
pub struct Reclaimed {
    pub task: Task,
    pub previous_owner: String,
}

pub struct TaskStore<'a> {
    db: &'a Database,
}

impl<'a> TaskStore<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Access the underlying database reference.
    pub fn db(&self) -> &'a Database {
        self.db
    }

    /// Create a task in `New` status, assigning it an auto-incremented ID.
    pub fn create(&self, new: NewTask) -> Result<Task> {
        let mut task = new.into_task();
        let write_txn = self.db.begin_write()?;
        {
            let mut counter = write_txn.open_table(COUNTER_TABLE)?;
            let next_id = counter.get(NEXT_ID_KEY)?.map(|v| v.value()).unwrap_or(1);
            task.id = TaskId(next_id);
            counter.insert(NEXT_ID_KEY, next_id + 1)?;

            let mut tasks = write_txn.open_table(TASKS_TABLE)?;
            put(&mut tasks, &task)?;
        }
        write_txn.commit()?;
        tracing::debug!(task_id = %task.id, title = %task.title, "task created");
        Ok(task)
    }

    /// Get a task by ID.
    pub fn get(&self, id: TaskId) -> Result<Option<Task>> {
        let read_txn = self.db.begin_read()?;
        let tasks = read_txn.open_table(TASKS_TABLE)?;
        match tasks.get(id.0)? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    /// Get a task by ID, failing with `NotFound` if it doesn't exist.
    pub fn require(&self, id: TaskId) -> Result<Task> {
        self.get(id)?
            .ok_or_else(|| TetherError::not_found(id.to_string()).into())
    }

    /// List tasks in ID order, optionally filtered by status.
    pub fn list(&self, status_filter: Option<TaskStatus>) -> Result<Vec<Task>> {
        let read_txn = self.db.begin_read()?;
        let tasks = read_txn.open_table(TASKS_TABLE)?;
        let mut result = Vec::new();

        for entry in tasks.iter()? {
            let (_, value) = entry?;
            let task = decode(value.value())?;
            if let Some(status) = status_filter
                && task.status != status
            {
                continue;
            }
            result.push(task);
        }

        Ok(result)
    }

    /// The task holding the in-progress slot, if any.
    pub fn in_progress(&self) -> Result<Option<Task>> {
        Ok(self.list(Some(TaskStatus::InProgress))?.into_iter().next())
    }

    /// Apply a producer or operator update.
    ///
    /// Comments are appended and metadata keys merged. Status changes go
    /// through [`TaskStatus::allows_external_transition`]: the in-progress
    /// slot and the end of a suspension are never reachable from here.
    pub fn update(&self, id: TaskId, update: TaskUpdate) -> Result<Task> {
        let write_txn = self.db.begin_write()?;
        let task = {
            let mut tasks = write_txn.open_table(TASKS_TABLE)?;
            let mut task = load(&tasks, id)?;
            ensure_mutable(&task)?;

            if let Some(next) = update.status {
                if !task.status.allows_external_transition(next) {
                    return Err(TetherError::InvalidTransition {
                        task_id: id,
                        from: task.status,
                        to: next,
                    }
                    .into());
                }
                task.status = next;
            }
            if let Some(comment) = update.comment {
                task.comments.push(comment);
            }
            if let Some(metadata) = update.metadata {
                merge_metadata(&mut task.metadata, metadata);
            }
            task.updated_at = Utc::now();
            put(&mut tasks, &task)?;
            task
        };
        write_txn.commit()?;
        Ok(task)
    }

    /// Compare-and-set claim of one task.
    ///
    /// Succeeds only if the task is `New` or `UserInputReceived` and no task
    /// holds the in-progress slot, all checked inside one write transaction.
    pub fn try_claim(&self, id: TaskId, owner: &str) -> Result<Task> {
        let write_txn = self.db.begin_write()?;
        let task = {
            let mut tasks = write_txn.open_table(TASKS_TABLE)?;
            if let Some(holder) = slot_holder(&tasks)? {
                return Err(TetherError::SlotBusy { holder }.into());
            }
            let mut task = load(&tasks, id)?;
            if !task.status.is_claimable() {
                return Err(TetherError::ClaimConflict {
                    task_id: id,
                    reason: format!("status is {}", task.status),
                }
                .into());
            }

            let now = Utc::now();
            task.run_count += 1;
            task.lease = Some(Lease {
                owner: owner.to_string(),
                run: task.run_count,
                claimed_from: task.status,
                acquired_at: now,
                renewed_at: now,
            });
            task.status = TaskStatus::InProgress;
            task.updated_at = now;
            put(&mut tasks, &task)?;
            task
        };
        write_txn.commit()?;
        Ok(task)
    }

    /// Claim the next eligible task.
    ///
    /// Selection happens in a read snapshot: `UserInputReceived` by
    /// `updated_at`, then `New` by `created_at`. The claim itself is
    /// [`try_claim`](Self::try_claim); losing the race re-runs selection.
    /// Returns `None` when nothing is eligible or the slot is taken.
    pub fn claim_next(&self, owner: &str) -> Result<Option<Task>> {
        for attempt in 1..=MAX_CLAIM_ATTEMPTS {
            let Some(candidate) = self.next_candidate()? else {
                return Ok(None);
            };
            match self.try_claim(candidate, owner) {
                Ok(task) => return Ok(Some(task)),
                Err(e) => match TetherError::find(&e) {
                    Some(TetherError::SlotBusy { .. }) => return Ok(None),
                    Some(TetherError::ClaimConflict { reason, .. }) => {
                        tracing::debug!(
                            task_id = %candidate,
                            attempt,
                            reason = %reason,
                            "lost claim race, reselecting"
                        );
                    }
                    _ => return Err(e),
                },
            }
        }
        tracing::warn!(owner, "claim kept conflicting, skipping this cycle");
        Ok(None)
    }

    fn next_candidate(&self) -> Result<Option<TaskId>> {
        let mut resumed: Vec<Task> = Vec::new();
        let mut fresh: Vec<Task> = Vec::new();
        for task in self.list(None)? {
            match task.status {
                TaskStatus::InProgress => return Ok(None),
                TaskStatus::UserInputReceived => resumed.push(task),
                TaskStatus::New => fresh.push(task),
                _ => {}
            }
        }
        if let Some(task) = resumed.iter().min_by_key(|t| (t.updated_at, t.id)) {
            return Ok(Some(task.id));
        }
        Ok(fresh.iter().min_by_key(|t| (t.created_at, t.id)).map(|t| t.id))
    }

    /// Finish a run: lease-conditioned `InProgress -> next`.
    ///
    /// A guard whose lease is no longer current gets `ClaimConflict` and
    /// nothing is written.
    pub fn transition(
        &self,
        guard: &LeaseGuard,
        next: TaskStatus,
        comment: Option<Comment>,
    ) -> Result<Task> {
        self.finish(guard, next, comment, None)
    }

    /// Like [`transition`](Self::transition), also writing the run's
    /// checkpoint (version-checked) in the same transaction.
    pub fn finish(
        &self,
        guard: &LeaseGuard,
        next: TaskStatus,
        comment: Option<Comment>,
        checkpoint: Option<&mut Checkpoint>,
    ) -> Result<Task> {
        let write_txn = self.db.begin_write()?;
        let task = {
            let mut tasks = write_txn.open_table(TASKS_TABLE)?;
            let mut task = load(&tasks, guard.task_id)?;
            ensure_mutable(&task)?;
            ensure_lease(&task, guard)?;
            if !task.status.can_transition_to(next) || next == TaskStatus::InProgress {
                return Err(TetherError::InvalidTransition {
                    task_id: task.id,
                    from: task.status,
                    to: next,
                }
                .into());
            }

            task.status = next;
            task.lease = None;
            if let Some(comment) = comment {
                task.comments.push(comment);
            }
            task.updated_at = Utc::now();
            put(&mut tasks, &task)?;

            if let Some(checkpoint) = checkpoint {
                let mut checkpoints = write_txn.open_table(CHECKPOINT_TABLE)?;
                checkpoint_store::put_checked(&mut checkpoints, checkpoint)?;
            }
            task
        };
        write_txn.commit()?;
        Ok(task)
    }

    /// Heartbeat: refresh `renewed_at` if the lease is still ours.
    pub fn renew_lease(&self, guard: &LeaseGuard) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut tasks = write_txn.open_table(TASKS_TABLE)?;
            let mut task = load(&tasks, guard.task_id)?;
            ensure_lease(&task, guard)?;
            if let Some(lease) = task.lease.as_mut() {
                lease.renewed_at = Utc::now();
            }
            put(&mut tasks, &task)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Release in-progress tasks whose lease was not renewed within `ttl`,
    /// restoring the status they were claimed from.
    pub fn reclaim_expired(&self, ttl: chrono::Duration) -> Result<Vec<Reclaimed>> {
        let now = Utc::now();
        let write_txn = self.db.begin_write()?;
        let reclaimed = {
            let mut tasks = write_txn.open_table(TASKS_TABLE)?;
            let mut expired = Vec::new();
            for entry in tasks.iter()? {
                let (_, value) = entry?;
                let task = decode(value.value())?;
                if task.status != TaskStatus::InProgress {
                    continue;
                }
                let stale = task
                    .lease
                    .as_ref()
                    .is_none_or(|lease| lease.is_expired(ttl, now));
                if stale {
                    expired.push(task);
                }
            }

            let mut reclaimed = Vec::new();
            for mut task in expired {
                let lease = task.lease.take();
                let (owner, restored) = match &lease {
                    Some(lease) => (lease.owner.clone(), lease.claimed_from),
                    None => ("<unknown>".to_string(), TaskStatus::New),
                };
                task.status = restored;
                task.comments.push(Comment::new(
                    AUTHOR_SCHEDULER,
                    format!("Lease held by {owner} expired; returned to {restored}."),
                ));
                task.updated_at = now;
                put(&mut tasks, &task)?;
                reclaimed.push(Reclaimed {
                    task,
                    previous_owner: owner,
                });
            }
            reclaimed
        };
        write_txn.commit()?;
        Ok(reclaimed)
    }

    /// End a suspension: record a human response on the checkpoint and move
    /// the task `NeedsReview -> UserInputReceived`, in one transaction.
    ///
    /// The response is normalized against the pending interrupt's kind.
    /// Any validation failure is `InvalidResume` and nothing is written.
    pub fn record_response(&self, id: TaskId, response: ResumeValue) -> Result<(Task, Checkpoint)> {
        let invalid = |reason: String| TetherError::InvalidResume {
            task_id: id,
            reason,
        };
        let write_txn = self.db.begin_write()?;
        let result = {
            let mut tasks = write_txn.open_table(TASKS_TABLE)?;
            let mut checkpoints = write_txn.open_table(CHECKPOINT_TABLE)?;
            let mut task = load(&tasks, id)?;
            if task.status != TaskStatus::NeedsReview {
                return Err(invalid(format!("task is {}, not needs-review", task.status)).into());
            }
            let mut checkpoint = checkpoint_store::load(&checkpoints, id)?
                .ok_or_else(|| invalid("task has no checkpoint".into()))?;
            let Some(pending) = checkpoint.pending_interrupt.as_ref() else {
                return Err(invalid("no pending interrupt".into()).into());
            };
            if checkpoint.response.is_some() {
                return Err(invalid("a response was already recorded".into()).into());
            }
            let response = response
                .normalize_for(pending.interrupt.kind)
                .map_err(invalid)?;
            let summary = response.summary();

            checkpoint.response = Some(response);
            checkpoint_store::put_checked(&mut checkpoints, &mut checkpoint)?;

            task.status = TaskStatus::UserInputReceived;
            task.comments
                .push(Comment::new(AUTHOR_HUMAN, format!("Response: {summary}")));
            task.updated_at = Utc::now();
            put(&mut tasks, &task)?;
            (task, checkpoint)
        };
        write_txn.commit()?;
        Ok(result)
    }

    /// Count tasks by status label.
    pub fn status_counts(&self) -> Result<BTreeMap<String, usize>> {
        let mut counts: BTreeMap<String, usize> = TaskStatus::ALL
            .iter()
            .map(|s| (s.label().to_string(), 0))
            .collect();
        for task in self.list(None)? {
            *counts.entry(task.status.label().to_string()).or_insert(0) += 1;
        }
        Ok(counts)
    }
}

fn decode(raw: &str) -> Result<Task> {
    serde_json::from_str(raw).context("failed to decode task record")
}

fn load(tasks: &Table<'_, i64, &'static str>, id: TaskId) -> Result<Task> {
    match tasks.get(id.0)? {
        Some(guard) => decode(guard.value()),
        None => Err(TetherError::not_found(id.to_string()).into()),
    }
}

fn put(tasks: &mut Table<'_, i64, &'static str>, task: &Task) -> Result<()> {
    let json = serde_json::to_string(task)?;
    tasks.insert(task.id.0, json.as_str())?;
    Ok(())
}

fn slot_holder(tasks: &Table<'_, i64, &'static str>) -> Result<Option<TaskId>> {
    for entry in tasks.iter()? {
        let (_, value) = entry?;
        let task = decode(value.value())?;
        if task.status == TaskStatus::InProgress {
            return Ok(Some(task.id));
        }
    }
    Ok(None)
}

fn ensure_mutable(task: &Task) -> Result<()> {
    if task.status.is_terminal() {
        return Err(TetherError::TerminalTask {
            task_id: task.id,
            status: task.status,
        }
        .into());
    }
    Ok(())
}

fn ensure_lease(task: &Task, guard: &LeaseGuard) -> Result<()> {
    if task.status != TaskStatus::InProgress || !guard.matches(task.lease.as_ref()) {
        return Err(TetherError::ClaimConflict {
            task_id: task.id,
            reason: format!("lease {}#{} is no longer held", guard.owner, guard.run),
        }
        .into());
    }
    Ok(())
}
