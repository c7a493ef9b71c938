//! The scheduler loop.
//!
//! Each cycle reclaims expired leases, claims at most one task, runs it
//! through the execution engine while a heartbeat keeps its lease fresh, and
//! applies the outcome with a lease-conditioned write. Failures inside a task
//! end that task; only store failures count against the loop, which backs
//! off exponentially and gives up after `max_store_failures` in a row.

use crate::broker::InterruptBroker;
use crate::capability::CallContext;
use crate::engine::{Execution, ExecutionEngine, Outcome};
use crate::event_bus::EventBus;
use anyhow::{Context, Result};
use redb::Database;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tether_core::TetherError;
use tether_core::checkpoint::Checkpoint;
use tether_core::config::SchedulerConfig;
use tether_core::event::{EventKind, LogLevel};
use tether_core::task::{AUTHOR_AGENT, AUTHOR_SCHEDULER, Comment, LeaseGuard, Task, TaskId, TaskStatus};
use tether_db::checkpoint_store::CheckpointStore;
use tether_db::task_store::TaskStore;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

static SCHEDULER_SEQ: AtomicU64 = AtomicU64::new(1);

/// What one cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleReport {
    /// Nothing was claimable, or another scheduler holds the slot.
    Idle,
    Completed(TaskId),
    Suspended(TaskId),
    Failed { task_id: TaskId, error: String },
    /// The lease expired or moved on while running; the outcome was dropped.
    LeaseLost(TaskId),
}

impl std::fmt::Display for CycleReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CycleReport::Idle => write!(f, "idle"),
            CycleReport::Completed(id) => write!(f, "{id}: done"),
            CycleReport::Suspended(id) => write!(f, "{id}: waiting on human input"),
            CycleReport::Failed { task_id, error } => write!(f, "{task_id}: failed: {error}"),
            CycleReport::LeaseLost(id) => write!(f, "{id}: lease lost, outcome discarded"),
        }
    }
}

pub struct Scheduler {
    db: Arc<Database>,
    engine: Arc<ExecutionEngine>,
    broker: InterruptBroker,
    events: EventBus,
    config: SchedulerConfig,
    owner: String,
}

impl Scheduler {
    pub fn new(
        db: Arc<Database>,
        engine: Arc<ExecutionEngine>,
        events: EventBus,
        config: SchedulerConfig,
    ) -> Self {
        let owner = format!(
            "scheduler-{}-{}",
            std::process::id(),
            SCHEDULER_SEQ.fetch_add(1, Ordering::Relaxed)
        );
        Self {
            broker: InterruptBroker::new(Arc::clone(&db), events.clone()),
            db,
            engine,
            events,
            config,
            owner,
        }
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Run cycles until `shutdown` is cancelled.
    ///
    /// A cycle in flight always finishes before the loop exits. Returns an
    /// error only when the store keeps failing past `max_store_failures`.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        tracing::info!(
            owner = %self.owner,
            poll_interval_secs = self.config.poll_interval_secs,
            lease_ttl_secs = self.config.lease_ttl_secs,
            "scheduler started"
        );
        let mut failures = 0u32;

        while !shutdown.is_cancelled() {
            let delay = match self.run_once().await {
                Ok(CycleReport::Idle) => {
                    failures = 0;
                    self.config.poll_interval()
                }
                Ok(report) => {
                    failures = 0;
                    tracing::debug!(%report, "cycle finished");
                    continue;
                }
                Err(e) => {
                    failures += 1;
                    let message = format!("store failure {failures}/{}: {e:#}", self.config.max_store_failures);
                    tracing::error!(owner = %self.owner, failures, error = %format!("{e:#}"), "scheduler cycle failed");
                    self.events.log(LogLevel::Error, message);
                    if failures >= self.config.max_store_failures {
                        return Err(e.context(format!(
                            "scheduler giving up after {failures} consecutive store failures"
                        )));
                    }
                    self.config.backoff(failures)
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        tracing::info!(owner = %self.owner, "scheduler stopped");
        Ok(())
    }

    /// One cycle: reclaim, claim, execute, apply.
    pub async fn run_once(&self) -> Result<CycleReport> {
        self.reclaim_expired()?;

        let Some(task) = TaskStore::new(&self.db).claim_next(&self.owner)? else {
            return Ok(CycleReport::Idle);
        };
        let guard = task
            .lease_guard()
            .with_context(|| format!("claimed {} without a lease", task.id))?;
        let claimed_from = task
            .lease
            .as_ref()
            .map(|l| l.claimed_from)
            .unwrap_or(TaskStatus::New);

        tracing::info!(task_id = %task.id, owner = %self.owner, run = guard.run, "claimed task");
        self.events.emit(EventKind::TaskClaimed {
            task_id: task.id,
            owner: self.owner.clone(),
            run: guard.run,
        });
        self.events.emit(EventKind::TaskStateChange {
            task_id: task.id,
            from: claimed_from,
            to: TaskStatus::InProgress,
        });

        let heartbeat = self.spawn_heartbeat(guard.clone());
        let report = self.execute(&task, &guard).await;
        if let Some((stop, handle)) = heartbeat {
            stop.cancel();
            let _ = handle.await;
        }
        report
    }

    fn reclaim_expired(&self) -> Result<()> {
        let Some(ttl) = self.config.lease_ttl() else {
            return Ok(());
        };
        let ttl = chrono::Duration::from_std(ttl).context("lease ttl out of range")?;
        for reclaimed in TaskStore::new(&self.db).reclaim_expired(ttl)? {
            tracing::warn!(
                task_id = %reclaimed.task.id,
                previous_owner = %reclaimed.previous_owner,
                restored_to = %reclaimed.task.status,
                "reclaimed expired lease"
            );
            self.events.emit(EventKind::LeaseReclaimed {
                task_id: reclaimed.task.id,
                owner: reclaimed.previous_owner,
                restored_to: reclaimed.task.status,
            });
        }
        Ok(())
    }

    fn spawn_heartbeat(&self, guard: LeaseGuard) -> Option<(CancellationToken, JoinHandle<()>)> {
        let period = self.config.heartbeat_interval()?;
        let stop = CancellationToken::new();
        let child = stop.child_token();
        let db = Arc::clone(&self.db);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = TaskStore::new(&db).renew_lease(&guard) {
                            tracing::warn!(task_id = %guard.task_id, error = %e, "lease renewal failed");
                            if matches!(TetherError::find(&e), Some(TetherError::ClaimConflict { .. })) {
                                break;
                            }
                        }
                    }
                }
            }
        });
        Some((stop, handle))
    }

    async fn execute(&self, task: &Task, guard: &LeaseGuard) -> Result<CycleReport> {
        let stored = match CheckpointStore::new(&self.db).get(task.id) {
            Ok(stored) => stored,
            Err(e) if matches!(TetherError::find(&e), Some(TetherError::CheckpointCorruption { .. })) => {
                let error = format!("{e:#}");
                tracing::error!(task_id = %task.id, %error, "refusing to resume from corrupt checkpoint");
                return self.fail(task.id, guard, error, None);
            }
            Err(e) => return Err(e),
        };

        let checkpoint = match stored {
            None => Checkpoint::new(task.id),
            Some(cp) if cp.awaiting_response() => {
                // Claimed while still waiting on a human: put it back.
                let interrupt = cp
                    .pending_interrupt
                    .as_ref()
                    .map(|p| p.interrupt.clone())
                    .context("pending interrupt vanished")?;
                tracing::warn!(task_id = %task.id, "claimed task is still waiting for a response");
                let parked = self.broker.park(guard, &interrupt, None);
                return self.settle(task.id, parked, CycleReport::Suspended(task.id));
            }
            Some(mut cp) if cp.summary.is_some() => {
                let summary = cp.summary.clone().unwrap_or_default();
                return self.complete(task.id, guard, summary, &mut cp);
            }
            Some(cp) => cp,
        };

        let ctx = CallContext {
            task_id: task.id,
            db: Arc::clone(&self.db),
        };
        // A panic in the run fails this task only.
        let engine = Arc::clone(&self.engine);
        let owned = task.clone();
        let run = tokio::spawn(async move { engine.run(&ctx, &owned, checkpoint).await });
        let Execution {
            outcome,
            mut checkpoint,
        } = match run.await {
            Ok(execution) => execution,
            Err(e) => {
                let error = if e.is_panic() {
                    format!("run panicked: {}", panic_message(e.into_panic()))
                } else {
                    format!("run aborted: {e}")
                };
                tracing::error!(task_id = %task.id, %error, "run did not finish");
                return self.fail(task.id, guard, error, None);
            }
        };

        match outcome {
            Outcome::Completed { summary } => self.complete(task.id, guard, summary, &mut checkpoint),
            Outcome::Failed { error } => self.fail(task.id, guard, error, Some(&mut checkpoint)),
            Outcome::Suspended { interrupt } => {
                let parked = self.broker.park(guard, &interrupt, Some(&mut checkpoint));
                self.settle(task.id, parked, CycleReport::Suspended(task.id))
            }
        }
    }

    fn complete(
        &self,
        task_id: TaskId,
        guard: &LeaseGuard,
        summary: String,
        checkpoint: &mut Checkpoint,
    ) -> Result<CycleReport> {
        let finished = TaskStore::new(&self.db).finish(
            guard,
            TaskStatus::Done,
            Some(Comment::new(AUTHOR_AGENT, summary)),
            Some(&mut *checkpoint),
        );
        if finished.is_ok() {
            tracing::info!(%task_id, "task done");
            self.emit_finished(task_id, TaskStatus::Done, Some(checkpoint.version));
        }
        self.settle(task_id, finished, CycleReport::Completed(task_id))
    }

    fn fail(
        &self,
        task_id: TaskId,
        guard: &LeaseGuard,
        error: String,
        checkpoint: Option<&mut Checkpoint>,
    ) -> Result<CycleReport> {
        let comment = Comment::new(AUTHOR_SCHEDULER, format!("Execution failed: {error}"));
        let (finished, version) = match checkpoint {
            Some(cp) => {
                let finished = TaskStore::new(&self.db).finish(
                    guard,
                    TaskStatus::Failed,
                    Some(comment),
                    Some(&mut *cp),
                );
                (finished, Some(cp.version))
            }
            None => (
                TaskStore::new(&self.db).transition(guard, TaskStatus::Failed, Some(comment)),
                None,
            ),
        };
        if finished.is_ok() {
            tracing::warn!(%task_id, %error, "task failed");
            self.emit_finished(task_id, TaskStatus::Failed, version);
        }
        self.settle(task_id, finished, CycleReport::Failed { task_id, error })
    }

    fn emit_finished(&self, task_id: TaskId, to: TaskStatus, checkpoint_version: Option<u64>) {
        if let Some(version) = checkpoint_version {
            self.events.emit(EventKind::CheckpointSaved { task_id, version });
        }
        self.events.emit(EventKind::TaskStateChange {
            task_id,
            from: TaskStatus::InProgress,
            to,
        });
    }

    /// Map a lease-conditioned write to a report. Losing the lease drops
    /// the outcome; any other error is a store failure.
    fn settle(&self, task_id: TaskId, written: Result<Task>, report: CycleReport) -> Result<CycleReport> {
        match written {
            Ok(_) => Ok(report),
            Err(e) => match TetherError::find(&e) {
                Some(TetherError::ClaimConflict { .. } | TetherError::TerminalTask { .. }) => {
                    tracing::warn!(%task_id, owner = %self.owner, error = %e, "lease lost, discarding outcome");
                    self.events.log(
                        LogLevel::Warn,
                        format!("{task_id}: lease lost, outcome of {} discarded", self.owner),
                    );
                    Ok(CycleReport::LeaseLost(task_id))
                }
                _ => Err(e),
            },
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(message) => (*message).to_string(),
            Err(_) => "unknown panic payload".to_string(),
        },
    }
}
