//! Scheduler event types for real-time observability.
//!
//! Events are emitted by the runner as tasks move through their lifecycle.
//! Consumers (SSE endpoint, CLI follow mode, logs) subscribe and render them.
//!
//! These are pure data types with no async runtime dependency; the
//! broadcast bus lives in `tether-runner`.

use crate::interrupt::InterruptKind;
use crate::task::{TaskId, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A timestamped scheduler event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

impl PipelineEvent {
    pub fn new(kind: EventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
        }
    }

    /// Task this event concerns, if any.
    pub fn task_id(&self) -> Option<TaskId> {
        match &self.kind {
            EventKind::TaskClaimed { task_id, .. }
            | EventKind::TaskStateChange { task_id, .. }
            | EventKind::CheckpointSaved { task_id, .. }
            | EventKind::InterruptRaised { task_id, .. }
            | EventKind::ResumeRecorded { task_id, .. }
            | EventKind::LeaseReclaimed { task_id, .. } => Some(*task_id),
            EventKind::RuleLearned { .. }
            | EventKind::PermissionsReloaded { .. }
            | EventKind::EngineLog { .. } => None,
        }
    }
}

/// The specific kind of scheduler event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventKind {
    /// A scheduler won the claim on a task.
    TaskClaimed {
        task_id: TaskId,
        owner: String,
        run: u32,
    },

    /// Task status changed.
    TaskStateChange {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    CheckpointSaved { task_id: TaskId, version: u64 },

    /// Execution suspended waiting on a human.
    InterruptRaised {
        task_id: TaskId,
        kind: InterruptKind,
        summary: String,
    },

    /// The resume gateway recorded a response.
    ResumeRecorded { task_id: TaskId, response: String },

    /// An `always_allow` decision was turned into a durable rule.
    RuleLearned { pattern: String },

    PermissionsReloaded { version: u64, ok: bool },

    /// An expired lease was released and the task put back in the queue.
    LeaseReclaimed {
        task_id: TaskId,
        owner: String,
        restored_to: TaskStatus,
    },

    /// Engine-level log message (info, warn, error).
    EngineLog { level: LogLevel, message: String },
}

/// Severity level for engine log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for PipelineEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ts = self.timestamp.format("%H:%M:%S%.3f");
        match &self.kind {
            EventKind::TaskClaimed {
                task_id,
                owner,
                run,
            } => write!(f, "[{ts}] {task_id}: claimed by {owner} (run {run})"),

            EventKind::TaskStateChange { task_id, from, to } => {
                write!(f, "[{ts}] {task_id}: {from} -> {to}")
            }

            EventKind::CheckpointSaved { task_id, version } => {
                write!(f, "[{ts}] {task_id}: checkpoint saved (v{version})")
            }

            EventKind::InterruptRaised {
                task_id,
                kind,
                summary,
            } => write!(f, "[{ts}] {task_id}: waiting on {kind}: {summary}"),

            EventKind::ResumeRecorded { task_id, response } => {
                write!(f, "[{ts}] {task_id}: response recorded ({response})")
            }

            EventKind::RuleLearned { pattern } => {
                write!(f, "[{ts}] learned rule: allow {pattern}")
            }

            EventKind::PermissionsReloaded { version, ok } => {
                let status = if *ok { "OK" } else { "FAILED CLOSED" };
                write!(f, "[{ts}] permissions reloaded (v{version}, {status})")
            }

            EventKind::LeaseReclaimed {
                task_id,
                owner,
                restored_to,
            } => write!(
                f,
                "[{ts}] {task_id}: lease held by {owner} expired, back to {restored_to}"
            ),

            EventKind::EngineLog { level, message } => {
                let tag = match level {
                    LogLevel::Info => "INFO",
                    LogLevel::Warn => "WARN",
                    LogLevel::Error => "ERROR",
                };
                write!(f, "[{ts}] [{tag}] {message}")
            }
        }
    }
}
