//! Domain error taxonomy.
//!
//! Stores and the runner return `anyhow::Result`; the rejections whose kind
//! matters to a caller (claim retry, corruption handling, HTTP status
//! mapping) are raised as [`TetherError`] inside the `anyhow::Error` and
//! recovered with [`TetherError::find`].

use crate::task::{TaskId, TaskStatus};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TetherError {
    /// Another scheduler won the compare-and-set for this task.
    #[error("claim conflict on {task_id}: {reason}")]
    ClaimConflict { task_id: TaskId, reason: String },

    /// The single in-progress slot is held by another task.
    #[error("scheduler slot busy: {holder} is in progress")]
    SlotBusy { holder: TaskId },

    #[error("{what} not found")]
    NotFound { what: String },

    /// DONE and FAILED tasks accept no further writes.
    #[error("{task_id} is terminal ({status}) and cannot be modified")]
    TerminalTask { task_id: TaskId, status: TaskStatus },

    #[error("invalid transition for {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    /// A response was submitted without a matching pending interrupt.
    #[error("invalid resume for {task_id}: {reason}")]
    InvalidResume { task_id: TaskId, reason: String },

    /// Checkpoint state could not be read back into a resumable transcript.
    #[error("checkpoint {thread_id} is corrupt: {reason}")]
    CheckpointCorruption { thread_id: String, reason: String },

    #[error("permission configuration error: {0}")]
    PermissionConfig(String),

    #[error("execution failed: {0}")]
    ExecutionFailure(String),
}

impl TetherError {
    /// Find a `TetherError` anywhere in an `anyhow` error chain.
    pub fn find(err: &anyhow::Error) -> Option<&TetherError> {
        err.chain().find_map(|cause| cause.downcast_ref::<TetherError>())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Short machine-readable kind, used in API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            TetherError::ClaimConflict { .. } => "claim_conflict",
            TetherError::SlotBusy { .. } => "slot_busy",
            TetherError::NotFound { .. } => "not_found",
            TetherError::TerminalTask { .. } => "terminal_task",
            TetherError::InvalidTransition { .. } => "invalid_transition",
            TetherError::InvalidResume { .. } => "invalid_resume",
            TetherError::CheckpointCorruption { .. } => "checkpoint_corruption",
            TetherError::PermissionConfig(_) => "permission_config",
            TetherError::ExecutionFailure(_) => "execution_failure",
        }
    }
}
