//! Persistent checkpoint store for suspendable runs.
//!
//! One checkpoint per execution thread, keyed by `thread:{task_id}`. Every
//! write is version-checked: the writer must hold the version currently
//! stored, and the store bumps it. A stale writer gets `ClaimConflict`.

use anyhow::Result;
use chrono::Utc;
use redb::{Database, ReadableTable, Table, TableDefinition};
use serde::Deserialize;
use tether_core::TetherError;
use tether_core::checkpoint::{Checkpoint, ThreadId};
use tether_core::task::TaskId;

/// redb table: thread ID string -> JSON-serialized Checkpoint.
pub const CHECKPOINT_TABLE: TableDefinition<&str, &str> = TableDefinition::new("checkpoints");

pub struct CheckpointStore<'a> {
    db: &'a Database,
}

impl<'a> CheckpointStore<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Write a checkpoint. `checkpoint.version` must match the stored
    /// version (0 when absent); on success it holds the new version.
    pub fn save(&self, checkpoint: &mut Checkpoint) -> Result<u64> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(CHECKPOINT_TABLE)?;
            put_checked(&mut table, checkpoint)?;
        }
        write_txn.commit()?;
        Ok(checkpoint.version)
    }

    /// Load the checkpoint for a task. Unreadable state is reported as
    /// `CheckpointCorruption`, never returned half-parsed.
    pub fn get(&self, task_id: TaskId) -> Result<Option<Checkpoint>> {
        let thread_id = ThreadId::for_task(task_id);
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(CHECKPOINT_TABLE)?;
        match table.get(thread_id.0.as_str())? {
            Some(guard) => Ok(Some(decode(&thread_id.0, guard.value())?)),
            None => Ok(None),
        }
    }

    /// List all checkpoints, skipping (and logging) unreadable ones.
    pub fn list(&self) -> Result<Vec<Checkpoint>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(CHECKPOINT_TABLE)?;
        let mut checkpoints = Vec::new();

        for entry in table.iter()? {
            let (key, value) = entry?;
            match decode(key.value(), value.value()) {
                Ok(checkpoint) => checkpoints.push(checkpoint),
                Err(e) => tracing::warn!(thread_id = key.value(), error = %e, "skipping corrupt checkpoint"),
            }
        }

        Ok(checkpoints)
    }

    /// Overwrite raw stored text. Only for tooling and tests that need to
    /// simulate damaged state.
    #[doc(hidden)]
    pub fn put_raw(&self, task_id: TaskId, raw: &str) -> Result<()> {
        let thread_id = ThreadId::for_task(task_id);
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(CHECKPOINT_TABLE)?;
            table.insert(thread_id.0.as_str(), raw)?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

pub(crate) fn decode(thread_id: &str, raw: &str) -> Result<Checkpoint> {
    let corrupt = |reason: String| TetherError::CheckpointCorruption {
        thread_id: thread_id.to_string(),
        reason,
    };
    let checkpoint: Checkpoint =
        serde_json::from_str(raw).map_err(|e| corrupt(e.to_string()))?;
    checkpoint.validate().map_err(corrupt)?;
    Ok(checkpoint)
}

pub(crate) fn load(
    table: &Table<'_, &'static str, &'static str>,
    task_id: TaskId,
) -> Result<Option<Checkpoint>> {
    let thread_id = ThreadId::for_task(task_id);
    match table.get(thread_id.0.as_str())? {
        Some(guard) => Ok(Some(decode(&thread_id.0, guard.value())?)),
        None => Ok(None),
    }
}

#[derive(Deserialize)]
struct VersionProbe {
    version: u64,
}

/// Version-checked insert inside an open write transaction.
pub(crate) fn put_checked(
    table: &mut Table<'_, &'static str, &'static str>,
    checkpoint: &mut Checkpoint,
) -> Result<()> {
    let key = checkpoint.thread_id.0.clone();
    let stored = match table.get(key.as_str())? {
        Some(guard) => Some(
            serde_json::from_str::<VersionProbe>(guard.value())
                .map_err(|e| TetherError::CheckpointCorruption {
                    thread_id: key.clone(),
                    reason: e.to_string(),
                })?
                .version,
        ),
        None => None,
    };
    let stored_version = stored.unwrap_or(0);
    if stored_version != checkpoint.version {
        return Err(TetherError::ClaimConflict {
            task_id: checkpoint.task_id,
            reason: format!(
                "checkpoint {key} is at v{stored_version}, writer holds v{}",
                checkpoint.version
            ),
        }
        .into());
    }

    checkpoint.version += 1;
    checkpoint.updated_at = Utc::now();
    let json = serde_json::to_string(checkpoint)?;
    table.insert(key.as_str(), json.as_str())?;
    Ok(())
}
