pub mod checkpoint_store;
pub mod rule_store;
pub mod task_store;

use anyhow::Result;
use redb::Database;
use std::path::Path;

/// Open (or create) the scheduler database at the given path.
pub fn open_db(path: &Path) -> Result<Database> {
    let db = Database::create(path)?;
    // Ensure all tables exist by doing a write transaction
    let write_txn = db.begin_write()?;
    {
        let _tasks = write_txn.open_table(task_store::TASKS_TABLE)?;
        let _counter = write_txn.open_table(task_store::COUNTER_TABLE)?;
        let _checkpoints = write_txn.open_table(checkpoint_store::CHECKPOINT_TABLE)?;
        let _rules = write_txn.open_table(rule_store::RULES_TABLE)?;
    }
    write_txn.commit()?;
    Ok(db)
}
