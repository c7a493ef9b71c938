//! Durable learned permission rules.
//!
//! Static rules live in `tether.toml`; rules learned from `always_allow`
//! decisions are persisted here so they survive restarts and config reloads.

use anyhow::Result;
use redb::{Database, ReadableTable, TableDefinition};
use tether_core::pattern::Pattern;
use tether_core::permission::{Rule, RuleOrigin};

/// redb table: pattern key -> JSON-serialized Rule.
pub const RULES_TABLE: TableDefinition<&str, &str> = TableDefinition::new("learned_rules");

pub struct RuleStore<'a> {
    db: &'a Database,
}

impl<'a> RuleStore<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Persist a learned rule. Returns `false` if the pattern was already stored.
    pub fn add(&self, rule: &Rule) -> Result<bool> {
        anyhow::ensure!(
            rule.origin == RuleOrigin::Learned,
            "only learned rules are persisted, got {:?} rule {}",
            rule.origin,
            rule.pattern
        );
        let json = serde_json::to_string(rule)?;
        let key = rule.pattern.key();
        let write_txn = self.db.begin_write()?;
        let added = {
            let mut table = write_txn.open_table(RULES_TABLE)?;
            let exists = table.get(key.as_str())?.is_some();
            if !exists {
                table.insert(key.as_str(), json.as_str())?;
            }
            !exists
        };
        write_txn.commit()?;
        Ok(added)
    }

    /// All learned rules, in key order.
    ///
    /// A row that no longer decodes is logged and skipped. Losing one
    /// remembered approval only means asking again.
    pub fn list(&self) -> Result<Vec<Rule>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(RULES_TABLE)?;
        let mut rules = Vec::new();
        for entry in table.iter()? {
            let (key, value) = entry?;
            match serde_json::from_str(value.value()) {
                Ok(rule) => rules.push(rule),
                Err(e) => tracing::warn!(key = key.value(), error = %e, "skipping unreadable learned rule"),
            }
        }
        Ok(rules)
    }

    /// Forget a learned rule. Returns true if it existed.
    pub fn remove(&self, pattern: &Pattern) -> Result<bool> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(RULES_TABLE)?;
            table.remove(pattern.key().as_str())?.is_some()
        };
        write_txn.commit()?;
        Ok(removed)
    }
}
