//! `tether.toml` configuration.

use crate::permission::PermissionConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub permissions: PermissionConfig,
}

/// The `[scheduler]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Sleep between cycles when nothing is claimable.
    pub poll_interval_secs: u64,
    /// Lease lifetime without a heartbeat. `0` disables reclaim.
    pub lease_ttl_secs: u64,
    /// Reasoner steps allowed per task before it fails.
    pub max_turns: u32,
    /// Consecutive store failures before the loop gives up.
    pub max_store_failures: u32,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            lease_ttl_secs: 900,
            max_turns: 64,
            max_store_failures: 8,
            backoff_initial_ms: 500,
            backoff_max_ms: 30_000,
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn lease_ttl(&self) -> Option<Duration> {
        (self.lease_ttl_secs > 0).then(|| Duration::from_secs(self.lease_ttl_secs))
    }

    /// Heartbeat period: a third of the lease lifetime, at least one second.
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.lease_ttl()
            .map(|ttl| (ttl / 3).max(Duration::from_secs(1)))
    }

    /// Backoff before retry number `attempt` (1-based), doubling up to the cap.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(20);
        let ms = self
            .backoff_initial_ms
            .saturating_mul(factor)
            .min(self.backoff_max_ms);
        Duration::from_millis(ms)
    }
}

impl Config {
    /// Load from a TOML file. Returns defaults if the file doesn't exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "config not found, using defaults");
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("failed to parse config: {}", path.display()))?;
        tracing::info!(
            path = %path.display(),
            allow = config.permissions.allow.len(),
            deny = config.permissions.deny.len(),
            default_secure = config.permissions.default_secure,
            "loaded config"
        );
        Ok(config)
    }

    /// Load for startup. A file that cannot be read or parsed yields
    /// defaults together with the error text, so callers can fail closed
    /// instead of refusing to start.
    pub fn load_or_default(path: &Path) -> (Self, Option<String>) {
        match Self::load(path) {
            Ok(config) => (config, None),
            Err(e) => {
                let reason = format!("{e:#}");
                tracing::error!(path = %path.display(), error = %reason, "config unusable, starting from defaults");
                (Self::default(), Some(reason))
            }
        }
    }
}
