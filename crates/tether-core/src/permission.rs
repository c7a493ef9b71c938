//! Capability approval policy.
//!
//! The engine holds an immutable [`PolicySnapshot`] behind an `ArcSwap`.
//! Readers load the current snapshot without locking; configuration reloads
//! and learned rules publish a new snapshot in one atomic swap, so a
//! decision never sees a half-applied rule set.

use crate::TetherError;
use crate::checkpoint::Arguments;
use crate::pattern::Pattern;
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Allow,
    Deny,
    RequireApproval,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Decision::Allow => "ALLOW",
            Decision::Deny => "DENY",
            Decision::RequireApproval => "REQUIRE_APPROVAL",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleOrigin {
    /// From the `[permissions]` configuration.
    Static,
    /// From an `always_allow` decision.
    Learned,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub pattern: Pattern,
    pub effect: Effect,
    pub origin: RuleOrigin,
}

impl Rule {
    pub fn learned_allow(capability: &str, arguments: &Arguments) -> Self {
        Self {
            pattern: Pattern::exact(capability, arguments),
            effect: Effect::Allow,
            origin: RuleOrigin::Learned,
        }
    }
}

/// The `[permissions]` section of `tether.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionConfig {
    #[serde(default = "default_secure")]
    pub default_secure: bool,
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

fn default_secure() -> bool {
    true
}

impl Default for PermissionConfig {
    fn default() -> Self {
        Self {
            default_secure: true,
            allow: Vec::new(),
            deny: Vec::new(),
        }
    }
}

/// Outcome of a decision plus the rule that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub decision: Decision,
    pub rule: Option<Rule>,
}

/// One immutable, versioned rule set.
#[derive(Debug, Clone, Serialize)]
pub struct PolicySnapshot {
    pub version: u64,
    pub default_secure: bool,
    pub allow: Vec<Rule>,
    pub deny: Vec<Rule>,
    /// Set when the configuration failed to compile. Every decision is
    /// `RequireApproval` until a reload succeeds.
    pub config_error: Option<String>,
}

impl PolicySnapshot {
    /// Compile configuration text patterns, appending learned allow rules.
    pub fn compile(config: &PermissionConfig, learned: &[Rule], version: u64) -> Result<Self, TetherError> {
        let compile_list = |patterns: &[String], effect: Effect| -> Result<Vec<Rule>, TetherError> {
            patterns
                .iter()
                .map(|raw| {
                    raw.parse::<Pattern>()
                        .map(|pattern| Rule {
                            pattern,
                            effect,
                            origin: RuleOrigin::Static,
                        })
                        .map_err(|e| TetherError::PermissionConfig(e.to_string()))
                })
                .collect()
        };
        let deny = compile_list(&config.deny, Effect::Deny)?;
        let mut allow = compile_list(&config.allow, Effect::Allow)?;
        allow.extend(learned.iter().cloned());
        Ok(Self {
            version,
            default_secure: config.default_secure,
            allow,
            deny,
            config_error: None,
        })
    }

    /// Snapshot that requires approval for everything. Learned rules are kept
    /// so a later successful reload restores them.
    pub fn fail_closed(error: impl Into<String>, learned: &[Rule], version: u64) -> Self {
        Self {
            version,
            default_secure: true,
            allow: learned.to_vec(),
            deny: Vec::new(),
            config_error: Some(error.into()),
        }
    }

    pub fn decide(&self, capability: &str, arguments: &Arguments) -> Decision {
        self.explain(capability, arguments).decision
    }

    /// Deny beats allow; allow beats the default.
    pub fn explain(&self, capability: &str, arguments: &Arguments) -> Verdict {
        if self.config_error.is_some() {
            return Verdict {
                decision: Decision::RequireApproval,
                rule: None,
            };
        }
        let hit = |rules: &[Rule]| {
            rules
                .iter()
                .find(|r| r.pattern.matches(capability, arguments))
                .cloned()
        };
        if let Some(rule) = hit(&self.deny) {
            return Verdict {
                decision: Decision::Deny,
                rule: Some(rule),
            };
        }
        if let Some(rule) = hit(&self.allow) {
            return Verdict {
                decision: Decision::Allow,
                rule: Some(rule),
            };
        }
        let decision = if self.default_secure {
            Decision::RequireApproval
        } else {
            Decision::Allow
        };
        Verdict {
            decision,
            rule: None,
        }
    }

    pub fn learned(&self) -> impl Iterator<Item = &Rule> {
        self.allow
            .iter()
            .filter(|r| r.origin == RuleOrigin::Learned)
    }
}

/// Hot-swappable decision gate.
pub struct PermissionEngine {
    current: ArcSwap<PolicySnapshot>,
}

impl PermissionEngine {
    /// Build from configuration and previously learned rules. A malformed
    /// configuration yields a fail-closed engine rather than an error.
    pub fn new(config: &PermissionConfig, learned: Vec<Rule>) -> Self {
        let snapshot = PolicySnapshot::compile(config, &learned, 1).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "permission config invalid, failing closed");
            PolicySnapshot::fail_closed(e.to_string(), &learned, 1)
        });
        Self {
            current: ArcSwap::from_pointee(snapshot),
        }
    }

    pub fn decide(&self, capability: &str, arguments: &Arguments) -> Decision {
        self.current.load().decide(capability, arguments)
    }

    pub fn explain(&self, capability: &str, arguments: &Arguments) -> Verdict {
        self.current.load().explain(capability, arguments)
    }

    pub fn snapshot(&self) -> Arc<PolicySnapshot> {
        self.current.load_full()
    }

    pub fn version(&self) -> u64 {
        self.current.load().version
    }

    /// Replace the static rules. Learned rules carry over. On error the
    /// engine fails closed and the error is returned.
    pub fn reload(&self, config: &PermissionConfig) -> Result<u64, TetherError> {
        let mut outcome = Ok(0);
        self.current.rcu(|current| {
            let learned: Vec<Rule> = current.learned().cloned().collect();
            let version = current.version + 1;
            match PolicySnapshot::compile(config, &learned, version) {
                Ok(next) => {
                    outcome = Ok(version);
                    next
                }
                Err(e) => {
                    let next = PolicySnapshot::fail_closed(e.to_string(), &learned, version);
                    outcome = Err(e);
                    next
                }
            }
        });
        match &outcome {
            Ok(version) => tracing::info!(version, "permission rules reloaded"),
            Err(e) => tracing::warn!(error = %e, "permission reload failed, failing closed"),
        }
        outcome
    }

    /// Require approval for everything until the next successful reload.
    /// Used when the configuration source itself cannot be read.
    pub fn fail_closed(&self, reason: &str) -> u64 {
        let previous = self.current.rcu(|current| {
            let learned: Vec<Rule> = current.learned().cloned().collect();
            PolicySnapshot::fail_closed(reason, &learned, current.version + 1)
        });
        tracing::warn!(reason, "permission engine failing closed");
        previous.version + 1
    }

    /// Add a learned rule. Returns `false` when an identical rule exists.
    pub fn learn(&self, rule: Rule) -> bool {
        let mut added = false;
        self.current.rcu(|current| {
            let mut next = PolicySnapshot::clone(current);
            added = !next
                .allow
                .iter()
                .any(|r| r.pattern == rule.pattern);
            if added {
                next.allow.push(rule.clone());
                next.version += 1;
            }
            next
        });
        if added {
            tracing::info!(pattern = %rule.pattern, "learned allow rule");
        }
        added
    }
}
