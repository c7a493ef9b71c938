//! Permission service: the in-memory engine plus its durable learned rules.
//!
//! Learned rules are written to the rule store before they are swapped into
//! the live snapshot, so a rule the engine acts on is never lost on restart.
//! Reloads re-read `tether.toml`; anything unreadable fails closed.

use crate::event_bus::EventBus;
use anyhow::Result;
use redb::Database;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tether_core::TetherError;
use tether_core::checkpoint::Arguments;
use tether_core::config::Config;
use tether_core::event::EventKind;
use tether_core::permission::{Decision, PermissionConfig, PermissionEngine, PolicySnapshot, Rule, Verdict};
use tether_db::rule_store::RuleStore;

pub struct PermissionService {
    engine: PermissionEngine,
    db: Arc<Database>,
    config_path: PathBuf,
    events: EventBus,
}

impl PermissionService {
    /// Build from the `[permissions]` section and the learned rules on disk.
    pub fn load(
        db: Arc<Database>,
        config: &PermissionConfig,
        config_path: impl Into<PathBuf>,
        events: EventBus,
    ) -> Result<Self> {
        let learned = RuleStore::new(&db).list()?;
        tracing::info!(
            allow = config.allow.len(),
            deny = config.deny.len(),
            learned = learned.len(),
            default_secure = config.default_secure,
            "permission engine loaded"
        );
        Ok(Self {
            engine: PermissionEngine::new(config, learned),
            db,
            config_path: config_path.into(),
            events,
        })
    }

    /// Read `tether.toml` and build the service from it.
    ///
    /// An unusable file does not stop startup: defaults are returned and the
    /// engine fails closed until a reload succeeds.
    pub fn start(
        db: Arc<Database>,
        config_path: impl Into<PathBuf>,
        events: EventBus,
    ) -> Result<(Self, Config)> {
        let config_path = config_path.into();
        let (config, config_error) = Config::load_or_default(&config_path);
        let service = Self::load(db, &config.permissions, config_path, events)?;
        if let Some(reason) = config_error {
            let version = service.engine.fail_closed(&reason);
            service.events.emit(EventKind::PermissionsReloaded { version, ok: false });
        }
        Ok((service, config))
    }

    pub fn decide(&self, capability: &str, arguments: &Arguments) -> Decision {
        self.engine.decide(capability, arguments)
    }

    pub fn explain(&self, capability: &str, arguments: &Arguments) -> Verdict {
        self.engine.explain(capability, arguments)
    }

    pub fn snapshot(&self) -> Arc<PolicySnapshot> {
        self.engine.snapshot()
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Turn an `always_allow` decision into a durable exact-match rule.
    /// Returns `false` when the same rule was already known.
    pub fn learn_allow(&self, capability: &str, arguments: &Arguments) -> Result<bool> {
        let rule = Rule::learned_allow(capability, arguments);
        let stored = RuleStore::new(&self.db).add(&rule)?;
        let pattern = rule.pattern.to_string();
        let swapped = self.engine.learn(rule);
        if stored || swapped {
            self.events.emit(EventKind::RuleLearned { pattern });
        }
        Ok(stored || swapped)
    }

    /// Re-read the config file and swap in its rules.
    ///
    /// A file that cannot be read or parsed, or rules that do not compile,
    /// leave the engine failing closed and return `PermissionConfig`.
    pub fn reload(&self) -> Result<u64> {
        match Config::load(&self.config_path) {
            Ok(config) => self.reload_with(&config.permissions),
            Err(e) => {
                let reason = format!("{e:#}");
                let version = self.engine.fail_closed(&reason);
                self.events.emit(EventKind::PermissionsReloaded { version, ok: false });
                Err(TetherError::PermissionConfig(reason).into())
            }
        }
    }

    /// Swap in the given static rules, keeping learned ones.
    pub fn reload_with(&self, config: &PermissionConfig) -> Result<u64> {
        match self.engine.reload(config) {
            Ok(version) => {
                self.events.emit(EventKind::PermissionsReloaded { version, ok: true });
                Ok(version)
            }
            Err(e) => {
                let version = self.engine.version();
                self.events.emit(EventKind::PermissionsReloaded { version, ok: false });
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn setup(config: &PermissionConfig) -> (tempfile::TempDir, PermissionService) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(tether_db::open_db(&dir.path().join("test.redb")).unwrap());
        let service =
            PermissionService::load(db, config, dir.path().join("tether.toml"), EventBus::new())
                .unwrap();
        (dir, service)
    }

    fn args(value: serde_json::Value) -> Arguments {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn learned_rule_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.redb");
        let call = args(json!({"table": "orders", "id": 7}));
        {
            let db = Arc::new(tether_db::open_db(&path).unwrap());
            let service =
                PermissionService::load(db, &PermissionConfig::default(), "tether.toml", EventBus::new())
                    .unwrap();
            assert_eq!(service.decide("delete_record", &call), Decision::RequireApproval);
            assert!(service.learn_allow("delete_record", &call).unwrap());
            assert!(!service.learn_allow("delete_record", &call).unwrap());
            assert_eq!(service.decide("delete_record", &call), Decision::Allow);
        }

        let db = Arc::new(tether_db::open_db(&path).unwrap());
        let service =
            PermissionService::load(db, &PermissionConfig::default(), "tether.toml", EventBus::new())
                .unwrap();
        assert_eq!(service.decide("delete_record", &call), Decision::Allow);
        let other = args(json!({"table": "orders", "id": 8}));
        assert_eq!(service.decide("delete_record", &other), Decision::RequireApproval);
    }

    #[tokio::test]
    async fn learn_emits_event() {
        let (_dir, service) = setup(&PermissionConfig::default());
        let mut rx = service.events.subscribe();
        service.learn_allow("note", &args(json!({"text": "hi"}))).unwrap();
        let event = rx.recv().await.unwrap();
        assert!(matches!(event.kind, EventKind::RuleLearned { pattern } if pattern == "note(text=hi)"));
    }

    #[test]
    fn reload_reads_config_file() {
        let (dir, service) = setup(&PermissionConfig::default());
        std::fs::write(
            dir.path().join("tether.toml"),
            "[permissions]\ndefault_secure = true\nallow = [\"read_*\"]\n",
        )
        .unwrap();

        assert_eq!(service.decide("read_file", &Arguments::new()), Decision::RequireApproval);
        service.reload().unwrap();
        assert_eq!(service.decide("read_file", &Arguments::new()), Decision::Allow);
    }

    #[test]
    fn unparsable_config_fails_closed() {
        let config = PermissionConfig {
            default_secure: false,
            ..Default::default()
        };
        let (dir, service) = setup(&config);
        assert_eq!(service.decide("note", &Arguments::new()), Decision::Allow);

        std::fs::write(dir.path().join("tether.toml"), "[permissions\nallow = 3").unwrap();
        let err = service.reload().unwrap_err();
        assert!(matches!(
            TetherError::find(&err),
            Some(TetherError::PermissionConfig(_))
        ));
        assert_eq!(service.decide("note", &Arguments::new()), Decision::RequireApproval);
        assert!(service.snapshot().config_error.is_some());
    }

    #[test]
    fn malformed_config_at_startup_fails_closed() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(tether_db::open_db(&dir.path().join("test.redb")).unwrap());
        let path = dir.path().join("tether.toml");
        std::fs::write(&path, "[permissions]\ndefault_secure = false\nallow = 3\n").unwrap();

        let (service, config) = PermissionService::start(db, &path, EventBus::new()).unwrap();
        assert_eq!(config.scheduler, tether_core::config::SchedulerConfig::default());
        assert!(service.snapshot().config_error.is_some());
        assert_eq!(service.decide("note", &Arguments::new()), Decision::RequireApproval);

        std::fs::write(&path, "[permissions]\ndefault_secure = false\n").unwrap();
        service.reload().unwrap();
        assert!(service.snapshot().config_error.is_none());
        assert_eq!(service.decide("note", &Arguments::new()), Decision::Allow);
    }

    #[test]
    fn awkward_learned_arguments_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.redb");
        let call = args(json!({"a,b": 1, "x*": "y", "": true, " k": "v"}));
        {
            let db = Arc::new(tether_db::open_db(&path).unwrap());
            let service =
                PermissionService::load(db, &PermissionConfig::default(), "tether.toml", EventBus::new())
                    .unwrap();
            assert!(service.learn_allow("sync", &call).unwrap());
        }

        let db = Arc::new(tether_db::open_db(&path).unwrap());
        let service =
            PermissionService::load(db, &PermissionConfig::default(), "tether.toml", EventBus::new())
                .unwrap();
        assert_eq!(service.decide("sync", &call), Decision::Allow);
        let mut changed = call.clone();
        changed.insert("x*".into(), json!("z"));
        assert_eq!(service.decide("sync", &changed), Decision::RequireApproval);
    }

    #[test]
    fn learned_string_does_not_allow_number() {
        let (_dir, service) = setup(&PermissionConfig::default());
        service.learn_allow("delete_record", &args(json!({"id": "3"}))).unwrap();
        assert_eq!(
            service.decide("delete_record", &args(json!({"id": "3"}))),
            Decision::Allow
        );
        assert_eq!(
            service.decide("delete_record", &args(json!({"id": 3}))),
            Decision::RequireApproval
        );
    }

    #[test]
    fn bad_pattern_fails_closed_until_fixed() {
        let config = PermissionConfig {
            default_secure: false,
            ..Default::default()
        };
        let (_dir, service) = setup(&config);

        let broken = PermissionConfig {
            default_secure: false,
            allow: vec!["note(text=".into()],
            deny: Vec::new(),
        };
        assert!(service.reload_with(&broken).is_err());
        assert_eq!(service.decide("note", &Arguments::new()), Decision::RequireApproval);

        service.reload_with(&config).unwrap();
        assert_eq!(service.decide("note", &Arguments::new()), Decision::Allow);
    }
}
