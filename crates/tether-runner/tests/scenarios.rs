//! End-to-end runs through scheduler, broker and gateway on a real database.

use anyhow::Result;
use async_trait::async_trait;
use redb::Database;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tether_core::TetherError;
use tether_core::checkpoint::{ApprovalDecision, Arguments, CallOutcome, ResumeValue};
use tether_core::config::SchedulerConfig;
use tether_core::interrupt::InterruptKind;
use tether_core::permission::PermissionConfig;
use tether_core::task::{NewTask, Task, TaskId, TaskStatus, TaskUpdate};
use tether_db::checkpoint_store::CheckpointStore;
use tether_db::rule_store::RuleStore;
use tether_db::task_store::TaskStore;
use tether_runner::reasoner::PLAN_KEY;
use tether_runner::{
    CallContext, Capability, CapabilityOutput, CapabilityRegistry, CycleReport, EventBus,
    ExecutionEngine, PermissionService, PlanReasoner, ResumeGateway, Scheduler,
};

/// Side-effecting capability that counts how often it really ran.
struct DeleteRecord {
    runs: Arc<AtomicUsize>,
}

#[async_trait]
impl Capability for DeleteRecord {
    fn name(&self) -> &str {
        "delete_record"
    }
    fn description(&self) -> &str {
        "delete a row"
    }
    async fn invoke(&self, _: &CallContext, arguments: &Arguments) -> Result<CapabilityOutput> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(CapabilityOutput::Text(format!(
            "deleted {}",
            arguments.get("id").cloned().unwrap_or(Value::Null)
        )))
    }
}

/// Answers synchronously or asks, depending on how it was built.
struct Confirm {
    answer: Option<&'static str>,
}

#[async_trait]
impl Capability for Confirm {
    fn name(&self) -> &str {
        "confirm"
    }
    fn description(&self) -> &str {
        "confirm something"
    }
    async fn invoke(&self, _: &CallContext, _: &Arguments) -> Result<CapabilityOutput> {
        Ok(match self.answer {
            Some(answer) => CapabilityOutput::Text(answer.to_string()),
            None => CapabilityOutput::Ask {
                question: "Confirm?".into(),
            },
        })
    }
}

/// Panics instead of answering.
struct Explode;

#[async_trait]
impl Capability for Explode {
    fn name(&self) -> &str {
        "explode"
    }
    fn description(&self) -> &str {
        "always panics"
    }
    async fn invoke(&self, _: &CallContext, _: &Arguments) -> Result<CapabilityOutput> {
        panic!("capability blew up");
    }
}

struct World {
    _dir: tempfile::TempDir,
    db: Arc<Database>,
    scheduler: Scheduler,
    gateway: ResumeGateway,
    runs: Arc<AtomicUsize>,
}

impl World {
    fn new(permissions: PermissionConfig) -> Self {
        Self::with_registry(permissions, |_| {})
    }

    fn with_registry(permissions: PermissionConfig, extend: impl FnOnce(&mut CapabilityRegistry)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(tether_db::open_db(&dir.path().join("tether.redb")).unwrap());
        let events = EventBus::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let mut registry = CapabilityRegistry::with_builtins();
        registry.register(Box::new(DeleteRecord {
            runs: Arc::clone(&runs),
        }));
        extend(&mut registry);

        let permissions = Arc::new(
            PermissionService::load(
                Arc::clone(&db),
                &permissions,
                dir.path().join("tether.toml"),
                events.clone(),
            )
            .unwrap(),
        );
        let engine = Arc::new(ExecutionEngine::new(
            Arc::new(registry),
            Arc::new(PlanReasoner),
            permissions,
        ));
        let scheduler = Scheduler::new(
            Arc::clone(&db),
            engine,
            events.clone(),
            SchedulerConfig::default(),
        );
        let gateway = ResumeGateway::new(Arc::clone(&db), events);
        Self {
            _dir: dir,
            db,
            scheduler,
            gateway,
            runs,
        }
    }

    fn store(&self) -> TaskStore<'_> {
        TaskStore::new(&self.db)
    }

    fn create(&self, title: &str, plan: Value) -> Task {
        self.store()
            .create(NewTask::new(title).meta(PLAN_KEY, plan))
            .unwrap()
    }

    fn task(&self, id: TaskId) -> Task {
        self.store().require(id).unwrap()
    }
}

fn allow(patterns: &[&str]) -> PermissionConfig {
    PermissionConfig {
        default_secure: true,
        allow: patterns.iter().map(|p| p.to_string()).collect(),
        deny: Vec::new(),
    }
}

fn is_invalid_resume(err: &anyhow::Error) -> bool {
    matches!(TetherError::find(err), Some(TetherError::InvalidResume { .. }))
}

#[tokio::test]
async fn question_answered_then_completed() {
    let world = World::new(allow(&["ask_human"]));
    let task = world.create(
        "clean the staging table",
        json!([{"capability": "ask_human", "arguments": {"question": "Proceed?"}}]),
    );

    assert_eq!(
        world.scheduler.run_once().await.unwrap(),
        CycleReport::Suspended(task.id)
    );
    let waiting = world.task(task.id);
    assert_eq!(waiting.status, TaskStatus::NeedsReview);
    assert!(waiting.last_comment().unwrap().text.contains("Proceed?"));
    assert_eq!(
        world.store().list(Some(TaskStatus::NeedsReview)).unwrap().len(),
        1
    );

    // Nothing runs while it waits.
    assert_eq!(world.scheduler.run_once().await.unwrap(), CycleReport::Idle);

    world
        .gateway
        .respond(task.id, ResumeValue::text("yes"))
        .unwrap();
    assert_eq!(world.task(task.id).status, TaskStatus::UserInputReceived);

    assert_eq!(
        world.scheduler.run_once().await.unwrap(),
        CycleReport::Completed(task.id)
    );
    let done = world.task(task.id);
    assert_eq!(done.status, TaskStatus::Done);
    assert!(
        done.last_comment()
            .unwrap()
            .text
            .contains("ask_human(question=Proceed?) -> yes")
    );

    let cp = CheckpointStore::new(&world.db).get(task.id).unwrap().unwrap();
    let (content, outcome) = cp.transcript.result_for("call-1").unwrap();
    assert_eq!(content, "yes");
    assert_eq!(outcome, CallOutcome::Answered);
}

#[tokio::test]
async fn destructive_call_waits_for_approval() {
    let world = World::new(PermissionConfig::default());
    let task = world.create(
        "purge old orders",
        json!([{"capability": "delete_record", "arguments": {"table": "orders", "id": 7}}]),
    );

    assert_eq!(
        world.scheduler.run_once().await.unwrap(),
        CycleReport::Suspended(task.id)
    );
    assert_eq!(world.runs.load(Ordering::SeqCst), 0);

    let cp = CheckpointStore::new(&world.db).get(task.id).unwrap().unwrap();
    let pending = cp.pending_interrupt.as_ref().unwrap();
    assert_eq!(pending.interrupt.kind, InterruptKind::ToolApproval);
    let comment = world.task(task.id).last_comment().unwrap().text.clone();
    assert!(comment.contains("delete_record"));
    assert!(comment.contains("approve, always_allow, or deny"));

    world
        .gateway
        .respond(task.id, ResumeValue::decision(ApprovalDecision::Approve))
        .unwrap();
    assert_eq!(world.runs.load(Ordering::SeqCst), 0);

    assert_eq!(
        world.scheduler.run_once().await.unwrap(),
        CycleReport::Completed(task.id)
    );
    assert_eq!(world.runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn denied_approval_never_runs() {
    let world = World::new(PermissionConfig::default());
    let task = world.create(
        "purge old orders",
        json!([{"capability": "delete_record", "arguments": {"id": 7}}]),
    );
    world.scheduler.run_once().await.unwrap();
    world
        .gateway
        .respond(task.id, ResumeValue::text("deny"))
        .unwrap();

    assert_eq!(
        world.scheduler.run_once().await.unwrap(),
        CycleReport::Completed(task.id)
    );
    assert_eq!(world.runs.load(Ordering::SeqCst), 0);
    let summary = world.task(task.id).last_comment().unwrap().text.clone();
    assert!(summary.contains("this action was denied: delete_record"));
}

#[tokio::test]
async fn respond_to_done_task_changes_nothing() {
    let world = World::new(PermissionConfig::default());
    let task = world.create("already handled", json!([]));
    world
        .store()
        .update(task.id, TaskUpdate::status(TaskStatus::Done))
        .unwrap();
    let before = world.task(task.id);

    let err = world
        .gateway
        .respond(task.id, ResumeValue::text("yes"))
        .unwrap_err();
    assert!(is_invalid_resume(&err));

    let after = world.task(task.id);
    assert_eq!(after.status, TaskStatus::Done);
    assert_eq!(after.comments, before.comments);
    assert_eq!(after.updated_at, before.updated_at);
    assert!(CheckpointStore::new(&world.db).get(task.id).unwrap().is_none());
}

#[tokio::test]
async fn resubmission_after_resolution_is_rejected() {
    let world = World::new(allow(&["ask_human"]));
    let task = world.create(
        "ask once",
        json!([{"capability": "ask_human", "arguments": {"question": "Name?"}}]),
    );
    world.scheduler.run_once().await.unwrap();
    world.gateway.respond(task.id, ResumeValue::text("Ada")).unwrap();
    world.scheduler.run_once().await.unwrap();

    let err = world
        .gateway
        .respond(task.id, ResumeValue::text("Grace"))
        .unwrap_err();
    assert!(is_invalid_resume(&err));
}

#[tokio::test]
async fn resumed_answer_matches_synchronous_answer() {
    let plan = json!([
        {"capability": "note", "arguments": {"text": "before"}},
        {"capability": "confirm"},
        {"capability": "note", "arguments": {"text": "after"}},
    ]);
    let open = PermissionConfig {
        default_secure: false,
        ..Default::default()
    };

    let sync = World::with_registry(open.clone(), |r| {
        r.register(Box::new(Confirm {
            answer: Some("V"),
        }))
    });
    let sync_task = sync.create("confirm", plan.clone());
    assert_eq!(
        sync.scheduler.run_once().await.unwrap(),
        CycleReport::Completed(sync_task.id)
    );

    let parked = World::with_registry(open, |r| r.register(Box::new(Confirm { answer: None })));
    let parked_task = parked.create("confirm", plan);
    assert_eq!(
        parked.scheduler.run_once().await.unwrap(),
        CycleReport::Suspended(parked_task.id)
    );
    parked
        .gateway
        .respond(parked_task.id, ResumeValue::text("V"))
        .unwrap();
    assert_eq!(
        parked.scheduler.run_once().await.unwrap(),
        CycleReport::Completed(parked_task.id)
    );

    let sync_cp = CheckpointStore::new(&sync.db).get(sync_task.id).unwrap().unwrap();
    let parked_cp = CheckpointStore::new(&parked.db)
        .get(parked_task.id)
        .unwrap()
        .unwrap();
    let contents = |cp: &tether_core::checkpoint::Checkpoint| -> Vec<(String, String)> {
        cp.transcript
            .resolved()
            .into_iter()
            .map(|(call, content)| (call.capability.clone(), content.to_string()))
            .collect()
    };
    assert_eq!(contents(&sync_cp), contents(&parked_cp));
    assert_eq!(sync_cp.summary, parked_cp.summary);
    assert_eq!(
        sync.task(sync_task.id).last_comment().unwrap().text,
        parked.task(parked_task.id).last_comment().unwrap().text
    );
}

#[tokio::test]
async fn always_allow_is_remembered() {
    let world = World::new(PermissionConfig::default());
    let call = json!({"capability": "delete_record", "arguments": {"table": "orders", "id": 7}});
    let first = world.create("first purge", json!([call.clone(), call.clone()]));

    assert_eq!(
        world.scheduler.run_once().await.unwrap(),
        CycleReport::Suspended(first.id)
    );
    world
        .gateway
        .respond(first.id, ResumeValue::text("always_allow"))
        .unwrap();
    // The identical second call in the same run is allowed without asking.
    assert_eq!(
        world.scheduler.run_once().await.unwrap(),
        CycleReport::Completed(first.id)
    );
    assert_eq!(world.runs.load(Ordering::SeqCst), 2);
    assert_eq!(RuleStore::new(&world.db).list().unwrap().len(), 1);

    let second = world.create("second purge", json!([call]));
    assert_eq!(
        world.scheduler.run_once().await.unwrap(),
        CycleReport::Completed(second.id)
    );
    assert_eq!(world.runs.load(Ordering::SeqCst), 3);

    // Different arguments still need approval.
    let third = world.create(
        "other purge",
        json!([{"capability": "delete_record", "arguments": {"table": "orders", "id": 8}}]),
    );
    assert_eq!(
        world.scheduler.run_once().await.unwrap(),
        CycleReport::Suspended(third.id)
    );
}

#[tokio::test]
async fn learned_rule_keeps_argument_types_apart() {
    let world = World::new(PermissionConfig::default());
    let as_text = world.create(
        "purge by text id",
        json!([{"capability": "delete_record", "arguments": {"id": "3"}}]),
    );
    world.scheduler.run_once().await.unwrap();
    world
        .gateway
        .respond(as_text.id, ResumeValue::text("always_allow"))
        .unwrap();
    assert_eq!(
        world.scheduler.run_once().await.unwrap(),
        CycleReport::Completed(as_text.id)
    );

    // Same digits, but a number: not what was approved.
    let as_number = world.create(
        "purge by numeric id",
        json!([{"capability": "delete_record", "arguments": {"id": 3}}]),
    );
    assert_eq!(
        world.scheduler.run_once().await.unwrap(),
        CycleReport::Suspended(as_number.id)
    );
    assert_eq!(world.runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn deny_wins_over_allow() {
    let world = World::new(PermissionConfig {
        default_secure: false,
        allow: vec!["delete_record(*)".into()],
        deny: vec!["delete_record(table=users, *)".into()],
    });
    let task = world.create(
        "purge",
        json!([
            {"capability": "delete_record", "arguments": {"table": "users", "id": 1}},
            {"capability": "delete_record", "arguments": {"table": "orders", "id": 1}},
        ]),
    );
    assert_eq!(
        world.scheduler.run_once().await.unwrap(),
        CycleReport::Completed(task.id)
    );
    assert_eq!(world.runs.load(Ordering::SeqCst), 1);
    let summary = world.task(task.id).last_comment().unwrap().text.clone();
    assert!(summary.contains("this action was denied: delete_record"));
    assert!(summary.contains("deleted 1"));
}

#[tokio::test]
async fn answered_task_runs_before_new_work() {
    let world = World::new(allow(&["ask_human", "note"]));
    let asked = world.create(
        "ask",
        json!([{"capability": "ask_human", "arguments": {"question": "Go?"}}]),
    );
    world.scheduler.run_once().await.unwrap();

    let fresh = world.create("fresh", json!([{"capability": "note", "arguments": {"text": "x"}}]));
    world.gateway.respond(asked.id, ResumeValue::text("go")).unwrap();
    let later = world.create("later", json!([]));

    assert_eq!(
        world.scheduler.run_once().await.unwrap(),
        CycleReport::Completed(asked.id)
    );
    assert_eq!(
        world.scheduler.run_once().await.unwrap(),
        CycleReport::Completed(fresh.id)
    );
    assert_eq!(
        world.scheduler.run_once().await.unwrap(),
        CycleReport::Completed(later.id)
    );
}

#[tokio::test]
async fn follow_up_tasks_join_the_queue() {
    let world = World::new(allow(&["create_task"]));
    let parent = world.create(
        "triage",
        json!([{"capability": "create_task", "arguments": {
            "title": "fix the report",
            "plan": [{"capability": "note", "arguments": {"text": "fixed"}}],
        }}]),
    );
    assert_eq!(
        world.scheduler.run_once().await.unwrap(),
        CycleReport::Completed(parent.id)
    );

    let children: Vec<Task> = world
        .store()
        .list(Some(TaskStatus::New))
        .unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].metadata.get("follow_up_of"), Some(&json!(parent.id.0)));

    // `note` is not allowed, so the child asks for approval.
    assert_eq!(
        world.scheduler.run_once().await.unwrap(),
        CycleReport::Suspended(children[0].id)
    );
}

#[tokio::test]
async fn panicking_capability_fails_only_its_task() {
    let world = World::with_registry(
        PermissionConfig {
            default_secure: false,
            ..Default::default()
        },
        |registry| registry.register(Box::new(Explode)),
    );
    let bad = world.create("bad", json!([{"capability": "explode", "arguments": {}}]));
    let good = world.create("good", json!([{"capability": "note", "arguments": {"text": "ok"}}]));

    let report = world.scheduler.run_once().await.unwrap();
    let CycleReport::Failed { task_id, error } = report else {
        panic!("expected failure, got {report:?}");
    };
    assert_eq!(task_id, bad.id);
    assert!(error.contains("capability blew up"), "{error}");

    let failed = world.task(bad.id);
    assert_eq!(failed.status, TaskStatus::Failed);
    assert!(failed.lease.is_none());
    assert!(failed.last_comment().unwrap().text.contains("capability blew up"));

    assert_eq!(
        world.scheduler.run_once().await.unwrap(),
        CycleReport::Completed(good.id)
    );
}

#[tokio::test]
async fn run_loop_survives_a_panicking_task() {
    let world = Arc::new(World::with_registry(
        PermissionConfig {
            default_secure: false,
            ..Default::default()
        },
        |registry| registry.register(Box::new(Explode)),
    ));
    let bad = world.create("bad", json!([{"capability": "explode", "arguments": {}}]));
    let good = world.create("good", json!([{"capability": "note", "arguments": {"text": "ok"}}]));

    let stop = tokio_util::sync::CancellationToken::new();
    let runner = {
        let world = Arc::clone(&world);
        let stop = stop.clone();
        tokio::spawn(async move { world.scheduler.run(stop).await })
    };
    for _ in 0..200 {
        if world.task(good.id).status == TaskStatus::Done {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    stop.cancel();
    runner.await.unwrap().unwrap();

    assert_eq!(world.task(bad.id).status, TaskStatus::Failed);
    assert_eq!(world.task(good.id).status, TaskStatus::Done);
}

/// Run cycles until the queue is empty. Returns how many tasks completed.
async fn drain(scheduler: &Scheduler, db: &Database) -> usize {
    let mut completed = 0;
    loop {
        match scheduler.run_once().await.unwrap() {
            CycleReport::Completed(_) => completed += 1,
            CycleReport::Idle => {
                let store = TaskStore::new(db);
                if store.list(Some(TaskStatus::New)).unwrap().is_empty()
                    && store.in_progress().unwrap().is_none()
                {
                    return completed;
                }
                tokio::task::yield_now().await;
            }
            other => panic!("unexpected cycle: {other:?}"),
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn competing_schedulers_never_overlap() {
    let world = World::new(PermissionConfig {
        default_secure: false,
        ..Default::default()
    });
    for i in 0..12 {
        world.create(
            &format!("task {i}"),
            json!([{"capability": "note", "arguments": {"text": i.to_string()}}]),
        );
    }

    let engine = {
        let permissions = Arc::new(
            PermissionService::load(
                Arc::clone(&world.db),
                &PermissionConfig {
                    default_secure: false,
                    ..Default::default()
                },
                "tether.toml",
                EventBus::new(),
            )
            .unwrap(),
        );
        Arc::new(ExecutionEngine::new(
            Arc::new(CapabilityRegistry::with_builtins()),
            Arc::new(PlanReasoner),
            permissions,
        ))
    };
    let rival = Scheduler::new(
        Arc::clone(&world.db),
        engine,
        EventBus::new(),
        SchedulerConfig::default(),
    );

    let db = Arc::clone(&world.db);
    let watcher = tokio::spawn(async move {
        let mut max_seen = 0;
        for _ in 0..400 {
            let running = TaskStore::new(&db)
                .list(Some(TaskStatus::InProgress))
                .unwrap()
                .len();
            max_seen = max_seen.max(running);
            tokio::task::yield_now().await;
        }
        max_seen
    });

    let rival_db = Arc::clone(&world.db);
    let rival = tokio::spawn(async move { drain(&rival, &rival_db).await });
    let mine = drain(&world.scheduler, &world.db).await;
    let theirs = rival.await.unwrap();

    assert_eq!(mine + theirs, 12);
    assert!(watcher.await.unwrap() <= 1);
    assert_eq!(world.store().list(Some(TaskStatus::Done)).unwrap().len(), 12);
}
