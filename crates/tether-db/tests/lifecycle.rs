//! End-to-end integration test exercising the suspend/resume lifecycle
//! through the store layer: the same state transitions the scheduler loop,
//! interrupt broker and resume gateway perform, without running an engine.

use tether_core::TetherError;
use tether_core::checkpoint::{ApprovalDecision, Arguments, CallOutcome, Checkpoint, ResumeValue, Role};
use tether_core::interrupt::Interrupt;
use tether_core::task::*;
use tether_db::checkpoint_store::CheckpointStore;
use tether_db::task_store::TaskStore;

fn test_db() -> redb::Database {
    let dir = tempfile::tempdir().unwrap();
    tether_db::open_db(&dir.path().join("lifecycle.redb")).unwrap()
}

/// New -> InProgress -> NeedsReview -> UserInputReceived -> InProgress -> Done.
#[test]
fn question_round_trip_lifecycle() {
    let db = test_db();
    let tasks = TaskStore::new(&db);
    let checkpoints = CheckpointStore::new(&db);

    let task = tasks
        .create(NewTask::new("Archive old invoices").description("Ask first"))
        .unwrap();

    // Run 1: claim, ask a question, park.
    let claimed = tasks.claim_next("sched-a").unwrap().unwrap();
    assert_eq!(claimed.id, task.id);
    let guard = claimed.lease_guard().unwrap();

    let mut cp = Checkpoint::new(task.id);
    cp.transcript.push_message(Role::Task, &claimed.title);
    let call = cp.transcript.push_call("ask_human", Arguments::new());
    let interrupt = Interrupt::question("Archive 2019 too?");
    let note = interrupt.describe();
    cp.suspend(&call.call_id, interrupt);
    tasks
        .finish(
            &guard,
            TaskStatus::NeedsReview,
            Some(Comment::new(AUTHOR_AGENT, note)),
            Some(&mut cp),
        )
        .unwrap();

    let review = tasks.list(Some(TaskStatus::NeedsReview)).unwrap();
    assert_eq!(review.len(), 1);
    assert!(review[0].last_comment().unwrap().text.contains("Archive 2019 too?"));
    assert!(review[0].lease.is_none());

    // Nothing to do while parked.
    assert!(tasks.claim_next("sched-a").unwrap().is_none());

    // Gateway.
    tasks.record_response(task.id, ResumeValue::text("yes")).unwrap();

    // Run 2: resume with the recorded answer.
    let resumed = tasks.claim_next("sched-b").unwrap().unwrap();
    assert_eq!(resumed.run_count, 2);
    assert_eq!(resumed.lease.as_ref().unwrap().claimed_from, TaskStatus::UserInputReceived);

    let mut cp = checkpoints.get(task.id).unwrap().unwrap();
    let (pending, response) = cp.take_resume().unwrap();
    cp.transcript
        .push_result(&pending.call_id, response.summary(), CallOutcome::Answered);
    cp.summary = Some("archived".into());
    let done = tasks
        .finish(
            &resumed.lease_guard().unwrap(),
            TaskStatus::Done,
            Some(Comment::new(AUTHOR_AGENT, "archived")),
            Some(&mut cp),
        )
        .unwrap();
    assert_eq!(done.status, TaskStatus::Done);

    // Checkpoint retained for audit.
    let stored = checkpoints.get(task.id).unwrap().unwrap();
    assert_eq!(stored.summary.as_deref(), Some("archived"));
    assert!(stored.transcript.unresolved_calls().is_empty());
}

/// Responding to a finished task is rejected and changes nothing.
#[test]
fn respond_to_done_task_is_invalid() {
    let db = test_db();
    let tasks = TaskStore::new(&db);

    let task = tasks.create(NewTask::new("Send report")).unwrap();
    let guard = tasks.claim_next("s").unwrap().unwrap().lease_guard().unwrap();
    tasks.transition(&guard, TaskStatus::Done, None).unwrap();
    let before = tasks.require(task.id).unwrap();

    let err = tasks
        .record_response(task.id, ResumeValue::decision(ApprovalDecision::Approve))
        .unwrap_err();
    assert!(matches!(
        TetherError::find(&err),
        Some(TetherError::InvalidResume { .. })
    ));

    let after = tasks.require(task.id).unwrap();
    assert_eq!(after.status, TaskStatus::Done);
    assert_eq!(after.comments.len(), before.comments.len());
    assert_eq!(after.updated_at, before.updated_at);
}

/// A scheduler whose lease was reclaimed cannot write its outcome, and its
/// checkpoint write is rolled back with the task write.
#[test]
fn lost_lease_discards_outcome() {
    let db = test_db();
    let tasks = TaskStore::new(&db);
    let checkpoints = CheckpointStore::new(&db);

    let task = tasks.create(NewTask::new("Flaky")).unwrap();
    let old = tasks.claim_next("slow").unwrap().unwrap().lease_guard().unwrap();
    tasks.reclaim_expired(chrono::Duration::milliseconds(-1)).unwrap();
    let new = tasks.claim_next("fast").unwrap().unwrap().lease_guard().unwrap();
    assert_eq!(new.run, 2);

    let mut cp = Checkpoint::new(task.id);
    cp.summary = Some("stale".into());
    let err = tasks
        .finish(&old, TaskStatus::Done, None, Some(&mut cp))
        .unwrap_err();
    assert!(matches!(
        TetherError::find(&err),
        Some(TetherError::ClaimConflict { .. })
    ));
    assert!(checkpoints.get(task.id).unwrap().is_none());
    assert_eq!(tasks.require(task.id).unwrap().status, TaskStatus::InProgress);

    tasks.transition(&new, TaskStatus::Failed, None).unwrap();
}

/// Producer supersession: a waiting task is revived, and an obsolete one closed.
#[test]
fn producer_updates() {
    let db = test_db();
    let tasks = TaskStore::new(&db);

    let old = tasks.create(NewTask::new("Reply to thread v1")).unwrap();
    let new = tasks
        .create(NewTask::new("Reply to thread v2").meta("supersedes", serde_json::json!(old.id.0)))
        .unwrap();

    let mut meta = Metadata::new();
    meta.insert("superseded_by".into(), serde_json::json!(new.id.0));
    tasks
        .update(
            old.id,
            TaskUpdate::status(TaskStatus::Done)
                .with_comment("ingest", "superseded")
                .with_metadata(meta),
        )
        .unwrap();

    tasks.update(new.id, TaskUpdate::status(TaskStatus::Waiting)).unwrap();
    assert!(tasks.claim_next("s").unwrap().is_none());
    tasks.update(new.id, TaskUpdate::status(TaskStatus::New)).unwrap();
    assert_eq!(tasks.claim_next("s").unwrap().unwrap().id, new.id);
}
