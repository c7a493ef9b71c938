//! Reasoners decide what a run does next.
//!
//! The engine owns the transcript and the permission gate; a reasoner only
//! looks at the task and the transcript so far and proposes the next step.
//! Model-backed reasoners plug in behind the same trait.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tether_core::TetherError;
use tether_core::checkpoint::{Arguments, Transcript};
use tether_core::pattern::format_call;
use tether_core::task::Task;

/// Metadata key holding a task's call plan.
pub const PLAN_KEY: &str = "plan";

/// A capability call the reasoner wants made.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedCall {
    pub capability: String,
    #[serde(default)]
    pub arguments: Arguments,
}

impl PlannedCall {
    pub fn new(capability: impl Into<String>, arguments: Arguments) -> Self {
        Self {
            capability: capability.into(),
            arguments,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Make these calls, in order, as one turn.
    Act {
        note: Option<String>,
        calls: Vec<PlannedCall>,
    },
    /// The run is complete.
    Finish { summary: String },
}

#[async_trait]
pub trait Reasoner: Send + Sync {
    fn name(&self) -> &str;

    /// Propose the next step. Called only when every earlier call has a
    /// result. An `Err` fails the task.
    async fn next_step(&self, task: &Task, transcript: &Transcript) -> Result<Step>;
}

/// Follows the call plan stored in the task's `plan` metadata.
///
/// The plan is a list whose entries are either one call
/// (`{"capability": ..., "arguments": {...}}`) or a list of calls made
/// together as one turn. When the plan is exhausted the reasoner finishes
/// with a summary of every call and its result.
pub struct PlanReasoner;

impl PlanReasoner {
    fn plan(task: &Task) -> Result<Vec<Vec<PlannedCall>>> {
        let Some(raw) = task.metadata.get(PLAN_KEY) else {
            return Ok(Vec::new());
        };
        let malformed = |reason: String| TetherError::ExecutionFailure(format!("malformed plan: {reason}"));
        let Value::Array(entries) = raw else {
            return Err(malformed("expected a list".into()).into());
        };

        let mut turns = Vec::with_capacity(entries.len());
        for (index, entry) in entries.iter().enumerate() {
            let turn = match entry {
                Value::Array(batch) => batch
                    .iter()
                    .map(|call| serde_json::from_value::<PlannedCall>(call.clone()))
                    .collect::<Result<Vec<_>, _>>(),
                call => serde_json::from_value::<PlannedCall>(call.clone()).map(|c| vec![c]),
            }
            .map_err(|e| malformed(format!("step {}: {e}", index + 1)))?;
            if turn.is_empty() {
                return Err(malformed(format!("step {} has no calls", index + 1)).into());
            }
            turns.push(turn);
        }
        Ok(turns)
    }

    fn summarize(transcript: &Transcript) -> String {
        let resolved = transcript.resolved();
        if resolved.is_empty() {
            return "Nothing to do: no plan steps.".to_string();
        }
        let mut summary = format!("Completed {} call(s):", resolved.len());
        for (call, content) in resolved {
            summary.push_str(&format!(
                "\n- {} -> {}",
                format_call(&call.capability, &call.arguments),
                content
            ));
        }
        summary
    }
}

#[async_trait]
impl Reasoner for PlanReasoner {
    fn name(&self) -> &str {
        "plan"
    }

    async fn next_step(&self, task: &Task, transcript: &Transcript) -> Result<Step> {
        let turns = Self::plan(task)?;
        let made = transcript.calls().count();

        let mut consumed = 0;
        for (index, turn) in turns.into_iter().enumerate() {
            if consumed == made {
                return Ok(Step::Act {
                    note: Some(format!("plan step {}", index + 1)),
                    calls: turn,
                });
            }
            consumed += turn.len();
            if consumed > made {
                break;
            }
        }
        if consumed != made {
            return Err(TetherError::ExecutionFailure(format!(
                "transcript has {made} call(s), which does not line up with the plan"
            ))
            .into());
        }

        Ok(Step::Finish {
            summary: Self::summarize(transcript),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tether_core::checkpoint::CallOutcome;
    use tether_core::task::NewTask;

    fn task_with_plan(plan: Value) -> Task {
        NewTask::new("plan task").meta(PLAN_KEY, plan).into_task()
    }

    #[tokio::test]
    async fn walks_plan_one_turn_at_a_time() {
        let task = task_with_plan(json!([
            {"capability": "note", "arguments": {"text": "a"}},
            {"capability": "note", "arguments": {"text": "b"}},
        ]));
        let mut transcript = Transcript::new();

        let Step::Act { calls, .. } = PlanReasoner.next_step(&task, &transcript).await.unwrap() else {
            panic!("expected act");
        };
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].arguments.get("text"), Some(&json!("a")));

        let call = transcript.push_call("note", calls[0].arguments.clone());
        transcript.push_result(&call.call_id, "a", CallOutcome::Executed);

        let Step::Act { calls, .. } = PlanReasoner.next_step(&task, &transcript).await.unwrap() else {
            panic!("expected act");
        };
        assert_eq!(calls[0].arguments.get("text"), Some(&json!("b")));

        let call = transcript.push_call("note", calls[0].arguments.clone());
        transcript.push_result(&call.call_id, "b", CallOutcome::Executed);

        let Step::Finish { summary } = PlanReasoner.next_step(&task, &transcript).await.unwrap() else {
            panic!("expected finish");
        };
        assert_eq!(summary, "Completed 2 call(s):\n- note(text=a) -> a\n- note(text=b) -> b");
    }

    #[tokio::test]
    async fn batched_step_is_one_turn() {
        let task = task_with_plan(json!([
            [
                {"capability": "note", "arguments": {"text": "a"}},
                {"capability": "note", "arguments": {"text": "b"}},
            ],
            {"capability": "note"},
        ]));
        let mut transcript = Transcript::new();
        let Step::Act { calls, .. } = PlanReasoner.next_step(&task, &transcript).await.unwrap() else {
            panic!("expected act");
        };
        assert_eq!(calls.len(), 2);

        for call in calls {
            let call = transcript.push_call(call.capability, call.arguments);
            transcript.push_result(&call.call_id, "ok", CallOutcome::Executed);
        }
        let Step::Act { calls, .. } = PlanReasoner.next_step(&task, &transcript).await.unwrap() else {
            panic!("expected act");
        };
        assert_eq!(calls, vec![PlannedCall::new("note", Arguments::new())]);
    }

    #[tokio::test]
    async fn no_plan_finishes_immediately() {
        let task = NewTask::new("nothing").into_task();
        let step = PlanReasoner.next_step(&task, &Transcript::new()).await.unwrap();
        assert!(matches!(step, Step::Finish { summary } if summary.starts_with("Nothing to do")));
    }

    #[tokio::test]
    async fn malformed_plan_is_execution_failure() {
        let task = task_with_plan(json!({"capability": "note"}));
        let err = PlanReasoner
            .next_step(&task, &Transcript::new())
            .await
            .unwrap_err();
        assert!(matches!(
            TetherError::find(&err),
            Some(TetherError::ExecutionFailure(msg)) if msg.contains("expected a list")
        ));

        let task = task_with_plan(json!([{"arguments": {}}]));
        let err = PlanReasoner
            .next_step(&task, &Transcript::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("step 1"));
    }
}
