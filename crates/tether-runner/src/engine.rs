//! Execution engine: the turn loop over a serializable transcript.
//!
//! Every capability call passes through the permission gate before it is
//! dispatched. A call that needs a human (approval, or a capability asking a
//! question) stops the loop with the call unresolved at the tail of the
//! transcript. Resuming injects the recorded response as that call's result
//! and carries on from there; earlier turns are never replayed.

use crate::capability::{CallContext, CapabilityOutput, CapabilityRegistry};
use crate::permissions::PermissionService;
use crate::reasoner::{Reasoner, Step};
use anyhow::{Context, Result};
use std::sync::Arc;
use tether_core::TetherError;
use tether_core::checkpoint::{ApprovalDecision, CallOutcome, CapabilityCall, Checkpoint, ResumeValue, Role};
use tether_core::interrupt::{Interrupt, InterruptKind};
use tether_core::permission::Decision;
use tether_core::task::Task;

/// Default bound on reasoner steps per task.
pub const DEFAULT_MAX_TURNS: u32 = 64;

/// How a run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed { summary: String },
    /// Waiting on a human. The checkpoint holds the pending interrupt.
    Suspended { interrupt: Interrupt },
    Failed { error: String },
}

/// An outcome plus the checkpoint the run left behind.
#[derive(Debug, Clone)]
pub struct Execution {
    pub outcome: Outcome,
    pub checkpoint: Checkpoint,
}

/// The result text recorded for a denied call.
pub fn denial_text(capability: &str) -> String {
    format!("this action was denied: {capability}")
}

enum Dispatch {
    Resolved,
    Suspend(Interrupt),
}

pub struct ExecutionEngine {
    capabilities: Arc<CapabilityRegistry>,
    reasoner: Arc<dyn Reasoner>,
    permissions: Arc<PermissionService>,
    max_turns: u32,
}

impl ExecutionEngine {
    pub fn new(
        capabilities: Arc<CapabilityRegistry>,
        reasoner: Arc<dyn Reasoner>,
        permissions: Arc<PermissionService>,
    ) -> Self {
        Self {
            capabilities,
            reasoner,
            permissions,
            max_turns: DEFAULT_MAX_TURNS,
        }
    }

    pub fn with_max_turns(mut self, max_turns: u32) -> Self {
        self.max_turns = max_turns;
        self
    }

    pub fn permissions(&self) -> &PermissionService {
        &self.permissions
    }

    pub fn capabilities(&self) -> &CapabilityRegistry {
        &self.capabilities
    }

    /// Run (or resume) a task from `checkpoint`.
    ///
    /// Never returns an error: anything that goes wrong inside the run ends
    /// it as [`Outcome::Failed`], with the checkpoint as far as it got.
    pub async fn run(&self, ctx: &CallContext, task: &Task, mut checkpoint: Checkpoint) -> Execution {
        let outcome = match self.drive(ctx, task, &mut checkpoint).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(task_id = %task.id, error = %format!("{e:#}"), "run failed");
                Outcome::Failed {
                    error: format!("{e:#}"),
                }
            }
        };
        Execution {
            outcome,
            checkpoint,
        }
    }

    async fn drive(&self, ctx: &CallContext, task: &Task, cp: &mut Checkpoint) -> Result<Outcome> {
        if cp.transcript.is_empty() {
            let prompt = if task.description.trim().is_empty() {
                task.title.clone()
            } else {
                format!("{}\n\n{}", task.title, task.description)
            };
            cp.transcript.push_message(Role::Task, prompt);
        }

        if let Some(interrupt) = self.resume(ctx, cp).await? {
            return Ok(Outcome::Suspended { interrupt });
        }

        loop {
            while let Some(call) = cp.transcript.next_unresolved_call().cloned() {
                if let Dispatch::Suspend(interrupt) = self.dispatch(ctx, cp, &call, true).await? {
                    self.suspend(ctx, cp, &call, interrupt.clone());
                    return Ok(Outcome::Suspended { interrupt });
                }
            }

            if cp.turns >= self.max_turns {
                return Err(TetherError::ExecutionFailure(format!(
                    "turn limit of {} reached",
                    self.max_turns
                ))
                .into());
            }
            let step = self
                .reasoner
                .next_step(task, &cp.transcript)
                .await
                .with_context(|| format!("reasoner {} failed", self.reasoner.name()))?;
            cp.turns += 1;

            match step {
                Step::Finish { summary } => {
                    tracing::info!(task_id = %task.id, turns = cp.turns, "run completed");
                    cp.transcript.push_message(Role::Agent, summary.clone());
                    cp.summary = Some(summary.clone());
                    return Ok(Outcome::Completed { summary });
                }
                Step::Act { note, calls } => {
                    if let Some(note) = note {
                        cp.transcript.push_message(Role::Agent, note);
                    }
                    for call in calls {
                        cp.transcript.push_call(call.capability, call.arguments);
                    }
                }
            }
        }
    }

    fn suspend(&self, ctx: &CallContext, cp: &mut Checkpoint, call: &CapabilityCall, interrupt: Interrupt) {
        tracing::info!(
            task_id = %ctx.task_id,
            call_id = %call.call_id,
            kind = %interrupt.kind,
            "suspending for human input"
        );
        cp.suspend(&call.call_id, interrupt);
    }

    /// Inject a recorded response into the pending call. Returns the next
    /// interrupt if the injected call asks for more input.
    async fn resume(&self, ctx: &CallContext, cp: &mut Checkpoint) -> Result<Option<Interrupt>> {
        if cp.awaiting_response() {
            return Err(TetherError::ExecutionFailure(
                "checkpoint is still waiting for a response".into(),
            )
            .into());
        }
        let Some((pending, response)) = cp.take_resume() else {
            return Ok(None);
        };

        let call = match cp.transcript.next_unresolved_call() {
            Some(call) if call.call_id == pending.call_id => call.clone(),
            _ => {
                return Err(TetherError::CheckpointCorruption {
                    thread_id: cp.thread_id.to_string(),
                    reason: format!("pending call {} is not the first unresolved call", pending.call_id),
                }
                .into());
            }
        };
        let kind = pending.interrupt.kind;
        let response = response
            .normalize_for(kind)
            .map_err(|reason| TetherError::InvalidResume {
                task_id: ctx.task_id,
                reason,
            })?;
        tracing::info!(
            task_id = %ctx.task_id,
            call_id = %call.call_id,
            response = %response.summary(),
            "resuming from checkpoint"
        );

        match (kind, response) {
            (InterruptKind::ToolApproval, ResumeValue::Decision { decision, message }) => {
                let dispatch = match decision {
                    ApprovalDecision::Deny => {
                        cp.transcript.push_result(
                            &call.call_id,
                            denial_text(&call.capability),
                            CallOutcome::Denied,
                        );
                        Dispatch::Resolved
                    }
                    ApprovalDecision::AlwaysAllow => {
                        self.permissions
                            .learn_allow(&call.capability, &call.arguments)
                            .context("failed to persist learned rule")?;
                        self.dispatch(ctx, cp, &call, false).await?
                    }
                    ApprovalDecision::Approve => self.dispatch(ctx, cp, &call, false).await?,
                };
                if let Some(message) = message {
                    cp.transcript.push_message(Role::Human, message);
                }
                match dispatch {
                    Dispatch::Resolved => Ok(None),
                    Dispatch::Suspend(interrupt) => {
                        self.suspend(ctx, cp, &call, interrupt.clone());
                        Ok(Some(interrupt))
                    }
                }
            }
            (_, ResumeValue::Text(answer)) => {
                cp.transcript
                    .push_result(&call.call_id, answer, CallOutcome::Answered);
                Ok(None)
            }
            (kind, ResumeValue::Decision { .. }) => Err(TetherError::InvalidResume {
                task_id: ctx.task_id,
                reason: format!("a decision cannot answer a {kind} interrupt"),
            }
            .into()),
        }
    }

    /// Gate (unless already approved) and execute one call.
    async fn dispatch(
        &self,
        ctx: &CallContext,
        cp: &mut Checkpoint,
        call: &CapabilityCall,
        gated: bool,
    ) -> Result<Dispatch> {
        let Some(capability) = self.capabilities.get(&call.capability) else {
            return Err(TetherError::ExecutionFailure(format!(
                "unknown capability `{}`",
                call.capability
            ))
            .into());
        };

        if gated {
            let decision = self.permissions.decide(&call.capability, &call.arguments);
            tracing::debug!(
                task_id = %ctx.task_id,
                capability = %call.capability,
                %decision,
                "gated call"
            );
            match decision {
                Decision::Allow => {}
                Decision::Deny => {
                    tracing::info!(task_id = %ctx.task_id, capability = %call.capability, "call denied");
                    cp.transcript.push_result(
                        &call.call_id,
                        denial_text(&call.capability),
                        CallOutcome::Denied,
                    );
                    return Ok(Dispatch::Resolved);
                }
                Decision::RequireApproval => {
                    return Ok(Dispatch::Suspend(Interrupt::tool_approval(
                        &call.capability,
                        &call.arguments,
                    )));
                }
            }
        }

        let output = capability
            .invoke(ctx, &call.arguments)
            .await
            .map_err(|e| TetherError::ExecutionFailure(format!("{} failed: {e:#}", call.capability)))?;
        match output {
            CapabilityOutput::Text(text) => {
                cp.transcript
                    .push_result(&call.call_id, text, CallOutcome::Executed);
                Ok(Dispatch::Resolved)
            }
            CapabilityOutput::Ask { question } => Ok(Dispatch::Suspend(Interrupt::question(question))),
        }
    }
}
