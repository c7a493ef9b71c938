//! Durable execution state for suspendable runs.
//!
//! A checkpoint holds an explicit, serializable transcript of everything a
//! run has done so far. Suspension persists the transcript with the
//! unresolved call at its tail; resumption injects the recorded human
//! response as that call's result and continues from there. Earlier turns
//! are never replayed.

use crate::interrupt::{Interrupt, InterruptKind};
use crate::task::TaskId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Keyword arguments passed to a capability.
pub type Arguments = serde_json::Map<String, serde_json::Value>;

/// Identifies the execution thread of a task. One checkpoint per thread.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ThreadId(pub String);

impl ThreadId {
    pub fn for_task(task_id: TaskId) -> Self {
        Self(format!("thread:{}", task_id.0))
    }
}

impl std::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// The task as handed to the reasoner.
    Task,
    /// Reasoner notes and final summary.
    Agent,
    /// Text a human supplied through the resume gateway.
    Human,
}

/// How a call's result came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcome {
    Executed,
    Denied,
    /// A human answered the question the capability asked.
    Answered,
}

/// A single capability invocation requested by the reasoner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityCall {
    pub call_id: String,
    pub capability: String,
    #[serde(default)]
    pub arguments: Arguments,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TranscriptEntry {
    Message {
        role: Role,
        text: String,
    },
    Call(CapabilityCall),
    Result {
        call_id: String,
        content: String,
        outcome: CallOutcome,
    },
}

/// Ordered record of messages, calls and results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Transcript {
    entries: Vec<TranscriptEntry>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn push_message(&mut self, role: Role, text: impl Into<String>) {
        self.entries.push(TranscriptEntry::Message {
            role,
            text: text.into(),
        });
    }

    /// Append a call and return it with a freshly assigned call id.
    pub fn push_call(&mut self, capability: impl Into<String>, arguments: Arguments) -> CapabilityCall {
        let call = CapabilityCall {
            call_id: format!("call-{}", self.calls().count() + 1),
            capability: capability.into(),
            arguments,
        };
        self.entries.push(TranscriptEntry::Call(call.clone()));
        call
    }

    pub fn push_result(&mut self, call_id: impl Into<String>, content: impl Into<String>, outcome: CallOutcome) {
        self.entries.push(TranscriptEntry::Result {
            call_id: call_id.into(),
            content: content.into(),
            outcome,
        });
    }

    pub fn calls(&self) -> impl Iterator<Item = &CapabilityCall> {
        self.entries.iter().filter_map(|e| match e {
            TranscriptEntry::Call(call) => Some(call),
            _ => None,
        })
    }

    pub fn result_for(&self, call_id: &str) -> Option<(&str, CallOutcome)> {
        self.entries.iter().find_map(|e| match e {
            TranscriptEntry::Result {
                call_id: id,
                content,
                outcome,
            } if id == call_id => Some((content.as_str(), *outcome)),
            _ => None,
        })
    }

    /// Calls that have no result yet, in the order they were issued.
    pub fn unresolved_calls(&self) -> Vec<&CapabilityCall> {
        let resolved: HashSet<&str> = self
            .entries
            .iter()
            .filter_map(|e| match e {
                TranscriptEntry::Result { call_id, .. } => Some(call_id.as_str()),
                _ => None,
            })
            .collect();
        self.calls()
            .filter(|c| !resolved.contains(c.call_id.as_str()))
            .collect()
    }

    pub fn next_unresolved_call(&self) -> Option<&CapabilityCall> {
        self.unresolved_calls().into_iter().next()
    }

    /// Pairs of (call, result content) for every resolved call.
    pub fn resolved(&self) -> Vec<(&CapabilityCall, &str)> {
        self.calls()
            .filter_map(|c| self.result_for(&c.call_id).map(|(content, _)| (c, content)))
            .collect()
    }

    /// Structural sanity: unique call ids, and every result answers exactly
    /// one earlier call.
    pub fn validate(&self) -> Result<(), String> {
        let mut calls = HashSet::new();
        let mut results = HashSet::new();
        for entry in &self.entries {
            match entry {
                TranscriptEntry::Call(call) => {
                    if !calls.insert(call.call_id.as_str()) {
                        return Err(format!("duplicate call id {}", call.call_id));
                    }
                }
                TranscriptEntry::Result { call_id, .. } => {
                    if !calls.contains(call_id.as_str()) {
                        return Err(format!("result for unknown call {call_id}"));
                    }
                    if !results.insert(call_id.as_str()) {
                        return Err(format!("call {call_id} resolved twice"));
                    }
                }
                TranscriptEntry::Message { .. } => {}
            }
        }
        Ok(())
    }
}

/// Human decision on a tool-approval interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approve,
    AlwaysAllow,
    Deny,
}

impl ApprovalDecision {
    pub fn label(&self) -> &'static str {
        match self {
            ApprovalDecision::Approve => "approve",
            ApprovalDecision::AlwaysAllow => "always_allow",
            ApprovalDecision::Deny => "deny",
        }
    }
}

impl std::fmt::Display for ApprovalDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

impl std::str::FromStr for ApprovalDecision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace(['-', ' '], "_").as_str() {
            "approve" => Ok(ApprovalDecision::Approve),
            "always_allow" => Ok(ApprovalDecision::AlwaysAllow),
            "deny" => Ok(ApprovalDecision::Deny),
            other => Err(format!(
                "unknown decision '{other}' (expected approve, always_allow or deny)"
            )),
        }
    }
}

/// A human response, as submitted to the resume gateway and as recorded on
/// the checkpoint. On the wire this is either a bare string or
/// `{"decision": ..., "message": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResumeValue {
    Text(String),
    Decision {
        decision: ApprovalDecision,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl ResumeValue {
    pub fn text(text: impl Into<String>) -> Self {
        ResumeValue::Text(text.into())
    }

    pub fn decision(decision: ApprovalDecision) -> Self {
        ResumeValue::Decision {
            decision,
            message: None,
        }
    }

    /// Reshape a response for the interrupt it answers.
    ///
    /// Tool approvals need a decision; a bare string is accepted only when it
    /// is one of the decision keywords. Questions need text; a structured
    /// response is accepted only when it carries a message.
    pub fn normalize_for(self, kind: InterruptKind) -> Result<ResumeValue, String> {
        match (kind, self) {
            (InterruptKind::ToolApproval, ResumeValue::Text(text)) => text
                .parse::<ApprovalDecision>()
                .map(ResumeValue::decision)
                .map_err(|_| {
                    format!("tool approval needs approve, always_allow or deny, got '{text}'")
                }),
            (InterruptKind::ToolApproval, decision @ ResumeValue::Decision { .. }) => Ok(decision),
            (_, ResumeValue::Text(text)) if text.trim().is_empty() => {
                Err("response text is empty".into())
            }
            (_, text @ ResumeValue::Text(_)) => Ok(text),
            (_, ResumeValue::Decision { message, .. }) => match message {
                Some(message) if !message.trim().is_empty() => Ok(ResumeValue::Text(message)),
                _ => Err("a question needs a text answer; structured responses must carry a message".into()),
            },
        }
    }

    /// Short rendering for comments and events.
    pub fn summary(&self) -> String {
        match self {
            ResumeValue::Text(text) => text.clone(),
            ResumeValue::Decision {
                decision,
                message: Some(message),
            } => format!("{decision}: {message}"),
            ResumeValue::Decision { decision, .. } => decision.to_string(),
        }
    }
}

/// The interrupt a suspended run is waiting on, tied to the call that raised it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingInterrupt {
    pub call_id: String,
    pub interrupt: Interrupt,
}

/// Resumable execution state for one thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub thread_id: ThreadId,
    pub task_id: TaskId,
    pub transcript: Transcript,
    /// Reasoner steps taken so far, across suspensions.
    #[serde(default)]
    pub turns: u32,
    pub pending_interrupt: Option<PendingInterrupt>,
    /// Human response recorded by the gateway, awaiting pickup.
    pub response: Option<ResumeValue>,
    /// Final summary once the run completed.
    #[serde(default)]
    pub summary: Option<String>,
    /// Incremented by the store on every write.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(task_id: TaskId) -> Self {
        let now = Utc::now();
        Self {
            thread_id: ThreadId::for_task(task_id),
            task_id,
            transcript: Transcript::new(),
            turns: 0,
            pending_interrupt: None,
            response: None,
            summary: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Suspended and still waiting for the gateway.
    pub fn awaiting_response(&self) -> bool {
        self.pending_interrupt.is_some() && self.response.is_none()
    }

    /// Suspended with a recorded response ready for pickup.
    pub fn ready_to_resume(&self) -> bool {
        self.pending_interrupt.is_some() && self.response.is_some()
    }

    pub fn suspend(&mut self, call_id: impl Into<String>, interrupt: Interrupt) {
        self.pending_interrupt = Some(PendingInterrupt {
            call_id: call_id.into(),
            interrupt,
        });
        self.response = None;
    }

    /// Take the pending interrupt and its response, clearing both.
    pub fn take_resume(&mut self) -> Option<(PendingInterrupt, ResumeValue)> {
        if !self.ready_to_resume() {
            return None;
        }
        let pending = self.pending_interrupt.take()?;
        let response = self.response.take()?;
        Some((pending, response))
    }

    /// Checks that a stored checkpoint can be resumed from: the transcript
    /// is consistent and a pending interrupt points at the first unresolved
    /// call.
    pub fn validate(&self) -> Result<(), String> {
        self.transcript.validate()?;
        if let Some(pending) = &self.pending_interrupt {
            match self.transcript.next_unresolved_call() {
                Some(call) if call.call_id == pending.call_id => {}
                Some(call) => {
                    return Err(format!(
                        "pending interrupt targets {} but first unresolved call is {}",
                        pending.call_id, call.call_id
                    ));
                }
                None => {
                    return Err(format!(
                        "pending interrupt targets {} which is already resolved",
                        pending.call_id
                    ));
                }
            }
        }
        Ok(())
    }
}
