//! Capabilities the execution engine may invoke on behalf of a reasoner.
//!
//! A capability is a named async function over keyword arguments that
//! either returns a result string or asks a human a question. Whether a call
//! needs approval is never a property of the capability: the engine gates
//! every call through the permission engine before dispatching it here.

use anyhow::Result;
use async_trait::async_trait;
use redb::Database;
use serde_json::Value;
use std::sync::Arc;
use tether_core::TetherError;
use tether_core::checkpoint::Arguments;
use tether_core::task::{NewTask, TaskId};
use tether_db::task_store::TaskStore;

/// What a capability produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapabilityOutput {
    /// Result string recorded as the call's result.
    Text(String),
    /// Suspend and ask a human; the answer becomes the call's result.
    Ask { question: String },
}

/// Everything a capability may touch while running for a task.
#[derive(Clone)]
pub struct CallContext {
    pub task_id: TaskId,
    pub db: Arc<Database>,
}

#[async_trait]
pub trait Capability: Send + Sync {
    /// Name the reasoner uses to request this capability.
    fn name(&self) -> &str;

    /// One-line description for listings.
    fn description(&self) -> &str;

    /// Run the capability. An `Err` fails the task.
    async fn invoke(&self, ctx: &CallContext, arguments: &Arguments) -> Result<CapabilityOutput>;
}

/// Explicit registry of capabilities, looked up by name at dispatch time.
pub struct CapabilityRegistry {
    capabilities: Vec<Box<dyn Capability>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self {
            capabilities: Vec::new(),
        }
    }

    /// Registry holding `ask_human`, `create_task` and `note`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(AskHuman));
        registry.register(Box::new(CreateTask));
        registry.register(Box::new(Note));
        registry
    }

    /// Register a capability, replacing any existing one with the same name.
    pub fn register(&mut self, capability: Box<dyn Capability>) {
        self.capabilities.retain(|c| c.name() != capability.name());
        self.capabilities.push(capability);
    }

    pub fn get(&self, name: &str) -> Option<&dyn Capability> {
        self.capabilities
            .iter()
            .find(|c| c.name() == name)
            .map(|c| c.as_ref())
    }

    /// `(name, description)` of every registered capability.
    pub fn list(&self) -> Vec<(&str, &str)> {
        self.capabilities
            .iter()
            .map(|c| (c.name(), c.description()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn required_str<'a>(capability: &str, arguments: &'a Arguments, key: &str) -> Result<&'a str> {
    arguments
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| {
            TetherError::ExecutionFailure(format!("{capability}: missing string argument `{key}`"))
                .into()
        })
}

/// Raises a question for a human: `ask_human(question=...)`.
pub struct AskHuman;

#[async_trait]
impl Capability for AskHuman {
    fn name(&self) -> &str {
        "ask_human"
    }

    fn description(&self) -> &str {
        "Ask a human a free-text question and wait for the answer"
    }

    async fn invoke(&self, _ctx: &CallContext, arguments: &Arguments) -> Result<CapabilityOutput> {
        let question = required_str(self.name(), arguments, "question")?;
        Ok(CapabilityOutput::Ask {
            question: question.to_string(),
        })
    }
}

/// Creates a follow-up task:
/// `create_task(title=..., description?, tags?, plan?)`.
///
/// The new task carries `follow_up_of` metadata pointing at the caller.
pub struct CreateTask;

#[async_trait]
impl Capability for CreateTask {
    fn name(&self) -> &str {
        "create_task"
    }

    fn description(&self) -> &str {
        "Create a follow-up task in the queue"
    }

    async fn invoke(&self, ctx: &CallContext, arguments: &Arguments) -> Result<CapabilityOutput> {
        let title = required_str(self.name(), arguments, "title")?;
        let mut new = NewTask::new(title).meta("follow_up_of", Value::from(ctx.task_id.0));

        if let Some(description) = arguments.get("description").and_then(Value::as_str) {
            new = new.description(description);
        }
        match arguments.get("tags") {
            None | Some(Value::Null) => {}
            Some(Value::Array(tags)) => {
                for tag in tags {
                    let Some(tag) = tag.as_str() else {
                        return Err(TetherError::ExecutionFailure(
                            "create_task: `tags` must be strings".into(),
                        )
                        .into());
                    };
                    new = new.tag(tag);
                }
            }
            Some(_) => {
                return Err(
                    TetherError::ExecutionFailure("create_task: `tags` must be a list".into())
                        .into(),
                );
            }
        }
        if let Some(plan) = arguments.get("plan") {
            new = new.meta("plan", plan.clone());
        }

        let task = TaskStore::new(&ctx.db).create(new)?;
        tracing::info!(task_id = %ctx.task_id, follow_up = %task.id, "created follow-up task");
        Ok(CapabilityOutput::Text(format!("created {}", task.id)))
    }
}

/// Records text verbatim: `note(text=...)`.
pub struct Note;

#[async_trait]
impl Capability for Note {
    fn name(&self) -> &str {
        "note"
    }

    fn description(&self) -> &str {
        "Record a note in the transcript"
    }

    async fn invoke(&self, _ctx: &CallContext, arguments: &Arguments) -> Result<CapabilityOutput> {
        let text = arguments
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default();
        Ok(CapabilityOutput::Text(text.to_string()))
    }
}
