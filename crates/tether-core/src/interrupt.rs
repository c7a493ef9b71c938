//! Interrupts: the single representation of "execution is waiting on a human".

use crate::checkpoint::Arguments;
use crate::pattern::format_call;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptKind {
    Question,
    ToolApproval,
    /// Any kind written by a newer producer. Handled like `Question`.
    #[serde(other)]
    Unknown,
}

impl InterruptKind {
    pub fn label(&self) -> &'static str {
        match self {
            InterruptKind::Question => "question",
            InterruptKind::ToolApproval => "tool_approval",
            InterruptKind::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for InterruptKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interrupt {
    pub kind: InterruptKind,
    /// `{"text": ...}` for questions, `{"capability": ..., "arguments": {...}}`
    /// for tool approvals.
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

impl Interrupt {
    pub fn question(text: impl Into<String>) -> Self {
        Self {
            kind: InterruptKind::Question,
            payload: json!({ "text": text.into() }),
            created_at: Utc::now(),
        }
    }

    pub fn tool_approval(capability: &str, arguments: &Arguments) -> Self {
        Self {
            kind: InterruptKind::ToolApproval,
            payload: json!({ "capability": capability, "arguments": arguments }),
            created_at: Utc::now(),
        }
    }

    pub fn question_text(&self) -> Option<&str> {
        self.payload.get("text").and_then(Value::as_str)
    }

    /// Capability and arguments a tool approval asks about.
    pub fn requested_call(&self) -> Option<(&str, Arguments)> {
        let capability = self.payload.get("capability")?.as_str()?;
        let arguments = self
            .payload
            .get("arguments")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        Some((capability, arguments))
    }

    /// One-line rendering for events and listings.
    pub fn summary(&self) -> String {
        match self.kind {
            InterruptKind::ToolApproval => match self.requested_call() {
                Some((capability, arguments)) => format_call(capability, &arguments),
                None => self.payload.to_string(),
            },
            InterruptKind::Question | InterruptKind::Unknown => self
                .question_text()
                .map(str::to_string)
                .unwrap_or_else(|| self.payload.to_string()),
        }
    }

    /// Comment text appended to the task when it is parked for review.
    pub fn describe(&self) -> String {
        match self.kind {
            InterruptKind::ToolApproval => {
                let Some((capability, arguments)) = self.requested_call() else {
                    return format!("Approval required for an unreadable request: {}", self.payload);
                };
                let mut text = format!("Approval required for capability `{capability}`.\n");
                if arguments.is_empty() {
                    text.push_str("\nNo arguments.\n");
                } else {
                    text.push_str("\nArguments:\n");
                    for (key, value) in &arguments {
                        let rendered = match value {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        text.push_str(&format!("  {key} = {rendered}\n"));
                    }
                }
                text.push_str("\nRespond with approve, always_allow, or deny.");
                text
            }
            InterruptKind::Question | InterruptKind::Unknown => format!(
                "Question from the agent:\n\n{}\n\nRespond with a free-text answer.",
                self.summary()
            ),
        }
    }
}
