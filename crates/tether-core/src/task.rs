use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Open key/value map for producer-specific extensions (supersession links,
/// call plans, source identifiers).
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Comment author used by the scheduler loop.
pub const AUTHOR_SCHEDULER: &str = "scheduler";
/// Comment author used for interrupt notes and agent summaries.
pub const AUTHOR_AGENT: &str = "agent";
/// Comment author used by the resume gateway for recorded human responses.
pub const AUTHOR_HUMAN: &str = "human";

/// Unique task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub i64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TASK-{:04}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = std::num::ParseIntError;

    /// Accepts both `42` and `TASK-0042`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.trim().trim_start_matches("TASK-");
        digits.parse::<i64>().map(TaskId)
    }
}

/// Task lifecycle.
///
/// Transitions:
///   New -> InProgress (claim) | Waiting
///   UserInputReceived -> InProgress (claim)
///   InProgress -> Done | Failed | NeedsReview | New/UserInputReceived (lease reclaim)
///   NeedsReview -> UserInputReceived (resume gateway)
///   Waiting -> New
///   any non-terminal -> Done | Failed (operator intervention)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    New,
    InProgress,
    NeedsReview,
    UserInputReceived,
    Waiting,
    Done,
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 7] = [
        TaskStatus::New,
        TaskStatus::InProgress,
        TaskStatus::NeedsReview,
        TaskStatus::UserInputReceived,
        TaskStatus::Waiting,
        TaskStatus::Done,
        TaskStatus::Failed,
    ];

    /// Short label for display and filtering.
    pub fn label(&self) -> &'static str {
        match self {
            TaskStatus::New => "new",
            TaskStatus::InProgress => "in-progress",
            TaskStatus::NeedsReview => "needs-review",
            TaskStatus::UserInputReceived => "user-input-received",
            TaskStatus::Waiting => "waiting",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed)
    }

    /// Whether a human decision is being waited on.
    pub fn needs_human(&self) -> bool {
        matches!(self, TaskStatus::NeedsReview)
    }

    /// Whether the scheduler may claim a task in this status.
    pub fn is_claimable(&self) -> bool {
        matches!(self, TaskStatus::New | TaskStatus::UserInputReceived)
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        if self.is_terminal() {
            return false;
        }
        if *self == next {
            return true;
        }
        match (self, next) {
            (_, Done | Failed) => true,
            (New | UserInputReceived, InProgress) => true,
            (_, InProgress) => false,
            (InProgress, NeedsReview | New | UserInputReceived) => true,
            (NeedsReview, UserInputReceived) => true,
            (New, Waiting) | (Waiting, New) => true,
            _ => false,
        }
    }

    /// Whether a producer or operator may request `self -> next` through a
    /// plain update. Claiming, finishing a run and ending a suspension each
    /// have their own guarded path.
    pub fn allows_external_transition(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        if *self == InProgress {
            return false;
        }
        if *self == next {
            return !self.is_terminal();
        }
        !matches!(next, InProgress | UserInputReceived) && self.can_transition_to(next)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    /// Accepts labels (`needs-review`) and wire names (`NEEDS_REVIEW`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('_', "-");
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.label() == normalized)
            .ok_or_else(|| {
                let known: Vec<_> = TaskStatus::ALL.iter().map(|s| s.label()).collect();
                format!("unknown status '{s}' (expected one of: {})", known.join(", "))
            })
    }
}

/// One entry in a task's append-only comment log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub author: String,
    pub timestamp: DateTime<Utc>,
    pub text: String,
}

impl Comment {
    pub fn new(author: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            author: author.into(),
            timestamp: Utc::now(),
            text: text.into(),
        }
    }
}

/// Exclusive processing rights recorded on an in-progress task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    /// Scheduler instance that holds the claim.
    pub owner: String,
    /// Value of `Task::run_count` when the claim was taken.
    pub run: u32,
    /// Status the task was claimed from; restored when the lease expires.
    pub claimed_from: TaskStatus,
    pub acquired_at: DateTime<Utc>,
    pub renewed_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, ttl: chrono::Duration, now: DateTime<Utc>) -> bool {
        now - self.renewed_at > ttl
    }

    pub fn guard(&self, task_id: TaskId) -> LeaseGuard {
        LeaseGuard {
            task_id,
            owner: self.owner.clone(),
            run: self.run,
        }
    }
}

/// Proof of a claim, required for every write the claim holder makes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseGuard {
    pub task_id: TaskId,
    pub owner: String,
    pub run: u32,
}

impl LeaseGuard {
    pub fn matches(&self, lease: Option<&Lease>) -> bool {
        lease.is_some_and(|l| l.owner == self.owner && l.run == self.run)
    }
}

/// A durable unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub status: TaskStatus,
    #[serde(default)]
    pub comments: Vec<Comment>,
    #[serde(default)]
    pub metadata: Metadata,
    /// How many times this task has been claimed.
    #[serde(default)]
    pub run_count: u32,
    /// Present while the task is in progress.
    #[serde(default)]
    pub lease: Option<Lease>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a new task in `New` status. The ID is assigned by the store.
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId(0),
            title: title.into(),
            description: description.into(),
            tags: Vec::new(),
            status: TaskStatus::New,
            comments: Vec::new(),
            metadata: Metadata::new(),
            run_count: 0,
            lease: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn last_comment(&self) -> Option<&Comment> {
        self.comments.last()
    }

    /// Guard for the current lease, if the task is claimed.
    pub fn lease_guard(&self) -> Option<LeaseGuard> {
        self.lease.as_ref().map(|l| l.guard(self.id))
    }
}

/// Producer input for a new task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewTask {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl NewTask {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn meta(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn into_task(self) -> Task {
        Task::new(self.title, self.description)
            .with_tags(self.tags)
            .with_metadata(self.metadata)
    }
}

/// Partial update applied by producers and operators.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskUpdate {
    #[serde(default)]
    pub status: Option<TaskStatus>,
    /// Appended, never replacing earlier comments.
    #[serde(default)]
    pub comment: Option<Comment>,
    /// Merged key by key; a JSON `null` value removes the key.
    #[serde(default)]
    pub metadata: Option<Metadata>,
}

impl TaskUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn comment(author: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            comment: Some(Comment::new(author, text)),
            ..Self::default()
        }
    }

    pub fn with_comment(mut self, author: impl Into<String>, text: impl Into<String>) -> Self {
        self.comment = Some(Comment::new(author, text));
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.comment.is_none() && self.metadata.is_none()
    }
}

/// Merge `patch` into `target`; `null` values delete keys.
pub fn merge_metadata(target: &mut Metadata, patch: Metadata) {
    for (key, value) in patch {
        if value.is_null() {
            target.remove(&key);
        } else {
            target.insert(key, value);
        }
    }
}
