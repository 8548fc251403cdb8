use crate::task::context::ContextId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Unique identifier for tasks
pub type TaskId = Uuid;

/// Crate-wide result type
pub type Result<T> = std::result::Result<T, TaskEngineError>;

/// Task status
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskStatus {
    /// Status is undefined
    Undefined,
    /// Task is idle
    Idle,
    /// Task is currently running
    Running,
    /// Task is running, but its operating time is not known
    RunningIndeterminate,
    /// Task has finished successfully
    Finished,
    /// Task is about to be aborted
    AboutToBeAborted,
    /// Task is in the process of being aborted
    Aborting,
    /// Task has been aborted
    Aborted,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 8] = [
        TaskStatus::Undefined,
        TaskStatus::Idle,
        TaskStatus::Running,
        TaskStatus::RunningIndeterminate,
        TaskStatus::Finished,
        TaskStatus::AboutToBeAborted,
        TaskStatus::Aborting,
        TaskStatus::Aborted,
    ];

    /// Human readable status name
    pub fn name(&self) -> &'static str {
        match self {
            TaskStatus::Undefined => "Undefined",
            TaskStatus::Idle => "Idle",
            TaskStatus::Running => "Running",
            TaskStatus::RunningIndeterminate => "Running indeterminate",
            TaskStatus::Finished => "Finished",
            TaskStatus::AboutToBeAborted => "About to be aborted",
            TaskStatus::Aborting => "Aborting",
            TaskStatus::Aborted => "Aborted",
        }
    }

    /// Whether work is in progress
    pub fn is_running(&self) -> bool {
        matches!(self, TaskStatus::Running | TaskStatus::RunningIndeterminate)
    }

    /// Whether the task settled after doing work
    pub fn is_settled(&self) -> bool {
        matches!(self, TaskStatus::Finished | TaskStatus::Aborted)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How the progress of a task is determined
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum ProgressMode {
    /// Progress is set directly with `set_progress`
    #[default]
    Manual,
    /// Progress is the fraction of finished subtasks
    Subtasks,
    /// Progress and status are derived from the child tasks
    Aggregate,
}

impl ProgressMode {
    pub fn name(&self) -> &'static str {
        match self {
            ProgressMode::Manual => "Manual",
            ProgressMode::Subtasks => "Subtasks",
            ProgressMode::Aggregate => "Aggregate",
        }
    }
}

/// Where a task should be surfaced to the user; opaque to the engine
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskScope {
    /// No explicit presentation (still listed in the registry)
    None,
    /// Aggregated into one overarching background task
    Background,
    /// Shown in a popup while running
    Foreground,
    /// Shown in a modal dialog
    Modal,
    /// Shown next to the owning dataset
    DataHierarchy,
}

impl TaskScope {
    pub fn name(&self) -> &'static str {
        match self {
            TaskScope::None => "None",
            TaskScope::Background => "Background",
            TaskScope::Foreground => "Foreground",
            TaskScope::Modal => "Modal",
            TaskScope::DataHierarchy => "Data hierarchy",
        }
    }

    /// Whether at least one scope is present in both sets
    pub fn overlap(a: &BTreeSet<TaskScope>, b: &BTreeSet<TaskScope>) -> bool {
        a.intersection(b).next().is_some()
    }
}

/// Named completion slot used in [`ProgressMode::Subtasks`]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct Subtask {
    pub name: String,
    pub finished: bool,
}

/// Addresses a subtask by position or by name
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubtaskRef {
    Index(usize),
    Name(String),
}

impl From<usize> for SubtaskRef {
    fn from(index: usize) -> Self {
        SubtaskRef::Index(index)
    }
}

impl From<&str> for SubtaskRef {
    fn from(name: &str) -> Self {
        SubtaskRef::Name(name.to_string())
    }
}

/// Custom progress text, overrides the standard text when installed
///
/// Runs outside the task tree lock, so it may read any task through a
/// [`TaskHandle`](crate::task::TaskHandle). The snapshot's `progress_text` holds
/// the standard text the task would show without a formatter.
#[derive(Clone)]
pub struct ProgressTextFormatter(Arc<dyn Fn(&TaskSnapshot) -> String + Send + Sync>);

impl ProgressTextFormatter {
    pub fn new<F>(format: F) -> Self
    where
        F: Fn(&TaskSnapshot) -> String + Send + Sync + 'static,
    {
        Self(Arc::new(format))
    }

    pub fn format(&self, snapshot: &TaskSnapshot) -> String {
        (self.0)(snapshot)
    }
}

impl fmt::Debug for ProgressTextFormatter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ProgressTextFormatter(..)")
    }
}

/// Errors returned to callers of the engine
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskEngineError {
    #[error("Task {0} not found")]
    TaskNotFound(TaskId),

    #[error("Task {0} cannot be its own parent")]
    SelfParent(TaskId),

    #[error("Attaching {task} to {parent} would create a cycle")]
    Cycle { task: TaskId, parent: TaskId },

    #[error("Task {0} belongs to a different task manager")]
    ForeignTask(TaskId),

    #[error("Mutation queue of context {context} is full ({capacity} pending)")]
    QueueFull { context: ContextId, capacity: usize },
}

/// Specification for creating a new task
#[derive(Clone, Debug)]
pub struct TaskSpec {
    pub name: String,
    pub description: String,
    pub status: TaskStatus,
    pub may_kill: bool,
    pub enabled: bool,
    pub visible: bool,
    pub scopes: BTreeSet<TaskScope>,
    pub parent: Option<TaskId>,
}

impl TaskSpec {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_may_kill(mut self, may_kill: bool) -> Self {
        self.may_kill = may_kill;
        self
    }

    pub fn with_parent(mut self, parent: TaskId) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_scopes<I: IntoIterator<Item = TaskScope>>(mut self, scopes: I) -> Self {
        self.scopes = scopes.into_iter().collect();
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn hidden(mut self) -> Self {
        self.visible = false;
        self
    }
}

impl Default for TaskSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            description: String::new(),
            status: TaskStatus::Undefined,
            may_kill: false,
            enabled: true,
            visible: true,
            scopes: BTreeSet::from([TaskScope::None]),
            parent: None,
        }
    }
}

/// Status application scheduled for later
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeferredStatus {
    pub status: TaskStatus,
    pub recursive: bool,
    pub due: Instant,
}

/// Point-in-time copy of a task, safe to hand to other threads or serialize
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub name: String,
    pub description: String,
    pub status: TaskStatus,
    pub progress_mode: ProgressMode,
    pub progress: f32,
    pub progress_description: String,
    pub progress_text: String,
    pub subtasks: Vec<Subtask>,
    pub enabled: bool,
    pub visible: bool,
    pub may_kill: bool,
    pub killable: bool,
    pub scopes: BTreeSet<TaskScope>,
    pub parent_id: Option<TaskId>,
    pub children: Vec<TaskId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Task node stored in the task tree arena
#[derive(Debug)]
pub struct TaskNode {
    pub id: TaskId,
    pub name: String,
    pub description: String,
    pub owner: ContextId,
    pub status: TaskStatus,
    pub enabled: bool,
    pub visible: bool,
    pub may_kill: bool,
    pub scopes: BTreeSet<TaskScope>,
    pub progress_mode: ProgressMode,
    pub progress: f32,
    pub subtasks: Vec<Subtask>,
    pub progress_description: String,
    pub progress_text: String,
    pub formatter: Option<ProgressTextFormatter>,
    pub parent_id: Option<TaskId>,
    pub children: Vec<TaskId>,
    pub deferred_status: Option<DeferredStatus>,
    pub description_clear_at: Option<Instant>,
    pub cancellation: CancellationToken,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskNode {
    /// Create a freestanding node owned by `owner`
    pub fn new(spec: &TaskSpec, owner: ContextId) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: spec.name.clone(),
            description: spec.description.clone(),
            owner,
            status: spec.status,
            enabled: spec.enabled,
            visible: spec.visible,
            may_kill: spec.may_kill,
            scopes: spec.scopes.clone(),
            progress_mode: ProgressMode::Manual,
            progress: 0.0,
            subtasks: Vec::new(),
            progress_description: String::new(),
            progress_text: String::new(),
            formatter: None,
            parent_id: None,
            children: Vec::new(),
            deferred_status: None,
            description_clear_at: None,
            cancellation: CancellationToken::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Killable when allowed to be killed and currently running
    pub fn is_killable(&self) -> bool {
        self.may_kill && self.status.is_running()
    }

    /// Whether a direct change to `status` is permitted
    pub fn accepts_status(&self, status: TaskStatus) -> bool {
        if status == self.status {
            return false;
        }

        !(self.status == TaskStatus::Aborted && status == TaskStatus::Finished)
    }

    /// Index of the first subtask called `name`
    pub fn subtask_index(&self, name: &str) -> Option<usize> {
        self.subtasks.iter().position(|subtask| subtask.name == name)
    }

    pub fn resolve_subtask(&self, subtask: &SubtaskRef) -> Option<usize> {
        match subtask {
            SubtaskRef::Index(index) if *index < self.subtasks.len() => Some(*index),
            SubtaskRef::Index(_) => None,
            SubtaskRef::Name(name) => self.subtask_index(name),
        }
    }

    /// Earliest pending timer of this node
    pub fn next_deadline(&self) -> Option<Instant> {
        let deferred = self.deferred_status.map(|deferred| deferred.due);
        match (deferred, self.description_clear_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Schedule the progress description to be cleared after `delay`
    pub fn schedule_description_clear(&mut self, now: Instant, delay: Duration) {
        self.description_clear_at = if delay.is_zero() || self.progress_description.is_empty() {
            None
        } else {
            Some(now + delay)
        };
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id,
            name: self.name.clone(),
            description: self.description.clone(),
            status: self.status,
            progress_mode: self.progress_mode,
            progress: self.progress,
            progress_description: self.progress_description.clone(),
            progress_text: self.progress_text.clone(),
            subtasks: self.subtasks.clone(),
            enabled: self.enabled,
            visible: self.visible,
            may_kill: self.may_kill,
            killable: self.is_killable(),
            scopes: self.scopes.clone(),
            parent_id: self.parent_id,
            children: self.children.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}
