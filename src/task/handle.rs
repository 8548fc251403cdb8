//! Public per-task API.
//!
//! [`Task`] is the owning value handed out by [`TaskManager::create_task`]. When
//! it is dropped, on any thread, the task leaves the registry at once; its
//! parent and children update their links on their own contexts. [`TaskHandle`] is a cheap non-owning reference
//! that can be cloned and sent to worker threads.
//!
//! Accessors read the last applied state. On a destroyed task they return
//! defaults (`Undefined`, `0.0`, empty strings). Mutators return
//! [`TaskEngineError::TaskNotFound`] for destroyed tasks.

use crate::task::context::Mutation;
use crate::task::manager::TaskManager;
use crate::task::types::*;
use std::collections::BTreeSet;
use std::fmt;
use std::ops::Deref;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Owning handle, destroys the task when dropped
pub struct Task {
    handle: TaskHandle,
}

impl Task {
    pub(crate) fn new(handle: TaskHandle) -> Self {
        Self { handle }
    }

    /// Non-owning handle to this task
    pub fn handle(&self) -> TaskHandle {
        self.handle.clone()
    }
}

impl Deref for Task {
    type Target = TaskHandle;

    fn deref(&self) -> &TaskHandle {
        &self.handle
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        if let Err(e) = self.handle.manager.destroy(self.handle.id) {
            debug!("Task {} already gone on drop: {}", self.handle.id, e);
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Task").field(&self.handle.id).finish()
    }
}

/// Non-owning reference to a task
#[derive(Clone)]
pub struct TaskHandle {
    manager: TaskManager,
    id: TaskId,
}

impl PartialEq for TaskHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.manager.same_manager(&other.manager)
    }
}

impl Eq for TaskHandle {}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle").field("id", &self.id).finish()
    }
}

impl TaskHandle {
    pub(crate) fn new(manager: TaskManager, id: TaskId) -> Self {
        Self { manager, id }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn manager(&self) -> &TaskManager {
        &self.manager
    }

    /// Whether the task has not been destroyed yet
    pub fn exists(&self) -> bool {
        self.read(|_| ()).is_some()
    }

    pub fn snapshot(&self) -> Option<TaskSnapshot> {
        self.read(TaskNode::snapshot)
    }

    fn read<R>(&self, f: impl FnOnce(&TaskNode) -> R) -> Option<R> {
        self.manager.with_task(self.id, f)
    }

    fn send(&self, mutation: Mutation) -> Result<()> {
        self.manager.dispatch(self.id, mutation)
    }

    fn handles(&self, ids: Vec<TaskId>) -> Vec<TaskHandle> {
        ids.into_iter()
            .map(|id| TaskHandle::new(self.manager.clone(), id))
            .collect()
    }

    // ------------------------------------------------------------------
    // Identity and flags
    // ------------------------------------------------------------------

    pub fn name(&self) -> String {
        self.read(|node| node.name.clone()).unwrap_or_default()
    }

    pub fn set_name(&self, name: &str) -> Result<()> {
        self.send(Mutation::SetName(name.to_string()))
    }

    pub fn description(&self) -> String {
        self.read(|node| node.description.clone()).unwrap_or_default()
    }

    pub fn set_description(&self, description: &str) -> Result<()> {
        self.send(Mutation::SetDescription(description.to_string()))
    }

    pub fn is_enabled(&self) -> bool {
        self.read(|node| node.enabled).unwrap_or(false)
    }

    pub fn set_enabled(&self, enabled: bool, recursive: bool) -> Result<()> {
        self.send(Mutation::SetEnabled { enabled, recursive })
    }

    pub fn is_visible(&self) -> bool {
        self.read(|node| node.visible).unwrap_or(false)
    }

    pub fn set_visible(&self, visible: bool) -> Result<()> {
        self.send(Mutation::SetVisible(visible))
    }

    pub fn may_kill(&self) -> bool {
        self.read(|node| node.may_kill).unwrap_or(false)
    }

    pub fn set_may_kill(&self, may_kill: bool, recursive: bool) -> Result<()> {
        self.send(Mutation::SetMayKill {
            may_kill,
            recursive,
        })
    }

    pub fn scopes(&self) -> BTreeSet<TaskScope> {
        self.read(|node| node.scopes.clone()).unwrap_or_default()
    }

    pub fn has_scope(&self, scope: TaskScope) -> bool {
        self.read(|node| node.scopes.contains(&scope))
            .unwrap_or(false)
    }

    pub fn set_scopes<I: IntoIterator<Item = TaskScope>>(&self, scopes: I) -> Result<()> {
        self.send(Mutation::SetScopes(scopes.into_iter().collect()))
    }

    pub fn add_scope(&self, scope: TaskScope) -> Result<()> {
        self.send(Mutation::AddScope(scope))
    }

    pub fn remove_scope(&self, scope: TaskScope) -> Result<()> {
        self.send(Mutation::RemoveScope(scope))
    }

    // ------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------

    pub fn status(&self) -> TaskStatus {
        self.read(|node| node.status)
            .unwrap_or(TaskStatus::Undefined)
    }

    pub fn set_status(&self, status: TaskStatus, recursive: bool) -> Result<()> {
        self.send(Mutation::SetStatus { status, recursive })
    }

    /// Apply `status` after `delay` (the configured default when `None`)
    ///
    /// Replaces a pending deferred status; any immediate status change cancels it.
    pub fn set_status_deferred(
        &self,
        status: TaskStatus,
        recursive: bool,
        delay: Option<Duration>,
    ) -> Result<()> {
        let delay = delay.unwrap_or_else(|| self.manager.config().deferred_status_delay());
        self.send(Mutation::SetStatusDeferred {
            status,
            recursive,
            delay,
        })
    }

    pub fn set_undefined(&self) -> Result<()> {
        self.set_status(TaskStatus::Undefined, false)
    }

    pub fn set_idle(&self) -> Result<()> {
        self.set_status(TaskStatus::Idle, false)
    }

    pub fn set_running(&self) -> Result<()> {
        self.set_status(TaskStatus::Running, false)
    }

    pub fn set_running_indeterminate(&self) -> Result<()> {
        self.set_status(TaskStatus::RunningIndeterminate, false)
    }

    pub fn set_finished(&self) -> Result<()> {
        self.set_status(TaskStatus::Finished, false)
    }

    pub fn set_about_to_be_aborted(&self) -> Result<()> {
        self.set_status(TaskStatus::AboutToBeAborted, false)
    }

    pub fn set_aborting(&self) -> Result<()> {
        self.set_status(TaskStatus::Aborting, false)
    }

    pub fn set_aborted(&self) -> Result<()> {
        self.set_status(TaskStatus::Aborted, false)
    }

    pub fn is_undefined(&self) -> bool {
        self.status() == TaskStatus::Undefined
    }

    pub fn is_idle(&self) -> bool {
        self.status() == TaskStatus::Idle
    }

    pub fn is_running(&self) -> bool {
        self.status() == TaskStatus::Running
    }

    pub fn is_running_indeterminate(&self) -> bool {
        self.status() == TaskStatus::RunningIndeterminate
    }

    pub fn is_finished(&self) -> bool {
        self.status() == TaskStatus::Finished
    }

    pub fn is_about_to_be_aborted(&self) -> bool {
        self.status() == TaskStatus::AboutToBeAborted
    }

    pub fn is_aborting(&self) -> bool {
        self.status() == TaskStatus::Aborting
    }

    pub fn is_aborted(&self) -> bool {
        self.status() == TaskStatus::Aborted
    }

    pub fn is_killable(&self) -> bool {
        self.read(TaskNode::is_killable).unwrap_or(false)
    }

    /// Force `Idle`, clear progress and description, drop any deferred status
    /// and re-arm the cancellation token
    pub fn reset(&self, recursive: bool) -> Result<()> {
        self.send(Mutation::Reset { recursive })
    }

    // ------------------------------------------------------------------
    // Cancellation
    // ------------------------------------------------------------------

    /// Request cooperative cancellation; ignored unless the task is killable
    pub fn kill(&self, recursive: bool) -> Result<()> {
        self.send(Mutation::Kill { recursive })
    }

    /// Token cancelled when the task is killed. A destroyed task yields an
    /// already cancelled token.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.read(|node| node.cancellation.clone())
            .unwrap_or_else(|| {
                let token = CancellationToken::new();
                token.cancel();
                token
            })
    }

    pub fn abort_requested(&self) -> bool {
        self.cancellation_token().is_cancelled()
    }

    // ------------------------------------------------------------------
    // Progress
    // ------------------------------------------------------------------

    pub fn progress(&self) -> f32 {
        self.read(|node| node.progress).unwrap_or(0.0)
    }

    pub fn progress_mode(&self) -> ProgressMode {
        self.read(|node| node.progress_mode).unwrap_or_default()
    }

    pub fn set_progress_mode(&self, mode: ProgressMode) -> Result<()> {
        self.send(Mutation::SetProgressMode(mode))
    }

    /// Set manual progress, clamped to [0, 1]; a non-empty description also
    /// replaces the progress description
    pub fn set_progress(&self, progress: f32, description: Option<&str>) -> Result<()> {
        self.send(Mutation::SetProgress {
            progress,
            description: description.map(str::to_string),
        })
    }

    pub fn reset_progress(&self, recursive: bool) -> Result<()> {
        self.send(Mutation::ResetProgress { recursive })
    }

    /// Text from the custom formatter when one is installed, the standard
    /// text otherwise
    pub fn progress_text(&self) -> String {
        if let Some(text) = self.manager.format_progress_text(self.id) {
            return text;
        }
        self.read(|node| node.progress_text.clone())
            .unwrap_or_default()
    }

    pub fn progress_description(&self) -> String {
        self.read(|node| node.progress_description.clone())
            .unwrap_or_default()
    }

    /// Set the progress description, optionally clearing it after `clear_after`
    pub fn set_progress_description(
        &self,
        description: &str,
        clear_after: Option<Duration>,
    ) -> Result<()> {
        self.send(Mutation::SetProgressDescription {
            description: description.to_string(),
            clear_after,
        })
    }

    pub fn set_progress_text_formatter(&self, formatter: Option<ProgressTextFormatter>) -> Result<()> {
        self.send(Mutation::SetProgressTextFormatter(formatter))
    }

    // ------------------------------------------------------------------
    // Subtasks
    // ------------------------------------------------------------------

    /// Switch to subtasks mode with `count` unnamed subtasks
    pub fn set_subtasks(&self, count: usize) -> Result<()> {
        self.send(Mutation::SetSubtasks(vec![String::new(); count]))
    }

    /// Switch to subtasks mode with one subtask per name
    pub fn set_subtasks_named<I, S>(&self, names: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.send(Mutation::SetSubtasks(
            names.into_iter().map(Into::into).collect(),
        ))
    }

    pub fn set_subtask_started(
        &self,
        subtask: impl Into<SubtaskRef>,
        description: Option<&str>,
    ) -> Result<()> {
        self.send(Mutation::SubtaskStarted {
            subtask: subtask.into(),
            description: description.map(str::to_string),
        })
    }

    pub fn set_subtask_finished(
        &self,
        subtask: impl Into<SubtaskRef>,
        description: Option<&str>,
    ) -> Result<()> {
        self.send(Mutation::SubtaskFinished {
            subtask: subtask.into(),
            description: description.map(str::to_string),
        })
    }

    pub fn set_subtask_name(&self, index: usize, name: &str) -> Result<()> {
        self.send(Mutation::SetSubtaskName {
            index,
            name: name.to_string(),
        })
    }

    pub fn subtask_names(&self) -> Vec<String> {
        self.read(|node| {
            node.subtasks
                .iter()
                .map(|subtask| subtask.name.clone())
                .collect()
        })
        .unwrap_or_default()
    }

    pub fn subtask_index(&self, name: &str) -> Option<usize> {
        self.read(|node| node.subtask_index(name)).flatten()
    }

    pub fn finished_subtasks(&self) -> Vec<bool> {
        self.read(|node| node.subtasks.iter().map(|subtask| subtask.finished).collect())
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Hierarchy
    // ------------------------------------------------------------------

    pub fn parent_task(&self) -> Option<TaskHandle> {
        self.read(|node| node.parent_id)
            .flatten()
            .map(|parent_id| TaskHandle::new(self.manager.clone(), parent_id))
    }

    /// Attach under `parent`, or detach with `None`
    ///
    /// Self-parenting, cycles and parents from another manager are rejected
    /// before anything is queued.
    pub fn set_parent_task(&self, parent: Option<&TaskHandle>) -> Result<()> {
        if let Some(parent) = parent {
            if !parent.manager.same_manager(&self.manager) {
                return Err(TaskEngineError::ForeignTask(parent.id));
            }
        }

        let parent_id = parent.map(TaskHandle::id);
        self.manager.validate_parent(self.id, parent_id)?;
        self.send(Mutation::SetParent(parent_id))
    }

    /// Children in insertion order, or all descendants pre-order when
    /// `recursive`; `enabled_only` skips disabled children and their subtrees
    pub fn child_tasks(&self, recursive: bool, enabled_only: bool) -> Vec<TaskHandle> {
        self.handles(self.manager.child_ids(self.id, recursive, enabled_only))
    }

    /// Like [`child_tasks`](Self::child_tasks), keeping only tasks with one of
    /// `statuses` and one of `scopes` (empty slices accept everything)
    pub fn child_tasks_for(
        &self,
        recursive: bool,
        enabled_only: bool,
        statuses: &[TaskStatus],
        scopes: &[TaskScope],
    ) -> Vec<TaskHandle> {
        let ids = self
            .manager
            .filter_children(self.id, recursive, enabled_only, |node| {
                (statuses.is_empty() || statuses.contains(&node.status))
                    && (scopes.is_empty() || scopes.iter().any(|scope| node.scopes.contains(scope)))
            });
        self.handles(ids)
    }
}
