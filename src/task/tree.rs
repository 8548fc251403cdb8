use crate::config::TaskManagerConfig;
use crate::task::context::{ContextId, Envelope, Mutation};
use crate::task::manager::TaskEvent;
use crate::task::progress;
use crate::task::types::*;
use std::collections::{BTreeSet, HashMap, HashSet};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Side effects collected while applying mutations to the tree
///
/// Events are dispatched and forwarded envelopes are queued only after the tree
/// lock has been released.
#[derive(Debug)]
pub struct Effects {
    /// Context applying the mutations
    pub context: ContextId,
    pub now: Instant,
    pub events: Vec<TaskEvent>,
    /// Mutations for tasks owned by other contexts
    pub forwarded: Vec<(ContextId, Envelope)>,
    /// A timer of a task owned by `context` was armed
    pub timers_changed: bool,
    /// Tasks whose custom formatter must run once the lock is released
    pub reformat: Vec<TaskId>,
    /// Contexts left without any live task
    pub released: Vec<ContextId>,
}

impl Effects {
    pub fn new(context: ContextId) -> Self {
        Self {
            context,
            now: Instant::now(),
            events: Vec::new(),
            forwarded: Vec::new(),
            timers_changed: false,
            reformat: Vec::new(),
            released: Vec::new(),
        }
    }
}

/// Arena holding every live task and the parent/child linkage between them
#[derive(Debug)]
pub struct TaskTree {
    tasks: HashMap<TaskId, TaskNode>,
    /// Live task IDs in creation order
    registry: Vec<TaskId>,
    /// Live task count per owner context
    owned: HashMap<ContextId, usize>,
    description_linger: Duration,
    total_tasks_created: u64,
}

impl TaskTree {
    /// Create a new empty task tree
    pub fn new(config: &TaskManagerConfig) -> Self {
        Self {
            tasks: HashMap::new(),
            registry: Vec::new(),
            owned: HashMap::new(),
            description_linger: config.progress_description_linger(),
            total_tasks_created: 0,
        }
    }

    /// Add a new task owned by `owner`, attaching it to `spec.parent`
    pub fn insert(&mut self, spec: &TaskSpec, owner: ContextId, fx: &mut Effects) -> Result<TaskId> {
        if let Some(parent_id) = spec.parent {
            if !self.tasks.contains_key(&parent_id) {
                return Err(TaskEngineError::TaskNotFound(parent_id));
            }
        }

        let mut node = TaskNode::new(spec, owner);
        node.parent_id = spec.parent;
        node.progress_text = progress::standard_text(&node);
        let task_id = node.id;

        self.tasks.insert(task_id, node);
        self.registry.push(task_id);
        *self.owned.entry(owner).or_insert(0) += 1;
        self.total_tasks_created += 1;
        fx.events.push(TaskEvent::TaskCreated {
            task_id,
            parent_id: spec.parent,
        });

        if let Some(parent_id) = spec.parent {
            fx.events.push(TaskEvent::ParentTaskChanged {
                task_id,
                previous: None,
                current: Some(parent_id),
            });
            self.route(parent_id, Mutation::AddChild(task_id), fx);
        }

        debug!("Added task {} ({}) owned by {}", task_id, spec.name, owner);
        Ok(task_id)
    }

    pub fn get(&self, task_id: &TaskId) -> Option<&TaskNode> {
        self.tasks.get(task_id)
    }

    pub fn contains(&self, task_id: &TaskId) -> bool {
        self.tasks.contains_key(task_id)
    }

    pub fn owner_of(&self, task_id: &TaskId) -> Option<ContextId> {
        self.tasks.get(task_id).map(|node| node.owner)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn total_tasks_created(&self) -> u64 {
        self.total_tasks_created
    }

    /// Whether `context` owns any live task
    pub fn owns_tasks(&self, context: ContextId) -> bool {
        self.owned.contains_key(&context)
    }

    /// Live task IDs in creation order
    pub fn task_ids(&self) -> &[TaskId] {
        &self.registry
    }

    /// Live tasks in creation order
    pub fn iter(&self) -> impl Iterator<Item = &TaskNode> {
        self.registry.iter().filter_map(|task_id| self.tasks.get(task_id))
    }

    /// Whether `ancestor` is a (transitive) parent of `task_id`
    pub fn is_ancestor(&self, ancestor: TaskId, task_id: TaskId) -> bool {
        let mut current = self.tasks.get(&task_id).and_then(|node| node.parent_id);
        let mut steps = 0;

        while let Some(parent_id) = current {
            if parent_id == ancestor {
                return true;
            }
            steps += 1;
            if steps > self.tasks.len() {
                warn!("Parent chain of task {} does not terminate", task_id);
                return true;
            }
            current = self.tasks.get(&parent_id).and_then(|node| node.parent_id);
        }

        false
    }

    /// Check that `parent` may become the parent of `task_id`
    pub fn validate_parent(&self, task_id: TaskId, parent: Option<TaskId>) -> Result<()> {
        let Some(parent_id) = parent else {
            return Ok(());
        };

        if parent_id == task_id {
            return Err(TaskEngineError::SelfParent(task_id));
        }
        if !self.tasks.contains_key(&parent_id) {
            return Err(TaskEngineError::TaskNotFound(parent_id));
        }
        if self.is_ancestor(task_id, parent_id) {
            return Err(TaskEngineError::Cycle {
                task: task_id,
                parent: parent_id,
            });
        }

        Ok(())
    }

    /// Children of `task_id` in insertion order, optionally flattened pre-order
    pub fn child_ids(&self, task_id: TaskId, recursive: bool, enabled_only: bool) -> Vec<TaskId> {
        let mut children = Vec::new();
        self.collect_children(task_id, recursive, enabled_only, &mut children);
        children
    }

    fn collect_children(
        &self,
        task_id: TaskId,
        recursive: bool,
        enabled_only: bool,
        out: &mut Vec<TaskId>,
    ) {
        let Some(node) = self.tasks.get(&task_id) else {
            return;
        };

        for child_id in &node.children {
            let Some(child) = self.tasks.get(child_id) else {
                continue;
            };
            if enabled_only && !child.enabled {
                continue;
            }
            out.push(*child_id);
            if recursive {
                self.collect_children(*child_id, true, enabled_only, out);
            }
        }
    }

    /// Apply a mutation on behalf of `fx.context`
    pub fn apply(&mut self, envelope: Envelope, fx: &mut Effects) {
        let Envelope { task, mutation } = envelope;

        if !self.tasks.contains_key(&task) {
            debug!("Dropping {} for missing task {}", mutation.name(), task);
            return;
        }

        match mutation {
            Mutation::SetParent(parent) => self.set_parent(task, parent, fx),
            Mutation::SetName(name) => self.set_name(task, name, fx),
            Mutation::SetDescription(description) => self.set_description(task, description, fx),
            Mutation::SetEnabled { enabled, recursive } => {
                self.set_enabled(task, enabled, recursive, fx)
            }
            Mutation::SetVisible(visible) => self.set_visible(task, visible, fx),
            Mutation::SetMayKill {
                may_kill,
                recursive,
            } => self.set_may_kill(task, may_kill, recursive, fx),
            Mutation::Reset { recursive } => self.reset(task, recursive, fx),
            Mutation::SetStatus { status, recursive } => {
                self.set_status(task, status, recursive, fx)
            }
            Mutation::SetStatusDeferred {
                status,
                recursive,
                delay,
            } => self.set_status_deferred(task, status, recursive, delay, fx),
            Mutation::Kill { recursive } => self.kill(task, recursive, fx),
            Mutation::SetProgressMode(mode) => self.set_progress_mode(task, mode, fx),
            Mutation::SetScopes(scopes) => self.update_scopes(task, fx, |current| *current = scopes),
            Mutation::AddScope(scope) => self.update_scopes(task, fx, |current| {
                current.insert(scope);
            }),
            Mutation::RemoveScope(scope) => self.update_scopes(task, fx, |current| {
                current.remove(&scope);
            }),
            Mutation::ResetProgress { recursive } => self.reset_progress(task, recursive, fx),
            Mutation::SetProgress {
                progress,
                description,
            } => self.set_progress(task, progress, description, fx),
            Mutation::SetSubtasks(names) => self.set_subtasks(task, names, fx),
            Mutation::SubtaskStarted {
                subtask,
                description,
            } => self.subtask_started(task, subtask, description, fx),
            Mutation::SubtaskFinished {
                subtask,
                description,
            } => self.subtask_finished(task, subtask, description, fx),
            Mutation::SetSubtaskName { index, name } => {
                self.set_subtask_name(task, index, name, fx)
            }
            Mutation::SetProgressDescription {
                description,
                clear_after,
            } => self.set_progress_description(task, description, clear_after, fx),
            Mutation::SetProgressTextFormatter(formatter) => {
                if let Some(node) = self.tasks.get_mut(&task) {
                    node.formatter = formatter;
                }
                self.refresh_progress_text(task, fx);
            }
            Mutation::RefreshAggregate => self.refresh_aggregate(task, fx),
            Mutation::AddChild(child) => self.add_child(task, child, fx),
            Mutation::RemoveChild(child) => self.remove_child(task, child, fx),
            Mutation::ClearParent(former) => self.clear_parent(task, former, fx),
            Mutation::Destroy => self.destroy(task, fx),
        }
    }

    /// Apply locally when `task_id` is owned by `fx.context`, forward otherwise
    fn route(&mut self, task_id: TaskId, mutation: Mutation, fx: &mut Effects) {
        match self.owner_of(&task_id) {
            Some(owner) if owner == fx.context => self.apply(Envelope::new(task_id, mutation), fx),
            Some(owner) => fx.forwarded.push((owner, Envelope::new(task_id, mutation))),
            None => {}
        }
    }

    /// Route `mutation` to every direct child, in insertion order
    fn recurse(&mut self, task_id: TaskId, mutation: Mutation, fx: &mut Effects) {
        let children = self
            .tasks
            .get(&task_id)
            .map(|node| node.children.clone())
            .unwrap_or_default();

        for child_id in children {
            self.route(child_id, mutation.clone(), fx);
        }
    }

    fn notify_parent(&mut self, task_id: TaskId, fx: &mut Effects) {
        if let Some(parent_id) = self.tasks.get(&task_id).and_then(|node| node.parent_id) {
            self.route(parent_id, Mutation::RefreshAggregate, fx);
        }
    }

    fn refresh_progress_text(&mut self, task_id: TaskId, fx: &mut Effects) {
        let Some(node) = self.tasks.get_mut(&task_id) else {
            return;
        };

        if node.formatter.is_some() {
            if !fx.reformat.contains(&task_id) {
                fx.reformat.push(task_id);
            }
            return;
        }

        let text = progress::standard_text(node);
        if text != node.progress_text {
            node.progress_text = text.clone();
            fx.events.push(TaskEvent::ProgressTextChanged { task_id, text });
        }
    }

    /// Store text produced by a custom formatter, returning whether it changed
    pub fn store_progress_text(&mut self, task_id: TaskId, text: &str) -> bool {
        match self.tasks.get_mut(&task_id) {
            Some(node) if node.formatter.is_some() && node.progress_text != text => {
                node.progress_text = text.to_string();
                true
            }
            _ => false,
        }
    }

    // ------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------

    fn set_status(&mut self, task_id: TaskId, status: TaskStatus, recursive: bool, fx: &mut Effects) {
        let Some(node) = self.tasks.get_mut(&task_id) else {
            return;
        };

        if node.deferred_status.take().is_some() {
            debug!("Cancelled deferred status of task {}", task_id);
        }

        if node.progress_mode == ProgressMode::Aggregate {
            debug!(
                "Aggregate task {} ignores direct status {}",
                task_id, status
            );
        } else if node.accepts_status(status) {
            self.force_status(task_id, status, fx);
        } else {
            debug!(
                "Task {} ignores transition {} -> {}",
                task_id, node.status, status
            );
        }

        if recursive {
            self.recurse(
                task_id,
                Mutation::SetStatus {
                    status,
                    recursive: true,
                },
                fx,
            );
        }
    }

    /// Assign `status` without consulting the transition rules
    ///
    /// Returns false when the task already had `status`.
    fn force_status(&mut self, task_id: TaskId, status: TaskStatus, fx: &mut Effects) -> bool {
        let linger = self.description_linger;
        let Some(node) = self.tasks.get_mut(&task_id) else {
            return false;
        };

        let previous = node.status;
        if previous == status {
            return false;
        }

        let was_killable = node.is_killable();
        node.status = status;
        node.touch();
        fx.events.push(TaskEvent::StatusChanged {
            task_id,
            previous,
            current: status,
        });

        if status == TaskStatus::Finished && node.progress_mode != ProgressMode::Aggregate {
            node.subtasks.iter_mut().for_each(|subtask| subtask.finished = true);
            if progress::progress_changed(node.progress, 1.0) {
                node.progress = 1.0;
                fx.events.push(TaskEvent::ProgressChanged {
                    task_id,
                    progress: 1.0,
                });
            }
        }

        if status.is_settled() && !node.progress_description.is_empty() {
            node.schedule_description_clear(fx.now, linger);
            fx.timers_changed = true;
        }

        let killable = node.is_killable();
        if killable != was_killable {
            fx.events.push(TaskEvent::KillableChanged { task_id, killable });
        }

        self.refresh_progress_text(task_id, fx);
        self.notify_parent(task_id, fx);
        true
    }

    fn set_status_deferred(
        &mut self,
        task_id: TaskId,
        status: TaskStatus,
        recursive: bool,
        delay: Duration,
        fx: &mut Effects,
    ) {
        let Some(node) = self.tasks.get_mut(&task_id) else {
            return;
        };

        if node.deferred_status.is_some() {
            debug!("Replacing deferred status of task {}", task_id);
        }

        node.deferred_status = Some(DeferredStatus {
            status,
            recursive,
            due: fx.now + delay,
        });
        fx.timers_changed = true;
    }

    fn kill(&mut self, task_id: TaskId, recursive: bool, fx: &mut Effects) {
        let Some(node) = self.tasks.get_mut(&task_id) else {
            return;
        };

        if node.is_killable() {
            info!("Killing task {} ({})", task_id, node.name);
            node.deferred_status = None;
            node.cancellation.cancel();
            self.force_status(task_id, TaskStatus::AboutToBeAborted, fx);
            fx.events.push(TaskEvent::AbortRequested { task_id });
        } else {
            debug!("Task {} is not killable", task_id);
        }

        if recursive {
            self.recurse(task_id, Mutation::Kill { recursive: true }, fx);
        }
    }

    fn reset(&mut self, task_id: TaskId, recursive: bool, fx: &mut Effects) {
        let Some(node) = self.tasks.get_mut(&task_id) else {
            return;
        };

        node.deferred_status = None;
        node.description_clear_at = None;
        if node.cancellation.is_cancelled() {
            node.cancellation = CancellationToken::new();
        }
        node.touch();

        if !node.progress_description.is_empty() {
            node.progress_description.clear();
            fx.events.push(TaskEvent::ProgressDescriptionChanged {
                task_id,
                description: String::new(),
            });
        }

        if node.progress_mode == ProgressMode::Aggregate {
            // Status and progress follow the children
            if recursive {
                self.recurse(task_id, Mutation::Reset { recursive: true }, fx);
            }
            self.refresh_aggregate(task_id, fx);
            self.refresh_progress_text(task_id, fx);
            return;
        }

        node.subtasks.iter_mut().for_each(|subtask| subtask.finished = false);
        if progress::progress_changed(node.progress, 0.0) {
            node.progress = 0.0;
            fx.events.push(TaskEvent::ProgressChanged {
                task_id,
                progress: 0.0,
            });
        }

        if !self.force_status(task_id, TaskStatus::Idle, fx) {
            self.refresh_progress_text(task_id, fx);
            self.notify_parent(task_id, fx);
        }

        if recursive {
            self.recurse(task_id, Mutation::Reset { recursive: true }, fx);
        }
    }

    // ------------------------------------------------------------------
    // Progress
    // ------------------------------------------------------------------

    fn set_progress_mode(&mut self, task_id: TaskId, mode: ProgressMode, fx: &mut Effects) {
        let Some(node) = self.tasks.get_mut(&task_id) else {
            return;
        };

        if node.progress_mode == mode {
            return;
        }

        node.progress_mode = mode;
        node.touch();
        fx.events.push(TaskEvent::ProgressModeChanged { task_id, mode });

        match mode {
            ProgressMode::Subtasks => {
                let progress = progress::subtasks_progress(&node.subtasks);
                if progress::progress_changed(node.progress, progress) {
                    node.progress = progress;
                    fx.events.push(TaskEvent::ProgressChanged { task_id, progress });
                    self.notify_parent(task_id, fx);
                }
            }
            ProgressMode::Aggregate => self.refresh_aggregate(task_id, fx),
            ProgressMode::Manual => {}
        }

        self.refresh_progress_text(task_id, fx);
    }

    fn set_progress(
        &mut self,
        task_id: TaskId,
        progress: f32,
        description: Option<String>,
        fx: &mut Effects,
    ) {
        let Some(node) = self.tasks.get_mut(&task_id) else {
            return;
        };

        if node.progress_mode != ProgressMode::Manual {
            debug!(
                "Task {} ignores manual progress in {} mode",
                task_id,
                node.progress_mode.name()
            );
            return;
        }

        let Some(progress) = progress::clamp_progress(progress) else {
            debug!("Task {} ignores NaN progress", task_id);
            return;
        };

        let moved = progress::progress_changed(node.progress, progress);
        if moved {
            node.progress = progress;
            node.touch();
            fx.events.push(TaskEvent::ProgressChanged { task_id, progress });
        }

        if let Some(description) = description.filter(|description| !description.is_empty()) {
            self.assign_progress_description(task_id, description, fx);
        }

        self.refresh_progress_text(task_id, fx);
        if moved {
            self.notify_parent(task_id, fx);
        }
    }

    fn reset_progress(&mut self, task_id: TaskId, recursive: bool, fx: &mut Effects) {
        let Some(node) = self.tasks.get_mut(&task_id) else {
            return;
        };

        let moved = match node.progress_mode {
            ProgressMode::Manual | ProgressMode::Subtasks => {
                node.subtasks.iter_mut().for_each(|subtask| subtask.finished = false);
                let moved = progress::progress_changed(node.progress, 0.0);
                node.progress = 0.0;
                moved
            }
            ProgressMode::Aggregate => false,
        };

        if moved {
            node.touch();
            fx.events.push(TaskEvent::ProgressChanged {
                task_id,
                progress: 0.0,
            });
            self.notify_parent(task_id, fx);
        }
        self.refresh_progress_text(task_id, fx);

        if recursive {
            self.recurse(task_id, Mutation::ResetProgress { recursive: true }, fx);
        }
    }

    fn set_subtasks(&mut self, task_id: TaskId, names: Vec<String>, fx: &mut Effects) {
        let Some(node) = self.tasks.get_mut(&task_id) else {
            return;
        };

        node.subtasks = names
            .into_iter()
            .map(|name| Subtask {
                name,
                finished: false,
            })
            .collect();
        node.touch();

        if node.progress_mode != ProgressMode::Subtasks {
            node.progress_mode = ProgressMode::Subtasks;
            fx.events.push(TaskEvent::ProgressModeChanged {
                task_id,
                mode: ProgressMode::Subtasks,
            });
        }

        fx.events.push(TaskEvent::SubtasksChanged {
            task_id,
            names: node.subtasks.iter().map(|subtask| subtask.name.clone()).collect(),
        });

        let moved = progress::progress_changed(node.progress, 0.0);
        if moved {
            node.progress = 0.0;
            fx.events.push(TaskEvent::ProgressChanged {
                task_id,
                progress: 0.0,
            });
        }

        self.refresh_progress_text(task_id, fx);
        if moved {
            self.notify_parent(task_id, fx);
        }
    }

    fn subtask_started(
        &mut self,
        task_id: TaskId,
        subtask: SubtaskRef,
        description: Option<String>,
        fx: &mut Effects,
    ) {
        let Some(node) = self.tasks.get(&task_id) else {
            return;
        };

        if node.progress_mode != ProgressMode::Subtasks {
            debug!("Task {} is not in subtasks mode", task_id);
            return;
        }

        let Some(index) = node.resolve_subtask(&subtask) else {
            debug!("Task {} has no subtask {:?}", task_id, subtask);
            return;
        };

        let name = node.subtasks[index].name.clone();
        fx.events.push(TaskEvent::SubtaskStarted {
            task_id,
            index,
            name: name.clone(),
        });

        if let Some(description) = subtask_description(description, &name) {
            self.assign_progress_description(task_id, description, fx);
        }
        self.refresh_progress_text(task_id, fx);
    }

    fn subtask_finished(
        &mut self,
        task_id: TaskId,
        subtask: SubtaskRef,
        description: Option<String>,
        fx: &mut Effects,
    ) {
        let Some(node) = self.tasks.get_mut(&task_id) else {
            return;
        };

        if node.progress_mode != ProgressMode::Subtasks {
            debug!("Task {} is not in subtasks mode", task_id);
            return;
        }

        let Some(index) = node.resolve_subtask(&subtask) else {
            debug!("Task {} has no subtask {:?}", task_id, subtask);
            return;
        };

        let slot = &mut node.subtasks[index];
        let newly_finished = !slot.finished;
        slot.finished = true;
        let name = slot.name.clone();

        let progress = progress::subtasks_progress(&node.subtasks);
        let moved = progress::progress_changed(node.progress, progress);
        if moved {
            node.progress = progress;
            node.touch();
            fx.events.push(TaskEvent::ProgressChanged { task_id, progress });
        }
        if newly_finished {
            fx.events.push(TaskEvent::SubtaskFinished {
                task_id,
                index,
                name: name.clone(),
            });
        }

        if let Some(description) = subtask_description(description, &name) {
            self.assign_progress_description(task_id, description, fx);
        }
        self.refresh_progress_text(task_id, fx);
        if moved {
            self.notify_parent(task_id, fx);
        }
    }

    fn set_subtask_name(&mut self, task_id: TaskId, index: usize, name: String, fx: &mut Effects) {
        let Some(node) = self.tasks.get_mut(&task_id) else {
            return;
        };

        if node.progress_mode != ProgressMode::Subtasks {
            return;
        }

        let Some(slot) = node.subtasks.get_mut(index) else {
            debug!("Task {} has no subtask at index {}", task_id, index);
            return;
        };

        if slot.name != name {
            slot.name = name;
            fx.events.push(TaskEvent::SubtasksChanged {
                task_id,
                names: node.subtasks.iter().map(|subtask| subtask.name.clone()).collect(),
            });
        }
    }

    fn set_progress_description(
        &mut self,
        task_id: TaskId,
        description: String,
        clear_after: Option<Duration>,
        fx: &mut Effects,
    ) {
        self.assign_progress_description(task_id, description, fx);

        if let (Some(delay), Some(node)) = (clear_after, self.tasks.get_mut(&task_id)) {
            node.schedule_description_clear(fx.now, delay);
            fx.timers_changed = true;
        }

        self.refresh_progress_text(task_id, fx);
    }

    fn assign_progress_description(&mut self, task_id: TaskId, description: String, fx: &mut Effects) {
        let linger = self.description_linger;
        let Some(node) = self.tasks.get_mut(&task_id) else {
            return;
        };

        if node.progress_description != description {
            node.progress_description = description.clone();
            node.touch();
            fx.events.push(TaskEvent::ProgressDescriptionChanged {
                task_id,
                description,
            });
        }

        if node.status.is_settled() {
            node.schedule_description_clear(fx.now, linger);
            fx.timers_changed = true;
        } else {
            node.description_clear_at = None;
        }
    }

    // ------------------------------------------------------------------
    // Flags and naming
    // ------------------------------------------------------------------

    fn set_name(&mut self, task_id: TaskId, name: String, fx: &mut Effects) {
        let Some(node) = self.tasks.get_mut(&task_id) else {
            return;
        };

        if node.name != name {
            node.name = name.clone();
            node.touch();
            fx.events.push(TaskEvent::NameChanged { task_id, name });
            self.refresh_progress_text(task_id, fx);
        }
    }

    fn set_description(&mut self, task_id: TaskId, description: String, fx: &mut Effects) {
        let Some(node) = self.tasks.get_mut(&task_id) else {
            return;
        };

        if node.description != description {
            node.description = description.clone();
            node.touch();
            fx.events.push(TaskEvent::DescriptionChanged {
                task_id,
                description,
            });
        }
    }

    fn set_enabled(&mut self, task_id: TaskId, enabled: bool, recursive: bool, fx: &mut Effects) {
        let Some(node) = self.tasks.get_mut(&task_id) else {
            return;
        };

        if node.enabled != enabled {
            node.enabled = enabled;
            node.touch();
            fx.events.push(TaskEvent::EnabledChanged { task_id, enabled });
            self.notify_parent(task_id, fx);
        }

        if recursive {
            self.recurse(
                task_id,
                Mutation::SetEnabled {
                    enabled,
                    recursive: true,
                },
                fx,
            );
        }
    }

    fn set_visible(&mut self, task_id: TaskId, visible: bool, fx: &mut Effects) {
        let Some(node) = self.tasks.get_mut(&task_id) else {
            return;
        };

        if node.visible != visible {
            node.visible = visible;
            node.touch();
            fx.events.push(TaskEvent::VisibleChanged { task_id, visible });
        }
    }

    fn set_may_kill(&mut self, task_id: TaskId, may_kill: bool, recursive: bool, fx: &mut Effects) {
        let Some(node) = self.tasks.get_mut(&task_id) else {
            return;
        };

        if node.may_kill != may_kill {
            let was_killable = node.is_killable();
            node.may_kill = may_kill;
            node.touch();
            fx.events.push(TaskEvent::MayKillChanged { task_id, may_kill });

            let killable = node.is_killable();
            if killable != was_killable {
                fx.events.push(TaskEvent::KillableChanged { task_id, killable });
            }
        }

        if recursive {
            self.recurse(
                task_id,
                Mutation::SetMayKill {
                    may_kill,
                    recursive: true,
                },
                fx,
            );
        }
    }

    fn update_scopes<F>(&mut self, task_id: TaskId, fx: &mut Effects, update: F)
    where
        F: FnOnce(&mut BTreeSet<TaskScope>),
    {
        let Some(node) = self.tasks.get_mut(&task_id) else {
            return;
        };

        let before = node.scopes.clone();
        update(&mut node.scopes);

        if node.scopes != before {
            node.touch();
            fx.events.push(TaskEvent::ScopesChanged {
                task_id,
                scopes: node.scopes.clone(),
            });
        }
    }

    // ------------------------------------------------------------------
    // Hierarchy
    // ------------------------------------------------------------------

    /// Repoint `task_id` at `parent`; the old and new parent update their
    /// children on their own contexts
    fn set_parent(&mut self, task_id: TaskId, parent: Option<TaskId>, fx: &mut Effects) {
        if let Err(e) = self.validate_parent(task_id, parent) {
            warn!("Rejected reparenting of task {}: {}", task_id, e);
            return;
        }

        let Some(node) = self.tasks.get_mut(&task_id) else {
            return;
        };

        let previous = node.parent_id;
        if previous == parent {
            return;
        }

        node.parent_id = parent;
        node.touch();
        fx.events.push(TaskEvent::ParentTaskChanged {
            task_id,
            previous,
            current: parent,
        });

        if let Some(previous_id) = previous {
            self.route(previous_id, Mutation::RemoveChild(task_id), fx);
        }
        if let Some(parent_id) = parent {
            self.route(parent_id, Mutation::AddChild(task_id), fx);
        }
    }

    /// Link `child_id` below `parent_id`, switching the parent to aggregation
    fn add_child(&mut self, parent_id: TaskId, child_id: TaskId, fx: &mut Effects) {
        let points_here = self
            .tasks
            .get(&child_id)
            .is_some_and(|child| child.parent_id == Some(parent_id));
        if !points_here {
            debug!("Task {} no longer points at {}", child_id, parent_id);
            return;
        }

        let Some(parent) = self.tasks.get_mut(&parent_id) else {
            return;
        };
        if parent.children.contains(&child_id) {
            return;
        }

        parent.children.push(child_id);
        parent.touch();

        if parent.progress_mode != ProgressMode::Aggregate {
            parent.progress_mode = ProgressMode::Aggregate;
            fx.events.push(TaskEvent::ProgressModeChanged {
                task_id: parent_id,
                mode: ProgressMode::Aggregate,
            });
        }

        fx.events.push(TaskEvent::ChildTaskAdded {
            task_id: parent_id,
            child_id,
        });

        self.refresh_aggregate(parent_id, fx);
    }

    fn remove_child(&mut self, parent_id: TaskId, child_id: TaskId, fx: &mut Effects) {
        let Some(parent) = self.tasks.get_mut(&parent_id) else {
            return;
        };
        if !parent.children.contains(&child_id) {
            return;
        }

        fx.events.push(TaskEvent::ChildTaskAboutToBeRemoved {
            task_id: parent_id,
            child_id,
        });

        parent.children.retain(|id| *id != child_id);
        parent.touch();

        fx.events.push(TaskEvent::ChildTaskRemoved {
            task_id: parent_id,
            child_id,
        });

        self.refresh_aggregate(parent_id, fx);
    }

    fn clear_parent(&mut self, task_id: TaskId, former: TaskId, fx: &mut Effects) {
        let Some(node) = self.tasks.get_mut(&task_id) else {
            return;
        };
        if node.parent_id != Some(former) {
            return;
        }

        node.parent_id = None;
        node.touch();
        fx.events.push(TaskEvent::ParentTaskChanged {
            task_id,
            previous: Some(former),
            current: None,
        });
    }

    /// Recompute status and progress of an aggregate task from its children
    fn refresh_aggregate(&mut self, task_id: TaskId, fx: &mut Effects) {
        let Some(node) = self.tasks.get(&task_id) else {
            return;
        };

        if node.progress_mode != ProgressMode::Aggregate {
            return;
        }

        let inputs: Vec<(TaskStatus, f32)> = node
            .children
            .iter()
            .filter_map(|child_id| self.tasks.get(child_id))
            .filter(|child| child.enabled)
            .map(|child| (child.status, child.progress))
            .collect();

        let (status, progress) = progress::aggregate(&inputs);
        let status_changed = node.status != status;
        let progress_moved = progress::progress_changed(node.progress, progress);

        if progress_moved {
            if let Some(node) = self.tasks.get_mut(&task_id) {
                node.progress = progress;
                node.touch();
            }
            fx.events.push(TaskEvent::ProgressChanged { task_id, progress });
        }

        if status_changed {
            self.force_status(task_id, status, fx);
        } else if progress_moved {
            self.refresh_progress_text(task_id, fx);
            self.notify_parent(task_id, fx);
        }
    }

    /// Remove a task, detaching it from its parent and orphaning its children
    ///
    /// Applied by whichever context drops the owning handle. The parent and the
    /// children update their linkage on their own contexts.
    fn destroy(&mut self, task_id: TaskId, fx: &mut Effects) {
        let Some(node) = self.tasks.remove(&task_id) else {
            return;
        };

        self.registry.retain(|id| *id != task_id);
        self.release_owner(node.owner, fx);
        fx.events.push(TaskEvent::TaskDestroyed { task_id });

        if let Some(parent_id) = node.parent_id {
            self.route(parent_id, Mutation::RemoveChild(task_id), fx);
        }

        // Includes children whose link to this task is still queued
        let orphans: Vec<TaskId> = self
            .iter()
            .filter(|child| child.parent_id == Some(task_id))
            .map(|child| child.id)
            .collect();
        for child_id in orphans {
            self.route(child_id, Mutation::ClearParent(task_id), fx);
        }

        debug!("Removed task {} from tree", task_id);
    }

    fn release_owner(&mut self, owner: ContextId, fx: &mut Effects) {
        let Some(count) = self.owned.get_mut(&owner) else {
            return;
        };

        *count = count.saturating_sub(1);
        if *count == 0 {
            self.owned.remove(&owner);
            fx.released.push(owner);
        }
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    /// Fire deferred statuses and description clears that are due for tasks
    /// owned by `fx.context`
    pub fn fire_due_timers(&mut self, fx: &mut Effects) -> usize {
        let now = fx.now;
        let context = fx.context;
        let due: Vec<TaskId> = self
            .iter()
            .filter(|node| node.owner == context)
            .filter(|node| node.next_deadline().is_some_and(|deadline| deadline <= now))
            .map(|node| node.id)
            .collect();

        let mut fired = 0;
        for task_id in due {
            let Some(node) = self.tasks.get_mut(&task_id) else {
                continue;
            };

            let deferred = node.deferred_status.filter(|deferred| deferred.due <= now);
            let clear = node.description_clear_at.is_some_and(|at| at <= now);

            if let Some(deferred) = deferred {
                debug!(
                    "Applying deferred status {} to task {}",
                    deferred.status, task_id
                );
                self.set_status(task_id, deferred.status, deferred.recursive, fx);
                fired += 1;
            }

            if clear {
                if let Some(node) = self.tasks.get_mut(&task_id) {
                    node.description_clear_at = None;
                    if !node.progress_description.is_empty() {
                        node.progress_description.clear();
                        fx.events.push(TaskEvent::ProgressDescriptionChanged {
                            task_id,
                            description: String::new(),
                        });
                    }
                }
                self.refresh_progress_text(task_id, fx);
                fired += 1;
            }
        }

        fired
    }

    /// Earliest pending timer among tasks owned by `context`
    pub fn next_deadline(&self, context: ContextId) -> Option<Instant> {
        self.iter()
            .filter(|node| node.owner == context)
            .filter_map(|node| node.next_deadline())
            .min()
    }

    /// Check parent/child linkage for inconsistencies
    ///
    /// Linkage updates still queued for another context are reported until
    /// that context drains them.
    pub fn validate_integrity(&self) -> Vec<String> {
        let mut issues = Vec::new();

        for (task_id, task) in &self.tasks {
            if let Some(parent_id) = task.parent_id {
                match self.tasks.get(&parent_id) {
                    None => issues.push(format!(
                        "Task {} has non-existent parent {}",
                        task_id, parent_id
                    )),
                    Some(parent) if !parent.children.contains(task_id) => issues.push(format!(
                        "Task {} is missing from the children of its parent {}",
                        task_id, parent_id
                    )),
                    Some(_) => {}
                }
            }

            let mut seen = HashSet::new();
            for child_id in &task.children {
                if !seen.insert(*child_id) {
                    issues.push(format!("Task {} lists child {} twice", task_id, child_id));
                }
                match self.tasks.get(child_id) {
                    None => issues.push(format!(
                        "Task {} references non-existent child {}",
                        task_id, child_id
                    )),
                    Some(child) if child.parent_id != Some(*task_id) => issues.push(format!(
                        "Child {} of task {} points to parent {:?}",
                        child_id, task_id, child.parent_id
                    )),
                    Some(_) => {}
                }
            }

            if self.is_ancestor(*task_id, *task_id) {
                issues.push(format!("Task {} is its own ancestor", task_id));
            }
        }

        let owned: usize = self.owned.values().sum();
        if owned != self.tasks.len() {
            issues.push(format!(
                "Owner contexts account for {} tasks but the tree holds {}",
                owned,
                self.tasks.len()
            ));
        }

        if self.registry.len() != self.tasks.len() {
            issues.push(format!(
                "Registry lists {} tasks but the tree holds {}",
                self.registry.len(),
                self.tasks.len()
            ));
        }

        issues
    }
}

/// Explicit description, else the subtask name when it has one
fn subtask_description(description: Option<String>, name: &str) -> Option<String> {
    description
        .filter(|description| !description.is_empty())
        .or_else(|| (!name.is_empty()).then(|| name.to_string()))
}
