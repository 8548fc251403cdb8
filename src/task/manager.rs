use crate::config::TaskManagerConfig;
use crate::task::context::{ContextId, ContextQueue, Envelope, Mutation};
use crate::task::handle::{Task, TaskHandle};
use crate::task::progress;
use crate::task::registry::{TaskFilter, TaskStatistics};
use crate::task::tree::{Effects, TaskTree};
use crate::task::types::*;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

static GLOBAL_MANAGER: Lazy<TaskManager> =
    Lazy::new(|| TaskManager::new(TaskManagerConfig::default()));

/// Central task management system
///
/// Cloning is cheap; clones share the same task tree, context queues and
/// event handlers.
#[derive(Clone)]
pub struct TaskManager {
    shared: Arc<Shared>,
}

struct Shared {
    tree: RwLock<TaskTree>,
    contexts: DashMap<ContextId, Arc<ContextQueue>>,
    event_handlers: RwLock<Vec<Arc<dyn TaskEventHandler + Send + Sync>>>,
    config: TaskManagerConfig,
}

/// Events that can occur during task management
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TaskEvent {
    TaskCreated {
        task_id: TaskId,
        parent_id: Option<TaskId>,
    },
    TaskDestroyed {
        task_id: TaskId,
    },
    StatusChanged {
        task_id: TaskId,
        previous: TaskStatus,
        current: TaskStatus,
    },
    ProgressChanged {
        task_id: TaskId,
        progress: f32,
    },
    ProgressDescriptionChanged {
        task_id: TaskId,
        description: String,
    },
    ProgressTextChanged {
        task_id: TaskId,
        text: String,
    },
    ProgressModeChanged {
        task_id: TaskId,
        mode: ProgressMode,
    },
    SubtasksChanged {
        task_id: TaskId,
        names: Vec<String>,
    },
    SubtaskStarted {
        task_id: TaskId,
        index: usize,
        name: String,
    },
    SubtaskFinished {
        task_id: TaskId,
        index: usize,
        name: String,
    },
    NameChanged {
        task_id: TaskId,
        name: String,
    },
    DescriptionChanged {
        task_id: TaskId,
        description: String,
    },
    EnabledChanged {
        task_id: TaskId,
        enabled: bool,
    },
    VisibleChanged {
        task_id: TaskId,
        visible: bool,
    },
    MayKillChanged {
        task_id: TaskId,
        may_kill: bool,
    },
    KillableChanged {
        task_id: TaskId,
        killable: bool,
    },
    ScopesChanged {
        task_id: TaskId,
        scopes: BTreeSet<TaskScope>,
    },
    ParentTaskChanged {
        task_id: TaskId,
        previous: Option<TaskId>,
        current: Option<TaskId>,
    },
    ChildTaskAdded {
        task_id: TaskId,
        child_id: TaskId,
    },
    ChildTaskAboutToBeRemoved {
        task_id: TaskId,
        child_id: TaskId,
    },
    ChildTaskRemoved {
        task_id: TaskId,
        child_id: TaskId,
    },
    AbortRequested {
        task_id: TaskId,
    },
}

impl TaskEvent {
    /// Task the event is about
    pub fn task_id(&self) -> TaskId {
        match self {
            TaskEvent::TaskCreated { task_id, .. }
            | TaskEvent::TaskDestroyed { task_id }
            | TaskEvent::StatusChanged { task_id, .. }
            | TaskEvent::ProgressChanged { task_id, .. }
            | TaskEvent::ProgressDescriptionChanged { task_id, .. }
            | TaskEvent::ProgressTextChanged { task_id, .. }
            | TaskEvent::ProgressModeChanged { task_id, .. }
            | TaskEvent::SubtasksChanged { task_id, .. }
            | TaskEvent::SubtaskStarted { task_id, .. }
            | TaskEvent::SubtaskFinished { task_id, .. }
            | TaskEvent::NameChanged { task_id, .. }
            | TaskEvent::DescriptionChanged { task_id, .. }
            | TaskEvent::EnabledChanged { task_id, .. }
            | TaskEvent::VisibleChanged { task_id, .. }
            | TaskEvent::MayKillChanged { task_id, .. }
            | TaskEvent::KillableChanged { task_id, .. }
            | TaskEvent::ScopesChanged { task_id, .. }
            | TaskEvent::ParentTaskChanged { task_id, .. }
            | TaskEvent::ChildTaskAdded { task_id, .. }
            | TaskEvent::ChildTaskAboutToBeRemoved { task_id, .. }
            | TaskEvent::ChildTaskRemoved { task_id, .. }
            | TaskEvent::AbortRequested { task_id } => *task_id,
        }
    }
}

/// Handler for task events
///
/// Handlers run on the context that applied the mutation, after the task tree
/// lock has been released, so they may read from the manager. `TaskDestroyed`
/// is delivered on the thread that dropped the task.
pub trait TaskEventHandler {
    fn handle_event(&self, event: &TaskEvent) -> anyhow::Result<()>;
}

/// Task manager operations
impl TaskManager {
    /// Create a new task manager
    pub fn new(config: TaskManagerConfig) -> Self {
        let log_events = config.log_events;
        let manager = Self {
            shared: Arc::new(Shared {
                tree: RwLock::new(TaskTree::new(&config)),
                contexts: DashMap::new(),
                event_handlers: RwLock::new(Vec::new()),
                config,
            }),
        };

        if log_events {
            manager.add_event_handler(Box::new(LoggingEventHandler));
        }

        manager
    }

    /// Process-wide task manager
    pub fn global() -> &'static TaskManager {
        &GLOBAL_MANAGER
    }

    pub fn config(&self) -> &TaskManagerConfig {
        &self.shared.config
    }

    /// Whether both values refer to the same manager
    pub fn same_manager(&self, other: &TaskManager) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Create a new task owned by the calling context
    pub fn create_task(&self, spec: TaskSpec) -> Result<Task> {
        let context = ContextId::current();
        let mut fx = Effects::new(context);
        let task_id = self.write_tree().insert(&spec, context, &mut fx)?;
        self.context_queue(context);
        self.finish(fx);

        debug!("Created task {} with parent {:?}", task_id, spec.parent);
        Ok(Task::new(TaskHandle::new(self.clone(), task_id)))
    }

    /// Apply `mutation` now when the caller owns `task_id`, otherwise queue it
    /// for the owner context
    pub(crate) fn dispatch(&self, task_id: TaskId, mutation: Mutation) -> Result<()> {
        let owner = self
            .read_tree()
            .owner_of(&task_id)
            .ok_or(TaskEngineError::TaskNotFound(task_id))?;

        let context = ContextId::current();
        if owner == context {
            self.apply_now(context, Envelope::new(task_id, mutation));
            return Ok(());
        }

        debug!(
            "Queueing {} for task {} on {}",
            mutation.name(),
            task_id,
            owner
        );
        self.context_queue(owner)
            .push(Envelope::new(task_id, mutation))
    }

    /// Destroy `task_id` right away, whichever context calls it
    pub(crate) fn destroy(&self, task_id: TaskId) -> Result<()> {
        let mut fx = Effects::new(ContextId::current());
        {
            let mut tree = self.write_tree();
            if !tree.contains(&task_id) {
                return Err(TaskEngineError::TaskNotFound(task_id));
            }
            tree.apply(Envelope::new(task_id, Mutation::Destroy), &mut fx);
        }
        self.finish(fx);
        Ok(())
    }

    fn apply_now(&self, context: ContextId, envelope: Envelope) {
        let mut fx = Effects::new(context);
        self.write_tree().apply(envelope, &mut fx);
        self.finish(fx);
    }

    /// Deliver everything collected in `fx` once the tree lock is released
    fn finish(&self, fx: Effects) {
        let Effects {
            context,
            mut events,
            forwarded,
            timers_changed,
            reformat,
            released,
            ..
        } = fx;

        for (owner, envelope) in forwarded {
            let mutation = envelope.mutation.name();
            let task_id = envelope.task;
            if let Err(e) = self.context_queue(owner).push(envelope) {
                error!(
                    "Failed to forward {} for task {} to {}: {}",
                    mutation, task_id, owner, e
                );
            }
        }

        for task_id in reformat {
            let Some(text) = self.format_progress_text(task_id) else {
                continue;
            };
            if self.write_tree().store_progress_text(task_id, &text) {
                events.push(TaskEvent::ProgressTextChanged { task_id, text });
            }
        }

        if timers_changed {
            self.context_queue(context).wake();
        }

        for context in released {
            self.prune_context(context);
        }

        self.emit_events(&events);
    }

    /// Run the custom formatter of `task_id`, if any, with no lock held
    pub(crate) fn format_progress_text(&self, task_id: TaskId) -> Option<String> {
        let (formatter, snapshot) = self
            .read_tree()
            .get(&task_id)
            .and_then(progress::formatter_call)?;
        Some(formatter.format(&snapshot))
    }

    /// Drop the queue of a context that owns no live task and has no event loop
    fn prune_context(&self, context: ContextId) {
        let removed = self.shared.contexts.remove_if(&context, |_, queue| {
            Arc::strong_count(queue) == 1 && !self.read_tree().owns_tasks(context)
        });

        if removed.is_some() {
            debug!("Released mutation queue of {}", context);
        }
    }

    /// Apply the mutations queued for the calling context and fire its due
    /// timers. Returns the number of mutations and timers processed.
    pub fn process_events(&self) -> usize {
        let context = ContextId::current();
        let queue = self
            .shared
            .contexts
            .get(&context)
            .map(|queue| Arc::clone(queue.value()));

        let mut processed = 0;
        while let Some(envelope) = queue.as_ref().and_then(|queue| queue.pop()) {
            self.apply_now(context, envelope);
            processed += 1;
        }

        let mut fx = Effects::new(context);
        processed += self.write_tree().fire_due_timers(&mut fx);
        self.finish(fx);

        processed
    }

    /// Earliest pending timer of a task owned by the calling context
    pub fn next_deadline(&self) -> Option<Instant> {
        self.read_tree().next_deadline(ContextId::current())
    }

    /// Number of contexts holding a mutation queue
    pub fn active_contexts(&self) -> usize {
        self.shared.contexts.len()
    }

    /// Number of mutations waiting for the calling context
    pub fn pending_events(&self) -> usize {
        self.shared
            .contexts
            .get(&ContextId::current())
            .map(|queue| queue.len())
            .unwrap_or(0)
    }

    /// Drive the calling context until `shutdown` is cancelled
    ///
    /// Queued mutations are applied as they arrive and deferred timers fire when
    /// due. Must be polled on the thread that owns the tasks, e.g. from a
    /// current-thread runtime.
    pub async fn run_event_loop(&self, shutdown: CancellationToken) {
        let context = ContextId::current();
        let queue = self.context_queue(context);
        info!("Task event loop started on {}", context);

        loop {
            self.process_events();
            let deadline = self.next_deadline();

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = queue.notified() => {}
                _ = sleep_until(deadline) => {}
            }
        }

        let remaining = self.process_events();
        info!(
            "Task event loop on {} stopped ({} final events)",
            context, remaining
        );
    }

    /// Add event handler
    pub fn add_event_handler(&self, handler: Box<dyn TaskEventHandler + Send + Sync>) {
        self.shared
            .event_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::from(handler));
    }

    /// Receive every task event on an unbounded channel
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TaskEvent> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.add_event_handler(Box::new(ChannelEventHandler { sender }));
        receiver
    }

    fn emit_events(&self, events: &[TaskEvent]) {
        if events.is_empty() {
            return;
        }

        let handlers = self
            .shared
            .event_handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for event in events {
            for handler in &handlers {
                if let Err(e) = handler.handle_event(event) {
                    error!("Event handler error: {}", e);
                }
            }
        }
    }

    /// Check a reparenting before it is dispatched
    pub(crate) fn validate_parent(&self, task_id: TaskId, parent: Option<TaskId>) -> Result<()> {
        let tree = self.read_tree();
        if !tree.contains(&task_id) {
            return Err(TaskEngineError::TaskNotFound(task_id));
        }
        tree.validate_parent(task_id, parent)
    }

    /// Read from a live task
    pub(crate) fn with_task<R>(&self, task_id: TaskId, f: impl FnOnce(&TaskNode) -> R) -> Option<R> {
        self.read_tree().get(&task_id).map(f)
    }

    pub(crate) fn child_ids(&self, task_id: TaskId, recursive: bool, enabled_only: bool) -> Vec<TaskId> {
        self.read_tree().child_ids(task_id, recursive, enabled_only)
    }

    pub(crate) fn filter_children<F>(
        &self,
        task_id: TaskId,
        recursive: bool,
        enabled_only: bool,
        predicate: F,
    ) -> Vec<TaskId>
    where
        F: Fn(&TaskNode) -> bool,
    {
        let tree = self.read_tree();
        tree.child_ids(task_id, recursive, enabled_only)
            .into_iter()
            .filter(|child_id| tree.get(child_id).is_some_and(&predicate))
            .collect()
    }

    /// Handle to a live task
    pub fn task(&self, task_id: TaskId) -> Option<TaskHandle> {
        self.read_tree()
            .contains(&task_id)
            .then(|| TaskHandle::new(self.clone(), task_id))
    }

    /// Snapshots of all live tasks in creation order
    pub fn tasks(&self) -> Vec<TaskSnapshot> {
        self.read_tree().iter().map(TaskNode::snapshot).collect()
    }

    /// Snapshots of live tasks accepted by `filter`, in creation order
    pub fn filter_tasks(&self, filter: &TaskFilter) -> Vec<TaskSnapshot> {
        let tree = self.read_tree();
        tree.iter()
            .filter(|node| filter.matches(node, &tree))
            .map(TaskNode::snapshot)
            .collect()
    }

    /// Get task statistics
    pub fn statistics(&self) -> TaskStatistics {
        TaskStatistics::collect(&self.read_tree())
    }

    pub fn task_count(&self) -> usize {
        self.read_tree().len()
    }

    /// Export all live tasks to JSON
    pub fn export_to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(&self.tasks())?)
    }

    /// Validate task tree integrity
    pub fn validate_tree_integrity(&self) -> Vec<String> {
        let issues = self.read_tree().validate_integrity();
        if !issues.is_empty() {
            warn!("Task tree has {} integrity issues", issues.len());
        }
        issues
    }

    fn context_queue(&self, context: ContextId) -> Arc<ContextQueue> {
        let capacity = self.shared.config.max_pending_mutations;
        self.shared
            .contexts
            .entry(context)
            .or_insert_with(|| Arc::new(ContextQueue::new(context, capacity)))
            .clone()
    }

    fn read_tree(&self) -> RwLockReadGuard<'_, TaskTree> {
        self.shared
            .tree
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write_tree(&self) -> RwLockWriteGuard<'_, TaskTree> {
        self.shared
            .tree
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new(TaskManagerConfig::default())
    }
}

impl fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskManager")
            .field("tasks", &self.task_count())
            .field("contexts", &self.active_contexts())
            .field("config", &self.shared.config)
            .finish()
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Default event handler that logs events
pub struct LoggingEventHandler;

impl TaskEventHandler for LoggingEventHandler {
    fn handle_event(&self, event: &TaskEvent) -> anyhow::Result<()> {
        match event {
            TaskEvent::TaskCreated { task_id, parent_id } => {
                info!("Task created: {} (parent: {:?})", task_id, parent_id);
            }
            TaskEvent::TaskDestroyed { task_id } => {
                info!("Task destroyed: {}", task_id);
            }
            TaskEvent::StatusChanged {
                task_id,
                previous,
                current,
            } => {
                info!("Task {} status: {} -> {}", task_id, previous, current);
            }
            TaskEvent::AbortRequested { task_id } => {
                warn!("Abort requested for task {}", task_id);
            }
            TaskEvent::ParentTaskChanged {
                task_id,
                previous,
                current,
            } => {
                info!(
                    "Task {} parent: {:?} -> {:?}",
                    task_id, previous, current
                );
            }
            other => {
                debug!("Task event: {:?}", other);
            }
        }
        Ok(())
    }
}

/// Forwards events to a [`TaskManager::subscribe`] receiver
struct ChannelEventHandler {
    sender: mpsc::UnboundedSender<TaskEvent>,
}

impl TaskEventHandler for ChannelEventHandler {
    fn handle_event(&self, event: &TaskEvent) -> anyhow::Result<()> {
        if self.sender.send(event.clone()).is_err() {
            debug!("Dropping event for closed subscriber");
        }
        Ok(())
    }
}
