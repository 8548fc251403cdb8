//! Execution contexts and the queued mutations delivered to them.
//!
//! Every thread gets a [`ContextId`] the first time it touches the engine. A task
//! is owned by the context that created it; mutations issued from any other
//! context are packaged as an [`Envelope`] and pushed onto the owner's
//! [`ContextQueue`], which the owner drains in FIFO order.

use crate::task::types::{
    ProgressMode, ProgressTextFormatter, Result, SubtaskRef, TaskEngineError, TaskId, TaskScope,
    TaskStatus,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_CONTEXT: ContextId = ContextId(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed));
}

/// Identifies an execution context (one per thread)
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u64);

impl ContextId {
    /// Context of the calling thread
    pub fn current() -> Self {
        CURRENT_CONTEXT.with(|context| *context)
    }

    pub fn is_current(&self) -> bool {
        *self == Self::current()
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// A state change addressed to one task
#[derive(Debug, Clone)]
pub enum Mutation {
    SetParent(Option<TaskId>),
    SetName(String),
    SetDescription(String),
    SetEnabled { enabled: bool, recursive: bool },
    SetVisible(bool),
    SetMayKill { may_kill: bool, recursive: bool },
    Reset { recursive: bool },
    SetStatus { status: TaskStatus, recursive: bool },
    SetStatusDeferred {
        status: TaskStatus,
        recursive: bool,
        delay: Duration,
    },
    Kill { recursive: bool },
    SetProgressMode(ProgressMode),
    SetScopes(BTreeSet<TaskScope>),
    AddScope(TaskScope),
    RemoveScope(TaskScope),
    ResetProgress { recursive: bool },
    SetProgress {
        progress: f32,
        description: Option<String>,
    },
    SetSubtasks(Vec<String>),
    SubtaskStarted {
        subtask: SubtaskRef,
        description: Option<String>,
    },
    SubtaskFinished {
        subtask: SubtaskRef,
        description: Option<String>,
    },
    SetSubtaskName { index: usize, name: String },
    SetProgressDescription {
        description: String,
        clear_after: Option<Duration>,
    },
    SetProgressTextFormatter(Option<ProgressTextFormatter>),
    RefreshAggregate,
    /// Link a child that already points at the target task
    AddChild(TaskId),
    RemoveChild(TaskId),
    /// The former parent was destroyed
    ClearParent(TaskId),
    Destroy,
}

impl Mutation {
    pub fn name(&self) -> &'static str {
        match self {
            Mutation::SetParent(_) => "set_parent",
            Mutation::SetName(_) => "set_name",
            Mutation::SetDescription(_) => "set_description",
            Mutation::SetEnabled { .. } => "set_enabled",
            Mutation::SetVisible(_) => "set_visible",
            Mutation::SetMayKill { .. } => "set_may_kill",
            Mutation::Reset { .. } => "reset",
            Mutation::SetStatus { .. } => "set_status",
            Mutation::SetStatusDeferred { .. } => "set_status_deferred",
            Mutation::Kill { .. } => "kill",
            Mutation::SetProgressMode(_) => "set_progress_mode",
            Mutation::SetScopes(_) => "set_scopes",
            Mutation::AddScope(_) => "add_scope",
            Mutation::RemoveScope(_) => "remove_scope",
            Mutation::ResetProgress { .. } => "reset_progress",
            Mutation::SetProgress { .. } => "set_progress",
            Mutation::SetSubtasks(_) => "set_subtasks",
            Mutation::SubtaskStarted { .. } => "subtask_started",
            Mutation::SubtaskFinished { .. } => "subtask_finished",
            Mutation::SetSubtaskName { .. } => "set_subtask_name",
            Mutation::SetProgressDescription { .. } => "set_progress_description",
            Mutation::SetProgressTextFormatter(_) => "set_progress_text_formatter",
            Mutation::RefreshAggregate => "refresh_aggregate",
            Mutation::AddChild(_) => "add_child",
            Mutation::RemoveChild(_) => "remove_child",
            Mutation::ClearParent(_) => "clear_parent",
            Mutation::Destroy => "destroy",
        }
    }
}

/// A mutation together with the task it targets
#[derive(Debug, Clone)]
pub struct Envelope {
    pub task: TaskId,
    pub mutation: Mutation,
}

impl Envelope {
    pub fn new(task: TaskId, mutation: Mutation) -> Self {
        Self { task, mutation }
    }
}

/// FIFO of mutations waiting for their owner context
#[derive(Debug)]
pub struct ContextQueue {
    context: ContextId,
    capacity: usize,
    pending: Mutex<VecDeque<Envelope>>,
    notify: Notify,
}

impl ContextQueue {
    pub fn new(context: ContextId, capacity: usize) -> Self {
        Self {
            context,
            capacity,
            pending: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    pub fn context(&self) -> ContextId {
        self.context
    }

    /// Append `envelope`, failing when the queue is at capacity
    pub fn push(&self, envelope: Envelope) -> Result<()> {
        {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            if pending.len() >= self.capacity {
                return Err(TaskEngineError::QueueFull {
                    context: self.context,
                    capacity: self.capacity,
                });
            }
            pending.push_back(envelope);
        }

        self.notify.notify_one();
        Ok(())
    }

    pub fn pop(&self) -> Option<Envelope> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    pub fn len(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wake a waiting event loop without queueing anything
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    /// Resolves once something was pushed or a wake-up was requested
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_context_is_per_thread() {
        let here = ContextId::current();
        assert_eq!(here, ContextId::current());

        let there = std::thread::spawn(ContextId::current).join().unwrap();
        assert_ne!(here, there);
        assert!(here.is_current());
        assert!(!there.is_current());
    }

    #[test]
    fn test_queue_is_fifo_and_bounded() {
        let queue = ContextQueue::new(ContextId::current(), 2);
        let task = Uuid::new_v4();

        queue
            .push(Envelope::new(task, Mutation::SetName("first".to_string())))
            .unwrap();
        queue
            .push(Envelope::new(task, Mutation::SetName("second".to_string())))
            .unwrap();

        let overflow = queue.push(Envelope::new(task, Mutation::Destroy));
        assert!(matches!(
            overflow,
            Err(TaskEngineError::QueueFull { capacity: 2, .. })
        ));

        assert!(matches!(
            queue.pop().map(|envelope| envelope.mutation),
            Some(Mutation::SetName(name)) if name == "first"
        ));
        assert!(matches!(
            queue.pop().map(|envelope| envelope.mutation),
            Some(Mutation::SetName(name)) if name == "second"
        ));
        assert!(queue.pop().is_none());
        assert!(queue.is_empty());
    }
}
