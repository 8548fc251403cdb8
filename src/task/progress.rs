//! Progress computation for the three progress modes.
//!
//! Manual progress is stored as written, subtask progress is the fraction of
//! finished subtasks, and aggregate status/progress is derived from the enabled
//! children of a task.

use crate::task::types::{ProgressTextFormatter, Subtask, TaskNode, TaskSnapshot, TaskStatus};

/// Clamp a progress value to [0, 1], rejecting NaN
pub fn clamp_progress(progress: f32) -> Option<f32> {
    if progress.is_nan() {
        None
    } else {
        Some(progress.clamp(0.0, 1.0))
    }
}

pub fn progress_changed(a: f32, b: f32) -> bool {
    (a - b).abs() > f32::EPSILON
}

/// Fraction of finished subtasks (0 when there are none)
pub fn subtasks_progress(subtasks: &[Subtask]) -> f32 {
    if subtasks.is_empty() {
        return 0.0;
    }

    let finished = subtasks.iter().filter(|subtask| subtask.finished).count();
    finished as f32 / subtasks.len() as f32
}

/// Derive the status of an aggregate task from the statuses of its children
pub fn aggregate_status(statuses: &[TaskStatus]) -> TaskStatus {
    let any = |status: TaskStatus| statuses.contains(&status);
    let all = |status: TaskStatus| statuses.iter().all(|s| *s == status);

    if statuses.is_empty() {
        TaskStatus::Idle
    } else if any(TaskStatus::Aborting) {
        TaskStatus::Aborting
    } else if any(TaskStatus::AboutToBeAborted) {
        TaskStatus::AboutToBeAborted
    } else if statuses.iter().any(|status| status.is_running()) {
        TaskStatus::Running
    } else if all(TaskStatus::Finished) {
        TaskStatus::Finished
    } else if all(TaskStatus::Aborted) {
        TaskStatus::Aborted
    } else {
        TaskStatus::Idle
    }
}

/// Derive status and progress from `(status, progress)` of participating children
pub fn aggregate(children: &[(TaskStatus, f32)]) -> (TaskStatus, f32) {
    let statuses: Vec<TaskStatus> = children.iter().map(|(status, _)| *status).collect();
    let status = aggregate_status(&statuses);

    let progress = match status {
        TaskStatus::Finished => 1.0,
        _ if children.is_empty() => 0.0,
        _ => {
            let total: f32 = children.iter().map(|(_, progress)| *progress).sum();
            (total / children.len() as f32).clamp(0.0, 1.0)
        }
    };

    (status, progress)
}

/// Progress text used when no custom formatter is installed
pub fn standard_progress_text(status: TaskStatus, progress: f32, description: &str) -> String {
    let percentage = format!("{:.1}%", progress * 100.0);
    let or_default = |default: &str| {
        if description.is_empty() {
            default.to_string()
        } else {
            description.to_string()
        }
    };

    match status {
        TaskStatus::Running if description.is_empty() => percentage,
        TaskStatus::Running => format!("{} {}", description, percentage),
        TaskStatus::RunningIndeterminate => or_default("Running..."),
        TaskStatus::Aborting => or_default("Aborting..."),
        other => or_default(other.name()),
    }
}

/// Standard progress text of `node`, ignoring any installed formatter
pub fn standard_text(node: &TaskNode) -> String {
    standard_progress_text(node.status, node.progress, &node.progress_description)
}

/// Formatter of `node` together with the snapshot it is called with
///
/// Formatters may read other tasks through their handles, so they are only
/// invoked once the tree lock has been released. The snapshot carries the
/// standard text in `progress_text`.
pub fn formatter_call(node: &TaskNode) -> Option<(ProgressTextFormatter, TaskSnapshot)> {
    let formatter = node.formatter.clone()?;
    let mut snapshot = node.snapshot();
    snapshot.progress_text = standard_text(node);
    Some((formatter, snapshot))
}
