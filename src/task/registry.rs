//! Listing and filtering of live tasks for presentation layers.

use crate::task::tree::TaskTree;
use crate::task::types::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Selects tasks from the registry
///
/// Empty status and scope sets accept everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFilter {
    pub statuses: BTreeSet<TaskStatus>,
    pub scopes: BTreeSet<TaskScope>,
    /// Only tasks without a parent
    pub top_level_only: bool,
    pub hide_disabled: bool,
    pub hide_hidden: bool,
    /// Substring of the parent task's name
    pub parent_name: Option<String>,
    /// Substring of the task's own name
    pub name_contains: Option<String>,
}

impl TaskFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_statuses<I: IntoIterator<Item = TaskStatus>>(mut self, statuses: I) -> Self {
        self.statuses = statuses.into_iter().collect();
        self
    }

    pub fn with_scopes<I: IntoIterator<Item = TaskScope>>(mut self, scopes: I) -> Self {
        self.scopes = scopes.into_iter().collect();
        self
    }

    pub fn top_level_only(mut self) -> Self {
        self.top_level_only = true;
        self
    }

    pub fn hide_disabled(mut self) -> Self {
        self.hide_disabled = true;
        self
    }

    pub fn hide_hidden(mut self) -> Self {
        self.hide_hidden = true;
        self
    }

    pub fn with_parent_name(mut self, parent_name: &str) -> Self {
        self.parent_name = Some(parent_name.to_string());
        self
    }

    pub fn with_name_containing(mut self, name: &str) -> Self {
        self.name_contains = Some(name.to_string());
        self
    }

    pub fn matches(&self, node: &TaskNode, tree: &TaskTree) -> bool {
        if !self.statuses.is_empty() && !self.statuses.contains(&node.status) {
            return false;
        }
        if !self.scopes.is_empty() && !TaskScope::overlap(&self.scopes, &node.scopes) {
            return false;
        }
        if self.top_level_only && node.parent_id.is_some() {
            return false;
        }
        if self.hide_disabled && !node.enabled {
            return false;
        }
        if self.hide_hidden && !node.visible {
            return false;
        }
        if let Some(name) = &self.name_contains {
            if !node.name.contains(name.as_str()) {
                return false;
            }
        }
        if let Some(parent_name) = &self.parent_name {
            let parent = node.parent_id.and_then(|parent_id| tree.get(&parent_id));
            if !parent.is_some_and(|parent| parent.name.contains(parent_name.as_str())) {
                return false;
            }
        }

        true
    }
}

/// Statistics about the live tasks
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskStatistics {
    pub total_tasks: u32,
    pub total_tasks_created: u64,
    pub status_counts: BTreeMap<TaskStatus, u32>,
    pub top_level_tasks: u32,
    pub disabled_tasks: u32,
    pub hidden_tasks: u32,
    pub killable_tasks: u32,
    pub completion_percentage: f64,
}

impl TaskStatistics {
    pub fn collect(tree: &TaskTree) -> Self {
        let mut stats = TaskStatistics {
            total_tasks: tree.len() as u32,
            total_tasks_created: tree.total_tasks_created(),
            ..Default::default()
        };

        for node in tree.iter() {
            *stats.status_counts.entry(node.status).or_insert(0) += 1;

            if node.parent_id.is_none() {
                stats.top_level_tasks += 1;
            }
            if !node.enabled {
                stats.disabled_tasks += 1;
            }
            if !node.visible {
                stats.hidden_tasks += 1;
            }
            if node.is_killable() {
                stats.killable_tasks += 1;
            }
        }

        if stats.total_tasks > 0 {
            stats.completion_percentage =
                stats.count(TaskStatus::Finished) as f64 / stats.total_tasks as f64 * 100.0;
        }

        stats
    }

    /// Number of live tasks with `status`
    pub fn count(&self, status: TaskStatus) -> u32 {
        self.status_counts.get(&status).copied().unwrap_or(0)
    }

    pub fn running_tasks(&self) -> u32 {
        self.count(TaskStatus::Running) + self.count(TaskStatus::RunningIndeterminate)
    }
}
