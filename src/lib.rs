//! # Task Progress Engine
//!
//! A status and progress tracking engine for long-running units of work that are
//! executed by other subsystems. Tasks form a mutable parent/child tree and are
//! updated from worker threads while a presentation thread reads and renders
//! them.
//!
//! ## Architecture Overview
//!
//! - **[`task`]**: Task state machine, progress modes, hierarchy and aggregation,
//!   owner-context queues and deferred transitions
//! - **[`config`]**: Engine configuration with TOML discovery
//! - **[`env`]**: Default intervals, limits and configuration paths
//!
//! ## Features
//!
//! ### 📊 Progress Tracking
//! - **Three Progress Modes**: Manual values, named subtasks, or aggregation over child tasks
//! - **Derived Status**: Aggregate tasks follow the statuses of their enabled children
//! - **Progress Text**: Standard or custom formatted text per task
//!
//! ### 🧵 Thread Affinity
//! - **Owner Contexts**: A task belongs to the thread that created it
//! - **Queued Mutation**: Changes from other threads are applied by the owner in FIFO order
//! - **Deferred Transitions**: Debounced status changes and self-clearing descriptions
//!
//! ### 🛑 Cooperative Cancellation
//! - **Kill Requests**: Killable tasks move to `AboutToBeAborted` and cancel their token
//! - **Recursive Kill**: Every descendant is asked independently
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use taskprog::{TaskManager, TaskSpec};
//!
//! fn main() -> anyhow::Result<()> {
//!     let manager = TaskManager::default();
//!
//!     let import = manager.create_task(TaskSpec::new("Import points").with_may_kill(true))?;
//!     import.set_subtasks_named(["Read header", "Read points", "Build index"])?;
//!     import.set_running()?;
//!     import.set_subtask_finished("Read header", None)?;
//!
//!     println!("{}", import.progress_text());
//!     Ok(())
//! }
//! ```

/// Configuration discovery and loading.
///
/// Provides the engine settings (deferred status delay, description linger,
/// queue capacity) and finds them in the usual configuration locations.
pub mod config;

/// Hierarchical task status and progress tracking.
///
/// Provides the task tree, the per-task state machine, progress computation,
/// aggregation and thread-affine mutation.
pub mod task;

/// Environment constants and path utilities.
///
/// Centralizes default intervals, limits and configuration file names used
/// throughout the crate.
pub mod env;

// Re-export main configuration types
pub use config::TaskManagerConfig;

// Re-export main task types
pub use task::{
    ProgressMode, ProgressTextFormatter, Task, TaskEngineError, TaskEvent, TaskEventHandler,
    TaskFilter, TaskHandle, TaskId, TaskManager, TaskScope, TaskSnapshot, TaskSpec,
    TaskStatistics, TaskStatus,
};
