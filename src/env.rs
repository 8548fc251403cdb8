//! Environment constants and path utilities for the task progress engine.
//!
//! This module centralizes the default intervals, limits and configuration file
//! locations used throughout the crate, making them easier to maintain and modify.

use std::path::{Path, PathBuf};

/// Application directory name (hidden directory like .git, .vscode)
pub const TASKPROG_DIR_NAME: &str = ".taskprog";

/// Configuration file name inside the application directory
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Configuration file name when placed directly in a working directory
pub const LOCAL_CONFIG_FILE_NAME: &str = "taskprog.toml";

/// Default tracing filter used by the binary when `RUST_LOG` is not set
pub const DEFAULT_LOG_FILTER: &str = "taskprog=info";

/// Timing defaults, in milliseconds
pub mod timing {
    /// Delay after which a deferred task status is applied
    pub const DEFERRED_STATUS_DELAY_MS: u64 = 1500;

    /// How long a progress description lingers after a task finishes or aborts
    pub const PROGRESS_DESCRIPTION_LINGER_MS: u64 = 1500;
}

/// Queue limits
pub mod limits {
    /// Maximum number of mutations waiting on a single owner context
    pub const MAX_PENDING_MUTATIONS: usize = 65_536;
}

/// Build the application directory path from a root directory
pub fn taskprog_dir_path(root: &Path) -> PathBuf {
    root.join(TASKPROG_DIR_NAME)
}

/// Build the configuration file path inside the application directory
pub fn config_file_path(root: &Path) -> PathBuf {
    taskprog_dir_path(root).join(CONFIG_FILE_NAME)
}

/// Build the configuration file path placed directly in `root`
pub fn local_config_file_path(root: &Path) -> PathBuf {
    root.join(LOCAL_CONFIG_FILE_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_construction() {
        let root = Path::new("/work");

        assert_eq!(taskprog_dir_path(root), PathBuf::from("/work/.taskprog"));
        assert_eq!(
            config_file_path(root),
            PathBuf::from("/work/.taskprog/config.toml")
        );
        assert_eq!(
            local_config_file_path(root),
            PathBuf::from("/work/taskprog.toml")
        );
    }
}
