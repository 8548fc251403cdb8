//! Configuration discovery and loading
//!
//! This module handles the configuration discovery hierarchy:
//! 1. Current directory: ./taskprog.toml or ./.taskprog/config.toml
//! 2. User config: ~/.taskprog/config.toml
//! 3. Built-in defaults

use crate::env;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Configuration for the task manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskManagerConfig {
    /// Delay used by `set_status_deferred` when no explicit delay is given
    pub deferred_status_delay_ms: u64,
    /// How long a progress description lingers once a task finished or aborted
    pub progress_description_linger_ms: u64,
    /// Capacity of each owner context's mutation queue
    pub max_pending_mutations: usize,
    /// Install a handler that logs every task event
    pub log_events: bool,
}

impl Default for TaskManagerConfig {
    fn default() -> Self {
        Self {
            deferred_status_delay_ms: env::timing::DEFERRED_STATUS_DELAY_MS,
            progress_description_linger_ms: env::timing::PROGRESS_DESCRIPTION_LINGER_MS,
            max_pending_mutations: env::limits::MAX_PENDING_MUTATIONS,
            log_events: false,
        }
    }
}

impl TaskManagerConfig {
    pub fn deferred_status_delay(&self) -> Duration {
        Duration::from_millis(self.deferred_status_delay_ms)
    }

    pub fn progress_description_linger(&self) -> Duration {
        Duration::from_millis(self.progress_description_linger_ms)
    }

    /// Load configuration from a TOML file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path).context("Failed to read config file")?;
        Self::from_toml_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse TOML configuration")
    }

    /// Save configuration to a TOML file
    pub fn to_toml_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = self.to_toml_string()?;
        std::fs::write(path, content).context("Failed to write config file")
    }

    /// Convert configuration to a TOML string
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }

    /// Discover and load configuration using the hierarchy, starting at the
    /// current working directory
    pub fn discover() -> Result<Self> {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self::discover_from(&cwd, home_dir().as_deref())
    }

    /// Discover configuration relative to `root`, falling back to `home`
    pub fn discover_from(root: &Path, home: Option<&Path>) -> Result<Self> {
        if let Some(path) = Self::find_config_file(root, home) {
            info!("Loading configuration from: {:?}", path);
            return Self::from_toml_file(path);
        }

        debug!("No configuration file found, using built-in defaults");
        Ok(Self::default())
    }

    /// Find the first configuration file in the discovery hierarchy
    pub fn find_config_file(root: &Path, home: Option<&Path>) -> Option<PathBuf> {
        let mut candidates = vec![
            env::local_config_file_path(root),
            env::config_file_path(root),
        ];
        if let Some(home) = home {
            candidates.push(env::config_file_path(home));
        }

        candidates.into_iter().find(|path| path.is_file())
    }
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}
