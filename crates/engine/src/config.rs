//! Service configuration via `txcoord.toml`
//!
//! The transaction settings live under `[transaction]`, the background
//! scheduler under `[scheduler]`. A commented default file is written on
//! first start; edit it and restart to change settings.

use serde::{Deserialize, Serialize};
use std::path::Path;
use txcoord_core::{TransactionSettings, TxError, TxResult};

/// Config file name placed in the service's log directory.
pub const CONFIG_FILE_NAME: &str = "txcoord.toml";

/// Background scheduler sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Worker threads running timeouts and retries.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    /// Maximum number of queued tasks, ready or delayed.
    #[serde(default = "default_max_queue_depth")]
    pub max_queue_depth: usize,
}

fn default_worker_threads() -> usize {
    2
}

fn default_max_queue_depth() -> usize {
    4096
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            worker_threads: default_worker_threads(),
            max_queue_depth: default_max_queue_depth(),
        }
    }
}

/// Service configuration loaded from `txcoord.toml`.
///
/// # Example
///
/// ```toml
/// server_name = "server1"
///
/// [transaction]
/// transaction_timeout_secs = 120
/// heuristic_completion_direction = "rollback"
///
/// [scheduler]
/// worker_threads = 2
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxConfig {
    /// Name written into the service data of both logs.
    #[serde(default = "default_server_name")]
    pub server_name: String,
    /// Coordinator settings.
    #[serde(default)]
    pub transaction: TransactionSettings,
    /// Background scheduler sizing.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

fn default_server_name() -> String {
    "txcoord".to_string()
}

impl Default for TxConfig {
    fn default() -> Self {
        TxConfig {
            server_name: default_server_name(),
            transaction: TransactionSettings::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl TxConfig {
    /// A configuration with the given server name and default settings.
    pub fn new(server_name: impl Into<String>) -> Self {
        TxConfig {
            server_name: server_name.into(),
            ..Self::default()
        }
    }

    /// Replace the transaction settings (builder pattern).
    pub fn with_transaction(mut self, settings: TransactionSettings) -> Self {
        self.transaction = settings;
        self
    }

    /// Replace the scheduler sizing (builder pattern).
    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Check every value.
    ///
    /// # Errors
    /// `Config` naming the first invalid value.
    pub fn validate(&self) -> TxResult<()> {
        if self.server_name.trim().is_empty() {
            return Err(TxError::Config("server_name must not be empty".to_string()));
        }
        if self.scheduler.worker_threads == 0 {
            return Err(TxError::Config(
                "scheduler.worker_threads must be at least 1".to_string(),
            ));
        }
        if self.scheduler.max_queue_depth == 0 {
            return Err(TxError::Config(
                "scheduler.max_queue_depth must be at least 1".to_string(),
            ));
        }
        self.transaction.validate()?;
        Ok(())
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# txcoord transaction service configuration

# Name recorded in the recovery logs
server_name = "txcoord"

[transaction]
# Lifetime timeout applied at begin, in seconds (0 = none)
transaction_timeout_secs = 120

# Base wait between outcome-delivery retries, in seconds (0 = 60)
heuristic_retry_interval_secs = 60

# Retries before a branch is abandoned (0 = unlimited)
heuristic_retry_limit = 0

# Attempts between doublings of the retry wait, and the cap on the wait
retry_backoff_threshold = 10
max_retry_interval_secs = 3600

# Outcome when it cannot be determined: "commit", "rollback" or "manual"
heuristic_completion_direction = "rollback"

# Commit a single participant in one phase; skip logging when only one
# participant voted to commit
one_phase_optimization = true

# Allow one one-phase participant alongside two-phase participants
accept_heuristic_hazard = true

[scheduler]
# Threads running timeouts and retries
worker_threads = 2

# Maximum queued tasks
max_queue_depth = 4096
"#
    }

    /// Read, parse and validate config from a file path.
    ///
    /// # Errors
    /// `Config` when the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> TxResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            TxError::Config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        let config: TxConfig = toml::from_str(&content).map_err(|e| {
            TxError::Config(format!(
                "Failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default config file if it does not already exist.
    pub fn write_default_if_missing(path: &Path) -> TxResult<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|e| {
                TxError::Config(format!(
                    "Failed to write default config file '{}': {}",
                    path.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> TxResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| TxError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content).map_err(|e| {
            TxError::Config(format!(
                "Failed to write config file '{}': {}",
                path.display(),
                e
            ))
        })
    }
}
