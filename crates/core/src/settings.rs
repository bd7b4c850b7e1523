//! Transaction settings
//!
//! An immutable value handed to every coordinator at construction. Nothing
//! here is process-wide mutable state.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry wait used when `heuristic_retry_interval_secs` is 0.
pub const DEFAULT_RETRY_INTERVAL_SECS: u64 = 60;

/// Direction applied when an outcome cannot be determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HeuristicDirection {
    /// Commit the transaction.
    Commit,
    /// Roll the transaction back.
    #[default]
    Rollback,
    /// Leave the transaction for an operator.
    Manual,
}

/// Settings consumed by coordinators and recovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionSettings {
    /// Default transaction lifetime in seconds (0 = no timeout).
    #[serde(default = "default_transaction_timeout")]
    pub transaction_timeout_secs: u64,

    /// Base wait between completion retries (0 = 60s).
    #[serde(default = "default_retry_interval")]
    pub heuristic_retry_interval_secs: u64,

    /// Retries before giving up on a branch (0 = unlimited).
    #[serde(default)]
    pub heuristic_retry_limit: u32,

    /// Attempts between doublings of the retry wait.
    #[serde(default = "default_backoff_threshold")]
    pub retry_backoff_threshold: u32,

    /// Cap on the retry wait in seconds.
    #[serde(default = "default_max_retry_interval")]
    pub max_retry_interval_secs: u64,

    /// What to do with an undeterminable outcome.
    #[serde(default)]
    pub heuristic_completion_direction: HeuristicDirection,

    /// Allow the one-phase optimizations.
    #[serde(default = "default_true")]
    pub one_phase_optimization: bool,

    /// Allow a one-phase participant alongside two-phase participants.
    #[serde(default = "default_true")]
    pub accept_heuristic_hazard: bool,
}

fn default_transaction_timeout() -> u64 {
    120
}

fn default_retry_interval() -> u64 {
    DEFAULT_RETRY_INTERVAL_SECS
}

fn default_backoff_threshold() -> u32 {
    10
}

fn default_max_retry_interval() -> u64 {
    3600
}

fn default_true() -> bool {
    true
}

impl Default for TransactionSettings {
    fn default() -> Self {
        TransactionSettings {
            transaction_timeout_secs: default_transaction_timeout(),
            heuristic_retry_interval_secs: default_retry_interval(),
            heuristic_retry_limit: 0,
            retry_backoff_threshold: default_backoff_threshold(),
            max_retry_interval_secs: default_max_retry_interval(),
            heuristic_completion_direction: HeuristicDirection::Rollback,
            one_phase_optimization: true,
            accept_heuristic_hazard: true,
        }
    }
}

impl TransactionSettings {
    /// Create settings with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default transaction timeout (builder pattern).
    pub fn with_transaction_timeout_secs(mut self, secs: u64) -> Self {
        self.transaction_timeout_secs = secs;
        self
    }

    /// Set the base retry interval (builder pattern).
    pub fn with_retry_interval_secs(mut self, secs: u64) -> Self {
        self.heuristic_retry_interval_secs = secs;
        self
    }

    /// Set the retry limit (builder pattern).
    pub fn with_retry_limit(mut self, limit: u32) -> Self {
        self.heuristic_retry_limit = limit;
        self
    }

    /// Set the backoff threshold (builder pattern).
    pub fn with_backoff_threshold(mut self, attempts: u32) -> Self {
        self.retry_backoff_threshold = attempts;
        self
    }

    /// Set the retry interval cap (builder pattern).
    pub fn with_max_retry_interval_secs(mut self, secs: u64) -> Self {
        self.max_retry_interval_secs = secs;
        self
    }

    /// Set the completion direction (builder pattern).
    pub fn with_direction(mut self, direction: HeuristicDirection) -> Self {
        self.heuristic_completion_direction = direction;
        self
    }

    /// Enable or disable the one-phase optimizations (builder pattern).
    pub fn with_one_phase_optimization(mut self, enabled: bool) -> Self {
        self.one_phase_optimization = enabled;
        self
    }

    /// Enable or disable last-participant support (builder pattern).
    pub fn with_accept_heuristic_hazard(mut self, enabled: bool) -> Self {
        self.accept_heuristic_hazard = enabled;
        self
    }

    /// Default transaction timeout, if any.
    pub fn transaction_timeout(&self) -> Option<Duration> {
        match self.transaction_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Base retry wait.
    pub fn retry_interval(&self) -> Duration {
        match self.heuristic_retry_interval_secs {
            0 => Duration::from_secs(DEFAULT_RETRY_INTERVAL_SECS),
            secs => Duration::from_secs(secs),
        }
    }

    /// Upper bound on the retry wait.
    pub fn max_retry_interval(&self) -> Duration {
        Duration::from_secs(self.max_retry_interval_secs)
    }

    /// Retry limit, if any.
    pub fn retry_limit(&self) -> Option<u32> {
        match self.heuristic_retry_limit {
            0 => None,
            n => Some(n),
        }
    }

    /// Validate settings.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.retry_backoff_threshold == 0 {
            return Err(SettingsError::ZeroBackoffThreshold);
        }
        if self.max_retry_interval() < self.retry_interval() {
            return Err(SettingsError::MaxIntervalBelowBase {
                base: self.retry_interval().as_secs(),
                max: self.max_retry_interval_secs,
            });
        }
        Ok(())
    }

    /// Settings for tests: short waits, no timeout.
    pub fn for_testing() -> Self {
        TransactionSettings {
            transaction_timeout_secs: 0,
            heuristic_retry_interval_secs: 1,
            max_retry_interval_secs: 4,
            ..Self::default()
        }
    }
}

/// Settings validation errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SettingsError {
    /// Backoff threshold must be at least one attempt.
    #[error("retry backoff threshold must be at least 1")]
    ZeroBackoffThreshold,

    /// The retry cap is below the base interval.
    #[error("max retry interval {max}s is below the base interval {base}s")]
    MaxIntervalBelowBase {
        /// Effective base interval
        base: u64,
        /// Configured cap
        max: u64,
    },
}
