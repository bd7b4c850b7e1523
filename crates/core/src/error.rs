//! Error types for transaction coordination
//!
//! [`TxError`] is what callers of commit, rollback, enlist and the service
//! lifecycle see. [`LogError`] is raised by recovery log stores.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.

use crate::heuristic::HeuristicOutcome;
use crate::settings::SettingsError;
use crate::xid::Xid;
use std::io;
use thiserror::Error;

/// Result type alias for coordination operations
pub type TxResult<T> = std::result::Result<T, TxError>;

/// Caller-visible transaction errors
#[derive(Debug, Error)]
pub enum TxError {
    /// The transaction was rolled back.
    #[error("transaction rolled back: {0}")]
    Rollback(String),

    /// Participants heuristically committed during a rollback.
    #[error("heuristic commit for {0}")]
    HeuristicCommit(Xid),

    /// Participants heuristically rolled back during a commit.
    #[error("heuristic rollback for {0}")]
    HeuristicRollback(Xid),

    /// Some participants committed and some rolled back.
    #[error("heuristic mixed outcome for {0}")]
    HeuristicMixed(Xid),

    /// The outcome of some participants is unknown.
    #[error("heuristic hazard for {0}")]
    HeuristicHazard(Xid),

    /// Internal invariant violation or unexpected resource-manager code.
    #[error("system error: {0}")]
    System(String),

    /// Operation not permitted in the current state.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// Recovery log failure.
    #[error("log error: {0}")]
    Log(#[from] LogError),

    /// Recovery found inconsistent or partially written log data.
    #[error("log {log} corrupted: {reason}")]
    Corrupted {
        /// Name of the affected log
        log: String,
        /// What was wrong
        reason: String,
    },

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The service is shutting down.
    #[error("transaction service is shutting down")]
    ShuttingDown,
}

impl TxError {
    /// Create a rollback error
    pub fn rollback(msg: impl Into<String>) -> Self {
        TxError::Rollback(msg.into())
    }

    /// Create a system error
    pub fn system(msg: impl Into<String>) -> Self {
        TxError::System(msg.into())
    }

    /// Create an illegal-state error
    pub fn illegal_state(msg: impl Into<String>) -> Self {
        TxError::IllegalState(msg.into())
    }

    /// Create a corruption error for the named log
    pub fn corrupted(log: impl Into<String>, reason: impl Into<String>) -> Self {
        TxError::Corrupted {
            log: log.into(),
            reason: reason.into(),
        }
    }

    /// Map a heuristic outcome to its error. `None` maps to `None`.
    pub fn from_heuristic(outcome: HeuristicOutcome, xid: &Xid) -> Option<Self> {
        match outcome {
            HeuristicOutcome::None => None,
            HeuristicOutcome::Commit => Some(TxError::HeuristicCommit(xid.clone())),
            HeuristicOutcome::Rollback => Some(TxError::HeuristicRollback(xid.clone())),
            HeuristicOutcome::Mixed => Some(TxError::HeuristicMixed(xid.clone())),
            HeuristicOutcome::Hazard => Some(TxError::HeuristicHazard(xid.clone())),
        }
    }

    /// True for the four heuristic errors
    pub fn is_heuristic(&self) -> bool {
        matches!(
            self,
            TxError::HeuristicCommit(_)
                | TxError::HeuristicRollback(_)
                | TxError::HeuristicMixed(_)
                | TxError::HeuristicHazard(_)
        )
    }

    /// True for the rollback error
    pub fn is_rollback(&self) -> bool {
        matches!(self, TxError::Rollback(_))
    }
}

impl From<SettingsError> for TxError {
    fn from(e: SettingsError) -> Self {
        TxError::Config(e.to_string())
    }
}

/// Errors raised by recovery log stores
#[derive(Debug, Error)]
pub enum LogError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding or decoding failure
    #[error("codec error: {0}")]
    Codec(String),

    /// Stored data failed validation
    #[error("log data corrupted: {0}")]
    Corrupted(String),

    /// No record with this id
    #[error("unknown record {0}")]
    UnknownRecord(u64),

    /// The log has been closed
    #[error("log closed")]
    Closed,
}

impl LogError {
    /// Create a codec error
    pub fn codec(msg: impl Into<String>) -> Self {
        LogError::Codec(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_from_heuristic() {
        let xid = Xid::global(Uuid::new_v4(), 1, 1);
        assert!(TxError::from_heuristic(HeuristicOutcome::None, &xid).is_none());
        assert!(matches!(
            TxError::from_heuristic(HeuristicOutcome::Mixed, &xid),
            Some(TxError::HeuristicMixed(_))
        ));
        assert!(TxError::from_heuristic(HeuristicOutcome::Hazard, &xid)
            .map(|e| e.is_heuristic())
            .unwrap_or(false));
    }

    #[test]
    fn test_log_error_converts() {
        let err: TxError = LogError::UnknownRecord(7).into();
        assert!(matches!(err, TxError::Log(LogError::UnknownRecord(7))));
        assert!(err.to_string().contains("unknown record 7"));
    }

    #[test]
    fn test_io_error_display() {
        let err = LogError::Io(io::Error::new(io::ErrorKind::NotFound, "gone"));
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn test_corrupted_display() {
        let err = TxError::corrupted("tranlog", "duplicate service data");
        let msg = err.to_string();
        assert!(msg.contains("tranlog"));
        assert!(msg.contains("duplicate service data"));
    }
}
