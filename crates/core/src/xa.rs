//! Resource-manager protocol vocabulary
//!
//! The closed set of outcome codes a resource manager may return, plus the
//! vote and association flags used by `prepare`, `start` and `end`.

use crate::heuristic::HeuristicOutcome;
use std::fmt;
use thiserror::Error;

/// Reason attached to a branch rollback reported by a resource manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RollbackReason {
    /// Rolled back for an unspecified reason.
    Unspecified,
    /// Communication failure inside the resource manager.
    Communication,
    /// Deadlock detected.
    Deadlock,
    /// Integrity constraint violated.
    Integrity,
    /// Protocol error inside the resource manager.
    Protocol,
    /// Branch timed out.
    Timeout,
    /// Transient failure; the branch may be retried by the application.
    Transient,
}

impl fmt::Display for RollbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RollbackReason::Unspecified => "unspecified",
            RollbackReason::Communication => "communication",
            RollbackReason::Deadlock => "deadlock",
            RollbackReason::Integrity => "integrity",
            RollbackReason::Protocol => "protocol",
            RollbackReason::Timeout => "timeout",
            RollbackReason::Transient => "transient",
        };
        f.write_str(s)
    }
}

/// Failure codes returned by resource-manager calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum XaError {
    /// Resource manager unavailable; the call may succeed later.
    #[error("resource manager unavailable (XAER_RMFAIL)")]
    RmFail,

    /// Resource manager internal error; the branch's work may be lost.
    #[error("resource manager error (XAER_RMERR)")]
    RmErr,

    /// The resource manager rolled the branch back.
    #[error("branch rolled back ({0})")]
    Rollback(RollbackReason),

    /// The branch was heuristically committed.
    #[error("branch heuristically committed (XA_HEURCOM)")]
    HeurCom,

    /// The branch was heuristically rolled back.
    #[error("branch heuristically rolled back (XA_HEURRB)")]
    HeurRb,

    /// The branch was partly committed and partly rolled back.
    #[error("branch heuristically mixed (XA_HEURMIX)")]
    HeurMix,

    /// The branch outcome is unknown.
    #[error("branch outcome hazard (XA_HEURHAZ)")]
    HeurHaz,

    /// The resource manager has no record of the branch.
    #[error("unknown branch (XAER_NOTA)")]
    NotA,

    /// Invalid arguments.
    #[error("invalid argument (XAER_INVAL)")]
    Inval,

    /// Call made in an improper context.
    #[error("protocol violation (XAER_PROTO)")]
    Proto,

    /// The call could not complete now and should be retried.
    #[error("retry (XA_RETRY)")]
    Retry,
}

impl XaError {
    /// True for the rollback family.
    pub fn is_rollback(self) -> bool {
        matches!(self, XaError::Rollback(_))
    }

    /// Heuristic outcome reported by this code, if it is one of the four
    /// heuristic codes.
    pub fn heuristic(self) -> Option<HeuristicOutcome> {
        match self {
            XaError::HeurCom => Some(HeuristicOutcome::Commit),
            XaError::HeurRb => Some(HeuristicOutcome::Rollback),
            XaError::HeurMix => Some(HeuristicOutcome::Mixed),
            XaError::HeurHaz => Some(HeuristicOutcome::Hazard),
            _ => None,
        }
    }

    /// True for codes that only mean "not now".
    pub fn is_transient(self) -> bool {
        matches!(self, XaError::RmFail | XaError::Retry)
    }
}

/// Result of a resource-manager call.
pub type XaResult<T> = std::result::Result<T, XaError>;

/// Successful prepare vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Vote {
    /// Prepared; the branch awaits the outcome.
    Ok,
    /// Nothing to commit; the branch is finished.
    ReadOnly,
}

/// Flags for associating work with a branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StartFlag {
    /// A new branch.
    NoFlags,
    /// Join an existing branch of the same resource manager.
    Join,
}

/// Flags for ending an association.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndFlag {
    /// Work completed normally.
    Success,
    /// Work failed; the branch will be rolled back.
    Fail,
    /// Association suspended and may be resumed.
    Suspend,
}
