//! Protocol statuses for branches and transactions
//!
//! [`BranchStatus`] tracks one participant through voting and outcome
//! delivery. [`TransactionState`] is the per-transaction state machine:
//!
//! ```text
//! Active ──► Preparing ──► Prepared (subordinate) ──┐
//!   │            │                                   │
//!   │            ├──► LastParticipant ───────────────┤
//!   │            ├──► CommittingOnePhase ──┐         ▼
//!   │            └──────────────────────► Committing ──► Committed ──► None
//!   │                                       │
//!   │                                       └──► HeuristicOnCommit ──► None
//!   └──► RollingBack ──► RolledBack ──► None
//!              └──► HeuristicOnRollback ──► None
//! ```
//!
//! Transitions only move forward. Re-entering the current state is allowed so
//! recovery can redrive a decision idempotently.

use crate::heuristic::HeuristicOutcome;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of one enlisted participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BranchStatus {
    /// Enlisted, not yet voted.
    Registered,
    /// Voted OK in the prepare phase.
    Prepared,
    /// Outcome delivery in progress (or awaiting retry).
    Completing,
    /// One-phase commit in progress (or awaiting retry).
    CompletingOnePhase,
    /// Committed.
    Committed,
    /// Rolled back.
    RolledBack,
    /// Participant heuristically committed.
    HeuristicCommit,
    /// Participant heuristically rolled back.
    HeuristicRollback,
    /// Participant partly committed and partly rolled back.
    HeuristicMixed,
    /// Participant outcome unknown.
    HeuristicHazard,
    /// Finished: read-only, forgotten, or abandoned.
    Completed,
}

impl BranchStatus {
    /// True for the four heuristic statuses.
    pub fn is_heuristic(self) -> bool {
        matches!(
            self,
            BranchStatus::HeuristicCommit
                | BranchStatus::HeuristicRollback
                | BranchStatus::HeuristicMixed
                | BranchStatus::HeuristicHazard
        )
    }

    /// True when no further protocol flow is owed to the participant, apart
    /// from `forget` for heuristic statuses.
    pub fn is_final(self) -> bool {
        matches!(
            self,
            BranchStatus::Committed | BranchStatus::RolledBack | BranchStatus::Completed
        ) || self.is_heuristic()
    }

    /// Heuristic value of this branch, for folding into the transaction
    /// outcome. Plain `Committed`/`RolledBack` map to the matching direction.
    pub fn heuristic(self) -> HeuristicOutcome {
        match self {
            BranchStatus::HeuristicCommit | BranchStatus::Committed => HeuristicOutcome::Commit,
            BranchStatus::HeuristicRollback | BranchStatus::RolledBack => {
                HeuristicOutcome::Rollback
            }
            BranchStatus::HeuristicMixed => HeuristicOutcome::Mixed,
            BranchStatus::HeuristicHazard => HeuristicOutcome::Hazard,
            _ => HeuristicOutcome::None,
        }
    }
}

impl fmt::Display for BranchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BranchStatus::Registered => "REGISTERED",
            BranchStatus::Prepared => "PREPARED",
            BranchStatus::Completing => "COMPLETING",
            BranchStatus::CompletingOnePhase => "COMPLETING_ONE_PHASE",
            BranchStatus::Committed => "COMMITTED",
            BranchStatus::RolledBack => "ROLLEDBACK",
            BranchStatus::HeuristicCommit => "HEURISTIC_COMMIT",
            BranchStatus::HeuristicRollback => "HEURISTIC_ROLLBACK",
            BranchStatus::HeuristicMixed => "HEURISTIC_MIXED",
            BranchStatus::HeuristicHazard => "HEURISTIC_HAZARD",
            BranchStatus::Completed => "COMPLETED",
        };
        f.write_str(s)
    }
}

/// Lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionState {
    /// Accepting enlistments.
    Active,
    /// Voting in progress.
    Preparing,
    /// Subordinate voted OK and awaits its superior's decision.
    Prepared,
    /// Commit decided; delivering to participants.
    Committing,
    /// Single participant being committed without a vote.
    CommittingOnePhase,
    /// Waiting on the last one-phase participant to decide.
    LastParticipant,
    /// Committed.
    Committed,
    /// Rollback decided; delivering to participants.
    RollingBack,
    /// Rolled back.
    RolledBack,
    /// Committed with at least one participant diverging.
    HeuristicOnCommit,
    /// Rolled back with at least one participant diverging.
    HeuristicOnRollback,
    /// Forgotten.
    None,
}

impl TransactionState {
    /// True when the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: TransactionState) -> bool {
        use TransactionState::*;
        if self == next {
            return true;
        }
        match self {
            Active => matches!(
                next,
                Preparing | CommittingOnePhase | Committed | RollingBack
            ),
            Preparing => matches!(
                next,
                Prepared
                    | Committing
                    | CommittingOnePhase
                    | LastParticipant
                    | Committed
                    | RolledBack
                    | RollingBack
            ),
            Prepared | LastParticipant => matches!(next, Committing | RollingBack),
            Committing => matches!(next, Committed | HeuristicOnCommit),
            CommittingOnePhase => {
                matches!(next, Committed | RolledBack | HeuristicOnCommit | RollingBack)
            }
            RollingBack => matches!(next, RolledBack | HeuristicOnRollback),
            Committed | RolledBack | HeuristicOnCommit | HeuristicOnRollback => next == None,
            None => false,
        }
    }

    /// True for states whose decision is commit.
    pub fn is_commit_family(self) -> bool {
        matches!(
            self,
            TransactionState::Committing
                | TransactionState::CommittingOnePhase
                | TransactionState::Committed
                | TransactionState::HeuristicOnCommit
        )
    }

    /// True for states whose decision is rollback.
    pub fn is_rollback_family(self) -> bool {
        matches!(
            self,
            TransactionState::RollingBack
                | TransactionState::RolledBack
                | TransactionState::HeuristicOnRollback
        )
    }

    /// True once the outcome has been fully delivered.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransactionState::Committed
                | TransactionState::RolledBack
                | TransactionState::HeuristicOnCommit
                | TransactionState::HeuristicOnRollback
                | TransactionState::None
        )
    }

    /// True for states worth persisting in the transaction log: recovery
    /// needs a record only once a decision or a prepared vote exists.
    pub fn is_recoverable(self) -> bool {
        matches!(
            self,
            TransactionState::Prepared
                | TransactionState::LastParticipant
                | TransactionState::Committing
                | TransactionState::RollingBack
                | TransactionState::HeuristicOnCommit
                | TransactionState::HeuristicOnRollback
        )
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransactionState::Active => "ACTIVE",
            TransactionState::Preparing => "PREPARING",
            TransactionState::Prepared => "PREPARED",
            TransactionState::Committing => "COMMITTING",
            TransactionState::CommittingOnePhase => "COMMITTING_ONE_PHASE",
            TransactionState::LastParticipant => "LAST_PARTICIPANT",
            TransactionState::Committed => "COMMITTED",
            TransactionState::RollingBack => "ROLLING_BACK",
            TransactionState::RolledBack => "ROLLED_BACK",
            TransactionState::HeuristicOnCommit => "HEURISTIC_ON_COMMIT",
            TransactionState::HeuristicOnRollback => "HEURISTIC_ON_ROLLBACK",
            TransactionState::None => "NONE",
        };
        f.write_str(s)
    }
}
