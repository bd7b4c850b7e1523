//! Per-transaction state value
//!
//! The protocol state, the combined heuristic outcome and the rollback-only
//! flag live in one [`TxStateCell`]. Every change goes through
//! [`TxStateCell::transition`] or [`TxStateCell::raise_heuristic`], which
//! enforce the invariants structurally:
//!
//! - state moves only along the edges allowed by
//!   [`TransactionState::can_transition_to`]
//! - the heuristic outcome only moves up the lattice
//! - rollback-only is set-once
//!
//! Readers take a [`TxStatus`] snapshot; nothing hands out the fields
//! themselves. Reconstruction from a log record is the only way to place a
//! transaction directly into a non-initial state.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use txcoord_core::{HeuristicOutcome, TransactionState, TxError, TxResult};

/// Shared, set-only rollback-only marker.
///
/// Cloned into timers and resource callbacks so they can doom a transaction
/// without entering its critical section.
#[derive(Debug, Clone, Default)]
pub struct RollbackOnlyFlag(Arc<AtomicBool>);

impl RollbackOnlyFlag {
    /// A fresh, unset flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark rollback-only. Returns true if this call set it.
    pub fn set(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }

    /// True once set.
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Point-in-time view of a transaction's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxStatus {
    /// Protocol state.
    pub state: TransactionState,
    /// Rollback-only flag.
    pub rollback_only: bool,
    /// Combined heuristic outcome.
    pub heuristic: HeuristicOutcome,
    /// Bumped on every state or outcome change.
    pub version: u64,
}

#[derive(Debug)]
struct CellInner {
    state: TransactionState,
    heuristic: HeuristicOutcome,
    version: u64,
}

/// Owned, versioned state of one transaction.
#[derive(Debug)]
pub struct TxStateCell {
    inner: RwLock<CellInner>,
    rollback_only: RollbackOnlyFlag,
}

impl TxStateCell {
    /// A new transaction in `Active`.
    pub fn new() -> Self {
        Self::reconstructed(TransactionState::Active, HeuristicOutcome::None)
    }

    /// A transaction rebuilt from a log record.
    pub fn reconstructed(state: TransactionState, heuristic: HeuristicOutcome) -> Self {
        TxStateCell {
            inner: RwLock::new(CellInner {
                state,
                heuristic,
                version: 0,
            }),
            rollback_only: RollbackOnlyFlag::new(),
        }
    }

    /// Current protocol state.
    pub fn state(&self) -> TransactionState {
        self.inner.read().state
    }

    /// Current heuristic outcome.
    pub fn heuristic(&self) -> HeuristicOutcome {
        self.inner.read().heuristic
    }

    /// The rollback-only flag, for sharing with timers.
    pub fn rollback_only(&self) -> &RollbackOnlyFlag {
        &self.rollback_only
    }

    /// Move to `next`.
    ///
    /// # Errors
    /// `IllegalState` when the state machine has no such edge.
    pub fn transition(&self, next: TransactionState) -> TxResult<TransactionState> {
        let mut inner = self.inner.write();
        let previous = inner.state;
        if !previous.can_transition_to(next) {
            return Err(TxError::illegal_state(format!(
                "cannot move from {} to {}",
                previous, next
            )));
        }
        if previous != next {
            inner.state = next;
            inner.version += 1;
        }
        Ok(previous)
    }

    /// Raise the heuristic outcome. Returns true if it changed.
    pub fn raise_heuristic(&self, outcome: HeuristicOutcome) -> bool {
        let mut inner = self.inner.write();
        let before = inner.heuristic;
        inner.heuristic.raise(outcome);
        if inner.heuristic != before {
            inner.version += 1;
            true
        } else {
            false
        }
    }

    /// Snapshot for readers.
    pub fn snapshot(&self) -> TxStatus {
        let inner = self.inner.read();
        TxStatus {
            state: inner.state,
            rollback_only: self.rollback_only.is_set(),
            heuristic: inner.heuristic,
            version: inner.version,
        }
    }
}

impl Default for TxStateCell {
    fn default() -> Self {
        Self::new()
    }
}
