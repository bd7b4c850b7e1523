//! Transaction counters

use std::sync::atomic::{AtomicU64, Ordering};
use txcoord_core::TransactionState;

/// Lock-free counters updated as transactions begin and finish.
#[derive(Debug, Default)]
pub(crate) struct MetricsRecorder {
    active_count: AtomicU64,
    total_started: AtomicU64,
    total_committed: AtomicU64,
    total_rolled_back: AtomicU64,
    total_heuristic: AtomicU64,
}

impl MetricsRecorder {
    pub(crate) fn record_start(&self) {
        self.active_count.fetch_add(1, Ordering::Relaxed);
        self.total_started.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a forgotten transaction by its last state.
    pub(crate) fn record_finish(&self, outcome: Option<TransactionState>, heuristic: bool) {
        // Saturating: a finish without a start must not wrap
        let _ = self
            .active_count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |x| {
                Some(x.saturating_sub(1))
            });
        let counter = match outcome {
            _ if heuristic => &self.total_heuristic,
            Some(TransactionState::HeuristicOnCommit | TransactionState::HeuristicOnRollback) => {
                &self.total_heuristic
            }
            Some(TransactionState::Committed) => &self.total_committed,
            _ => &self.total_rolled_back,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn active_count(&self) -> u64 {
        self.active_count.load(Ordering::SeqCst)
    }

    pub(crate) fn snapshot(&self) -> TransactionMetrics {
        let started = self.total_started.load(Ordering::Relaxed);
        let committed = self.total_committed.load(Ordering::Relaxed);

        TransactionMetrics {
            active_count: self.active_count.load(Ordering::Relaxed),
            total_started: started,
            total_committed: committed,
            total_rolled_back: self.total_rolled_back.load(Ordering::Relaxed),
            total_heuristic: self.total_heuristic.load(Ordering::Relaxed),
            commit_rate: if started > 0 {
                committed as f64 / started as f64
            } else {
                0.0
            },
        }
    }
}

/// Transaction metrics
///
/// Counts transactions begun or imported through the service. A
/// transaction is counted as finished once it has been forgotten.
#[derive(Debug, Clone)]
pub struct TransactionMetrics {
    /// Transactions begun and not yet forgotten
    pub active_count: u64,
    /// Transactions begun or imported
    pub total_started: u64,
    /// Transactions that committed cleanly
    pub total_committed: u64,
    /// Transactions that rolled back cleanly
    pub total_rolled_back: u64,
    /// Transactions that finished with a heuristic outcome
    pub total_heuristic: u64,
    /// Clean commits per started transaction
    pub commit_rate: f64,
}

impl TransactionMetrics {
    /// Transactions that finished, whatever the outcome
    pub fn total_completed(&self) -> u64 {
        self.total_committed + self.total_rolled_back + self.total_heuristic
    }

    /// Rollbacks per started transaction
    pub fn rollback_rate(&self) -> f64 {
        if self.total_started > 0 {
            self.total_rolled_back as f64 / self.total_started as f64
        } else {
            0.0
        }
    }
}
