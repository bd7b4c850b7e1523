//! Recovery statistics

/// Counters describing what recovery of one failure domain did.
///
/// Replay fills in the record and partner counts once; reconciliation
/// passes accumulate the rest.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Epoch found in the logs (0 for fresh logs).
    pub recovered_epoch: u32,

    /// Epoch written back to the logs for this run.
    pub epoch: u32,

    /// Transactions rebuilt from the transaction log.
    pub transactions_recovered: usize,

    /// Records of finished or undecided work dropped at replay.
    pub records_discarded: usize,

    /// Partners restored from the partner log.
    pub partners_recovered: usize,

    /// Stale partner records below the low watermark.
    pub partners_ignored: usize,

    /// Partners removed once recovery no longer needed them.
    pub partners_cleared: usize,

    /// Branches resource managers still reported in doubt.
    pub in_doubt_branches: usize,

    /// In-doubt branches no transaction record claimed, rolled back.
    pub orphans_rolled_back: usize,

    /// Reconciliation passes made.
    pub passes: u32,

    /// Recovered transactions driven to completion.
    pub transactions_completed: usize,

    /// Recovered transactions abandoned after the retry limit.
    pub transactions_abandoned: usize,
}

impl RecoveryStats {
    /// Recovered transactions not yet completed or abandoned.
    pub fn outstanding(&self) -> usize {
        self.transactions_recovered
            .saturating_sub(self.transactions_completed + self.transactions_abandoned)
    }

    /// True when the logs held nothing to recover.
    pub fn was_clean(&self) -> bool {
        self.transactions_recovered == 0 && self.partners_recovered == 0
    }
}
