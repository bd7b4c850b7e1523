//! Transaction log
//!
//! One record per transaction that has reached a point recovery must know
//! about: a prepared vote, a decision, or a heuristic outcome. The record
//! carries the protocol state and one section item per prepared branch.
//!
//! ## Replay
//!
//! `replay` returns the service data and every record whose state is
//! recoverable. Records that never had a state forced, or whose state is
//! terminal, are reported as discarded so the caller can remove them.
//! Corruption (duplicate or partial service data, undecodable sections,
//! transaction records without service data) is an error.

use crate::format::{decode, encode, kinds, BranchEntry, ServiceData, TransactionHeader};
use crate::service::{corrupt, read_service_data, split_service};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;
use txcoord_core::{HeuristicOutcome, LogError, RecordId, RecoveryLog, TransactionState};

/// A transaction read back from the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedTransaction {
    /// Record holding the transaction.
    pub record: RecordId,
    /// Identity.
    pub header: TransactionHeader,
    /// Last forced state.
    pub state: TransactionState,
    /// Logged heuristic outcome.
    pub heuristic: HeuristicOutcome,
    /// Prepared branches.
    pub branches: Vec<BranchEntry>,
}

/// Result of replaying the transaction log.
#[derive(Debug, Clone, Default)]
pub struct TranLogReplay {
    /// Service data, absent on a fresh log.
    pub service: Option<ServiceData>,
    /// Transactions to recover.
    pub transactions: Vec<LoggedTransaction>,
    /// Records holding finished or undecided work.
    pub discarded: Vec<RecordId>,
}

/// Semantic layer over the transaction [`RecoveryLog`].
pub struct TransactionLog {
    log: Arc<dyn RecoveryLog>,
    service_record: Mutex<Option<RecordId>>,
}

impl TransactionLog {
    /// Wrap a log store.
    pub fn new(log: Arc<dyn RecoveryLog>) -> Self {
        TransactionLog {
            log,
            service_record: Mutex::new(None),
        }
    }

    /// Name of the underlying log.
    pub fn name(&self) -> &str {
        self.log.name()
    }

    /// Write (or rewrite) the service data and force.
    pub fn write_service_data(&self, data: &ServiceData) -> Result<(), LogError> {
        let mut service = self.service_record.lock();
        let record = match *service {
            Some(r) => r,
            None => {
                let r = self.log.create_record()?;
                *service = Some(r);
                r
            }
        };
        self.log
            .write_section(record, kinds::SERVER_DATA, &encode(&data.server_name)?, true)?;
        self.log
            .write_section(record, kinds::APPLID_DATA, &encode(&data.appl_id)?, true)?;
        self.log
            .write_section(record, kinds::EPOCH_DATA, &encode(&data.epoch)?, true)?;
        self.log.force()?;
        debug!(target: "txcoord::log", log = %self.name(), epoch = data.epoch, "Service data written");
        Ok(())
    }

    /// Create the record for a transaction. Not forced.
    pub fn create_transaction(&self, header: &TransactionHeader) -> Result<RecordId, LogError> {
        let record = self.log.create_record()?;
        self.log
            .write_section(record, kinds::GLOBAL_ID, &encode(header)?, true)?;
        Ok(record)
    }

    /// Add a prepared branch to a transaction record. Not forced.
    pub fn add_branch(&self, record: RecordId, entry: &BranchEntry) -> Result<(), LogError> {
        self.log
            .write_section(record, kinds::RESOURCE_BRANCH, &encode(entry)?, false)
    }

    /// Record the transaction state and force.
    pub fn set_state(&self, record: RecordId, state: TransactionState) -> Result<(), LogError> {
        self.log
            .write_section(record, kinds::TRANSACTION_STATE, &encode(&state)?, true)?;
        self.log.force()
    }

    /// Record the combined heuristic outcome and force.
    pub fn set_heuristic(&self, record: RecordId, outcome: HeuristicOutcome) -> Result<(), LogError> {
        self.log
            .write_section(record, kinds::HEURISTIC_OUTCOME, &encode(&outcome)?, true)?;
        self.log.force()
    }

    /// Remove a transaction record and force.
    pub fn remove(&self, record: RecordId) -> Result<(), LogError> {
        self.log.remove_record(record)?;
        self.log.force()
    }

    /// Compact the underlying store.
    pub fn keypoint(&self) -> Result<(), LogError> {
        self.log.keypoint()
    }

    /// Read back the service data and recoverable transactions.
    pub fn replay(&self) -> Result<TranLogReplay, LogError> {
        let name = self.name().to_string();
        let split = split_service(&name, self.log.records()?)?;

        let service = match &split.service {
            Some((id, record)) => {
                *self.service_record.lock() = Some(*id);
                Some(read_service_data(&name, record)?)
            }
            None => None,
        };

        let mut replay = TranLogReplay {
            service,
            ..TranLogReplay::default()
        };

        for record in split.others {
            let header = match record.latest(kinds::GLOBAL_ID) {
                Some(bytes) => decode::<TransactionHeader>(bytes)
                    .map_err(|e| corrupt(&name, "transaction header", e))?,
                None => {
                    return Err(LogError::Corrupted(format!(
                        "{}: record {} has no transaction header",
                        name, record.id
                    )))
                }
            };

            let state = match record.latest(kinds::TRANSACTION_STATE) {
                Some(bytes) => Some(
                    decode::<TransactionState>(bytes)
                        .map_err(|e| corrupt(&name, "transaction state", e))?,
                ),
                None => None,
            };

            let state = match state {
                Some(s) if s.is_recoverable() => s,
                _ => {
                    debug!(target: "txcoord::log", xid = %header.xid, ?state, "Discarding transaction record");
                    replay.discarded.push(record.id);
                    continue;
                }
            };

            let heuristic = match record.latest(kinds::HEURISTIC_OUTCOME) {
                Some(bytes) => decode::<HeuristicOutcome>(bytes)
                    .map_err(|e| corrupt(&name, "heuristic outcome", e))?,
                None => HeuristicOutcome::None,
            };

            let branches = record
                .items(kinds::RESOURCE_BRANCH)
                .iter()
                .map(|bytes| decode::<BranchEntry>(bytes).map_err(|e| corrupt(&name, "branch", e)))
                .collect::<Result<Vec<_>, _>>()?;

            replay.transactions.push(LoggedTransaction {
                record: record.id,
                header,
                state,
                heuristic,
                branches,
            });
        }

        if replay.service.is_none() && !replay.transactions.is_empty() {
            return Err(LogError::Corrupted(format!(
                "{}: transaction records without service data",
                name
            )));
        }

        Ok(replay)
    }
}
