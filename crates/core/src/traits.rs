//! Seams to external collaborators
//!
//! - ResourceManager / OnePhaseResource: participants driven by the protocol
//! - ResourceFactory: reconnects to a resource manager from its descriptor
//! - Synchronization: callbacks around completion
//! - ProviderDirectory: tells recovery whether a subordinate's owner still exists
//! - RecoveryLog: record/section log store consumed by the durability layer

use crate::error::{LogError, TxResult};
use crate::status::TransactionState;
use crate::types::PartnerDescriptor;
use crate::xa::{EndFlag, StartFlag, Vote, XaResult};
use crate::xid::Xid;
use std::sync::Arc;

/// A two-phase capable resource manager.
///
/// Calls may block on I/O. Implementations must be thread-safe because
/// recovery contacts the same resource manager from several transactions.
pub trait ResourceManager: Send + Sync {
    /// Name of the resource manager, used in diagnostics.
    fn name(&self) -> &str;

    /// Associate work with a branch.
    fn start(&self, xid: &Xid, flag: StartFlag) -> XaResult<()>;

    /// End the association of work with a branch.
    fn end(&self, xid: &Xid, flag: EndFlag) -> XaResult<()>;

    /// Vote on the branch.
    fn prepare(&self, xid: &Xid) -> XaResult<Vote>;

    /// Commit the branch, without a prior prepare when `one_phase` is set.
    fn commit(&self, xid: &Xid, one_phase: bool) -> XaResult<()>;

    /// Roll the branch back.
    fn rollback(&self, xid: &Xid) -> XaResult<()>;

    /// Discard a heuristically completed branch.
    fn forget(&self, xid: &Xid) -> XaResult<()>;

    /// Branches the resource manager holds prepared or heuristically completed.
    fn recover(&self) -> XaResult<Vec<Xid>>;

    /// True when `other` is the same resource manager instance.
    fn is_same_rm(&self, _other: &dyn ResourceManager) -> XaResult<bool> {
        Ok(false)
    }

    /// Pass the remaining transaction lifetime. Returns whether it was applied.
    fn set_transaction_timeout(&self, _secs: u64) -> XaResult<bool> {
        Ok(false)
    }
}

/// A resource that can only commit in one phase.
pub trait OnePhaseResource: Send + Sync {
    /// Name of the resource, used in diagnostics.
    fn name(&self) -> &str;

    /// Commit the resource's work.
    fn commit_one_phase(&self) -> XaResult<()>;

    /// Roll the resource's work back.
    fn rollback(&self) -> XaResult<()>;
}

/// Reconnects to a resource manager described by a logged descriptor.
pub trait ResourceFactory: Send + Sync {
    /// Open a resource manager for `descriptor`.
    fn connect(&self, descriptor: &PartnerDescriptor) -> XaResult<Arc<dyn ResourceManager>>;
}

/// Completion callbacks registered by the application.
pub trait Synchronization: Send + Sync {
    /// Runs before voting. An error marks the transaction rollback-only.
    fn before_completion(&self) -> TxResult<()>;

    /// Runs once after the outcome has been delivered.
    fn after_completion(&self, state: TransactionState);
}

/// Knows which external providers (owners of subordinate transactions) are
/// still installed.
pub trait ProviderDirectory: Send + Sync {
    /// True when the provider is present.
    fn is_provider_installed(&self, provider: &str) -> bool;
}

/// Identifier of a record in a [`RecoveryLog`].
pub type RecordId = u64;

/// One section of a log record: a kind tag and its data items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSection {
    /// Section kind.
    pub kind: u16,
    /// Data items, oldest first. Single-valued sections hold at most one.
    pub data: Vec<Vec<u8>>,
}

/// A record read back from a [`RecoveryLog`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Record id.
    pub id: RecordId,
    /// Sections in creation order.
    pub sections: Vec<LogSection>,
}

impl LogRecord {
    /// Section of the given kind, if present.
    pub fn section(&self, kind: u16) -> Option<&LogSection> {
        self.sections.iter().find(|s| s.kind == kind)
    }

    /// Latest data item of the given section kind.
    pub fn latest(&self, kind: u16) -> Option<&[u8]> {
        self.section(kind)
            .and_then(|s| s.data.last())
            .map(|d| d.as_slice())
    }

    /// All data items of the given section kind.
    pub fn items(&self, kind: u16) -> &[Vec<u8>] {
        self.section(kind).map(|s| s.data.as_slice()).unwrap_or(&[])
    }
}

/// Append-only record/section log store.
///
/// Writes are not durable until [`force`](Self::force). After a crash only
/// forced data is visible; a record with no forced sections does not exist.
pub trait RecoveryLog: Send + Sync {
    /// Log name, used in diagnostics and corruption errors.
    fn name(&self) -> &str;

    /// Allocate a new empty record.
    fn create_record(&self) -> Result<RecordId, LogError>;

    /// Write a data item to a section of a record. A single-valued section
    /// keeps only the latest item; otherwise items accumulate.
    fn write_section(
        &self,
        record: RecordId,
        kind: u16,
        data: &[u8],
        single_valued: bool,
    ) -> Result<(), LogError>;

    /// Make every preceding write durable.
    fn force(&self) -> Result<(), LogError>;

    /// Remove a record. Takes effect durably with the next force.
    fn remove_record(&self, record: RecordId) -> Result<(), LogError>;

    /// Current records in id order.
    fn records(&self) -> Result<Vec<LogRecord>, LogError>;

    /// Compact the store so it only holds current records.
    fn keypoint(&self) -> Result<(), LogError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_accessors() {
        let record = LogRecord {
            id: 3,
            sections: vec![
                LogSection {
                    kind: 1,
                    data: vec![b"a".to_vec(), b"b".to_vec()],
                },
                LogSection {
                    kind: 2,
                    data: vec![],
                },
            ],
        };

        assert_eq!(record.latest(1), Some(&b"b"[..]));
        assert_eq!(record.items(1).len(), 2);
        assert_eq!(record.latest(2), None);
        assert!(record.items(9).is_empty());
    }
}
