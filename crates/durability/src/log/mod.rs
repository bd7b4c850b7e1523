//! Recovery log stores
//!
//! Two implementations of [`RecoveryLog`](txcoord_core::RecoveryLog):
//!
//! - [`MemoryLog`]: volatile and durable views in memory, with
//!   [`MemoryLog::restart`] to simulate a crash
//! - [`FileLog`]: one append-only file of CRC-framed operations

mod file;
pub mod frame;
mod memory;

pub use file::FileLog;
pub use memory::MemoryLog;

use std::collections::BTreeMap;
use txcoord_core::{LogRecord, LogSection, RecordId};

/// Section contents of every live record.
#[derive(Debug, Clone, Default)]
pub(crate) struct RecordTable {
    records: BTreeMap<RecordId, Vec<LogSection>>,
}

impl RecordTable {
    pub(crate) fn write(&mut self, record: RecordId, kind: u16, data: &[u8], single_valued: bool) {
        let sections = self.records.entry(record).or_default();
        match sections.iter_mut().find(|s| s.kind == kind) {
            Some(section) => {
                if single_valued {
                    section.data.clear();
                }
                section.data.push(data.to_vec());
            }
            None => sections.push(LogSection {
                kind,
                data: vec![data.to_vec()],
            }),
        }
    }

    pub(crate) fn remove(&mut self, record: RecordId) -> bool {
        self.records.remove(&record).is_some()
    }

    pub(crate) fn contains(&self, record: RecordId) -> bool {
        self.records.contains_key(&record)
    }

    pub(crate) fn max_id(&self) -> Option<RecordId> {
        self.records.keys().next_back().copied()
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }

    pub(crate) fn snapshot(&self) -> Vec<LogRecord> {
        self.records
            .iter()
            .map(|(id, sections)| LogRecord {
                id: *id,
                sections: sections.clone(),
            })
            .collect()
    }
}
