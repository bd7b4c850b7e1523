//! In-memory recovery log.
//!
//! Writes land in a volatile view; [`force`](RecoveryLog::force) copies the
//! volatile view into the durable view. [`MemoryLog::restart`] throws the
//! volatile view away, which is exactly what a crash does to unforced data.

use super::RecordTable;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;
use txcoord_core::{LogError, LogRecord, RecordId, RecoveryLog};

struct MemoryInner {
    volatile: RecordTable,
    durable: RecordTable,
    next_record: RecordId,
    closed: bool,
}

/// Recovery log held in memory.
pub struct MemoryLog {
    name: String,
    inner: Mutex<MemoryInner>,
    forces: AtomicU64,
}

impl MemoryLog {
    /// Create an empty log.
    pub fn new(name: impl Into<String>) -> Self {
        MemoryLog {
            name: name.into(),
            inner: Mutex::new(MemoryInner {
                volatile: RecordTable::default(),
                durable: RecordTable::default(),
                next_record: 1,
                closed: false,
            }),
            forces: AtomicU64::new(0),
        }
    }

    /// Simulate a crash and restart: unforced writes are lost and the log
    /// is reopened.
    pub fn restart(&self) {
        let mut inner = self.inner.lock();
        inner.volatile = inner.durable.clone();
        inner.next_record = inner.durable.max_id().map_or(1, |id| id + 1);
        inner.closed = false;
        debug!(target: "txcoord::log", log = %self.name, records = inner.durable.len(), "Memory log restarted");
    }

    /// Close the log; further operations fail with [`LogError::Closed`].
    pub fn close(&self) {
        self.inner.lock().closed = true;
    }

    /// Number of forces performed.
    pub fn force_count(&self) -> u64 {
        self.forces.load(Ordering::Relaxed)
    }

    /// Records that would survive a crash right now.
    pub fn durable_records(&self) -> Vec<LogRecord> {
        self.inner.lock().durable.snapshot()
    }
}

impl RecoveryLog for MemoryLog {
    fn name(&self) -> &str {
        &self.name
    }

    fn create_record(&self) -> Result<RecordId, LogError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(LogError::Closed);
        }
        let id = inner.next_record;
        inner.next_record += 1;
        Ok(id)
    }

    fn write_section(
        &self,
        record: RecordId,
        kind: u16,
        data: &[u8],
        single_valued: bool,
    ) -> Result<(), LogError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(LogError::Closed);
        }
        if record >= inner.next_record {
            return Err(LogError::UnknownRecord(record));
        }
        inner.volatile.write(record, kind, data, single_valued);
        Ok(())
    }

    fn force(&self) -> Result<(), LogError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(LogError::Closed);
        }
        inner.durable = inner.volatile.clone();
        self.forces.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn remove_record(&self, record: RecordId) -> Result<(), LogError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(LogError::Closed);
        }
        if !inner.volatile.remove(record) && record >= inner.next_record {
            return Err(LogError::UnknownRecord(record));
        }
        Ok(())
    }

    fn records(&self) -> Result<Vec<LogRecord>, LogError> {
        let inner = self.inner.lock();
        if inner.closed {
            return Err(LogError::Closed);
        }
        Ok(inner.volatile.snapshot())
    }

    fn keypoint(&self) -> Result<(), LogError> {
        self.force()
    }
}
