//! Partner table
//!
//! A partner is a resource manager this coordinator has enlisted, identified
//! by a stable recovery id. Entries are shared by every branch that addresses
//! the same resource manager and are reference counted so recovery knows when
//! a partner's log record can be dropped.
//!
//! Enlistment registers the partner before returning (log-early), so a crash
//! right after `enlist` still leaves enough in the partner log for recovery to
//! reconnect and roll back whatever the resource manager holds in doubt.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use txcoord_core::{
    EndFlag, PartnerDescriptor, ResourceFactory, ResourceManager, StartFlag, TxError, TxResult,
    Vote, XaError, XaResult, Xid,
};
use txcoord_durability::{PartnerLog, PartnerRecord};

/// One known resource manager.
pub struct PartnerEntry {
    recovery_id: u64,
    descriptor: PartnerDescriptor,
    users: AtomicUsize,
    used_this_run: AtomicBool,
    recovered: AtomicBool,
    connection: Mutex<Option<Arc<dyn ResourceManager>>>,
    factory: Option<Arc<dyn ResourceFactory>>,
}

impl PartnerEntry {
    fn new(
        recovery_id: u64,
        descriptor: PartnerDescriptor,
        factory: Option<Arc<dyn ResourceFactory>>,
    ) -> Self {
        PartnerEntry {
            recovery_id,
            descriptor,
            users: AtomicUsize::new(0),
            used_this_run: AtomicBool::new(false),
            recovered: AtomicBool::new(false),
            connection: Mutex::new(None),
            factory,
        }
    }

    /// Stable recovery id.
    pub fn recovery_id(&self) -> u64 {
        self.recovery_id
    }

    /// Reconnection descriptor.
    pub fn descriptor(&self) -> &PartnerDescriptor {
        &self.descriptor
    }

    /// Take a reference on behalf of a branch.
    pub fn acquire(&self) {
        self.users.fetch_add(1, Ordering::SeqCst);
    }

    /// Drop a branch reference.
    pub fn release(&self) {
        // saturating: a release without acquire must not wrap
        let _ = self
            .users
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    /// Branches currently referencing this partner.
    pub fn users(&self) -> usize {
        self.users.load(Ordering::SeqCst)
    }

    /// True if a live enlistment used this partner since startup.
    pub fn used_this_run(&self) -> bool {
        self.used_this_run.load(Ordering::SeqCst)
    }

    /// Record that recovery has finished with this partner.
    pub fn mark_recovered(&self) {
        self.recovered.store(true, Ordering::SeqCst);
    }

    /// True once recovery has finished with this partner.
    pub fn is_recovered(&self) -> bool {
        self.recovered.load(Ordering::SeqCst)
    }

    /// Use a live connection from an enlistment.
    pub fn attach(&self, rm: Arc<dyn ResourceManager>) {
        *self.connection.lock() = Some(rm);
    }

    /// Connection to the resource manager, reconnecting through the factory
    /// when none is cached.
    pub fn connect(&self) -> XaResult<Arc<dyn ResourceManager>> {
        let mut connection = self.connection.lock();
        if let Some(rm) = connection.as_ref() {
            return Ok(rm.clone());
        }
        let factory = self.factory.as_ref().ok_or(XaError::RmFail)?;
        let rm = factory.connect(&self.descriptor)?;
        debug!(
            target: "txcoord::recovery",
            recovery_id = self.recovery_id,
            partner = %self.descriptor.name,
            "Reconnected to resource manager"
        );
        *connection = Some(rm.clone());
        Ok(rm)
    }

    /// Forget a connection that failed so the next call reconnects.
    pub fn reset_connection(&self) {
        *self.connection.lock() = None;
    }
}

impl std::fmt::Debug for PartnerEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartnerEntry")
            .field("recovery_id", &self.recovery_id)
            .field("descriptor", &self.descriptor)
            .field("users", &self.users())
            .field("recovered", &self.is_recovered())
            .finish()
    }
}

/// A resource manager reached through its partner entry.
///
/// Used for branches rebuilt from the log: the connection is made lazily on
/// the first protocol call and dropped again when the resource manager
/// reports itself unavailable.
pub struct RecoveredResource {
    partner: Arc<PartnerEntry>,
}

impl RecoveredResource {
    /// Wrap a partner.
    pub fn new(partner: Arc<PartnerEntry>) -> Self {
        RecoveredResource { partner }
    }

    fn call<T>(&self, f: impl FnOnce(&dyn ResourceManager) -> XaResult<T>) -> XaResult<T> {
        let rm = self.partner.connect()?;
        let result = f(rm.as_ref());
        if matches!(result, Err(XaError::RmFail)) {
            self.partner.reset_connection();
        }
        result
    }
}

impl ResourceManager for RecoveredResource {
    fn name(&self) -> &str {
        &self.partner.descriptor.name
    }

    fn start(&self, xid: &Xid, flag: StartFlag) -> XaResult<()> {
        self.call(|rm| rm.start(xid, flag))
    }

    fn end(&self, xid: &Xid, flag: EndFlag) -> XaResult<()> {
        self.call(|rm| rm.end(xid, flag))
    }

    fn prepare(&self, xid: &Xid) -> XaResult<Vote> {
        self.call(|rm| rm.prepare(xid))
    }

    fn commit(&self, xid: &Xid, one_phase: bool) -> XaResult<()> {
        self.call(|rm| rm.commit(xid, one_phase))
    }

    fn rollback(&self, xid: &Xid) -> XaResult<()> {
        self.call(|rm| rm.rollback(xid))
    }

    fn forget(&self, xid: &Xid) -> XaResult<()> {
        self.call(|rm| rm.forget(xid))
    }

    fn recover(&self) -> XaResult<Vec<Xid>> {
        self.call(|rm| rm.recover())
    }
}

/// All partners known to one coordinator process.
pub struct PartnerTable {
    log: Option<Arc<PartnerLog>>,
    factory: Option<Arc<dyn ResourceFactory>>,
    entries: DashMap<u64, Arc<PartnerEntry>>,
    by_descriptor: DashMap<PartnerDescriptor, u64>,
    next_local: AtomicU64,
    register_lock: Mutex<()>,
}

impl PartnerTable {
    /// A table without a partner log: recovery ids are process-local.
    pub fn unlogged() -> Self {
        PartnerTable {
            log: None,
            factory: None,
            entries: DashMap::new(),
            by_descriptor: DashMap::new(),
            next_local: AtomicU64::new(1),
            register_lock: Mutex::new(()),
        }
    }

    /// A table backed by a partner log.
    pub fn new(log: Arc<PartnerLog>, factory: Option<Arc<dyn ResourceFactory>>) -> Self {
        PartnerTable {
            log: Some(log),
            factory,
            ..Self::unlogged()
        }
    }

    /// Set the factory used to reconnect to recovered partners (builder pattern).
    pub fn with_factory(mut self, factory: Arc<dyn ResourceFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// The partner log, if any.
    pub fn log(&self) -> Option<&Arc<PartnerLog>> {
        self.log.as_ref()
    }

    /// True when registrations are durable.
    pub fn is_logging(&self) -> bool {
        self.log.is_some()
    }

    /// Register a partner for a live enlistment.
    ///
    /// Reuses the existing entry for an identical descriptor; otherwise the
    /// descriptor is logged and forced before the entry is returned.
    ///
    /// # Errors
    /// `System` when the partner log cannot be written.
    pub fn register(&self, descriptor: &PartnerDescriptor) -> TxResult<Arc<PartnerEntry>> {
        let _guard = self.register_lock.lock();

        if let Some(id) = self.by_descriptor.get(descriptor).map(|e| *e.value()) {
            if let Some(entry) = self.entries.get(&id).map(|e| e.value().clone()) {
                entry.used_this_run.store(true, Ordering::SeqCst);
                return Ok(entry);
            }
        }

        let id = match &self.log {
            Some(log) => log.log_partner(descriptor).map_err(|e| {
                TxError::system(format!("cannot log partner {}: {}", descriptor.name, e))
            })?,
            None => self.next_local.fetch_add(1, Ordering::SeqCst),
        };

        let entry = Arc::new(PartnerEntry::new(
            id,
            descriptor.clone(),
            self.factory.clone(),
        ));
        entry.used_this_run.store(true, Ordering::SeqCst);
        self.entries.insert(id, entry.clone());
        self.by_descriptor.insert(descriptor.clone(), id);
        debug!(target: "txcoord::registry", recovery_id = id, partner = %descriptor.name, "Partner registered");
        Ok(entry)
    }

    /// Add a partner read back from the partner log.
    pub fn restore(&self, record: PartnerRecord) -> Arc<PartnerEntry> {
        let _guard = self.register_lock.lock();
        let entry = Arc::new(PartnerEntry::new(
            record.recovery_id,
            record.descriptor.clone(),
            self.factory.clone(),
        ));
        self.entries.insert(record.recovery_id, entry.clone());
        self.by_descriptor
            .insert(record.descriptor, record.recovery_id);
        let floor = record.recovery_id + 1;
        self.next_local.fetch_max(floor, Ordering::SeqCst);
        entry
    }

    /// Look up a partner by recovery id.
    pub fn find(&self, recovery_id: u64) -> Option<Arc<PartnerEntry>> {
        self.entries.get(&recovery_id).map(|e| e.value().clone())
    }

    /// Every known partner, ordered by recovery id.
    pub fn entries(&self) -> Vec<Arc<PartnerEntry>> {
        let mut all: Vec<_> = self.entries.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|e| e.recovery_id);
        all
    }

    /// Number of known partners.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no partner is known.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop partners that recovery has finished with and that no branch and
    /// no enlistment of this run still needs. Removals become durable with
    /// the next force of the partner log.
    ///
    /// Returns the number of partners removed.
    pub fn clear_unused(&self) -> TxResult<usize> {
        let _guard = self.register_lock.lock();
        let unused: Vec<Arc<PartnerEntry>> = self
            .entries
            .iter()
            .filter(|e| {
                let p = e.value();
                p.is_recovered() && p.users() == 0 && !p.used_this_run()
            })
            .map(|e| e.value().clone())
            .collect();

        for partner in &unused {
            if let Some(log) = &self.log {
                if let Err(e) = log.remove_partner(partner.recovery_id) {
                    warn!(
                        target: "txcoord::recovery",
                        recovery_id = partner.recovery_id,
                        error = %e,
                        "Cannot remove partner record"
                    );
                    return Err(TxError::system(format!(
                        "cannot remove partner {}: {}",
                        partner.recovery_id, e
                    )));
                }
            }
            self.entries.remove(&partner.recovery_id);
            self.by_descriptor.remove(&partner.descriptor);
        }

        if !unused.is_empty() {
            info!(target: "txcoord::recovery", removed = unused.len(), "Cleared unused partners");
        }
        Ok(unused.len())
    }
}

impl Default for PartnerTable {
    fn default() -> Self {
        Self::unlogged()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeFactory, FakeResource, Journal};
    use txcoord_durability::MemoryLog;

    fn logged_table() -> (Arc<MemoryLog>, PartnerTable) {
        let store = Arc::new(MemoryLog::new("partnerlog"));
        let log = Arc::new(PartnerLog::new(store.clone()));
        (store, PartnerTable::new(log, None))
    }

    #[test]
    fn test_register_is_durable_and_deduplicated() {
        let (store, table) = logged_table();
        let desc = PartnerDescriptor::new("db", b"url".to_vec());
        let a = table.register(&desc).unwrap();
        let b = table.register(&desc).unwrap();
        assert_eq!(a.recovery_id(), b.recovery_id());
        assert_eq!(table.len(), 1);

        store.restart();
        let replay = PartnerLog::new(store).replay().unwrap();
        assert_eq!(replay.partners.len(), 1);
        assert_eq!(replay.partners[0].descriptor, desc);
    }

    #[test]
    fn test_unlogged_ids_are_local() {
        let table = PartnerTable::unlogged();
        let a = table.register(&PartnerDescriptor::new("a", vec![])).unwrap();
        let b = table.register(&PartnerDescriptor::new("b", vec![])).unwrap();
        assert_ne!(a.recovery_id(), b.recovery_id());
        assert!(!table.is_logging());
    }

    #[test]
    fn test_reference_counting() {
        let table = PartnerTable::unlogged();
        let p = table.register(&PartnerDescriptor::new("a", vec![])).unwrap();
        p.acquire();
        p.acquire();
        p.release();
        assert_eq!(p.users(), 1);
        p.release();
        p.release();
        assert_eq!(p.users(), 0);
    }

    #[test]
    fn test_clear_unused_keeps_live_partners() {
        let (store, table) = logged_table();
        let live = table.register(&PartnerDescriptor::new("live", vec![])).unwrap();
        let old = table.restore(PartnerRecord {
            recovery_id: 40,
            descriptor: PartnerDescriptor::new("old", vec![]),
        });
        let busy = table.restore(PartnerRecord {
            recovery_id: 41,
            descriptor: PartnerDescriptor::new("busy", vec![]),
        });
        live.mark_recovered();
        old.mark_recovered();
        busy.mark_recovered();
        busy.acquire();

        assert_eq!(table.clear_unused().unwrap(), 1);
        assert!(table.find(40).is_none());
        assert!(table.find(41).is_some());
        assert!(table.find(live.recovery_id()).is_some());
        drop(store);
    }

    #[test]
    fn test_recovered_resource_reconnects_after_failure() {
        let journal = Journal::new();
        let rm = FakeResource::new("db", journal.clone());
        let factory = FakeFactory::new();
        factory.add(rm.clone());

        let table = PartnerTable::unlogged().with_factory(Arc::new(factory.clone()));
        let entry = table.restore(PartnerRecord {
            recovery_id: 3,
            descriptor: PartnerDescriptor::new("db", vec![]),
        });
        let recovered = RecoveredResource::new(entry);

        rm.script_recover(Err(XaError::RmFail));
        assert_eq!(recovered.recover(), Err(XaError::RmFail));
        assert_eq!(recovered.recover(), Ok(vec![]));
        assert_eq!(factory.connects("db"), 2);
    }

    #[test]
    fn test_connect_without_factory_is_unavailable() {
        let table = PartnerTable::unlogged();
        let entry = table.restore(PartnerRecord {
            recovery_id: 1,
            descriptor: PartnerDescriptor::new("gone", vec![]),
        });
        assert!(matches!(entry.connect(), Err(XaError::RmFail)));
    }
}
