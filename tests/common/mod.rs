//! Shared test utilities for the integration suites.
//!
//! Import via `#[path = "../common/mod.rs"] mod common;` from a suite's
//! main.rs.

#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing_subscriber::fmt::MakeWriter;
use txcoord::testing::{Call, FakeFactory, FakeResource, Journal};
use txcoord::{
    EnlistOptions, MemoryLog, PartnerDescriptor, ResourceManager, TransactionCoordinator,
    TransactionService, TransactionSettings, TxConfig, Xid,
};

pub const SERVER: &str = "server1";

// ============================================================================
// Process - one server lifetime over shared logs
// ============================================================================

/// Logs and resource managers that outlive any single service instance.
pub struct World {
    pub tran: Arc<MemoryLog>,
    pub partner: Arc<MemoryLog>,
    pub journal: Journal,
    pub factory: FakeFactory,
}

impl World {
    pub fn new() -> Self {
        World {
            tran: Arc::new(MemoryLog::new("tranlog")),
            partner: Arc::new(MemoryLog::new("partnerlog")),
            journal: Journal::new(),
            factory: FakeFactory::new(),
        }
    }

    /// A resource manager reachable through the factory.
    pub fn rm(&self, name: &str) -> FakeResource {
        let rm = FakeResource::new(name, self.journal.clone());
        self.factory.add(rm.clone());
        rm
    }

    /// Start a server over these logs and begin local recovery.
    pub fn boot(&self, settings: TransactionSettings) -> TransactionService {
        let service = TransactionService::builder(TxConfig::new(SERVER).with_transaction(settings))
            .local_logs(self.tran.clone(), self.partner.clone())
            .factory(Arc::new(self.factory.clone()))
            .build()
            .unwrap();
        service.initiate_recovery(SERVER).unwrap();
        service
    }

    /// Lose everything that was not forced.
    pub fn crash(&self) {
        self.tran.restart();
        self.partner.restart();
    }

    /// Branch xid the resource was started with for `global`.
    pub fn branch_of(&self, resource: &str, global: &Xid) -> Xid {
        self.journal
            .calls()
            .into_iter()
            .find_map(|call| match call {
                Call::Start(name, xid, _) if name == resource && &xid.global_id() == global => {
                    Some(xid)
                }
                _ => None,
            })
            .expect("resource was never started for this transaction")
    }
}

pub fn enlist(tx: &TransactionCoordinator, rm: &FakeResource) {
    let name = ResourceManager::name(rm).to_string();
    tx.enlist(
        rm.as_rm(),
        &EnlistOptions::new(PartnerDescriptor::new(name.clone(), name.into_bytes())),
    )
    .unwrap();
}

pub fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    done()
}

// ============================================================================
// Captured tracing output
// ============================================================================

/// A writer that captures log output for testing
#[derive(Clone, Default)]
pub struct CapturedLogs {
    logs: Arc<Mutex<Vec<u8>>>,
}

impl CapturedLogs {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.logs.lock()).to_string()
    }
}

impl std::io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.logs.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CapturedLogs {
    type Writer = CapturedLogs;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Run `f` with tracing output of the current thread captured.
pub fn with_tracing<T>(f: impl FnOnce() -> T) -> (String, T) {
    let logs = CapturedLogs::default();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_writer(logs.clone())
        .with_ansi(false)
        .without_time()
        .finish();
    let result = tracing::subscriber::with_default(subscriber, f);
    (logs.contents(), result)
}
