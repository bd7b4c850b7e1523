//! Scripted resource managers and the shared call journal.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use txcoord_core::{
    EndFlag, OnePhaseResource, PartnerDescriptor, ResourceFactory, ResourceManager, StartFlag,
    Vote, XaError, XaResult, Xid,
};

/// One protocol call observed by a fake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    /// `start(xid, flag)`
    Start(String, Xid, StartFlag),
    /// `end(xid, flag)`
    End(String, Xid, EndFlag),
    /// `prepare(xid)`
    Prepare(String, Xid),
    /// `commit(xid, one_phase)`
    Commit(String, Xid, bool),
    /// `rollback(xid)`
    Rollback(String, Xid),
    /// `forget(xid)`
    Forget(String, Xid),
    /// `recover()`
    Recover(String),
    /// One-phase resource commit.
    CommitOnePhase(String),
    /// One-phase resource rollback.
    OnePhaseRollback(String),
}

impl Call {
    /// Name of the resource that received the call.
    pub fn resource(&self) -> &str {
        match self {
            Call::Start(n, ..)
            | Call::End(n, ..)
            | Call::Prepare(n, ..)
            | Call::Commit(n, ..)
            | Call::Rollback(n, ..)
            | Call::Forget(n, ..)
            | Call::Recover(n)
            | Call::CommitOnePhase(n)
            | Call::OnePhaseRollback(n) => n,
        }
    }
}

/// Call log shared by several fakes.
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<Call>>>);

impl Journal {
    /// An empty journal.
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, call: Call) {
        self.0.lock().push(call);
    }

    /// Every call so far, in order.
    pub fn calls(&self) -> Vec<Call> {
        self.0.lock().clone()
    }

    /// Forget recorded calls.
    pub fn clear(&self) {
        self.0.lock().clear();
    }

    fn names(&self, pick: impl Fn(&Call) -> bool) -> Vec<String> {
        self.0
            .lock()
            .iter()
            .filter(|c| pick(c))
            .map(|c| c.resource().to_string())
            .collect()
    }

    /// Resources prepared, in order.
    pub fn prepares(&self) -> Vec<String> {
        self.names(|c| matches!(c, Call::Prepare(..)))
    }

    /// Resources committed (two-phase or one-phase), in order.
    pub fn commits(&self) -> Vec<String> {
        self.names(|c| matches!(c, Call::Commit(..) | Call::CommitOnePhase(_)))
    }

    /// Resources rolled back, in order.
    pub fn rollbacks(&self) -> Vec<String> {
        self.names(|c| matches!(c, Call::Rollback(..) | Call::OnePhaseRollback(_)))
    }

    /// Resources told to forget, in order.
    pub fn forgets(&self) -> Vec<String> {
        self.names(|c| matches!(c, Call::Forget(..)))
    }

    /// Resources asked for their in-doubt list, in order.
    pub fn recovers(&self) -> Vec<String> {
        self.names(|c| matches!(c, Call::Recover(_)))
    }
}

#[derive(Default)]
struct Scripts {
    start: VecDeque<XaResult<()>>,
    end: VecDeque<XaResult<()>>,
    prepare: VecDeque<XaResult<Vote>>,
    commit: VecDeque<XaResult<()>>,
    rollback: VecDeque<XaResult<()>>,
    forget: VecDeque<XaResult<()>>,
    recover: VecDeque<XaResult<Vec<Xid>>>,
    same_rm: VecDeque<XaResult<bool>>,
    timeout: VecDeque<XaResult<bool>>,
}

struct FakeInner {
    name: String,
    journal: Journal,
    shares_rm: bool,
    scripts: Mutex<Scripts>,
    in_doubt: Mutex<Vec<Xid>>,
    timeouts: Mutex<Vec<u64>>,
}

/// Two-phase resource manager with scripted outcomes.
///
/// Each operation pops its next scripted result; with nothing scripted the
/// call succeeds (prepare votes OK, recover reports the in-doubt list).
/// A successful prepare puts the branch in doubt; a successful commit,
/// rollback or forget takes it out again.
#[derive(Clone)]
pub struct FakeResource {
    inner: Arc<FakeInner>,
}

impl FakeResource {
    fn build(name: String, journal: Journal, shares_rm: bool) -> Self {
        FakeResource {
            inner: Arc::new(FakeInner {
                name,
                journal,
                shares_rm,
                scripts: Mutex::new(Scripts::default()),
                in_doubt: Mutex::new(Vec::new()),
                timeouts: Mutex::new(Vec::new()),
            }),
        }
    }

    /// A resource recording into `journal`.
    pub fn new(name: impl Into<String>, journal: Journal) -> Self {
        Self::build(name.into(), journal, false)
    }

    /// A resource that reports itself the same resource manager as any
    /// other resource with the same name.
    pub fn sharing_rm(name: impl Into<String>, journal: Journal) -> Self {
        Self::build(name.into(), journal, true)
    }

    /// Script the next `start` result.
    pub fn script_start(&self, r: XaResult<()>) {
        self.inner.scripts.lock().start.push_back(r);
    }

    /// Script the next `end` result.
    pub fn script_end(&self, r: XaResult<()>) {
        self.inner.scripts.lock().end.push_back(r);
    }

    /// Script the next `prepare` result.
    pub fn script_prepare(&self, r: XaResult<Vote>) {
        self.inner.scripts.lock().prepare.push_back(r);
    }

    /// Script the next `commit` result.
    pub fn script_commit(&self, r: XaResult<()>) {
        self.inner.scripts.lock().commit.push_back(r);
    }

    /// Script the next `rollback` result.
    pub fn script_rollback(&self, r: XaResult<()>) {
        self.inner.scripts.lock().rollback.push_back(r);
    }

    /// Script the next `forget` result.
    pub fn script_forget(&self, r: XaResult<()>) {
        self.inner.scripts.lock().forget.push_back(r);
    }

    /// Script the next `recover` result.
    pub fn script_recover(&self, r: XaResult<Vec<Xid>>) {
        self.inner.scripts.lock().recover.push_back(r);
    }

    /// Script the next `is_same_rm` result.
    pub fn script_same_rm(&self, r: XaResult<bool>) {
        self.inner.scripts.lock().same_rm.push_back(r);
    }

    /// Script the next `set_transaction_timeout` result.
    pub fn script_timeout(&self, r: XaResult<bool>) {
        self.inner.scripts.lock().timeout.push_back(r);
    }

    /// Put a branch in doubt, as if prepared before a crash.
    pub fn add_in_doubt(&self, xid: Xid) {
        let mut in_doubt = self.inner.in_doubt.lock();
        if !in_doubt.contains(&xid) {
            in_doubt.push(xid);
        }
    }

    /// Branches currently in doubt.
    pub fn in_doubt(&self) -> Vec<Xid> {
        self.inner.in_doubt.lock().clone()
    }

    /// Transaction timeouts received.
    pub fn timeouts(&self) -> Vec<u64> {
        self.inner.timeouts.lock().clone()
    }

    /// Journal this resource records into.
    pub fn journal(&self) -> &Journal {
        &self.inner.journal
    }

    /// This resource as a trait object.
    pub fn as_rm(&self) -> Arc<dyn ResourceManager> {
        Arc::new(self.clone())
    }

    fn settle(&self, xid: &Xid) {
        self.inner.in_doubt.lock().retain(|x| x != xid);
    }
}

impl ResourceManager for FakeResource {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn start(&self, xid: &Xid, flag: StartFlag) -> XaResult<()> {
        self.inner
            .journal
            .push(Call::Start(self.inner.name.clone(), xid.clone(), flag));
        self.inner.scripts.lock().start.pop_front().unwrap_or(Ok(()))
    }

    fn end(&self, xid: &Xid, flag: EndFlag) -> XaResult<()> {
        self.inner
            .journal
            .push(Call::End(self.inner.name.clone(), xid.clone(), flag));
        self.inner.scripts.lock().end.pop_front().unwrap_or(Ok(()))
    }

    fn prepare(&self, xid: &Xid) -> XaResult<Vote> {
        self.inner
            .journal
            .push(Call::Prepare(self.inner.name.clone(), xid.clone()));
        let result = self
            .inner
            .scripts
            .lock()
            .prepare
            .pop_front()
            .unwrap_or(Ok(Vote::Ok));
        if result == Ok(Vote::Ok) {
            self.add_in_doubt(xid.clone());
        }
        result
    }

    fn commit(&self, xid: &Xid, one_phase: bool) -> XaResult<()> {
        self.inner
            .journal
            .push(Call::Commit(self.inner.name.clone(), xid.clone(), one_phase));
        let result = self.inner.scripts.lock().commit.pop_front().unwrap_or(Ok(()));
        if result.is_ok() || result == Err(XaError::NotA) {
            self.settle(xid);
        }
        result
    }

    fn rollback(&self, xid: &Xid) -> XaResult<()> {
        self.inner
            .journal
            .push(Call::Rollback(self.inner.name.clone(), xid.clone()));
        let result = self
            .inner
            .scripts
            .lock()
            .rollback
            .pop_front()
            .unwrap_or(Ok(()));
        if result.is_ok() || result == Err(XaError::NotA) {
            self.settle(xid);
        }
        result
    }

    fn forget(&self, xid: &Xid) -> XaResult<()> {
        self.inner
            .journal
            .push(Call::Forget(self.inner.name.clone(), xid.clone()));
        let result = self.inner.scripts.lock().forget.pop_front().unwrap_or(Ok(()));
        if result.is_ok() {
            self.settle(xid);
        }
        result
    }

    fn recover(&self) -> XaResult<Vec<Xid>> {
        self.inner
            .journal
            .push(Call::Recover(self.inner.name.clone()));
        let scripted = self.inner.scripts.lock().recover.pop_front();
        match scripted {
            Some(r) => r,
            None => Ok(self.in_doubt()),
        }
    }

    fn is_same_rm(&self, other: &dyn ResourceManager) -> XaResult<bool> {
        if let Some(r) = self.inner.scripts.lock().same_rm.pop_front() {
            return r;
        }
        Ok(self.inner.shares_rm && other.name() == self.inner.name)
    }

    fn set_transaction_timeout(&self, secs: u64) -> XaResult<bool> {
        self.inner.timeouts.lock().push(secs);
        self.inner.scripts.lock().timeout.pop_front().unwrap_or(Ok(true))
    }
}

struct OnePhaseInner {
    name: String,
    journal: Journal,
    commit: Mutex<VecDeque<XaResult<()>>>,
    rollback: Mutex<VecDeque<XaResult<()>>>,
}

/// One-phase-only resource with scripted outcomes.
#[derive(Clone)]
pub struct FakeOnePhase {
    inner: Arc<OnePhaseInner>,
}

impl FakeOnePhase {
    /// A resource recording into `journal`.
    pub fn new(name: impl Into<String>, journal: Journal) -> Self {
        FakeOnePhase {
            inner: Arc::new(OnePhaseInner {
                name: name.into(),
                journal,
                commit: Mutex::new(VecDeque::new()),
                rollback: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// Script the next `commit_one_phase` result.
    pub fn script_commit(&self, r: XaResult<()>) {
        self.inner.commit.lock().push_back(r);
    }

    /// Script the next `rollback` result.
    pub fn script_rollback(&self, r: XaResult<()>) {
        self.inner.rollback.lock().push_back(r);
    }

    /// This resource as a trait object.
    pub fn as_resource(&self) -> Arc<dyn OnePhaseResource> {
        Arc::new(self.clone())
    }
}

impl OnePhaseResource for FakeOnePhase {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn commit_one_phase(&self) -> XaResult<()> {
        self.inner
            .journal
            .push(Call::CommitOnePhase(self.inner.name.clone()));
        self.inner.commit.lock().pop_front().unwrap_or(Ok(()))
    }

    fn rollback(&self) -> XaResult<()> {
        self.inner
            .journal
            .push(Call::OnePhaseRollback(self.inner.name.clone()));
        self.inner.rollback.lock().pop_front().unwrap_or(Ok(()))
    }
}

#[derive(Default)]
struct FactoryInner {
    resources: HashMap<String, FakeResource>,
    connects: HashMap<String, usize>,
}

/// Reconnects recovered partners to fakes registered by descriptor name.
/// Unknown names are reported unavailable.
#[derive(Clone, Default)]
pub struct FakeFactory {
    inner: Arc<Mutex<FactoryInner>>,
}

impl FakeFactory {
    /// An empty factory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a resource reachable under its name.
    pub fn add(&self, resource: FakeResource) {
        let name = resource.name().to_string();
        self.inner.lock().resources.insert(name, resource);
    }

    /// Make a resource unreachable.
    pub fn remove(&self, name: &str) {
        self.inner.lock().resources.remove(name);
    }

    /// Successful connections made to `name`.
    pub fn connects(&self, name: &str) -> usize {
        self.inner.lock().connects.get(name).copied().unwrap_or(0)
    }
}

impl ResourceFactory for FakeFactory {
    fn connect(&self, descriptor: &PartnerDescriptor) -> XaResult<Arc<dyn ResourceManager>> {
        let mut inner = self.inner.lock();
        let resource = inner
            .resources
            .get(&descriptor.name)
            .cloned()
            .ok_or(XaError::RmFail)?;
        *inner.connects.entry(descriptor.name.clone()).or_insert(0) += 1;
        Ok(Arc::new(resource))
    }
}
