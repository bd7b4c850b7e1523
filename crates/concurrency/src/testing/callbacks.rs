//! Recording stand-ins for completion callbacks, retry scheduling and the
//! provider directory.

use crate::retry::{RetryScheduler, RetryTask};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use txcoord_core::{ProviderDirectory, Synchronization, TransactionState, TxError, TxResult};

#[derive(Default)]
struct SyncInner {
    fail_before: Mutex<Option<String>>,
    before_calls: AtomicUsize,
    after: Mutex<Vec<TransactionState>>,
}

/// Synchronization that records its callbacks.
#[derive(Clone, Default)]
pub struct FakeSynchronization {
    inner: Arc<SyncInner>,
}

impl FakeSynchronization {
    /// A synchronization whose `before_completion` succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `before_completion` fail with `reason`.
    pub fn fail_before_completion(&self, reason: impl Into<String>) {
        *self.inner.fail_before.lock() = Some(reason.into());
    }

    /// Number of `before_completion` calls.
    pub fn before_calls(&self) -> usize {
        self.inner.before_calls.load(Ordering::SeqCst)
    }

    /// States passed to `after_completion`, in order.
    pub fn after_states(&self) -> Vec<TransactionState> {
        self.inner.after.lock().clone()
    }

    /// This synchronization as a trait object.
    pub fn as_sync(&self) -> Arc<dyn Synchronization> {
        Arc::new(self.clone())
    }
}

impl Synchronization for FakeSynchronization {
    fn before_completion(&self) -> TxResult<()> {
        self.inner.before_calls.fetch_add(1, Ordering::SeqCst);
        match self.inner.fail_before.lock().as_ref() {
            Some(reason) => Err(TxError::system(reason.clone())),
            None => Ok(()),
        }
    }

    fn after_completion(&self, state: TransactionState) {
        self.inner.after.lock().push(state);
    }
}

/// Retry scheduler that only collects tasks; tests run them by hand.
#[derive(Clone, Default)]
pub struct RecordingRetryScheduler {
    tasks: Arc<Mutex<Vec<RetryTask>>>,
}

impl RecordingRetryScheduler {
    /// An empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Tasks scheduled so far.
    pub fn tasks(&self) -> Vec<RetryTask> {
        self.tasks.lock().clone()
    }

    /// Remove and return the scheduled tasks.
    pub fn take(&self) -> Vec<RetryTask> {
        std::mem::take(&mut *self.tasks.lock())
    }
}

impl RetryScheduler for RecordingRetryScheduler {
    fn schedule(&self, task: RetryTask) {
        self.tasks.lock().push(task);
    }
}

/// Provider directory over a mutable set of installed names.
#[derive(Clone, Default)]
pub struct FakeProviders {
    installed: Arc<Mutex<HashSet<String>>>,
}

impl FakeProviders {
    /// A directory with nothing installed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a provider installed.
    pub fn install(&self, provider: impl Into<String>) {
        self.installed.lock().insert(provider.into());
    }

    /// Mark a provider gone.
    pub fn uninstall(&self, provider: &str) {
        self.installed.lock().remove(provider);
    }
}

impl ProviderDirectory for FakeProviders {
    fn is_provider_installed(&self, provider: &str) -> bool {
        self.installed.lock().contains(provider)
    }
}
