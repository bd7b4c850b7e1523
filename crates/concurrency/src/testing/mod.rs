//! Testing utilities for coordination
//!
//! Scripted stand-ins for the external collaborators of a coordinator:
//!
//! - **Resources**: `FakeResource` (two-phase) and `FakeOnePhase` replay
//!   scripted outcomes per operation and record every call in a shared
//!   `Journal`, so tests can assert on cross-resource ordering
//! - **Factory**: `FakeFactory` reconnects recovered partners by name
//! - **Callbacks**: `FakeSynchronization`, `RecordingRetryScheduler` and
//!   `FakeProviders`
//!
//! # Example
//!
//! ```ignore
//! use txcoord_concurrency::testing::{FakeResource, Journal};
//!
//! let journal = Journal::new();
//! let db = FakeResource::new("db", journal.clone());
//! db.script_prepare(Err(XaError::Rollback(RollbackReason::Deadlock)));
//! ```

mod callbacks;
mod resource;

pub use callbacks::{FakeProviders, FakeSynchronization, RecordingRetryScheduler};
pub use resource::{Call, FakeFactory, FakeOnePhase, FakeResource, Journal};
