//! Outcome-delivery retries
//!
//! When a resource manager is unreachable during commit, rollback or forget,
//! the coordinator does not block. It hands a [`RetryTask`] to a
//! [`RetryScheduler`]; when the task's delay has elapsed the scheduler calls
//! `TransactionCoordinator::retry_completion`, which makes exactly one more
//! delivery pass and, if still incomplete, produces the next task.
//!
//! ## Backoff
//!
//! ```text
//! delay(attempt) = min(base * 2^((attempt - 1) / threshold), max)
//! ```
//!
//! With a non-zero retry limit, no task is produced once `limit` attempts
//! have been made.

use std::time::Duration;
use txcoord_core::{TransactionSettings, Xid};

/// One scheduled delivery retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryTask {
    /// Global id of the transaction to retry.
    pub xid: Xid,
    /// 1-based attempt number this task represents.
    pub attempt: u32,
    /// Wait before running the attempt.
    pub delay: Duration,
}

/// Result of one retry attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStatus {
    /// Every branch reached a final status; the transaction is forgotten.
    Done,
    /// Branches remain; another attempt has been scheduled (or, during
    /// recovery, will be made on the next pass).
    Pending,
    /// The retry limit was exhausted and the remaining branches abandoned.
    GaveUp,
}

/// Backoff and limit for delivery retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    base: Duration,
    max: Duration,
    threshold: u32,
    limit: Option<u32>,
}

impl RetryPolicy {
    /// Derive the policy from transaction settings.
    pub fn from_settings(settings: &TransactionSettings) -> Self {
        RetryPolicy {
            base: settings.retry_interval(),
            max: settings.max_retry_interval(),
            threshold: settings.retry_backoff_threshold.max(1),
            limit: settings.retry_limit(),
        }
    }

    /// Wait before the given 1-based attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let doublings = attempt.saturating_sub(1) / self.threshold;
        let factor = 1u32.checked_shl(doublings).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .unwrap_or(self.max)
            .min(self.max)
    }

    /// True once `attempts_made` reaches a configured limit.
    pub fn is_exhausted(&self, attempts_made: u32) -> bool {
        matches!(self.limit, Some(limit) if attempts_made >= limit)
    }

    /// The task following `attempts_made` attempts, or `None` when the limit
    /// is exhausted.
    pub fn next(&self, xid: &Xid, attempts_made: u32) -> Option<RetryTask> {
        if self.is_exhausted(attempts_made) {
            return None;
        }
        let attempt = attempts_made + 1;
        Some(RetryTask {
            xid: xid.clone(),
            attempt,
            delay: self.delay_for(attempt),
        })
    }
}

/// Accepts retry tasks and runs them after their delay.
pub trait RetryScheduler: Send + Sync {
    /// Queue a task.
    fn schedule(&self, task: RetryTask);
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use uuid::Uuid;

    fn policy(base: u64, max: u64, threshold: u32, limit: u32) -> RetryPolicy {
        RetryPolicy::from_settings(
            &TransactionSettings::default()
                .with_retry_interval_secs(base)
                .with_max_retry_interval_secs(max)
                .with_backoff_threshold(threshold)
                .with_retry_limit(limit),
        )
    }

    #[test]
    fn test_delay_doubles_every_threshold_attempts() {
        let p = policy(2, 3600, 3, 0);
        assert_eq!(p.delay_for(1), Duration::from_secs(2));
        assert_eq!(p.delay_for(3), Duration::from_secs(2));
        assert_eq!(p.delay_for(4), Duration::from_secs(4));
        assert_eq!(p.delay_for(7), Duration::from_secs(8));
    }

    #[test]
    fn test_delay_is_capped() {
        let p = policy(60, 100, 1, 0);
        assert_eq!(p.delay_for(2), Duration::from_secs(100));
        assert_eq!(p.delay_for(500), Duration::from_secs(100));
    }

    #[test]
    fn test_limit_stops_tasks() {
        let xid = Xid::global(Uuid::new_v4(), 1, 1);
        let p = policy(1, 10, 10, 2);
        assert_eq!(p.next(&xid, 0).unwrap().attempt, 1);
        assert_eq!(p.next(&xid, 1).unwrap().attempt, 2);
        assert!(p.next(&xid, 2).is_none());
        assert!(p.is_exhausted(2));
    }

    #[test]
    fn test_unlimited_never_exhausts() {
        let xid = Xid::global(Uuid::new_v4(), 1, 1);
        let p = policy(1, 10, 10, 0);
        assert!(p.next(&xid, u32::MAX - 1).is_some());
    }

    proptest! {
        #[test]
        fn prop_delay_monotone_and_bounded(
            base in 1u64..120,
            extra in 0u64..4000,
            threshold in 1u32..20,
            attempt in 1u32..10_000,
        ) {
            let p = policy(base, base + extra, threshold, 0);
            let d = p.delay_for(attempt);
            prop_assert!(d >= Duration::from_secs(base));
            prop_assert!(d <= Duration::from_secs(base + extra));
            prop_assert!(p.delay_for(attempt + 1) >= d);
        }
    }
}
