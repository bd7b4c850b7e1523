//! Heuristic outcome lattice
//!
//! Each participant's completion result is folded into one transaction-wide
//! classification. The values form a join-semilattice:
//!
//! ```text
//!              Hazard
//!                │
//!              Mixed
//!             ╱     ╲
//!        Commit     Rollback
//!             ╲     ╱
//!              None
//! ```
//!
//! Combining `Commit` with `Rollback` yields `Mixed`; anything combined with
//! `Hazard` is `Hazard`. A transaction's outcome only ever moves upward.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Transaction-wide heuristic classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum HeuristicOutcome {
    /// No participant diverged.
    #[default]
    None,
    /// Participants committed.
    Commit,
    /// Participants rolled back.
    Rollback,
    /// Some participants committed and some rolled back.
    Mixed,
    /// The outcome of at least one participant is unknown.
    Hazard,
}

impl HeuristicOutcome {
    fn rank(self) -> u8 {
        match self {
            HeuristicOutcome::None => 0,
            HeuristicOutcome::Commit | HeuristicOutcome::Rollback => 1,
            HeuristicOutcome::Mixed => 2,
            HeuristicOutcome::Hazard => 3,
        }
    }

    /// Least upper bound of two outcomes.
    pub fn combine(self, other: HeuristicOutcome) -> HeuristicOutcome {
        if self == other {
            return self;
        }
        match (self.rank(), other.rank()) {
            // Commit and Rollback are incomparable
            (1, 1) => HeuristicOutcome::Mixed,
            (a, b) if a >= b => self,
            _ => other,
        }
    }

    /// Fold an outcome into `self` in place.
    pub fn raise(&mut self, other: HeuristicOutcome) {
        *self = self.combine(other);
    }

    /// True unless the outcome is `None`.
    pub fn is_heuristic(self) -> bool {
        self != HeuristicOutcome::None
    }

    /// True when this outcome contradicts a decision to commit.
    ///
    /// `Commit` agrees with a commit decision and so is not reported to a
    /// committing caller as an error.
    pub fn contradicts_commit(self) -> bool {
        matches!(
            self,
            HeuristicOutcome::Rollback | HeuristicOutcome::Mixed | HeuristicOutcome::Hazard
        )
    }

    /// True when this outcome contradicts a decision to roll back.
    pub fn contradicts_rollback(self) -> bool {
        matches!(
            self,
            HeuristicOutcome::Commit | HeuristicOutcome::Mixed | HeuristicOutcome::Hazard
        )
    }
}

impl fmt::Display for HeuristicOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HeuristicOutcome::None => "NONE",
            HeuristicOutcome::Commit => "COMMIT",
            HeuristicOutcome::Rollback => "ROLLBACK",
            HeuristicOutcome::Mixed => "MIXED",
            HeuristicOutcome::Hazard => "HAZARD",
        };
        f.write_str(s)
    }
}

impl FromIterator<HeuristicOutcome> for HeuristicOutcome {
    fn from_iter<I: IntoIterator<Item = HeuristicOutcome>>(iter: I) -> Self {
        iter.into_iter()
            .fold(HeuristicOutcome::None, HeuristicOutcome::combine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use HeuristicOutcome::{Commit, Hazard, Mixed, Rollback};

    const NONE: HeuristicOutcome = HeuristicOutcome::None;

    const ALL: [HeuristicOutcome; 5] = [NONE, Commit, Rollback, Mixed, Hazard];

    fn outcome() -> impl Strategy<Value = HeuristicOutcome> {
        prop::sample::select(ALL.to_vec())
    }

    #[test]
    fn test_commit_and_rollback_make_mixed() {
        assert_eq!(Commit.combine(Rollback), Mixed);
        assert_eq!(Rollback.combine(Commit), Mixed);
    }

    #[test]
    fn test_same_direction_is_stable() {
        assert_eq!(Commit.combine(Commit), Commit);
        assert_eq!(Rollback.combine(NONE), Rollback);
    }

    #[test]
    fn test_mixed_absorbs_directions() {
        assert_eq!(Mixed.combine(Commit), Mixed);
        assert_eq!(Rollback.combine(Mixed), Mixed);
        assert_eq!(Mixed.combine(Hazard), Hazard);
    }

    #[test]
    fn test_collect_folds() {
        let folded: HeuristicOutcome = vec![NONE, Commit, NONE, Rollback].into_iter().collect();
        assert_eq!(folded, Mixed);
        let empty: HeuristicOutcome = Vec::<HeuristicOutcome>::new().into_iter().collect();
        assert_eq!(empty, NONE);
    }

    #[test]
    fn test_contradiction_predicates() {
        assert!(!Commit.contradicts_commit());
        assert!(Rollback.contradicts_commit());
        assert!(!Rollback.contradicts_rollback());
        assert!(Hazard.contradicts_rollback());
        assert!(!NONE.contradicts_commit());
    }

    proptest! {
        #[test]
        fn prop_none_is_identity(a in outcome()) {
            prop_assert_eq!(a.combine(NONE), a);
        }

        #[test]
        fn prop_commutative(a in outcome(), b in outcome()) {
            prop_assert_eq!(a.combine(b), b.combine(a));
        }

        #[test]
        fn prop_associative(a in outcome(), b in outcome(), c in outcome()) {
            prop_assert_eq!(a.combine(b).combine(c), a.combine(b.combine(c)));
        }

        #[test]
        fn prop_hazard_is_top(a in outcome()) {
            prop_assert_eq!(a.combine(Hazard), Hazard);
        }

        #[test]
        fn prop_never_decreases(a in outcome(), b in outcome()) {
            let mut acc = a;
            acc.raise(b);
            prop_assert!(acc.rank() >= a.rank());
            prop_assert_eq!(acc.combine(a), acc);
        }
    }
}
