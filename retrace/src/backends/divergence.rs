//! Divergence detection policy
//!
//! Replay can stop matching the stored schedule in several ways; every one of
//! them funnels into [`declare`], which applies the single policy: below the
//! configured executed-callback threshold divergence is fatal (it means the
//! replay inputs are wrong, not merely nondeterministic), at or above it the
//! scheduler silently falls back to recording from that point on.

use std::fmt;

use log::warn;
use retrace_common::{CallbackKind, MarkerKind};

use super::SharedState;
use crate::domain::types::Mode;
use crate::schedule::ExecExpectation;
use crate::tree::TreePath;

/// Thresholds governing when divergence is tolerated.
#[derive(Debug, Clone, Copy)]
pub struct DivergencePolicy {
    /// Exec records that must be consumed before a divergence may fall back
    /// to recording instead of aborting.
    pub min_executed: u64,
    /// Consecutive yields without reaching the next scheduled
    /// BEFORE_EXEC_CB before the replay is considered stalled.
    pub max_idle_yields: u32,
}

/// How the live run stopped matching the schedule.
#[derive(Debug, Clone)]
pub enum Divergence {
    /// The callback about to run is not the schedule's next expected one.
    ExecMismatch { expected: Option<ExecExpectation>, actual: ExecExpectation },
    /// A completed callback registered different children than recorded.
    ChildrenMismatch {
        path: TreePath,
        expected: Vec<CallbackKind>,
        actual: Vec<CallbackKind>,
    },
    /// The loop announced a different landmark than recorded.
    MarkerMismatch { expected: Option<MarkerKind>, actual: MarkerKind },
    /// The loop kept yielding without the next scheduled callback becoming
    /// producible.
    Stall { yields: u32 },
}

impl fmt::Display for Divergence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Divergence::ExecMismatch { expected: Some(e), actual } => write!(
                f,
                "expected callback {} at `{}`, observed {} at `{}`",
                e.kind, e.path, actual.kind, actual.path
            ),
            Divergence::ExecMismatch { expected: None, actual } => {
                write!(f, "schedule exhausted but {} at `{}` ran", actual.kind, actual.path)
            }
            Divergence::ChildrenMismatch { path, expected, actual } => write!(
                f,
                "callback at `{path}` registered children {actual:?}, schedule records {expected:?}"
            ),
            Divergence::MarkerMismatch { expected: Some(e), actual } => {
                write!(f, "expected marker {e}, observed {actual}")
            }
            Divergence::MarkerMismatch { expected: None, actual } => {
                write!(f, "schedule exhausted but marker {actual} announced")
            }
            Divergence::Stall { yields } => {
                write!(f, "{yields} yields without reaching the next scheduled callback")
            }
        }
    }
}

/// Apply the divergence policy.
///
/// # Panics
///
/// Panics (fatal divergence) when fewer than `policy.min_executed` callbacks
/// have been replayed — at that point the schedule and the program plainly do
/// not belong together, and continuing would mask the bug.
pub fn declare(shared: &mut SharedState, policy: &DivergencePolicy, divergence: &Divergence) {
    assert!(
        shared.n_executed >= policy.min_executed,
        "schedule diverged after {} executed callbacks (fatal below {}): {divergence}",
        shared.n_executed,
        policy.min_executed,
    );
    warn!(
        "schedule diverged after {} executed callbacks, falling back to record mode: {divergence}",
        shared.n_executed
    );
    shared.diverged = true;
    shared.mode = Mode::Record;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stall() -> Divergence {
        Divergence::Stall { yields: 100 }
    }

    #[test]
    fn test_divergence_above_threshold_flips_mode() {
        let mut shared = SharedState::new(Mode::Replay);
        shared.n_executed = 2;
        let policy = DivergencePolicy { min_executed: 2, max_idle_yields: 100 };

        declare(&mut shared, &policy, &stall());
        assert!(shared.diverged);
        assert_eq!(shared.mode, Mode::Record);
    }

    #[test]
    fn test_divergence_below_threshold_is_fatal() {
        let mut shared = SharedState::new(Mode::Replay);
        shared.n_executed = 1;
        let policy = DivergencePolicy { min_executed: 100, max_idle_yields: 100 };

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            declare(&mut shared, &policy, &stall());
        }));
        assert!(outcome.is_err());
    }

    #[test]
    fn test_divergence_messages_name_the_cause() {
        let divergence = Divergence::MarkerMismatch {
            expected: Some(MarkerKind::LoopEnd),
            actual: MarkerKind::LoopBegin,
        };
        let text = divergence.to_string();
        assert!(text.contains("loop_end"));
        assert!(text.contains("loop_begin"));
    }
}
