//! Per-criterion lifecycle used by the workflow coordinator.
//!
//! ```text
//! Pending → Extracting → Evaluating ─┬─→ Validated ──────────────────────┬─→ Summarized
//!                                    └─→ RetryExtracting → Evaluating ─┬─┘
//!                                                                      └─→ Flagged ─→ Summarized
//! ```
//!
//! A document with no text moves `Pending` straight to `Flagged`; a
//! document-level timeout flags any criterion that has no verdict yet
//! through [`CriterionTracker::abort`].

use serde::{Deserialize, Serialize};
use tracing::trace;

/// States a criterion moves through during one workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriterionState {
    Pending,
    Extracting,
    Evaluating,
    RetryExtracting,
    Validated,
    Flagged,
    Summarized,
}

impl CriterionState {
    /// Whether `self → next` is an edge of the lifecycle graph.
    ///
    /// `retried` tells whether the criterion already went through
    /// `RetryExtracting`; only a retried criterion may become `Flagged`
    /// from `Evaluating`, and a retried one can never retry again.
    pub fn can_transition(self, next: CriterionState, retried: bool) -> bool {
        use CriterionState::*;
        match (self, next) {
            (Pending, Extracting) => true,
            (Extracting, Evaluating) => true,
            (Evaluating, Validated) => true,
            (Evaluating, RetryExtracting) => !retried,
            (Evaluating, Flagged) => retried,
            (RetryExtracting, Evaluating) => true,
            (Validated | Flagged, Summarized) => true,
            // document with no text
            (Pending, Flagged) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == CriterionState::Summarized
    }
}

/// Tracks one criterion's state and rejects transitions outside the graph.
#[derive(Debug, Clone)]
pub struct CriterionTracker {
    state: CriterionState,
    retried: bool,
    history: Vec<CriterionState>,
}

impl Default for CriterionTracker {
    fn default() -> Self {
        Self {
            state: CriterionState::Pending,
            retried: false,
            history: vec![CriterionState::Pending],
        }
    }
}

impl CriterionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> CriterionState {
        self.state
    }

    pub fn retried(&self) -> bool {
        self.retried
    }

    /// Every state visited so far, starting with `Pending`.
    pub fn history(&self) -> &[CriterionState] {
        &self.history
    }

    /// Move to `next`. Returns `false` (and stays put) if the edge is illegal.
    pub fn advance(&mut self, next: CriterionState) -> bool {
        if !self.state.can_transition(next, self.retried) {
            return false;
        }
        trace!(from = ?self.state, to = ?next, "criterion state transition");
        if next == CriterionState::RetryExtracting {
            self.retried = true;
        }
        self.state = next;
        self.history.push(next);
        true
    }

    /// Flag a criterion that has no verdict yet, from any state. Returns
    /// `false` once it is `Validated`, `Flagged` or `Summarized`.
    pub fn abort(&mut self) -> bool {
        use CriterionState::*;
        if matches!(self.state, Validated | Flagged | Summarized) {
            return false;
        }
        trace!(from = ?self.state, "criterion aborted");
        self.state = Flagged;
        self.history.push(Flagged);
        true
    }
}
