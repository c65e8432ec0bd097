//! Stopping policies for the search loop.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

use crate::candidate::PipelineCandidate;

/// Decides whether the search loop should stop.
///
/// `history` is the chronological attempt log (successes and failures).
pub trait Terminator: Send + Sync + fmt::Debug {
    fn should_terminate(&self, history: &[PipelineCandidate]) -> bool;

    /// Iterations left under an iteration budget, `None` when the budget is
    /// not iteration-bounded. May be negative once the budget is exceeded.
    fn remaining_iterations(&self, history: &[PipelineCandidate]) -> Option<i64>;
}

/// What the search is allowed to spend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Budget {
    Iterations {
        max_iterations: usize,
    },
    WallClock {
        max_duration_ms: u64,
    },
    Both {
        max_iterations: usize,
        max_duration_ms: u64,
    },
}

impl Budget {
    /// Budget from optional limits; `None` when neither is set.
    pub fn from_limits(max_iterations: Option<usize>, max_duration_ms: Option<u64>) -> Option<Self> {
        match (max_iterations, max_duration_ms) {
            (Some(max_iterations), Some(max_duration_ms)) => Some(Budget::Both {
                max_iterations,
                max_duration_ms,
            }),
            (Some(max_iterations), None) => Some(Budget::Iterations { max_iterations }),
            (None, Some(max_duration_ms)) => Some(Budget::WallClock { max_duration_ms }),
            (None, None) => None,
        }
    }

    pub fn max_iterations(&self) -> Option<usize> {
        match self {
            Budget::Iterations { max_iterations } | Budget::Both { max_iterations, .. } => {
                Some(*max_iterations)
            }
            Budget::WallClock { .. } => None,
        }
    }

    pub fn max_duration(&self) -> Option<Duration> {
        match self {
            Budget::WallClock { max_duration_ms } | Budget::Both { max_duration_ms, .. } => {
                Some(Duration::from_millis(*max_duration_ms))
            }
            Budget::Iterations { .. } => None,
        }
    }
}

/// Iteration-count and/or wall-clock terminator. The clock starts at
/// construction.
#[derive(Debug, Clone)]
pub struct IterationTerminator {
    budget: Budget,
    started: Instant,
}

impl IterationTerminator {
    pub fn new(budget: Budget) -> Self {
        Self {
            budget,
            started: Instant::now(),
        }
    }

    pub fn iterations(max_iterations: usize) -> Self {
        Self::new(Budget::Iterations { max_iterations })
    }

    pub fn wall_clock(max_duration: Duration) -> Self {
        Self::new(Budget::WallClock {
            max_duration_ms: max_duration.as_millis() as u64,
        })
    }

    pub fn budget(&self) -> Budget {
        self.budget
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Restart the wall clock, e.g. before resuming a search.
    pub fn restart(&mut self) {
        self.started = Instant::now();
    }
}

impl Terminator for IterationTerminator {
    fn should_terminate(&self, history: &[PipelineCandidate]) -> bool {
        // A zero duration stops before any candidate runs.
        if let Some(limit) = self.budget.max_duration() {
            if self.started.elapsed() >= limit {
                return true;
            }
        }
        match self.budget.max_iterations() {
            Some(max) => history.len() >= max,
            None => false,
        }
    }

    fn remaining_iterations(&self, history: &[PipelineCandidate]) -> Option<i64> {
        self.budget
            .max_iterations()
            .map(|max| max as i64 - history.len() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::tests::dummy_candidate;

    #[test]
    fn iteration_budget_counts_history() {
        let terminator = IterationTerminator::iterations(2);
        let mut history = Vec::new();
        assert!(!terminator.should_terminate(&history));
        assert_eq!(terminator.remaining_iterations(&history), Some(2));

        history.push(dummy_candidate());
        history.push(dummy_candidate());
        history.push(dummy_candidate());
        assert!(terminator.should_terminate(&history));
        assert_eq!(terminator.remaining_iterations(&history), Some(-1));
    }

    #[test]
    fn zero_duration_terminates_immediately() {
        let terminator = IterationTerminator::new(Budget::Both {
            max_iterations: 100,
            max_duration_ms: 0,
        });
        assert!(terminator.should_terminate(&[]));
    }

    #[test]
    fn wall_clock_only_has_no_iteration_count() {
        let terminator = IterationTerminator::wall_clock(Duration::from_secs(3600));
        assert!(!terminator.should_terminate(&[]));
        assert_eq!(terminator.remaining_iterations(&[]), None);
    }

    #[test]
    fn budget_from_limits() {
        assert_eq!(Budget::from_limits(None, None), None);
        assert_eq!(
            Budget::from_limits(Some(5), None),
            Some(Budget::Iterations { max_iterations: 5 })
        );
        let both = Budget::from_limits(Some(5), Some(10)).unwrap();
        assert_eq!(both.max_iterations(), Some(5));
        assert_eq!(both.max_duration(), Some(Duration::from_millis(10)));

        let json = serde_json::to_string(&both).unwrap();
        assert_eq!(serde_json::from_str::<Budget>(&json).unwrap(), both);
    }
}
