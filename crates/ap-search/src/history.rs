//! Ranked history of evaluated candidates plus the chronological attempt log.

use std::collections::HashSet;

use ap_types::ObjectiveDirection;

use crate::candidate::PipelineCandidate;

/// Offset applied to a ranking key that collides with an existing entry.
pub const COLLISION_EPSILON: f64 = 1e-10;

/// Smallest step that changes `key`: the epsilon when it is representable at
/// this magnitude, otherwise the next float up.
fn nudge(key: f64) -> f64 {
    let bumped = key + COLLISION_EPSILON;
    if bumped != key || !key.is_finite() {
        return bumped;
    }
    let bits = key.to_bits();
    if key > 0.0 {
        f64::from_bits(bits + 1)
    } else if key < 0.0 {
        f64::from_bits(bits - 1)
    } else {
        f64::from_bits(1)
    }
}

#[derive(Debug, Clone)]
pub struct SearchHistory {
    direction: ObjectiveDirection,
    /// Best-first. The key is the metric value, nudged on collision.
    ranked: Vec<(f64, PipelineCandidate)>,
    /// Every attempt in order, failures included.
    attempts: Vec<PipelineCandidate>,
    failed: HashSet<String>,
}

impl SearchHistory {
    pub fn new(direction: ObjectiveDirection) -> Self {
        Self {
            direction,
            ranked: Vec::new(),
            attempts: Vec::new(),
            failed: HashSet::new(),
        }
    }

    pub fn direction(&self) -> ObjectiveDirection {
        self.direction
    }

    /// Insert an evaluated candidate. Returns the ranking key used, which
    /// differs from the metric value only when another entry already holds
    /// that exact key.
    ///
    /// Candidates without a summary are only logged as attempts.
    pub fn record_success(&mut self, candidate: PipelineCandidate) -> Option<f64> {
        self.attempts.push(candidate.clone());
        let mut key = candidate.metric_value()?;
        while self.ranked.iter().any(|(k, _)| k.to_bits() == key.to_bits()) {
            key = nudge(key);
        }
        let position = match self.direction {
            ObjectiveDirection::Maximize => self.ranked.partition_point(|(k, _)| *k >= key),
            ObjectiveDirection::Minimize => self.ranked.partition_point(|(k, _)| *k <= key),
        };
        self.ranked.insert(position, (key, candidate));
        Some(key)
    }

    /// Log a failed attempt and remember its configuration.
    pub fn record_failure(&mut self, candidate: PipelineCandidate) {
        self.failed.insert(candidate.signature());
        self.attempts.push(candidate);
    }

    /// Successful candidates, best first.
    pub fn ranked(&self) -> impl Iterator<Item = &PipelineCandidate> {
        self.ranked.iter().map(|(_, c)| c)
    }

    pub fn ranked_values(&self) -> Vec<PipelineCandidate> {
        self.ranked().cloned().collect()
    }

    pub fn ranked_keys(&self) -> Vec<f64> {
        self.ranked.iter().map(|(k, _)| *k).collect()
    }

    pub fn best(&self) -> Option<&PipelineCandidate> {
        self.ranked.first().map(|(_, c)| c)
    }

    pub fn attempts(&self) -> &[PipelineCandidate] {
        &self.attempts
    }

    pub fn failed(&self) -> &HashSet<String> {
        &self.failed
    }

    pub fn is_failed(&self, signature: &str) -> bool {
        self.failed.contains(signature)
    }

    pub fn len(&self) -> usize {
        self.ranked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranked.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::tests::dummy_candidate;
    use crate::candidate::RunSummary;

    fn scored(value: f64) -> PipelineCandidate {
        let mut candidate = dummy_candidate();
        candidate.summary = Some(RunSummary {
            metric_value: value,
            rows_used: 1,
            elapsed_ms: 0,
        });
        candidate
    }

    fn values(history: &SearchHistory) -> Vec<f64> {
        history.ranked().map(|c| c.metric_value().unwrap()).collect()
    }

    #[test]
    fn maximizing_ranks_descending() {
        let mut history = SearchHistory::new(ObjectiveDirection::Maximize);
        for v in [0.3, 0.9, 0.1, 0.5] {
            history.record_success(scored(v));
        }
        assert_eq!(values(&history), vec![0.9, 0.5, 0.3, 0.1]);
        assert_eq!(history.best().unwrap().metric_value(), Some(0.9));
    }

    #[test]
    fn minimizing_ranks_ascending() {
        let mut history = SearchHistory::new(ObjectiveDirection::Minimize);
        for v in [0.3, 0.9, 0.1] {
            history.record_success(scored(v));
        }
        assert_eq!(values(&history), vec![0.1, 0.3, 0.9]);
    }

    #[test]
    fn collisions_keep_both_entries() {
        let mut history = SearchHistory::new(ObjectiveDirection::Maximize);
        let first = history.record_success(scored(0.5)).unwrap();
        let second = history.record_success(scored(0.5)).unwrap();
        let third = history.record_success(scored(0.5)).unwrap();

        assert_eq!(history.len(), 3);
        assert_eq!(first, 0.5);
        assert!(second > first);
        assert!(third > second);
        assert_eq!(values(&history), vec![0.5, 0.5, 0.5]);
    }

    #[test]
    fn collisions_at_large_magnitudes() {
        let mut history = SearchHistory::new(ObjectiveDirection::Minimize);
        history.record_success(scored(1e12));
        history.record_success(scored(1e12));
        let keys = history.ranked_keys();
        assert_eq!(keys.len(), 2);
        assert_ne!(keys[0], keys[1]);
    }

    #[test]
    fn failures_are_logged_not_ranked() {
        let mut history = SearchHistory::new(ObjectiveDirection::Maximize);
        let failed = dummy_candidate();
        let signature = failed.signature();
        history.record_failure(failed);
        history.record_success(scored(0.4));

        assert_eq!(history.len(), 1);
        assert_eq!(history.attempts().len(), 2);
        assert!(history.is_failed(&signature));
    }
}
