//! Notification bus for search progress.
//!
//! Observers subscribe to an [`IterationMonitor`] and receive
//! started/finished/failed events synchronously, in subscription order. A
//! panicking observer is logged and skipped; the remaining observers still
//! receive the event.

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{info, warn};

use crate::candidate::{CandidateRecord, PipelineCandidate};

/// A successfully evaluated candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationResult {
    pub candidate: CandidateRecord,
    pub metric: String,
    pub metric_value: f64,
    pub rows_used: usize,
    pub elapsed_ms: u64,
    /// 1-based attempt number within the search.
    pub iteration: usize,
}

/// A candidate whose evaluation failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationFailure {
    pub candidate: CandidateRecord,
    pub error: String,
    pub iteration: usize,
}

pub trait IterationObserver: Send + Sync {
    fn name(&self) -> &str {
        "observer"
    }

    fn iteration_started(&self, _candidate: &PipelineCandidate) {}

    fn iteration_finished(&self, _result: &IterationResult) {}

    fn iteration_failed(&self, _failure: &IterationFailure) {}
}

/// Fan-out of iteration events to subscribed observers.
#[derive(Clone, Default)]
pub struct IterationMonitor {
    observers: Vec<Arc<dyn IterationObserver>>,
}

impl fmt::Debug for IterationMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.observers.iter().map(|o| o.name()).collect();
        f.debug_struct("IterationMonitor")
            .field("observers", &names)
            .finish()
    }
}

impl IterationMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, observer: Arc<dyn IterationObserver>) {
        self.observers.push(observer);
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    pub fn started(&self, candidate: &PipelineCandidate) {
        self.deliver("iteration_started", |o| o.iteration_started(candidate));
    }

    pub fn finished(&self, result: &IterationResult) {
        self.deliver("iteration_finished", |o| o.iteration_finished(result));
    }

    pub fn failed(&self, failure: &IterationFailure) {
        self.deliver("iteration_failed", |o| o.iteration_failed(failure));
    }

    fn deliver(&self, event: &str, call: impl Fn(&dyn IterationObserver)) {
        for observer in &self.observers {
            let outcome = catch_unwind(AssertUnwindSafe(|| call(observer.as_ref())));
            if outcome.is_err() {
                warn!("Observer {} panicked during {event}", observer.name());
            }
        }
    }
}

// ---- Bundled observers ----

/// Collects every result and failure in memory.
#[derive(Debug, Default)]
pub struct IterationResultRecorder {
    results: Mutex<Vec<IterationResult>>,
    failures: Mutex<Vec<IterationFailure>>,
}

impl IterationResultRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn results(&self) -> Vec<IterationResult> {
        self.results.lock().clone()
    }

    pub fn failures(&self) -> Vec<IterationFailure> {
        self.failures.lock().clone()
    }
}

impl IterationObserver for IterationResultRecorder {
    fn name(&self) -> &str {
        "result-recorder"
    }

    fn iteration_finished(&self, result: &IterationResult) {
        self.results.lock().push(result.clone());
    }

    fn iteration_failed(&self, failure: &IterationFailure) {
        self.failures.lock().push(failure.clone());
    }
}

/// Logs progress through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingObserver;

impl IterationObserver for LoggingObserver {
    fn name(&self) -> &str {
        "logging"
    }

    fn iteration_started(&self, candidate: &PipelineCandidate) {
        info!("Evaluating {candidate}");
    }

    fn iteration_finished(&self, result: &IterationResult) {
        info!(
            "Iteration {}: {} = {:.6} ({} rows, {} ms) {}",
            result.iteration,
            result.metric,
            result.metric_value,
            result.rows_used,
            result.elapsed_ms,
            result.candidate.signature
        );
    }

    fn iteration_failed(&self, failure: &IterationFailure) {
        warn!(
            "Iteration {} failed: {} ({})",
            failure.iteration, failure.error, failure.candidate.signature
        );
    }
}

/// Event forwarded by a [`ChannelObserver`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SearchEvent {
    Started { candidate: CandidateRecord },
    Finished(IterationResult),
    Failed(IterationFailure),
}

/// Forwards bus events onto a channel.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: Sender<SearchEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, Receiver<SearchEvent>) {
        let (tx, rx) = unbounded();
        (Self { tx }, rx)
    }

    pub fn with_sender(tx: Sender<SearchEvent>) -> Self {
        Self { tx }
    }

    fn send(&self, event: SearchEvent) {
        // Best-effort; a dropped receiver only loses events.
        let _ = self.tx.try_send(event);
    }
}

impl IterationObserver for ChannelObserver {
    fn name(&self) -> &str {
        "channel"
    }

    fn iteration_started(&self, candidate: &PipelineCandidate) {
        self.send(SearchEvent::Started {
            candidate: candidate.record(),
        });
    }

    fn iteration_finished(&self, result: &IterationResult) {
        self.send(SearchEvent::Finished(result.clone()));
    }

    fn iteration_failed(&self, failure: &IterationFailure) {
        self.send(SearchEvent::Failed(failure.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::tests::dummy_candidate;

    struct Panicking;

    impl IterationObserver for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        fn iteration_finished(&self, _result: &IterationResult) {
            panic!("observer bug");
        }
    }

    fn result(iteration: usize) -> IterationResult {
        IterationResult {
            candidate: dummy_candidate().record(),
            metric: "RSquared".into(),
            metric_value: 0.5,
            rows_used: 10,
            elapsed_ms: 1,
            iteration,
        }
    }

    #[test]
    fn panicking_observer_does_not_block_others() {
        let recorder = Arc::new(IterationResultRecorder::new());
        let mut monitor = IterationMonitor::new();
        monitor.subscribe(Arc::new(Panicking));
        monitor.subscribe(recorder.clone());

        monitor.finished(&result(1));
        monitor.finished(&result(2));

        let iterations: Vec<usize> = recorder.results().iter().map(|r| r.iteration).collect();
        assert_eq!(iterations, vec![1, 2]);
    }

    #[test]
    fn channel_observer_preserves_event_order() {
        let (observer, rx) = ChannelObserver::new();
        let mut monitor = IterationMonitor::new();
        monitor.subscribe(Arc::new(observer));

        let candidate = dummy_candidate();
        monitor.started(&candidate);
        monitor.failed(&IterationFailure {
            candidate: candidate.record(),
            error: "boom".into(),
            iteration: 1,
        });

        let events: Vec<SearchEvent> = rx.try_iter().collect();
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], SearchEvent::Started { candidate: c } if c.id == candidate.id));
        assert!(matches!(&events[1], SearchEvent::Failed(f) if f.error == "boom"));
    }

    #[test]
    fn events_serialize_with_tag() {
        let json = serde_json::to_value(SearchEvent::Finished(result(3))).unwrap();
        assert_eq!(json["event"], "finished");
        assert_eq!(json["iteration"], 3);
    }
}
