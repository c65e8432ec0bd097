//! Search state machine: owns the space, history, optimizer and terminator
//! for one search session and drives the propose/evaluate loop.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use ap_types::{
    config_error, internal_error, validation_error, ApResult, CandidateError, DataHandle,
    EstimatorChain, ExecutionContext, FittedTransformer, MetricDescriptor, RowLimit, SearchError,
};

use crate::candidate::{CandidateRecord, PipelineCandidate, RunSummary};
use crate::history::SearchHistory;
use crate::notify::{IterationFailure, IterationMonitor, IterationObserver, IterationResult};
use crate::optimizer::{PipelineOptimizer, ProposalRequest, SpaceDefinition};
use crate::space::{SearchSpace, SearchSpaceBuilder};
use crate::terminator::Terminator;

/// Rows of training data run through every transform to give optimizers a
/// look at the transformed schema.
pub const TRANSFORMED_SAMPLE_ROWS: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SearchPhase {
    Uninitialized,
    SpaceDefined,
    Running,
    Terminated,
}

/// Why the last `infer_pipelines` call returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Budget,
    Exhausted,
    OptimizerFailure,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchStatus {
    pub id: Uuid,
    pub phase: SearchPhase,
    pub attempts: usize,
    pub completed: usize,
    pub failed: usize,
    pub best: Option<CandidateRecord>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub stop_reason: Option<StopReason>,
}

impl SearchStatus {
    fn new(id: Uuid) -> Self {
        Self {
            id,
            phase: SearchPhase::Uninitialized,
            attempts: 0,
            completed: 0,
            failed: 0,
            best: None,
            started_at: None,
            finished_at: None,
            stop_reason: None,
        }
    }

    fn mark_running(&mut self) {
        self.phase = SearchPhase::Running;
        self.started_at.get_or_insert_with(Utc::now);
        self.finished_at = None;
        self.stop_reason = None;
    }

    fn mark_terminated(&mut self, reason: StopReason) {
        self.phase = SearchPhase::Terminated;
        self.finished_at = Some(Utc::now());
        self.stop_reason = Some(reason);
    }
}

/// Effective training-row count for one candidate: a normal draw centred on
/// `max` with a tenth of it as standard deviation, floored, with any overage
/// reflected back below `max` and clamped at zero.
pub fn subsample_rows<R: Rng + ?Sized>(max: usize, rng: &mut R) -> usize {
    if max == 0 {
        return 0;
    }
    let centre = max as f64;
    let Ok(normal) = Normal::new(centre, centre / 10.0) else {
        return max;
    };
    let mut sampled = normal.sample(rng).floor();
    if sampled > centre {
        sampled = centre - (sampled - centre);
    }
    sampled.max(0.0) as usize
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Mutable state shared by concurrent candidate evaluations.
#[derive(Debug)]
struct Progress {
    history: SearchHistory,
    status: SearchStatus,
    launched: usize,
}

/// Borrowed view of everything one candidate evaluation needs.
struct CandidateRunner<'a> {
    context: &'a ExecutionContext,
    train: &'a DataHandle,
    test: &'a DataHandle,
    metric: &'a MetricDescriptor,
    monitor: &'a IterationMonitor,
    progress: &'a Mutex<Progress>,
}

impl CandidateRunner<'_> {
    fn run(&self, mut candidate: PipelineCandidate, rows: usize) {
        let iteration = {
            let mut progress = self.progress.lock();
            progress.launched += 1;
            progress.launched
        };
        self.monitor.started(&candidate);

        let train: DataHandle = Arc::new(RowLimit::new(self.train.clone(), rows));
        let start = Instant::now();
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            candidate.run_train_test_experiment(&train, self.test, self.metric, self.context)
        }))
        .unwrap_or_else(|payload| {
            Err(CandidateError::Panicked {
                message: panic_message(payload),
            }
            .into())
        });
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(metric_value) => {
                let rows_used = train.row_count().unwrap_or(rows);
                candidate.summary = Some(RunSummary {
                    metric_value,
                    rows_used,
                    elapsed_ms,
                });
                let result = IterationResult {
                    candidate: candidate.record(),
                    metric: self.metric.name.clone(),
                    metric_value,
                    rows_used,
                    elapsed_ms,
                    iteration,
                };
                debug!("Candidate {} scored {metric_value}", candidate.id);
                {
                    let mut progress = self.progress.lock();
                    progress.history.record_success(candidate);
                    progress.status.attempts += 1;
                    progress.status.completed += 1;
                    progress.status.best = progress.history.best().map(|c| c.record());
                }
                self.monitor.finished(&result);
            }
            Err(e) => {
                warn!("Candidate {} failed: {e}", candidate.signature());
                candidate.failure = Some(e.to_string());
                let failure = IterationFailure {
                    candidate: candidate.record(),
                    error: e.to_string(),
                    iteration,
                };
                {
                    let mut progress = self.progress.lock();
                    progress.history.record_failure(candidate);
                    progress.status.attempts += 1;
                    progress.status.failed += 1;
                }
                self.monitor.failed(&failure);
            }
        }
    }
}

/// One search session.
///
/// The space is inferred once and reused; history accumulates across
/// `infer_pipelines` calls so a search can be resumed with a fresh
/// terminator.
pub struct SearchState {
    id: Uuid,
    context: ExecutionContext,
    train: DataHandle,
    test: DataHandle,
    metric: MetricDescriptor,
    optimizer: Box<dyn PipelineOptimizer>,
    terminator: Box<dyn Terminator>,
    monitor: IterationMonitor,
    requested_learners: Vec<String>,
    rng: ChaCha8Rng,
    parallelism: usize,
    pool: Option<rayon::ThreadPool>,
    space: Option<Arc<SearchSpace>>,
    progress: Mutex<Progress>,
    cancelled: Arc<AtomicBool>,
}

impl std::fmt::Debug for SearchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchState")
            .field("id", &self.id)
            .field("metric", &self.metric)
            .field("optimizer", &self.optimizer.name())
            .field("terminator", &self.terminator)
            .field("parallelism", &self.parallelism)
            .field("phase", &self.phase())
            .finish()
    }
}

impl SearchState {
    pub fn new(
        context: ExecutionContext,
        train: DataHandle,
        test: DataHandle,
        metric: MetricDescriptor,
        optimizer: Box<dyn PipelineOptimizer>,
        terminator: Box<dyn Terminator>,
    ) -> Self {
        let id = Uuid::new_v4();
        let history = SearchHistory::new(metric.direction());
        Self {
            id,
            context,
            train,
            test,
            metric,
            optimizer,
            terminator,
            monitor: IterationMonitor::new(),
            requested_learners: Vec::new(),
            rng: ChaCha8Rng::from_entropy(),
            parallelism: 1,
            pool: None,
            space: None,
            progress: Mutex::new(Progress {
                history,
                status: SearchStatus::new(id),
                launched: 0,
            }),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Seed the row-subsampling generator.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = ChaCha8Rng::seed_from_u64(seed);
        self
    }

    /// Evaluate up to `parallelism` candidates of a batch concurrently.
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self.pool = None;
        self
    }

    pub fn with_requested_learners(mut self, names: Vec<String>) -> Self {
        self.requested_learners = names;
        self
    }

    pub fn subscribe(&mut self, observer: Arc<dyn IterationObserver>) {
        self.monitor.subscribe(observer);
    }

    // ---- Space definition ----

    /// Build the search space and hand it to the optimizer. Does nothing when
    /// a space is already defined.
    pub fn infer_search_space(&mut self, levels: usize) -> ApResult<Arc<SearchSpace>> {
        if let Some(space) = &self.space {
            debug!("Search space already defined; skipping inference");
            return Ok(space.clone());
        }
        self.validate_inputs()?;

        let space = SearchSpaceBuilder::new(&self.context)
            .with_requested_learners(&self.requested_learners)
            .build(&self.train, levels)?;
        let space = Arc::new(space);

        let sample: DataHandle = Arc::new(RowLimit::new(self.train.clone(), TRANSFORMED_SAMPLE_ROWS));
        let mut chain = EstimatorChain::new();
        for spec in &space.transforms {
            if let Some(estimator) = &spec.estimator {
                chain = chain.append(estimator.clone());
            }
        }
        let transformed_sample = chain.fit(&sample)?.transform(&sample)?;

        self.optimizer.set_space(SpaceDefinition {
            space: space.clone(),
            train: self.train.clone(),
            transformed_sample,
            is_maximizing: self.metric.is_maximizing,
        })?;

        info!(
            "Search {} space defined for {} ({} learners, {} transforms)",
            self.id,
            self.metric.name,
            space.learners.len(),
            space.transforms.len()
        );
        self.space = Some(space.clone());
        let mut progress = self.progress.lock();
        if progress.status.phase == SearchPhase::Uninitialized {
            progress.status.phase = SearchPhase::SpaceDefined;
        }
        Ok(space)
    }

    /// Drop the current space and infer it again, e.g. after the training
    /// data changed. History is kept.
    pub fn redefine_search_space(&mut self, levels: usize) -> ApResult<Arc<SearchSpace>> {
        self.space = None;
        self.infer_search_space(levels)
    }

    fn validate_inputs(&self) -> ApResult<()> {
        let task = self.context.task;
        if !self.context.evaluator.supports(&self.metric.name, task) {
            return Err(SearchError::UnsupportedMetric {
                metric: self.metric.name.clone(),
                task: task.to_string(),
            }
            .into());
        }
        let roles = &self.context.roles;
        for (label, data) in [("training", &self.train), ("test", &self.test)] {
            data.schema().require(&roles.label).map_err(|_| {
                config_error!("{label} data has no label column {}", roles.label)
            })?;
            if let Some(weight) = &roles.weight {
                data.schema().require(weight).map_err(|_| {
                    config_error!("{label} data has no weight column {weight}")
                })?;
            }
        }
        Ok(())
    }

    // ---- Search loop ----

    /// Run the search until the terminator stops it, the optimizer runs dry
    /// or fails, or the search is cancelled. Returns the ranked history,
    /// best first.
    ///
    /// Only configuration errors are returned; candidate failures are
    /// recorded and reported through observers.
    pub fn infer_pipelines(
        &mut self,
        levels: usize,
        batch_size: usize,
        training_rows: usize,
    ) -> ApResult<Vec<PipelineCandidate>> {
        if batch_size == 0 {
            return Err(validation_error!("batch size must be at least 1"));
        }
        if training_rows == 0 {
            return Err(validation_error!("training row count must be at least 1"));
        }
        self.infer_search_space(levels)?;
        if self.parallelism > 1 && self.pool.is_none() {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(self.parallelism)
                .build()
                .map_err(|e| internal_error!("failed to start evaluation pool: {e}"))?;
            self.pool = Some(pool);
        }

        self.progress.lock().status.mark_running();
        let mut round = 0usize;
        let reason = loop {
            if self.cancelled.load(Ordering::SeqCst) {
                break StopReason::Cancelled;
            }

            let (stop, remaining, ranked, failed) = {
                let progress = self.progress.lock();
                let attempts = progress.history.attempts();
                (
                    self.terminator.should_terminate(attempts),
                    self.terminator.remaining_iterations(attempts),
                    progress.history.ranked_values(),
                    progress.history.failed().clone(),
                )
            };
            if stop {
                break StopReason::Budget;
            }
            let current = match remaining {
                Some(r) => batch_size.min(r.max(0) as usize),
                None => batch_size,
            };
            if current == 0 {
                break StopReason::Budget;
            }

            round += 1;
            let mut batch = match self.propose(&ranked, &failed, current) {
                Some(batch) => batch,
                None => break StopReason::OptimizerFailure,
            };
            if batch.is_empty() {
                info!("Optimizer {} has no more candidates", self.optimizer.name());
                break StopReason::Exhausted;
            }
            batch.truncate(current);
            info!("Round {round}: evaluating {} candidates", batch.len());

            let rows: Vec<usize> = batch
                .iter()
                .map(|_| subsample_rows(training_rows, &mut self.rng))
                .collect();
            self.evaluate_batch(batch, rows);
        };

        let ranked = {
            let mut progress = self.progress.lock();
            progress.status.mark_terminated(reason);
            progress.history.ranked_values()
        };
        info!(
            "Search {} stopped ({reason:?}) with {} ranked candidates",
            self.id,
            ranked.len()
        );
        Ok(ranked)
    }

    /// Ask the optimizer for a batch. `None` when it errors or panics.
    fn propose(
        &mut self,
        ranked: &[PipelineCandidate],
        failed: &HashSet<String>,
        batch_size: usize,
    ) -> Option<Vec<PipelineCandidate>> {
        let request = ProposalRequest {
            history: ranked,
            batch_size,
            roles: &self.context.roles,
            failed,
        };
        let optimizer = &mut self.optimizer;
        match catch_unwind(AssertUnwindSafe(|| optimizer.next_candidates(&request))) {
            Ok(Ok(batch)) => Some(batch),
            Ok(Err(e)) => {
                warn!("Optimizer {} failed, stopping search: {e}", optimizer.name());
                None
            }
            Err(payload) => {
                warn!(
                    "Optimizer {} panicked, stopping search: {}",
                    optimizer.name(),
                    panic_message(payload)
                );
                None
            }
        }
    }

    fn evaluate_batch(&self, batch: Vec<PipelineCandidate>, rows: Vec<usize>) {
        let runner = CandidateRunner {
            context: &self.context,
            train: &self.train,
            test: &self.test,
            metric: &self.metric,
            monitor: &self.monitor,
            progress: &self.progress,
        };
        let cancelled = &self.cancelled;

        match &self.pool {
            Some(pool) => pool.install(|| {
                batch
                    .into_par_iter()
                    .zip(rows.into_par_iter())
                    .for_each(|(candidate, rows)| {
                        if !cancelled.load(Ordering::SeqCst) {
                            runner.run(candidate, rows);
                        }
                    })
            }),
            None => {
                for (candidate, rows) in batch.into_iter().zip(rows) {
                    if cancelled.load(Ordering::SeqCst) {
                        break;
                    }
                    runner.run(candidate, rows);
                }
            }
        }
    }

    // ---- Accessors ----

    /// Shared flag; setting it stops the search between candidates.
    pub fn cancellation(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    /// Swap the stopping policy, typically before resuming.
    pub fn replace_terminator(&mut self, terminator: Box<dyn Terminator>) {
        self.terminator = terminator;
        self.cancelled.store(false, Ordering::SeqCst);
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn phase(&self) -> SearchPhase {
        self.progress.lock().status.phase
    }

    pub fn status(&self) -> SearchStatus {
        self.progress.lock().status.clone()
    }

    pub fn space(&self) -> Option<Arc<SearchSpace>> {
        self.space.clone()
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    pub fn train_data(&self) -> &DataHandle {
        &self.train
    }

    pub fn metric(&self) -> &MetricDescriptor {
        &self.metric
    }

    /// Successful candidates, best first.
    pub fn ranked(&self) -> Vec<PipelineCandidate> {
        self.progress.lock().history.ranked_values()
    }

    pub fn best(&self) -> Option<PipelineCandidate> {
        self.progress.lock().history.best().cloned()
    }

    /// Every attempt in launch-completion order.
    pub fn attempts(&self) -> Vec<PipelineCandidate> {
        self.progress.lock().history.attempts().to_vec()
    }

    pub fn failed_signatures(&self) -> HashSet<String> {
        self.progress.lock().history.failed().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::tests::linear_data;
    use crate::optimizer::DefaultsOptimizer;
    use crate::terminator::IterationTerminator;
    use ap_engine::standard_context;
    use ap_types::{DataRoles, SupportedMetric, TaskKind};

    fn state(max_iterations: usize) -> SearchState {
        let data = linear_data(50, 0.5);
        SearchState::new(
            standard_context(TaskKind::Regression, DataRoles::default()),
            data.clone(),
            data,
            SupportedMetric::RSquared.descriptor(),
            Box::new(DefaultsOptimizer::new()),
            Box::new(IterationTerminator::iterations(max_iterations)),
        )
        .with_seed(7)
    }

    #[test]
    fn subsampled_rows_never_exceed_max() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        for _ in 0..1000 {
            let rows = subsample_rows(100, &mut rng);
            assert!(rows <= 100);
            assert!(rows >= 40, "rows = {rows}");
        }
        assert_eq!(subsample_rows(0, &mut rng), 0);
    }

    #[test]
    fn subsampling_is_seeded() {
        let draw = |seed| {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            (0..10).map(|_| subsample_rows(500, &mut rng)).collect::<Vec<_>>()
        };
        assert_eq!(draw(4), draw(4));
    }

    #[test]
    fn phases_follow_the_lifecycle() {
        let mut state = state(10);
        assert_eq!(state.phase(), SearchPhase::Uninitialized);
        state.infer_search_space(1).unwrap();
        assert_eq!(state.phase(), SearchPhase::SpaceDefined);

        let ranked = state.infer_pipelines(1, 1, 50).unwrap();
        let status = state.status();
        assert_eq!(status.phase, SearchPhase::Terminated);
        assert_eq!(status.stop_reason, Some(StopReason::Exhausted));
        assert_eq!(status.attempts, 2);
        assert_eq!(status.completed + status.failed, 2);
        assert_eq!(ranked.len(), status.completed);
        assert!(status.started_at.is_some() && status.finished_at.is_some());
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let mut state = state(3);
        let err = state.infer_pipelines(1, 0, 50).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn unsupported_metric_is_a_configuration_error() {
        let data = linear_data(20, 0.0);
        let mut state = SearchState::new(
            standard_context(TaskKind::Regression, DataRoles::default()),
            data.clone(),
            data,
            SupportedMetric::Auc.descriptor(),
            Box::new(DefaultsOptimizer::new()),
            Box::new(IterationTerminator::iterations(3)),
        );
        let err = state.infer_pipelines(1, 1, 20).unwrap_err();
        assert!(err.is_configuration());
        assert_eq!(state.phase(), SearchPhase::Uninitialized);
    }

    #[test]
    fn missing_label_is_a_configuration_error() {
        let data = linear_data(20, 0.0);
        let mut state = SearchState::new(
            standard_context(
                TaskKind::Regression,
                DataRoles::default().with_label("Target"),
            ),
            data.clone(),
            data,
            SupportedMetric::RSquared.descriptor(),
            Box::new(DefaultsOptimizer::new()),
            Box::new(IterationTerminator::iterations(3)),
        );
        let err = state.infer_search_space(1).unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("Target"));
    }
}
