use std::collections::{HashMap, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use ap_engine::{standard_context, ColumnConcat, MeanRegressor, SgdRegressor};
use ap_search::{
    AutoMlExperiment, Budget, ChannelObserver, IterationObserver, IterationResult,
    IterationResultRecorder, IterationTerminator, PipelineCandidate, PipelineOptimizer,
    ProposalRequest, RandomOptimizer, SearchConfig, SearchEvent, SearchSpace, SearchState,
    SpaceDefinition, StopReason, StrategyKind,
};
use ap_types::{
    ApResult, DataHandle, DataRoles, Estimator, FittedTransformer, LearnerSpec,
    MetricDescriptor, ProducedColumn, RoutingInfo, SearchError, SupportedMetric, Table, TaskKind,
    TransformSpec,
};

// ---- Fixtures ----

fn regression_data(rows: usize) -> DataHandle {
    Table::from_numeric(
        &["x1", "x2", "Label"],
        (0..rows)
            .map(|i| {
                let x1 = (i % 23) as f64;
                let x2 = (i % 7) as f64;
                let noise = ((i * 37) % 11) as f64 / 11.0 - 0.5;
                vec![x1, x2, 2.0 * x1 - x2 + 3.0 + noise]
            })
            .collect(),
    )
    .unwrap()
    .into_handle()
}

fn binary_data(rows: usize) -> DataHandle {
    Table::from_numeric(
        &["a", "b", "Label"],
        (0..rows)
            .map(|i| {
                let a = (i % 17) as f64;
                let b = (i % 5) as f64;
                let label = if a + 0.5 * b > 9.0 { 1.0 } else { 0.0 };
                vec![a, b, label]
            })
            .collect(),
    )
    .unwrap()
    .into_handle()
}

fn concat(inputs: &[&str]) -> TransformSpec {
    TransformSpec::new(
        format!("ColumnConcat({})", inputs.join(",")),
        Arc::new(ColumnConcat::new(
            inputs.iter().map(|s| s.to_string()).collect(),
            "Features",
        )),
        RoutingInfo {
            level: 1,
            atomic_group_id: 0,
            columns_produced: vec![ProducedColumn {
                name: "Features".into(),
                is_numeric: true,
            }],
        },
    )
}

fn sgd() -> LearnerSpec {
    LearnerSpec::from_builder(Arc::new(SgdRegressor::default()))
}

fn mean() -> LearnerSpec {
    LearnerSpec::from_builder(Arc::new(MeanRegressor))
}

fn search(
    data: DataHandle,
    metric: MetricDescriptor,
    optimizer: Box<dyn PipelineOptimizer>,
    terminator: IterationTerminator,
) -> SearchState {
    SearchState::new(
        standard_context(TaskKind::Regression, DataRoles::default()),
        data.clone(),
        data,
        metric,
        optimizer,
        Box::new(terminator),
    )
    .with_seed(3)
}

fn r_squared() -> MetricDescriptor {
    SupportedMetric::RSquared.descriptor()
}

fn assert_ranked(ranked: &[PipelineCandidate], maximizing: bool) {
    for pair in ranked.windows(2) {
        let (a, b) = (pair[0].metric_value().unwrap(), pair[1].metric_value().unwrap());
        if maximizing {
            assert!(a >= b, "{a} ranked before {b}");
        } else {
            assert!(a <= b, "{a} ranked before {b}");
        }
    }
}

// ---- Test optimizers ----

/// Proposes the first learner with default hyperparameters, forever.
#[derive(Debug, Default)]
struct RepeatOptimizer {
    space: Option<Arc<SearchSpace>>,
}

impl PipelineOptimizer for RepeatOptimizer {
    fn name(&self) -> &str {
        "repeat"
    }

    fn set_space(&mut self, definition: SpaceDefinition) -> ApResult<()> {
        self.space = Some(definition.space);
        Ok(())
    }

    fn next_candidates(
        &mut self,
        request: &ProposalRequest<'_>,
    ) -> ApResult<Vec<PipelineCandidate>> {
        let space = self.space.as_ref().ok_or(SearchError::SpaceNotDefined)?;
        (0..request.batch_size)
            .map(|_| space.compose(&space.transforms, &space.learners[0], request.roles))
            .collect()
    }
}

/// Hands out prepared batches in order, then nothing.
#[derive(Debug, Default)]
struct ScriptedOptimizer {
    batches: VecDeque<Vec<PipelineCandidate>>,
    set_space_calls: usize,
}

impl ScriptedOptimizer {
    fn new(batches: Vec<Vec<PipelineCandidate>>) -> Self {
        Self {
            batches: batches.into(),
            set_space_calls: 0,
        }
    }
}

impl PipelineOptimizer for ScriptedOptimizer {
    fn name(&self) -> &str {
        "scripted"
    }

    fn set_space(&mut self, _definition: SpaceDefinition) -> ApResult<()> {
        self.set_space_calls += 1;
        assert_eq!(self.set_space_calls, 1, "space handed over twice");
        Ok(())
    }

    fn next_candidates(
        &mut self,
        _request: &ProposalRequest<'_>,
    ) -> ApResult<Vec<PipelineCandidate>> {
        Ok(self.batches.pop_front().unwrap_or_default())
    }
}

#[derive(Debug)]
struct BrokenOptimizer {
    panics: bool,
    calls: usize,
}

impl PipelineOptimizer for BrokenOptimizer {
    fn name(&self) -> &str {
        "broken"
    }

    fn set_space(&mut self, _definition: SpaceDefinition) -> ApResult<()> {
        Ok(())
    }

    fn next_candidates(
        &mut self,
        _request: &ProposalRequest<'_>,
    ) -> ApResult<Vec<PipelineCandidate>> {
        self.calls += 1;
        if self.calls == 1 {
            return Ok(vec![PipelineCandidate::new(&[concat(&["x1", "x2"])], &mean())]);
        }
        if self.panics {
            panic!("optimizer bug");
        }
        Err(SearchError::Optimizer {
            optimizer: "broken".into(),
            message: "model diverged".into(),
        }
        .into())
    }
}

/// Estimator that panics when fitted.
#[derive(Debug)]
struct PanickingEstimator;

impl Estimator for PanickingEstimator {
    fn name(&self) -> &str {
        "Panicking"
    }

    fn fit(&self, _data: &DataHandle) -> ApResult<Arc<dyn FittedTransformer>> {
        panic!("estimator bug");
    }
}

struct PanickingObserver;

impl IterationObserver for PanickingObserver {
    fn iteration_started(&self, _candidate: &PipelineCandidate) {
        panic!("observer bug");
    }

    fn iteration_finished(&self, _result: &IterationResult) {
        panic!("observer bug");
    }
}

// ---- Scenarios ----

#[test]
fn repeated_default_learner_fills_history() {
    let context = standard_context(TaskKind::Regression, DataRoles::default());
    let data = regression_data(100);
    let mut state = SearchState::new(
        context,
        data.clone(),
        data,
        r_squared(),
        Box::new(RepeatOptimizer::default()),
        Box::new(IterationTerminator::iterations(5)),
    )
    .with_seed(11)
    .with_requested_learners(vec!["SgdRegressor".into()]);

    let ranked = state.infer_pipelines(0, 1, 100).unwrap();

    assert_eq!(ranked.len(), 5);
    assert!(ranked.iter().all(|c| c.summary.is_some()));
    assert!(ranked.iter().all(|c| c.learner.name == "SgdRegressor"));
    assert!(ranked.iter().all(|c| c.summary.unwrap().rows_used <= 100));
    assert_ranked(&ranked, true);
    assert_eq!(state.status().stop_reason, Some(StopReason::Budget));
}

#[test]
fn empty_first_batch_returns_empty_history() {
    let mut state = search(
        regression_data(40),
        r_squared(),
        Box::new(ScriptedOptimizer::new(Vec::new())),
        IterationTerminator::iterations(10),
    );
    let ranked = state.infer_pipelines(1, 2, 40).unwrap();
    assert!(ranked.is_empty());
    assert!(state.attempts().is_empty());
    assert_eq!(state.status().stop_reason, Some(StopReason::Exhausted));
}

#[test]
fn zero_wall_clock_evaluates_nothing() {
    let recorder = Arc::new(IterationResultRecorder::new());
    let mut state = search(
        regression_data(40),
        r_squared(),
        Box::new(RepeatOptimizer::default()),
        IterationTerminator::new(Budget::Both {
            max_iterations: 10,
            max_duration_ms: 0,
        }),
    );
    state.subscribe(recorder.clone());

    let ranked = state.infer_pipelines(1, 1, 40).unwrap();
    assert!(ranked.is_empty());
    assert!(recorder.results().is_empty());
    assert_eq!(state.status().stop_reason, Some(StopReason::Budget));
}

#[test]
fn failing_candidates_do_not_stop_the_batch() {
    let good = PipelineCandidate::new(&[concat(&["x1", "x2"])], &mean());
    let missing_column = PipelineCandidate::new(&[concat(&["x1", "nope"])], &mean());
    let panicking = PipelineCandidate::new(
        &[TransformSpec::new(
            "Panicking",
            Arc::new(PanickingEstimator),
            RoutingInfo::default(),
        )],
        &mean(),
    );
    let also_good = PipelineCandidate::new(&[concat(&["x1", "x2"])], &sgd());
    let failing_signatures = [missing_column.signature(), panicking.signature()];

    let recorder = Arc::new(IterationResultRecorder::new());
    let mut state = search(
        regression_data(60),
        r_squared(),
        Box::new(ScriptedOptimizer::new(vec![vec![
            good,
            missing_column,
            panicking,
            also_good,
        ]])),
        IterationTerminator::iterations(4),
    );
    state.subscribe(recorder.clone());

    let ranked = state.infer_pipelines(1, 4, 60).unwrap();

    assert_eq!(ranked.len(), 2);
    assert_eq!(state.attempts().len(), 4);
    let failed = state.failed_signatures();
    assert!(failing_signatures.iter().all(|s| failed.contains(s)));

    let failures = recorder.failures();
    assert_eq!(failures.len(), 2);
    assert!(failures.iter().any(|f| f.error.contains("panicked")));
    assert!(failures.iter().any(|f| f.error.contains("nope")));
    assert_eq!(state.status().failed, 2);
}

#[test]
fn equal_metric_values_are_both_kept() {
    let first = PipelineCandidate::new(&[concat(&["x1", "x2"])], &mean());
    let second = PipelineCandidate::new(&[concat(&["x1", "x2"])], &mean());
    let mut state = search(
        regression_data(50),
        SupportedMetric::Mae.descriptor(),
        Box::new(ScriptedOptimizer::new(vec![vec![first, second]])),
        IterationTerminator::iterations(2),
    );

    // Far more rows than the data holds: both candidates see every row.
    let ranked = state.infer_pipelines(1, 2, 100_000).unwrap();

    assert_eq!(ranked.len(), 2);
    assert_eq!(ranked[0].metric_value(), ranked[1].metric_value());
    assert_ne!(ranked[0].id, ranked[1].id);
}

#[test]
fn iteration_budget_holds_for_any_batch_size() {
    for batch_size in 1..=6 {
        let mut state = search(
            regression_data(60),
            SupportedMetric::Rmse.descriptor(),
            Box::new(RandomOptimizer::new(batch_size as u64)),
            IterationTerminator::iterations(5),
        );
        let ranked = state.infer_pipelines(1, batch_size, 60).unwrap();
        assert!(state.attempts().len() <= 5, "batch size {batch_size}");
        assert!(ranked.len() <= 5);
        assert_ranked(&ranked, false);
    }
}

#[test]
fn space_is_defined_once() {
    let mut state = search(
        regression_data(40),
        r_squared(),
        Box::new(ScriptedOptimizer::new(Vec::new())),
        IterationTerminator::iterations(3),
    );
    let first = state.infer_search_space(2).unwrap();
    let second = state.infer_search_space(2).unwrap();
    assert!(Arc::ptr_eq(&first, &second));

    state.infer_pipelines(2, 1, 40).unwrap();
    state.infer_pipelines(2, 1, 40).unwrap();
    let after = state.space().unwrap();
    assert!(Arc::ptr_eq(&first, &after));
    let names: Vec<&str> = after.learners.iter().map(|l| l.name.as_str()).collect();
    assert_eq!(names, vec!["MeanRegressor", "SgdRegressor"]);
}

#[test]
fn candidates_from_one_template_are_independent() {
    let mut state = search(
        regression_data(40),
        r_squared(),
        Box::new(ScriptedOptimizer::new(Vec::new())),
        IterationTerminator::iterations(3),
    );
    let space = state.infer_search_space(1).unwrap();
    let template = space.learner("SgdRegressor").unwrap();
    let roles = DataRoles::default();

    let mut x = space.compose(&space.transforms, template, &roles).unwrap();
    let y = space.compose(&space.transforms, template, &roles).unwrap();
    x.learner
        .hyperparameters
        .set("epochs", ap_types::HyperparameterValue::Long(150))
        .unwrap();

    assert!(y.learner.hyperparameters.get("epochs").unwrap().value.is_none());
    assert!(template.hyperparameters.get("epochs").unwrap().value.is_none());
    assert_ne!(x.signature(), y.signature());
}

#[test]
fn optimizer_errors_stop_gracefully() {
    for panics in [false, true] {
        let mut state = search(
            regression_data(40),
            r_squared(),
            Box::new(BrokenOptimizer { panics, calls: 0 }),
            IterationTerminator::iterations(10),
        );
        let ranked = state.infer_pipelines(1, 1, 40).unwrap();
        assert_eq!(ranked.len(), 1);
        assert_eq!(
            state.status().stop_reason,
            Some(StopReason::OptimizerFailure)
        );
    }
}

#[test]
fn panicking_observer_is_isolated() {
    let recorder = Arc::new(IterationResultRecorder::new());
    let mut state = search(
        regression_data(40),
        r_squared(),
        Box::new(RepeatOptimizer::default()),
        IterationTerminator::iterations(3),
    );
    state.subscribe(Arc::new(PanickingObserver));
    state.subscribe(recorder.clone());

    let ranked = state.infer_pipelines(1, 1, 40).unwrap();
    assert_eq!(ranked.len(), 3);
    assert_eq!(recorder.results().len(), 3);
}

#[test]
fn configuration_errors_propagate() {
    let data = regression_data(40);
    let mut state = SearchState::new(
        standard_context(TaskKind::Regression, DataRoles::default()),
        data.clone(),
        data,
        r_squared(),
        Box::new(RepeatOptimizer::default()),
        Box::new(IterationTerminator::iterations(3)),
    )
    .with_requested_learners(vec!["GradientBoosting".into()]);

    let err = state.infer_pipelines(1, 1, 40).unwrap_err();
    assert!(err.is_configuration());
    assert!(err.to_string().contains("GradientBoosting"));
}

#[test]
fn parallel_batches_keep_event_pairs_ordered() {
    let (observer, events) = ChannelObserver::new();
    let mut state = search(
        regression_data(80),
        r_squared(),
        Box::new(RandomOptimizer::new(21)),
        IterationTerminator::iterations(8),
    )
    .with_parallelism(4);
    state.subscribe(Arc::new(observer));

    let ranked = state.infer_pipelines(1, 4, 80).unwrap();
    assert!(state.attempts().len() <= 8);
    assert_ranked(&ranked, true);

    let mut started: HashMap<String, usize> = HashMap::new();
    for (position, event) in events.try_iter().enumerate() {
        match event {
            SearchEvent::Started { candidate } => {
                started.insert(candidate.id.to_string(), position);
            }
            SearchEvent::Finished(result) => {
                assert!(started.contains_key(&result.candidate.id.to_string()));
            }
            SearchEvent::Failed(failure) => {
                assert!(started.contains_key(&failure.candidate.id.to_string()));
            }
        }
    }
    assert_eq!(started.len(), state.attempts().len());
}

#[test]
fn search_resumes_and_cancels() {
    let mut state = search(
        regression_data(40),
        r_squared(),
        Box::new(RepeatOptimizer::default()),
        IterationTerminator::iterations(2),
    );
    state.infer_pipelines(1, 1, 40).unwrap();
    assert_eq!(state.attempts().len(), 2);
    let space = state.space().unwrap();

    state.replace_terminator(Box::new(IterationTerminator::iterations(4)));
    let ranked = state.infer_pipelines(1, 1, 40).unwrap();
    assert_eq!(state.attempts().len(), 4);
    assert_eq!(ranked.len(), 4);
    assert!(Arc::ptr_eq(&space, &state.space().unwrap()));

    state.replace_terminator(Box::new(IterationTerminator::iterations(10)));
    state.cancellation().store(true, Ordering::SeqCst);
    state.infer_pipelines(1, 1, 40).unwrap();
    assert_eq!(state.attempts().len(), 4);
    assert_eq!(state.status().stop_reason, Some(StopReason::Cancelled));
}

#[test]
fn experiment_runs_end_to_end() {
    let config = SearchConfig::new("binary", TaskKind::BinaryClassification)
        .with_strategy(StrategyKind::Exploit)
        .with_max_iterations(6)
        .with_batch_size(2)
        .with_seed(5);
    let recorder = Arc::new(IterationResultRecorder::new());
    let experiment = AutoMlExperiment::new(config).add_observer(recorder.clone());

    let train = binary_data(120);
    let valid = binary_data(60);
    let context = standard_context(TaskKind::BinaryClassification, DataRoles::default());
    let result = experiment.fit(context, train, valid).unwrap();

    assert!(!result.ranked.is_empty());
    assert!(result.ranked.len() <= 6);
    assert!(result.best_model.is_some());
    assert_eq!(result.iterations.len(), result.ranked.len());
    assert_eq!(recorder.results().len(), result.iterations.len());
    assert_ranked(&result.ranked, true);

    let records = result.records();
    let json = serde_json::to_string(&records).unwrap();
    let back: Vec<ap_search::CandidateRecord> = serde_json::from_str(&json).unwrap();
    assert_eq!(back, records);
    assert_eq!(result.status.completed, result.ranked.len());
}

#[test]
fn experiment_rejects_mismatched_context() {
    let experiment = AutoMlExperiment::new(SearchConfig::new("r", TaskKind::Regression));
    let context = standard_context(TaskKind::BinaryClassification, DataRoles::default());
    let data = binary_data(20);
    let err = experiment.fit(context, data.clone(), data).unwrap_err();
    assert!(err.is_configuration());
}
