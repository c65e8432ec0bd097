//! Search configuration and the one-call experiment facade.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use ap_types::{
    config_error, validation_error, ApResult, DataHandle, DataRoles, ExecutionContext,
    MetricDescriptor, SupportedMetric, TaskKind, FEATURES_COLUMN, LABEL_COLUMN,
};

use crate::candidate::{CandidateRecord, PipelineCandidate, PipelineModel};
use crate::notify::{IterationFailure, IterationObserver, IterationResult, IterationResultRecorder};
use crate::optimizer::{
    DefaultsOptimizer, ExploitOptimizer, GridOptimizer, PipelineOptimizer, RandomOptimizer,
};
use crate::state::{SearchState, SearchStatus};
use crate::terminator::{Budget, IterationTerminator, Terminator};

/// Training rows used when neither the config nor the data gives a count.
pub const DEFAULT_TRAINING_ROWS: usize = 10_000;

/// Which proposal strategy drives the search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Defaults,
    Grid,
    Random,
    Exploit,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyKind::Defaults => write!(f, "defaults"),
            StrategyKind::Grid => write!(f, "grid"),
            StrategyKind::Random => write!(f, "random"),
            StrategyKind::Exploit => write!(f, "exploit"),
        }
    }
}

/// Top-level configuration for a pipeline search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub name: String,
    pub task: TaskKind,

    /// Metric to optimize; the task's default when unset.
    pub metric: Option<String>,

    pub strategy: StrategyKind,

    pub max_iterations: Option<usize>,
    pub max_duration_ms: Option<u64>,

    /// Candidates proposed per round.
    pub batch_size: usize,

    /// Centre of the per-candidate training-row draw. Defaults to the
    /// training data's row count.
    pub training_rows: Option<usize>,

    /// Transform inference levels; 0 searches learners only.
    pub transform_levels: usize,

    /// Restrict the search to these learners. Empty means all.
    pub requested_learners: Vec<String>,

    pub seed: u64,

    /// Candidates evaluated concurrently within a batch.
    pub parallelism: usize,

    /// Exploration probability for the exploit strategy.
    pub exploration_weight: f64,

    /// Points per continuous dimension for grid search.
    pub grid_steps: usize,

    pub label_column: String,
    pub features_column: String,
    pub weight_column: Option<String>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            name: "autopipe".to_string(),
            task: TaskKind::Regression,
            metric: None,
            strategy: StrategyKind::Random,
            max_iterations: Some(20),
            max_duration_ms: None,
            batch_size: 1,
            training_rows: None,
            transform_levels: 2,
            requested_learners: Vec::new(),
            seed: 42,
            parallelism: 1,
            exploration_weight: 0.3,
            grid_steps: 3,
            label_column: LABEL_COLUMN.to_string(),
            features_column: FEATURES_COLUMN.to_string(),
            weight_column: None,
        }
    }
}

impl SearchConfig {
    pub fn new(name: impl Into<String>, task: TaskKind) -> Self {
        Self {
            name: name.into(),
            task,
            ..Self::default()
        }
    }

    pub fn from_json_str(json: &str) -> ApResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> ApResult<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn with_metric(mut self, metric: SupportedMetric) -> Self {
        self.metric = Some(metric.name().to_string());
        self
    }

    pub fn with_strategy(mut self, strategy: StrategyKind) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_max_iterations(mut self, n: usize) -> Self {
        self.max_iterations = Some(n);
        self
    }

    pub fn with_max_duration_ms(mut self, ms: u64) -> Self {
        self.max_duration_ms = Some(ms);
        self
    }

    pub fn with_batch_size(mut self, n: usize) -> Self {
        self.batch_size = n;
        self
    }

    pub fn with_training_rows(mut self, n: usize) -> Self {
        self.training_rows = Some(n);
        self
    }

    pub fn with_transform_levels(mut self, levels: usize) -> Self {
        self.transform_levels = levels;
        self
    }

    pub fn with_requested_learners(mut self, names: &[&str]) -> Self {
        self.requested_learners = names.iter().map(|n| n.to_string()).collect();
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_parallelism(mut self, n: usize) -> Self {
        self.parallelism = n;
        self
    }

    pub fn with_label_column(mut self, column: impl Into<String>) -> Self {
        self.label_column = column.into();
        self
    }

    pub fn validate(&self) -> ApResult<()> {
        if self.batch_size == 0 {
            return Err(validation_error!("batch_size must be at least 1"));
        }
        if self.parallelism == 0 {
            return Err(validation_error!("parallelism must be at least 1"));
        }
        if self.training_rows == Some(0) {
            return Err(validation_error!("training_rows must be at least 1"));
        }
        if self.budget().is_none() {
            return Err(validation_error!(
                "either max_iterations or max_duration_ms must be set"
            ));
        }
        if !(0.0..=1.0).contains(&self.exploration_weight) {
            return Err(validation_error!(
                "exploration_weight must be within [0, 1], got {}",
                self.exploration_weight
            ));
        }
        if self.strategy == StrategyKind::Grid && self.grid_steps < 2 {
            return Err(validation_error!("grid_steps must be at least 2"));
        }
        self.supported_metric()?;
        Ok(())
    }

    fn supported_metric(&self) -> ApResult<SupportedMetric> {
        let metric = match &self.metric {
            Some(name) => SupportedMetric::from_name(name)
                .ok_or_else(|| config_error!("unknown metric {name}"))?,
            None => SupportedMetric::default_for(self.task),
        };
        if !metric.applies_to(self.task) {
            return Err(config_error!(
                "metric {} does not apply to {}",
                metric.name(),
                self.task
            ));
        }
        Ok(metric)
    }

    pub fn metric_descriptor(&self) -> ApResult<MetricDescriptor> {
        Ok(self.supported_metric()?.descriptor())
    }

    pub fn roles(&self) -> DataRoles {
        let roles = DataRoles::default()
            .with_label(self.label_column.clone())
            .with_features(self.features_column.clone());
        match &self.weight_column {
            Some(weight) => roles.with_weight(weight.clone()),
            None => roles,
        }
    }

    pub fn budget(&self) -> Option<Budget> {
        Budget::from_limits(self.max_iterations, self.max_duration_ms)
    }

    pub fn build_terminator(&self) -> ApResult<Box<dyn Terminator>> {
        let budget = self
            .budget()
            .ok_or_else(|| validation_error!("search has no budget"))?;
        Ok(Box::new(IterationTerminator::new(budget)))
    }

    pub fn build_optimizer(&self) -> Box<dyn PipelineOptimizer> {
        match self.strategy {
            StrategyKind::Defaults => Box::new(DefaultsOptimizer::new()),
            StrategyKind::Grid => Box::new(GridOptimizer::new(self.grid_steps)),
            StrategyKind::Random => Box::new(RandomOptimizer::new(self.seed)),
            StrategyKind::Exploit => {
                Box::new(ExploitOptimizer::new(self.seed, self.exploration_weight))
            }
        }
    }
}

/// Everything a finished experiment produced.
#[derive(Debug)]
pub struct ExperimentResult {
    /// Successful candidates, best first.
    pub ranked: Vec<PipelineCandidate>,
    pub iterations: Vec<IterationResult>,
    pub failures: Vec<IterationFailure>,
    /// The best pipeline retrained on all training rows.
    pub best_model: Option<PipelineModel>,
    pub status: SearchStatus,
}

impl ExperimentResult {
    pub fn best(&self) -> Option<&PipelineCandidate> {
        self.ranked.first()
    }

    pub fn records(&self) -> Vec<CandidateRecord> {
        self.ranked.iter().map(|c| c.record()).collect()
    }
}

/// Runs a complete search from a [`SearchConfig`].
pub struct AutoMlExperiment {
    config: SearchConfig,
    observers: Vec<Arc<dyn IterationObserver>>,
}

impl fmt::Debug for AutoMlExperiment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AutoMlExperiment")
            .field("config", &self.config)
            .field("observers", &self.observers.len())
            .finish()
    }
}

impl AutoMlExperiment {
    pub fn new(config: SearchConfig) -> Self {
        Self {
            config,
            observers: Vec::new(),
        }
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    pub fn add_observer(mut self, observer: Arc<dyn IterationObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Search for the best pipeline on `train`, scoring candidates on
    /// `valid`, then retrain the winner on all of `train`.
    pub fn fit(
        &self,
        context: ExecutionContext,
        train: DataHandle,
        valid: DataHandle,
    ) -> ApResult<ExperimentResult> {
        self.config.validate()?;
        if context.task != self.config.task {
            return Err(config_error!(
                "context is built for {} but the config asks for {}",
                context.task,
                self.config.task
            ));
        }
        let metric = self.config.metric_descriptor()?;
        let training_rows = self
            .config
            .training_rows
            .or_else(|| train.row_count())
            .unwrap_or(DEFAULT_TRAINING_ROWS);

        info!(
            "Experiment {}: {} search on {} optimizing {}",
            self.config.name, self.config.strategy, self.config.task, metric.name
        );

        let mut state = SearchState::new(
            context,
            train,
            valid,
            metric,
            self.config.build_optimizer(),
            self.config.build_terminator()?,
        )
        .with_seed(self.config.seed)
        .with_parallelism(self.config.parallelism)
        .with_requested_learners(self.config.requested_learners.clone());

        let recorder = Arc::new(IterationResultRecorder::new());
        state.subscribe(recorder.clone());
        for observer in &self.observers {
            state.subscribe(observer.clone());
        }

        let ranked = state.infer_pipelines(
            self.config.transform_levels,
            self.config.batch_size,
            training_rows,
        )?;

        let best_model = match ranked.first() {
            Some(best) => match best.train_transformer(state.train_data(), state.context()) {
                Ok(model) => Some(model),
                Err(e) => {
                    warn!("Retraining best pipeline on full data failed: {e}");
                    None
                }
            },
            None => {
                warn!("Experiment {} found no successful pipeline", self.config.name);
                None
            }
        };

        Ok(ExperimentResult {
            ranked,
            iterations: recorder.results(),
            failures: recorder.failures(),
            best_model,
            status: state.status(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = SearchConfig::default();
        config.validate().unwrap();
        assert_eq!(config.metric_descriptor().unwrap().name, "RSquared");
    }

    #[test]
    fn json_fills_missing_fields() {
        let config = SearchConfig::from_json_str(
            r#"{"task": "BinaryClassification", "strategy": "grid", "max_iterations": 7}"#,
        )
        .unwrap();
        assert_eq!(config.strategy, StrategyKind::Grid);
        assert_eq!(config.max_iterations, Some(7));
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.metric_descriptor().unwrap().name, "Auc");
    }

    #[test]
    fn metric_must_fit_task() {
        let config = SearchConfig::new("x", TaskKind::Regression).with_metric(SupportedMetric::Auc);
        assert!(config.validate().unwrap_err().is_configuration());

        let mut unknown = SearchConfig::default();
        unknown.metric = Some("F1".into());
        assert!(unknown.validate().is_err());
    }

    #[test]
    fn budget_is_required() {
        let mut config = SearchConfig::default();
        config.max_iterations = None;
        assert!(config.validate().is_err());
        assert!(config.with_max_duration_ms(100).validate().is_ok());
    }

    #[test]
    fn roles_follow_column_names() {
        let mut config = SearchConfig::default().with_label_column("y");
        config.weight_column = Some("w".into());
        let roles = config.roles();
        assert_eq!(roles.label, "y");
        assert_eq!(roles.weight.as_deref(), Some("w"));
        assert_eq!(roles.features, FEATURES_COLUMN);
    }

    #[test]
    fn strategy_builds_matching_optimizer() {
        for (kind, name) in [
            (StrategyKind::Defaults, "defaults"),
            (StrategyKind::Grid, "grid"),
            (StrategyKind::Random, "random"),
            (StrategyKind::Exploit, "exploit"),
        ] {
            let config = SearchConfig::default().with_strategy(kind);
            assert_eq!(config.build_optimizer().name(), name);
            assert_eq!(kind.to_string(), name);
        }
    }
}
