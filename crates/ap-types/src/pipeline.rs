//! Estimator/transformer contracts and the transform and learner templates
//! the search draws candidates from.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::data::{DataHandle, DataRoles, RoleMappedData, Schema};
use crate::errors::ApResult;
use crate::hyperparams::{Hyperparameters, ParameterSet};
use crate::metric::{MetricEvaluator, TaskKind};

// ---------------------------------------------------------------------------
// Estimators and transformers
// ---------------------------------------------------------------------------

/// Something that can be fitted to data, producing a transformer.
pub trait Estimator: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn fit(&self, data: &DataHandle) -> ApResult<Arc<dyn FittedTransformer>>;
}

/// A fitted, reusable data mapping.
pub trait FittedTransformer: Send + Sync + fmt::Debug {
    fn transform(&self, data: &DataHandle) -> ApResult<DataHandle>;
}

/// Sequential composition of estimators.
#[derive(Debug, Clone, Default)]
pub struct EstimatorChain {
    stages: Vec<Arc<dyn Estimator>>,
}

impl EstimatorChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(mut self, estimator: Arc<dyn Estimator>) -> Self {
        self.stages.push(estimator);
        self
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Fit stages in order; each stage is fitted on the output of the
    /// previous fitted stages.
    pub fn fit(&self, data: &DataHandle) -> ApResult<TransformerChain> {
        let mut fitted = TransformerChain::default();
        let mut current = data.clone();
        for stage in &self.stages {
            let transformer = stage.fit(&current)?;
            current = transformer.transform(&current)?;
            fitted.stages.push(transformer);
        }
        Ok(fitted)
    }
}

/// Sequential composition of fitted transformers.
#[derive(Debug, Clone, Default)]
pub struct TransformerChain {
    stages: Vec<Arc<dyn FittedTransformer>>,
}

impl TransformerChain {
    pub fn append(&mut self, transformer: Arc<dyn FittedTransformer>) {
        self.stages.push(transformer);
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl FittedTransformer for TransformerChain {
    fn transform(&self, data: &DataHandle) -> ApResult<DataHandle> {
        let mut current = data.clone();
        for stage in &self.stages {
            current = stage.transform(&current)?;
        }
        Ok(current)
    }
}

// ---------------------------------------------------------------------------
// Learners
// ---------------------------------------------------------------------------

/// A trained model that appends score columns to role-mapped data.
pub trait Predictor: Send + Sync + fmt::Debug {
    fn score(&self, data: &RoleMappedData) -> ApResult<DataHandle>;
}

/// A configured, trainable learner.
pub trait Trainer: Send + Sync + fmt::Debug {
    fn train(&self, data: &RoleMappedData) -> ApResult<Arc<dyn Predictor>>;
}

/// Factory for one learning algorithm.
pub trait LearnerBuilder: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn supports(&self, task: TaskKind) -> bool;

    /// Declared hyperparameters with their defaults.
    fn hyperparameters(&self) -> Hyperparameters;

    /// Whether features must be normalized before this learner sees them.
    fn needs_normalization(&self) -> bool {
        false
    }

    fn build(&self, params: &ParameterSet) -> ApResult<Box<dyn Trainer>>;
}

/// Learner template: a builder plus the hyperparameter values to build with.
#[derive(Debug, Clone)]
pub struct LearnerSpec {
    pub name: String,
    pub builder: Arc<dyn LearnerBuilder>,
    pub hyperparameters: Hyperparameters,
}

impl LearnerSpec {
    /// Template with the builder's default hyperparameters.
    pub fn from_builder(builder: Arc<dyn LearnerBuilder>) -> Self {
        Self {
            name: builder.name().to_string(),
            hyperparameters: builder.hyperparameters(),
            builder,
        }
    }

    pub fn build_trainer(&self) -> ApResult<Box<dyn Trainer>> {
        self.builder.build(&self.hyperparameters.resolved())
    }
}

impl fmt::Display for LearnerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.name, self.hyperparameters)
    }
}

// ---------------------------------------------------------------------------
// Transforms
// ---------------------------------------------------------------------------

/// A column a transform writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducedColumn {
    pub name: String,
    pub is_numeric: bool,
}

/// Where a transform sits in the level structure and what it outputs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingInfo {
    /// Level the transform was introduced at (1-based).
    pub level: usize,
    /// Transforms sharing an atomic group are included or excluded together.
    pub atomic_group_id: u32,
    pub columns_produced: Vec<ProducedColumn>,
}

/// Transform template.
#[derive(Debug, Clone)]
pub struct TransformSpec {
    /// Stable identifier, e.g. `"MeanImputer(Age)"`.
    pub id: String,
    pub estimator: Option<Arc<dyn Estimator>>,
    pub routing: RoutingInfo,
}

impl TransformSpec {
    pub fn new(id: impl Into<String>, estimator: Arc<dyn Estimator>, routing: RoutingInfo) -> Self {
        Self {
            id: id.into(),
            estimator: Some(estimator),
            routing,
        }
    }

    pub fn produces(&self, column: &str, is_numeric: bool) -> bool {
        self.routing
            .columns_produced
            .iter()
            .any(|c| c.name == column && c.is_numeric == is_numeric)
    }
}

/// Identity is the id plus the level it was introduced at.
impl PartialEq for TransformSpec {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.routing.level == other.routing.level
    }
}

impl fmt::Display for TransformSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// Arguments for one level of transform inference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferenceArgs {
    pub level: usize,
    pub atomic_id_offset: u32,
    /// Leave the features concatenation to the final step.
    pub exclude_features_concat: bool,
}

/// Suggests feature transforms for a dataset.
pub trait TransformInference: Send + Sync + fmt::Debug {
    /// Transforms applicable at one level of the pipeline.
    fn infer(
        &self,
        data: &DataHandle,
        args: &InferenceArgs,
        roles: &DataRoles,
    ) -> ApResult<Vec<TransformSpec>>;

    /// A final step concatenating `columns` into the features column, or
    /// `None` when there is nothing for it to do.
    fn features_concat(
        &self,
        schema: &Schema,
        columns: &[String],
        routing: RoutingInfo,
        roles: &DataRoles,
    ) -> ApResult<Option<TransformSpec>>;
}

// ---------------------------------------------------------------------------
// Execution context
// ---------------------------------------------------------------------------

/// The collaborators a search trains and evaluates with.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub task: TaskKind,
    pub roles: DataRoles,
    pub evaluator: Arc<dyn MetricEvaluator>,
    /// Appended before learners that declare they need normalized features.
    pub normalizer: Option<Arc<dyn Estimator>>,
    pub learners: Vec<Arc<dyn LearnerBuilder>>,
    pub transform_inference: Option<Arc<dyn TransformInference>>,
}

impl ExecutionContext {
    pub fn new(task: TaskKind, evaluator: Arc<dyn MetricEvaluator>) -> Self {
        Self {
            task,
            roles: DataRoles::default(),
            evaluator,
            normalizer: None,
            learners: Vec::new(),
            transform_inference: None,
        }
    }

    pub fn with_roles(mut self, roles: DataRoles) -> Self {
        self.roles = roles;
        self
    }

    pub fn with_normalizer(mut self, normalizer: Arc<dyn Estimator>) -> Self {
        self.normalizer = Some(normalizer);
        self
    }

    pub fn with_learner(mut self, learner: Arc<dyn LearnerBuilder>) -> Self {
        self.learners.push(learner);
        self
    }

    pub fn with_learners(mut self, learners: Vec<Arc<dyn LearnerBuilder>>) -> Self {
        self.learners.extend(learners);
        self
    }

    pub fn with_transform_inference(mut self, inference: Arc<dyn TransformInference>) -> Self {
        self.transform_inference = Some(inference);
        self
    }
}
