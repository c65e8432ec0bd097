//! Pipeline candidates: one concrete transforms + learner + hyperparameters
//! combination, and the train/evaluate logic behind it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use ap_types::{
    ApResult, CandidateError, DataHandle, DataRoles, EstimatorChain, ExecutionContext,
    FittedTransformer, LearnerSpec, MetricDescriptor, MetricReport, ParameterSet, Predictor,
    RoleMappedData, TransformSpec, TransformerChain,
};
use tracing::debug;

/// Outcome of a successful train/test run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub metric_value: f64,
    pub rows_used: usize,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone)]
pub struct PipelineCandidate {
    pub id: Uuid,
    /// Applied in order; later transforms may read columns earlier ones wrote.
    pub transforms: Vec<TransformSpec>,
    pub learner: LearnerSpec,
    pub summary: Option<RunSummary>,
    pub failure: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl PipelineCandidate {
    /// Build a candidate from templates. Transform specs and the learner's
    /// hyperparameters are copied, so later edits to either side stay local.
    pub fn new(transforms: &[TransformSpec], learner: &LearnerSpec) -> Self {
        Self {
            id: Uuid::new_v4(),
            transforms: transforms.to_vec(),
            learner: learner.clone(),
            summary: None,
            failure: None,
            created_at: Utc::now(),
        }
    }

    pub fn is_evaluated(&self) -> bool {
        self.summary.is_some()
    }

    pub fn metric_value(&self) -> Option<f64> {
        self.summary.map(|s| s.metric_value)
    }

    /// Stable description of the configuration, identical for candidates
    /// that would train the same pipeline.
    pub fn signature(&self) -> String {
        let transforms: Vec<&str> = self.transforms.iter().map(|t| t.id.as_str()).collect();
        let params: Vec<String> = self
            .learner
            .hyperparameters
            .resolved()
            .iter()
            .map(|(name, value)| format!("{name}:{value}"))
            .collect();
        format!(
            "[{}] {}{{{}}}",
            transforms.join(" > "),
            self.learner.name,
            params.join(", ")
        )
    }

    /// Fit the transform chain and the learner on `train`.
    ///
    /// Learners that ask for normalized features get the context's normalizer
    /// appended after the candidate's own transforms.
    pub fn train_transformer(
        &self,
        train: &DataHandle,
        context: &ExecutionContext,
    ) -> ApResult<PipelineModel> {
        let mut chain = EstimatorChain::new();
        for spec in &self.transforms {
            if let Some(estimator) = &spec.estimator {
                chain = chain.append(estimator.clone());
            }
        }
        if self.learner.builder.needs_normalization() {
            if let Some(normalizer) = &context.normalizer {
                chain = chain.append(normalizer.clone());
            }
        }

        let transforms = chain.fit(train)?;
        let transformed = transforms.transform(train)?;
        let trainer = self.learner.build_trainer()?;
        let training = RoleMappedData::new(transformed, context.roles.clone());
        let predictor = trainer.train(&training)?;
        debug!(
            "Trained {} behind {} transform stages",
            self.learner.name,
            transforms.len()
        );

        Ok(PipelineModel {
            transforms,
            predictor,
            roles: context.roles.clone(),
        })
    }

    /// Train on `train`, score `test` and report every metric the evaluator
    /// computes.
    pub fn evaluate(
        &self,
        train: &DataHandle,
        test: &DataHandle,
        context: &ExecutionContext,
    ) -> ApResult<MetricReport> {
        let model = self.train_transformer(train, context)?;
        let scored = model.transform(test)?;
        context
            .evaluator
            .evaluate(&RoleMappedData::new(scored, context.roles.clone()), context.task)
    }

    /// Train, score and return the value of `metric`. A missing or non-finite
    /// value is an error.
    pub fn run_train_test_experiment(
        &self,
        train: &DataHandle,
        test: &DataHandle,
        metric: &MetricDescriptor,
        context: &ExecutionContext,
    ) -> ApResult<f64> {
        let report = self.evaluate(train, test, context)?;
        let value = *report
            .get(&metric.name)
            .ok_or_else(|| CandidateError::MetricMissing {
                metric: metric.name.clone(),
            })?;
        if !value.is_finite() {
            return Err(CandidateError::NonFiniteMetric {
                metric: metric.name.clone(),
                value,
            }
            .into());
        }
        Ok(value)
    }

    pub fn record(&self) -> CandidateRecord {
        CandidateRecord {
            id: self.id,
            signature: self.signature(),
            learner: self.learner.name.clone(),
            hyperparameters: self.learner.hyperparameters.resolved(),
            transforms: self.transforms.iter().map(|t| t.id.clone()).collect(),
            summary: self.summary,
            failure: self.failure.clone(),
            created_at: self.created_at,
        }
    }
}

impl fmt::Display for PipelineCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for transform in &self.transforms {
            write!(f, "{transform} > ")?;
        }
        write!(f, "{}", self.learner)
    }
}

/// Fitted pipeline: replays the transform chain, then scores.
#[derive(Debug, Clone)]
pub struct PipelineModel {
    transforms: TransformerChain,
    predictor: Arc<dyn Predictor>,
    roles: DataRoles,
}

impl PipelineModel {
    pub fn stage_count(&self) -> usize {
        self.transforms.len()
    }
}

impl FittedTransformer for PipelineModel {
    fn transform(&self, data: &DataHandle) -> ApResult<DataHandle> {
        let transformed = self.transforms.transform(data)?;
        self.predictor
            .score(&RoleMappedData::new(transformed, self.roles.clone()))
    }
}

/// Serializable snapshot of a candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub id: Uuid,
    pub signature: String,
    pub learner: String,
    pub hyperparameters: ParameterSet,
    pub transforms: Vec<String>,
    pub summary: Option<RunSummary>,
    pub failure: Option<String>,
    pub created_at: DateTime<Utc>,
}
