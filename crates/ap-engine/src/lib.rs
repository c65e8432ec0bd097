// AutoPipe reference engine
// In-memory transforms, learners and metrics the search drives end to end

pub mod evaluator;
pub mod inference;
pub mod learners;
pub mod transforms;

use std::sync::Arc;

use ap_types::{DataRoles, ExecutionContext, LearnerBuilder, TaskKind};
use tracing::info;

pub use evaluator::StandardEvaluator;
pub use inference::ExpertTransformInference;
pub use learners::{LogisticRegression, MeanRegressor, NearestCentroid, SgdRegressor};
pub use transforms::{ColumnConcat, MeanImputer, MinMaxNormalizer, OneHotEncoder};

/// Every bundled learner; the search filters them by task.
pub fn standard_learners() -> Vec<Arc<dyn LearnerBuilder>> {
    vec![
        Arc::new(MeanRegressor),
        Arc::new(SgdRegressor::default()),
        Arc::new(LogisticRegression),
        Arc::new(NearestCentroid),
    ]
}

/// Execution context wired with the bundled evaluator, normalizer, learners
/// and transform inference.
pub fn standard_context(task: TaskKind, roles: DataRoles) -> ExecutionContext {
    info!("Building standard execution context for {task}");
    ExecutionContext::new(task, Arc::new(StandardEvaluator::new()))
        .with_normalizer(Arc::new(MinMaxNormalizer::new(roles.features.clone())))
        .with_learners(standard_learners())
        .with_transform_inference(Arc::new(ExpertTransformInference::default()))
        .with_roles(roles)
}
