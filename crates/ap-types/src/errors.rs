use thiserror::Error;

/// Main error type for the AutoPipe system
#[derive(Error, Debug)]
pub enum ApError {
    #[error("Data error: {0}")]
    Data(#[from] DataError),

    #[error("Candidate error: {0}")]
    Candidate(#[from] CandidateError),

    #[error("Search error: {0}")]
    Search(#[from] SearchError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl ApError {
    /// Errors that mean the search cannot proceed at all. These propagate to
    /// the caller instead of being isolated to a single candidate. Optimizer
    /// failures end a run early but are not configuration errors.
    pub fn is_configuration(&self) -> bool {
        match self {
            ApError::Config(_) | ApError::Validation(_) => true,
            ApError::Search(err) => !matches!(err, SearchError::Optimizer { .. }),
            _ => false,
        }
    }
}

/// Tabular data errors
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Column not found: {name}")]
    ColumnNotFound { name: String },

    #[error("Column {column} has type {actual}, expected {expected}")]
    TypeMismatch {
        column: String,
        expected: String,
        actual: String,
    },

    #[error("Row has {actual} values but schema has {expected} columns")]
    RowLength { expected: usize, actual: usize },

    #[error("Invalid value in column {column}: {message}")]
    InvalidValue { column: String, message: String },

    #[error("Loading failed: {message}")]
    LoadingFailed { message: String },
}

/// Failures local to one pipeline candidate
#[derive(Error, Debug)]
pub enum CandidateError {
    #[error("Training learner {learner} failed: {message}")]
    TrainingFailed { learner: String, message: String },

    #[error("Evaluation failed: {message}")]
    EvaluationFailed { message: String },

    #[error("Metric {metric} not reported by evaluator")]
    MetricMissing { metric: String },

    #[error("Metric {metric} is not finite: {value}")]
    NonFiniteMetric { metric: String, value: f64 },

    #[error("Candidate panicked: {message}")]
    Panicked { message: String },
}

/// Search-level errors
#[derive(Error, Debug)]
pub enum SearchError {
    #[error("Search space has not been defined")]
    SpaceNotDefined,

    #[error("No admissible learners for task {task}")]
    NoLearners { task: String },

    #[error("Requested learners are not available for task {task}: {names:?}")]
    UnknownLearners { task: String, names: Vec<String> },

    #[error("Metric {metric} is not supported for task {task}")]
    UnsupportedMetric { metric: String, task: String },

    #[error("Hyperparameter {name} rejected: {message}")]
    InvalidHyperparameter { name: String, message: String },

    #[error("Optimizer {optimizer} failed: {message}")]
    Optimizer { optimizer: String, message: String },
}

/// Result type alias for AutoPipe operations
pub type ApResult<T> = Result<T, ApError>;

/// Macro for creating validation errors
#[macro_export]
macro_rules! validation_error {
    ($($arg:tt)*) => {
        $crate::ApError::Validation(format!($($arg)*))
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::ApError::Internal(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::ApError::Config(format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = CandidateError::NonFiniteMetric {
            metric: "RSquared".to_string(),
            value: f64::NAN,
        };

        assert!(error.to_string().contains("RSquared"));
        assert!(error.to_string().contains("NaN"));
    }

    #[test]
    fn test_error_conversion() {
        let data_error = DataError::ColumnNotFound {
            name: "Label".to_string(),
        };
        let ap_error: ApError = data_error.into();

        match ap_error {
            ApError::Data(_) => (),
            _ => panic!("Expected Data error"),
        }
    }

    #[test]
    fn test_configuration_classification() {
        assert!(config_error!("bad batch size {}", 0).is_configuration());
        assert!(ApError::from(SearchError::SpaceNotDefined).is_configuration());
        assert!(!ApError::from(SearchError::Optimizer {
            optimizer: "Random".into(),
            message: "proposal failed".into()
        })
        .is_configuration());
        assert!(!ApError::from(CandidateError::Panicked {
            message: "boom".into()
        })
        .is_configuration());
    }

    #[test]
    fn test_macros() {
        let _validation_err = validation_error!("Invalid value: {}", 42);
        let _internal_err = internal_error!("Something went wrong");
        let _config_err = config_error!("Missing required field: {}", "metric");
    }
}
