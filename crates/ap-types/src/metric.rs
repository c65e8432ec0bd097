//! Task kinds, the optimized metric and the evaluator contract.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use crate::data::RoleMappedData;
use crate::errors::ApResult;

/// Supervised learning task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskKind {
    Regression,
    BinaryClassification,
    MulticlassClassification,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Regression => write!(f, "regression"),
            TaskKind::BinaryClassification => write!(f, "binary-classification"),
            TaskKind::MulticlassClassification => write!(f, "multiclass-classification"),
        }
    }
}

/// Whether we are maximizing or minimizing the objective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectiveDirection {
    Maximize,
    Minimize,
}

impl Default for ObjectiveDirection {
    fn default() -> Self {
        Self::Maximize
    }
}

impl ObjectiveDirection {
    /// Order two metric values best-first.
    pub fn rank(&self, a: f64, b: f64) -> Ordering {
        let natural = a.partial_cmp(&b).unwrap_or(Ordering::Equal);
        match self {
            ObjectiveDirection::Maximize => natural.reverse(),
            ObjectiveDirection::Minimize => natural,
        }
    }

    /// True if `candidate` strictly improves on `incumbent`.
    pub fn improves(&self, candidate: f64, incumbent: f64) -> bool {
        match self {
            ObjectiveDirection::Maximize => candidate > incumbent,
            ObjectiveDirection::Minimize => candidate < incumbent,
        }
    }
}

/// The scalar metric being optimized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricDescriptor {
    pub name: String,
    pub is_maximizing: bool,
}

impl MetricDescriptor {
    pub fn new(name: impl Into<String>, is_maximizing: bool) -> Self {
        Self {
            name: name.into(),
            is_maximizing,
        }
    }

    pub fn direction(&self) -> ObjectiveDirection {
        if self.is_maximizing {
            ObjectiveDirection::Maximize
        } else {
            ObjectiveDirection::Minimize
        }
    }
}

/// Metrics understood by the bundled evaluators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SupportedMetric {
    RSquared,
    Rmse,
    Mae,
    Accuracy,
    MacroAccuracy,
    Auc,
    LogLoss,
}

impl SupportedMetric {
    pub const ALL: [SupportedMetric; 7] = [
        SupportedMetric::RSquared,
        SupportedMetric::Rmse,
        SupportedMetric::Mae,
        SupportedMetric::Accuracy,
        SupportedMetric::MacroAccuracy,
        SupportedMetric::Auc,
        SupportedMetric::LogLoss,
    ];

    /// Look a metric up by its report name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.name() == name)
    }

    pub fn name(&self) -> &'static str {
        match self {
            SupportedMetric::RSquared => "RSquared",
            SupportedMetric::Rmse => "Rmse",
            SupportedMetric::Mae => "Mae",
            SupportedMetric::Accuracy => "Accuracy",
            SupportedMetric::MacroAccuracy => "MacroAccuracy",
            SupportedMetric::Auc => "Auc",
            SupportedMetric::LogLoss => "LogLoss",
        }
    }

    pub fn is_maximizing(&self) -> bool {
        !matches!(
            self,
            SupportedMetric::Rmse | SupportedMetric::Mae | SupportedMetric::LogLoss
        )
    }

    pub fn descriptor(&self) -> MetricDescriptor {
        MetricDescriptor::new(self.name(), self.is_maximizing())
    }

    /// Whether the metric is defined for `task`.
    pub fn applies_to(&self, task: TaskKind) -> bool {
        match self {
            SupportedMetric::RSquared | SupportedMetric::Rmse | SupportedMetric::Mae => {
                task == TaskKind::Regression
            }
            SupportedMetric::Auc => task == TaskKind::BinaryClassification,
            SupportedMetric::MacroAccuracy => task == TaskKind::MulticlassClassification,
            SupportedMetric::Accuracy | SupportedMetric::LogLoss => {
                task != TaskKind::Regression
            }
        }
    }

    /// Default metric per task.
    pub fn default_for(task: TaskKind) -> Self {
        match task {
            TaskKind::Regression => SupportedMetric::RSquared,
            TaskKind::BinaryClassification => SupportedMetric::Auc,
            TaskKind::MulticlassClassification => SupportedMetric::Accuracy,
        }
    }
}

/// Named scalar metrics computed on one scored dataset.
pub type MetricReport = BTreeMap<String, f64>;

/// Computes named metrics from scored, role-mapped data.
pub trait MetricEvaluator: Send + Sync + fmt::Debug {
    fn evaluate(&self, scored: &RoleMappedData, task: TaskKind) -> ApResult<MetricReport>;

    /// Whether `metric` will be present in reports for `task`.
    fn supports(&self, metric: &str, task: TaskKind) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_ranks_best_first() {
        assert_eq!(ObjectiveDirection::Maximize.rank(0.9, 0.1), Ordering::Less);
        assert_eq!(ObjectiveDirection::Minimize.rank(0.9, 0.1), Ordering::Greater);
        assert!(ObjectiveDirection::Minimize.improves(0.05, 0.15));
        assert!(!ObjectiveDirection::Maximize.improves(1.0, 2.0));
    }

    #[test]
    fn supported_metric_descriptors() {
        let r2 = SupportedMetric::RSquared.descriptor();
        assert_eq!(r2.name, "RSquared");
        assert!(r2.is_maximizing);
        assert_eq!(
            SupportedMetric::LogLoss.descriptor().direction(),
            ObjectiveDirection::Minimize
        );
    }

    #[test]
    fn metric_task_applicability() {
        assert!(SupportedMetric::RSquared.applies_to(TaskKind::Regression));
        assert!(!SupportedMetric::Auc.applies_to(TaskKind::MulticlassClassification));
        assert!(SupportedMetric::Accuracy.applies_to(TaskKind::BinaryClassification));
        assert!(!SupportedMetric::Accuracy.applies_to(TaskKind::Regression));
    }

    #[test]
    fn metric_lookup_by_name() {
        assert_eq!(SupportedMetric::from_name("Auc"), Some(SupportedMetric::Auc));
        assert_eq!(SupportedMetric::from_name("F1"), None);
        for metric in SupportedMetric::ALL {
            assert_eq!(SupportedMetric::from_name(metric.name()), Some(metric));
        }
    }
}
