// Standard metrics for scored data.
// Undefined metrics (e.g. AUC on a single-class test set) are reported as NaN
// and left to the caller to reject.

use ap_types::{
    ApResult, CandidateError, MetricEvaluator, MetricReport, RoleMappedData, SupportedMetric,
    TaskKind, PREDICTED_LABEL_COLUMN, PROBABILITY_COLUMN, SCORE_COLUMN,
};

const PROBABILITY_EPSILON: f64 = 1e-15;

#[derive(Debug, Clone, Default)]
pub struct StandardEvaluator;

impl StandardEvaluator {
    pub fn new() -> Self {
        Self
    }
}

impl MetricEvaluator for StandardEvaluator {
    fn evaluate(&self, scored: &RoleMappedData, task: TaskKind) -> ApResult<MetricReport> {
        let labels = scored.labels()?;
        if labels.is_empty() {
            return Err(CandidateError::EvaluationFailed {
                message: "no rows to evaluate".to_string(),
            }
            .into());
        }
        let report = match task {
            TaskKind::Regression => regression(&labels, &scored.scalar_column(SCORE_COLUMN)?),
            TaskKind::BinaryClassification => binary(
                &labels,
                &scored.scalar_column(PROBABILITY_COLUMN)?,
                &scored.scalar_column(PREDICTED_LABEL_COLUMN)?,
            ),
            TaskKind::MulticlassClassification => multiclass(
                &labels,
                &scored.vector_column(SCORE_COLUMN)?,
                &scored.scalar_column(PREDICTED_LABEL_COLUMN)?,
            )?,
        };
        Ok(report)
    }

    fn supports(&self, metric: &str, task: TaskKind) -> bool {
        SupportedMetric::from_name(metric).is_some_and(|m| m.applies_to(task))
    }
}

fn report(entries: &[(SupportedMetric, f64)]) -> MetricReport {
    entries
        .iter()
        .map(|(metric, value)| (metric.name().to_string(), *value))
        .collect()
}

fn regression(labels: &[f64], scores: &[f64]) -> MetricReport {
    let n = labels.len() as f64;
    let mean = labels.iter().sum::<f64>() / n;
    let mut ss_res = 0.0;
    let mut ss_tot = 0.0;
    let mut abs = 0.0;
    for (y, p) in labels.iter().zip(scores) {
        ss_res += (y - p).powi(2);
        ss_tot += (y - mean).powi(2);
        abs += (y - p).abs();
    }
    report(&[
        (SupportedMetric::RSquared, 1.0 - ss_res / ss_tot),
        (SupportedMetric::Rmse, (ss_res / n).sqrt()),
        (SupportedMetric::Mae, abs / n),
    ])
}

fn accuracy(labels: &[f64], predicted: &[f64]) -> f64 {
    let correct = labels
        .iter()
        .zip(predicted)
        .filter(|(y, p)| (*y - *p).abs() < 0.5)
        .count();
    correct as f64 / labels.len() as f64
}

fn clamp_probability(p: f64) -> f64 {
    p.clamp(PROBABILITY_EPSILON, 1.0 - PROBABILITY_EPSILON)
}

/// Area under the ROC curve from the rank-sum statistic; ties share ranks.
fn auc(positive: &[bool], probabilities: &[f64]) -> f64 {
    let mut order: Vec<usize> = (0..probabilities.len()).collect();
    order.sort_by(|a, b| probabilities[*a].total_cmp(&probabilities[*b]));

    let mut rank_sum = 0.0;
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && probabilities[order[j + 1]] == probabilities[order[i]] {
            j += 1;
        }
        let shared_rank = (i + j) as f64 / 2.0 + 1.0;
        for &idx in &order[i..=j] {
            if positive[idx] {
                rank_sum += shared_rank;
            }
        }
        i = j + 1;
    }

    let n_pos = positive.iter().filter(|p| **p).count() as f64;
    let n_neg = positive.len() as f64 - n_pos;
    if n_pos == 0.0 || n_neg == 0.0 {
        return f64::NAN;
    }
    (rank_sum - n_pos * (n_pos + 1.0) / 2.0) / (n_pos * n_neg)
}

fn binary(labels: &[f64], probabilities: &[f64], predicted: &[f64]) -> MetricReport {
    let positive: Vec<bool> = labels.iter().map(|y| *y > 0.5).collect();
    let truth: Vec<f64> = positive.iter().map(|p| if *p { 1.0 } else { 0.0 }).collect();
    let log_loss = positive
        .iter()
        .zip(probabilities)
        .map(|(pos, p)| {
            let p = clamp_probability(*p);
            if *pos {
                -p.ln()
            } else {
                -(1.0 - p).ln()
            }
        })
        .sum::<f64>()
        / labels.len() as f64;
    report(&[
        (SupportedMetric::Accuracy, accuracy(&truth, predicted)),
        (SupportedMetric::Auc, auc(&positive, probabilities)),
        (SupportedMetric::LogLoss, log_loss),
    ])
}

/// Map raw labels onto class indices covered by the score vectors.
fn class_indices(labels: &[f64], classes: usize) -> ApResult<Vec<usize>> {
    labels
        .iter()
        .map(|y| {
            if !y.is_finite() || *y < 0.0 || y.fract() != 0.0 || *y >= classes as f64 {
                return Err(CandidateError::EvaluationFailed {
                    message: format!("label {y} is not a class index below {classes}"),
                }
                .into());
            }
            Ok(*y as usize)
        })
        .collect()
}

fn multiclass(
    labels: &[f64],
    scores: &[Vec<f64>],
    predicted: &[f64],
) -> ApResult<MetricReport> {
    let classes = scores.iter().map(Vec::len).max().unwrap_or(0);
    let indices = class_indices(labels, classes)?;
    let mut seen = vec![0usize; classes];
    let mut hits = vec![0usize; classes];
    let mut log_loss = 0.0;
    for ((&class, p), score) in indices.iter().zip(predicted).zip(scores) {
        seen[class] += 1;
        if (class as f64 - p).abs() < 0.5 {
            hits[class] += 1;
        }
        let prob = score.get(class).copied().unwrap_or(0.0);
        log_loss -= clamp_probability(prob).ln();
    }
    let recalls: Vec<f64> = seen
        .iter()
        .zip(&hits)
        .filter(|(s, _)| **s > 0)
        .map(|(s, h)| *h as f64 / *s as f64)
        .collect();
    let macro_accuracy = recalls.iter().sum::<f64>() / recalls.len() as f64;
    Ok(report(&[
        (SupportedMetric::Accuracy, accuracy(labels, predicted)),
        (SupportedMetric::MacroAccuracy, macro_accuracy),
        (SupportedMetric::LogLoss, log_loss / labels.len() as f64),
    ]))
}
