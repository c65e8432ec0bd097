// Reference learners.
// Options are plain structs; hyperparameters reach them through explicit
// setter bindings so every sweepable value is declared in one place.

use std::sync::Arc;

use ap_types::{
    bind_parameters, ApResult, CandidateError, Column, ColumnKind, DataHandle,
    HyperparameterValue, Hyperparameters, LearnerBuilder, ParamBinding, ParameterSet, Predictor,
    RoleMappedData, SweepableParam, Table, TaskKind, Trainer, Value, PREDICTED_LABEL_COLUMN,
    PROBABILITY_COLUMN, SCORE_COLUMN,
};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::debug;

// ---- Shared helpers ----

/// Features, labels and per-row weights of a training set.
struct TrainingSet {
    features: Vec<Vec<f64>>,
    labels: Vec<f64>,
    weights: Vec<f64>,
}

impl TrainingSet {
    fn load(data: &RoleMappedData, learner: &str, use_features: bool) -> ApResult<Self> {
        let fail = |message: String| CandidateError::TrainingFailed {
            learner: learner.to_string(),
            message,
        };
        let labels = data.labels()?;
        if labels.is_empty() {
            return Err(fail("no training rows".to_string()).into());
        }
        if labels.iter().any(|y| !y.is_finite()) {
            return Err(fail("label column contains missing values".to_string()).into());
        }
        let weights = data
            .weights()?
            .unwrap_or_else(|| vec![1.0; labels.len()]);

        let features = if use_features {
            let features = data.features()?;
            let width = features.first().map(Vec::len).unwrap_or(0);
            if features.iter().any(|row| row.len() != width) {
                return Err(fail("ragged feature vectors".to_string()).into());
            }
            if features.iter().flatten().any(|x| !x.is_finite()) {
                return Err(fail("features contain missing values".to_string()).into());
            }
            features
        } else {
            Vec::new()
        };

        Ok(Self {
            features,
            labels,
            weights,
        })
    }

    fn width(&self) -> usize {
        self.features.first().map(Vec::len).unwrap_or(0)
    }
}

fn dot(w: &[f64], x: &[f64]) -> f64 {
    w.iter().zip(x).map(|(a, b)| a * b).sum()
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

/// Copy of the input with prediction columns appended.
fn with_predictions(
    data: &RoleMappedData,
    columns: Vec<(Column, Vec<Value>)>,
) -> ApResult<DataHandle> {
    let mut table = Table::from_view(data.data.as_ref());
    for (column, values) in columns {
        table.append_column(column, values)?;
    }
    Ok(table.into_handle())
}

fn numbers(values: impl IntoIterator<Item = f64>) -> Vec<Value> {
    values.into_iter().map(Value::Number).collect()
}

fn float_of(value: &HyperparameterValue) -> Result<f64, String> {
    value.as_f64().ok_or_else(|| format!("expected a number, got {value}"))
}

fn long_of(value: &HyperparameterValue) -> Result<i64, String> {
    value.as_i64().ok_or_else(|| format!("expected an integer, got {value}"))
}

fn declared<O>(bindings: &[ParamBinding<O>]) -> Hyperparameters {
    Hyperparameters::new(bindings.iter().map(|b| b.param.clone()).collect())
}

fn non_finite(learner: &str, values: &[f64]) -> Option<CandidateError> {
    values
        .iter()
        .any(|w| !w.is_finite())
        .then(|| CandidateError::TrainingFailed {
            learner: learner.to_string(),
            message: "weights diverged".to_string(),
        })
}

// ---- Mean baseline ----

/// Predicts the weighted mean label for every row.
#[derive(Debug, Clone, Default)]
pub struct MeanRegressor;

#[derive(Debug)]
struct ConstantPredictor {
    value: f64,
}

impl LearnerBuilder for MeanRegressor {
    fn name(&self) -> &str {
        "MeanRegressor"
    }

    fn supports(&self, task: TaskKind) -> bool {
        task == TaskKind::Regression
    }

    fn hyperparameters(&self) -> Hyperparameters {
        Hyperparameters::default()
    }

    fn build(&self, params: &ParameterSet) -> ApResult<Box<dyn Trainer>> {
        bind_parameters::<()>(&mut (), &[], params)?;
        Ok(Box::new(MeanRegressor))
    }
}

impl Trainer for MeanRegressor {
    fn train(&self, data: &RoleMappedData) -> ApResult<Arc<dyn Predictor>> {
        let set = TrainingSet::load(data, "MeanRegressor", false)?;
        let total: f64 = set.weights.iter().sum();
        let value = if total > 0.0 {
            set.labels
                .iter()
                .zip(&set.weights)
                .map(|(y, w)| y * w)
                .sum::<f64>()
                / total
        } else {
            0.0
        };
        Ok(Arc::new(ConstantPredictor { value }))
    }
}

impl Predictor for ConstantPredictor {
    fn score(&self, data: &RoleMappedData) -> ApResult<DataHandle> {
        let rows = Table::from_view(data.data.as_ref()).len();
        with_predictions(
            data,
            vec![(
                Column::new(SCORE_COLUMN, ColumnKind::Numeric),
                numbers(std::iter::repeat(self.value).take(rows)),
            )],
        )
    }
}

// ---- Linear models ----

#[derive(Debug)]
struct LinearPredictor {
    weights: Vec<f64>,
    bias: f64,
    /// Emit probability and predicted label columns.
    logistic: bool,
}

impl Predictor for LinearPredictor {
    fn score(&self, data: &RoleMappedData) -> ApResult<DataHandle> {
        let margins: Vec<f64> = data
            .features()?
            .iter()
            .map(|x| dot(&self.weights, x) + self.bias)
            .collect();
        let mut columns = vec![(
            Column::new(SCORE_COLUMN, ColumnKind::Numeric),
            numbers(margins.iter().copied()),
        )];
        if self.logistic {
            let probabilities: Vec<f64> = margins.iter().map(|m| sigmoid(*m)).collect();
            let predicted = probabilities
                .iter()
                .map(|p| if *p >= 0.5 { 1.0 } else { 0.0 });
            columns.push((
                Column::new(PREDICTED_LABEL_COLUMN, ColumnKind::Numeric),
                numbers(predicted),
            ));
            columns.push((
                Column::new(PROBABILITY_COLUMN, ColumnKind::Numeric),
                numbers(probabilities),
            ));
        }
        with_predictions(data, columns)
    }
}

#[derive(Debug, Clone)]
pub struct SgdOptions {
    pub learning_rate: f64,
    pub epochs: usize,
    pub l2: f64,
}

impl Default for SgdOptions {
    fn default() -> Self {
        Self {
            learning_rate: 0.05,
            epochs: 20,
            l2: 1e-6,
        }
    }
}

fn sgd_bindings() -> Vec<ParamBinding<SgdOptions>> {
    let defaults = SgdOptions::default();
    vec![
        ParamBinding::new(
            SweepableParam::float_log("learning_rate", 1e-4, 1.0, defaults.learning_rate),
            |o: &mut SgdOptions, v| {
                o.learning_rate = float_of(v)?;
                Ok(())
            },
        ),
        ParamBinding::new(
            SweepableParam::long("epochs", 1, 200, defaults.epochs as i64),
            |o: &mut SgdOptions, v| {
                o.epochs = long_of(v)? as usize;
                Ok(())
            },
        ),
        ParamBinding::new(
            SweepableParam::float_log("l2", 1e-8, 1e-1, defaults.l2),
            |o: &mut SgdOptions, v| {
                o.l2 = float_of(v)?;
                Ok(())
            },
        ),
    ]
}

/// Linear regression fitted with shuffled per-row gradient steps.
#[derive(Debug, Clone)]
pub struct SgdRegressor {
    seed: u64,
}

impl Default for SgdRegressor {
    fn default() -> Self {
        Self { seed: 42 }
    }
}

impl SgdRegressor {
    pub fn with_seed(seed: u64) -> Self {
        Self { seed }
    }
}

#[derive(Debug)]
struct SgdTrainer {
    options: SgdOptions,
    seed: u64,
}

impl LearnerBuilder for SgdRegressor {
    fn name(&self) -> &str {
        "SgdRegressor"
    }

    fn supports(&self, task: TaskKind) -> bool {
        task == TaskKind::Regression
    }

    fn hyperparameters(&self) -> Hyperparameters {
        declared(&sgd_bindings())
    }

    fn needs_normalization(&self) -> bool {
        true
    }

    fn build(&self, params: &ParameterSet) -> ApResult<Box<dyn Trainer>> {
        let mut options = SgdOptions::default();
        bind_parameters(&mut options, &sgd_bindings(), params)?;
        Ok(Box::new(SgdTrainer {
            options,
            seed: self.seed,
        }))
    }
}

impl Trainer for SgdTrainer {
    fn train(&self, data: &RoleMappedData) -> ApResult<Arc<dyn Predictor>> {
        let set = TrainingSet::load(data, "SgdRegressor", true)?;
        let SgdOptions {
            learning_rate,
            epochs,
            l2,
        } = self.options;
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        let mut weights = vec![0.0; set.width()];
        let mut bias = 0.0;
        let mut order: Vec<usize> = (0..set.labels.len()).collect();

        for _ in 0..epochs {
            order.shuffle(&mut rng);
            for &i in &order {
                let x = &set.features[i];
                let error = dot(&weights, x) + bias - set.labels[i];
                let step = learning_rate * set.weights[i] * error;
                for (w, xj) in weights.iter_mut().zip(x) {
                    *w -= step * xj + learning_rate * l2 * *w;
                }
                bias -= step;
            }
        }

        let diverged = non_finite("SgdRegressor", &weights)
            .or_else(|| non_finite("SgdRegressor", &[bias]));
        if let Some(err) = diverged {
            return Err(err.into());
        }
        debug!("SgdRegressor trained {} weights over {epochs} epochs", weights.len());
        Ok(Arc::new(LinearPredictor {
            weights,
            bias,
            logistic: false,
        }))
    }
}

#[derive(Debug, Clone)]
pub struct LogisticOptions {
    pub learning_rate: f64,
    pub iterations: usize,
    pub l2: f64,
}

impl Default for LogisticOptions {
    fn default() -> Self {
        Self {
            learning_rate: 0.5,
            iterations: 100,
            l2: 1e-4,
        }
    }
}

fn logistic_bindings() -> Vec<ParamBinding<LogisticOptions>> {
    let defaults = LogisticOptions::default();
    vec![
        ParamBinding::new(
            SweepableParam::float_log("learning_rate", 1e-3, 10.0, defaults.learning_rate),
            |o: &mut LogisticOptions, v| {
                o.learning_rate = float_of(v)?;
                Ok(())
            },
        ),
        ParamBinding::new(
            SweepableParam::long_log("iterations", 10, 1000, defaults.iterations as i64),
            |o: &mut LogisticOptions, v| {
                o.iterations = long_of(v)? as usize;
                Ok(())
            },
        ),
        ParamBinding::new(
            SweepableParam::float_log("l2", 1e-8, 1.0, defaults.l2),
            |o: &mut LogisticOptions, v| {
                o.l2 = float_of(v)?;
                Ok(())
            },
        ),
    ]
}

/// Binary logistic regression with full-batch gradient descent.
#[derive(Debug, Clone, Default)]
pub struct LogisticRegression;

#[derive(Debug)]
struct LogisticTrainer {
    options: LogisticOptions,
}

impl LearnerBuilder for LogisticRegression {
    fn name(&self) -> &str {
        "LogisticRegression"
    }

    fn supports(&self, task: TaskKind) -> bool {
        task == TaskKind::BinaryClassification
    }

    fn hyperparameters(&self) -> Hyperparameters {
        declared(&logistic_bindings())
    }

    fn needs_normalization(&self) -> bool {
        true
    }

    fn build(&self, params: &ParameterSet) -> ApResult<Box<dyn Trainer>> {
        let mut options = LogisticOptions::default();
        bind_parameters(&mut options, &logistic_bindings(), params)?;
        Ok(Box::new(LogisticTrainer { options }))
    }
}

impl Trainer for LogisticTrainer {
    fn train(&self, data: &RoleMappedData) -> ApResult<Arc<dyn Predictor>> {
        let set = TrainingSet::load(data, "LogisticRegression", true)?;
        let LogisticOptions {
            learning_rate,
            iterations,
            l2,
        } = self.options;
        let targets: Vec<f64> = set
            .labels
            .iter()
            .map(|y| if *y > 0.5 { 1.0 } else { 0.0 })
            .collect();
        let total_weight: f64 = set.weights.iter().sum();
        if total_weight <= 0.0 {
            return Err(CandidateError::TrainingFailed {
                learner: "LogisticRegression".to_string(),
                message: "example weights sum to zero".to_string(),
            }
            .into());
        }

        let mut weights = vec![0.0; set.width()];
        let mut bias = 0.0;
        for _ in 0..iterations {
            let mut grad = vec![0.0; weights.len()];
            let mut grad_bias = 0.0;
            for ((x, y), w) in set.features.iter().zip(&targets).zip(&set.weights) {
                let error = (sigmoid(dot(&weights, x) + bias) - y) * w;
                for (g, xj) in grad.iter_mut().zip(x) {
                    *g += error * xj;
                }
                grad_bias += error;
            }
            for (wj, g) in weights.iter_mut().zip(&grad) {
                *wj -= learning_rate * (g / total_weight + l2 * *wj);
            }
            bias -= learning_rate * grad_bias / total_weight;
        }

        if let Some(err) = non_finite("LogisticRegression", &weights) {
            return Err(err.into());
        }
        Ok(Arc::new(LinearPredictor {
            weights,
            bias,
            logistic: true,
        }))
    }
}

// ---- Nearest centroid ----

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Distance {
    Euclidean,
    Manhattan,
}

impl Distance {
    fn between(&self, a: &[f64], b: &[f64]) -> f64 {
        match self {
            Distance::Euclidean => a
                .iter()
                .zip(b)
                .map(|(x, y)| (x - y).powi(2))
                .sum::<f64>()
                .sqrt(),
            Distance::Manhattan => a.iter().zip(b).map(|(x, y)| (x - y).abs()).sum(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CentroidOptions {
    pub distance: Distance,
    /// Pulls every centroid toward the global mean; 0 keeps raw centroids.
    pub shrinkage: f64,
}

impl Default for CentroidOptions {
    fn default() -> Self {
        Self {
            distance: Distance::Euclidean,
            shrinkage: 0.0,
        }
    }
}

fn centroid_bindings() -> Vec<ParamBinding<CentroidOptions>> {
    vec![
        ParamBinding::new(
            SweepableParam::discrete("distance", &["euclidean", "manhattan"], "euclidean"),
            |o: &mut CentroidOptions, v| {
                o.distance = match v.as_str() {
                    Some("euclidean") => Distance::Euclidean,
                    Some("manhattan") => Distance::Manhattan,
                    _ => return Err(format!("unknown distance {v}")),
                };
                Ok(())
            },
        ),
        ParamBinding::new(
            SweepableParam::float("shrinkage", 0.0, 1.0, 0.0),
            |o: &mut CentroidOptions, v| {
                o.shrinkage = float_of(v)?;
                Ok(())
            },
        ),
    ]
}

/// Classifies by the closest per-class mean. Labels are class indices.
#[derive(Debug, Clone, Default)]
pub struct NearestCentroid;

#[derive(Debug)]
struct CentroidTrainer {
    options: CentroidOptions,
}

#[derive(Debug)]
struct CentroidPredictor {
    distance: Distance,
    /// Indexed by class; `None` for classes absent from training data.
    centroids: Vec<Option<Vec<f64>>>,
}

impl LearnerBuilder for NearestCentroid {
    fn name(&self) -> &str {
        "NearestCentroid"
    }

    fn supports(&self, task: TaskKind) -> bool {
        matches!(
            task,
            TaskKind::BinaryClassification | TaskKind::MulticlassClassification
        )
    }

    fn hyperparameters(&self) -> Hyperparameters {
        declared(&centroid_bindings())
    }

    fn build(&self, params: &ParameterSet) -> ApResult<Box<dyn Trainer>> {
        let mut options = CentroidOptions::default();
        bind_parameters(&mut options, &centroid_bindings(), params)?;
        Ok(Box::new(CentroidTrainer { options }))
    }
}

impl Trainer for CentroidTrainer {
    fn train(&self, data: &RoleMappedData) -> ApResult<Arc<dyn Predictor>> {
        let set = TrainingSet::load(data, "NearestCentroid", true)?;
        let mut classes = Vec::with_capacity(set.labels.len());
        for y in &set.labels {
            if *y < 0.0 || y.fract() != 0.0 {
                return Err(CandidateError::TrainingFailed {
                    learner: "NearestCentroid".to_string(),
                    message: format!("label {y} is not a class index"),
                }
                .into());
            }
            classes.push(*y as usize);
        }

        let width = set.width();
        let class_count = classes.iter().max().map(|m| m + 1).unwrap_or(0).max(2);
        let mut sums = vec![vec![0.0; width]; class_count];
        let mut totals = vec![0.0; class_count];
        let mut global = vec![0.0; width];
        let mut global_total = 0.0;
        for ((x, class), w) in set.features.iter().zip(&classes).zip(&set.weights) {
            for (j, xj) in x.iter().enumerate() {
                sums[*class][j] += w * xj;
                global[j] += w * xj;
            }
            totals[*class] += w;
            global_total += w;
        }
        if global_total > 0.0 {
            global.iter_mut().for_each(|g| *g /= global_total);
        }

        let shrinkage = self.options.shrinkage;
        let centroids = sums
            .into_iter()
            .zip(&totals)
            .map(|(sum, total)| {
                (*total > 0.0).then(|| {
                    sum.iter()
                        .zip(&global)
                        .map(|(s, g)| (1.0 - shrinkage) * (s / total) + shrinkage * g)
                        .collect()
                })
            })
            .collect();
        Ok(Arc::new(CentroidPredictor {
            distance: self.options.distance,
            centroids,
        }))
    }
}

impl CentroidPredictor {
    /// Softmax over negative distances; absent classes get zero.
    fn probabilities(&self, x: &[f64]) -> Vec<f64> {
        let distances: Vec<Option<f64>> = self
            .centroids
            .iter()
            .map(|c| c.as_ref().map(|c| self.distance.between(c, x)))
            .collect();
        let nearest = distances
            .iter()
            .flatten()
            .copied()
            .fold(f64::INFINITY, f64::min);
        let exps: Vec<f64> = distances
            .iter()
            .map(|d| d.map(|d| (nearest - d).exp()).unwrap_or(0.0))
            .collect();
        let total: f64 = exps.iter().sum();
        exps.into_iter().map(|e| e / total).collect()
    }
}

impl Predictor for CentroidPredictor {
    fn score(&self, data: &RoleMappedData) -> ApResult<DataHandle> {
        let class_count = self.centroids.len();
        let mut scores = Vec::new();
        let mut predicted = Vec::new();
        let mut positive = Vec::new();
        for x in data.features()? {
            let p = self.probabilities(&x);
            let best = p
                .iter()
                .enumerate()
                .fold((0, f64::NEG_INFINITY), |best, (i, v)| {
                    if *v > best.1 {
                        (i, *v)
                    } else {
                        best
                    }
                })
                .0;
            predicted.push(best as f64);
            positive.push(p.get(1).copied().unwrap_or(0.0));
            scores.push(Value::Vector(p));
        }
        with_predictions(
            data,
            vec![
                (Column::new(SCORE_COLUMN, ColumnKind::Vector(class_count)), scores),
                (
                    Column::new(PREDICTED_LABEL_COLUMN, ColumnKind::Numeric),
                    numbers(predicted),
                ),
                (
                    Column::new(PROBABILITY_COLUMN, ColumnKind::Numeric),
                    numbers(positive),
                ),
            ],
        )
    }
}
