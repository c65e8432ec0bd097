// Column transforms over in-memory tables.
// Each estimator materializes its input, so any DataView works as a source.

use std::collections::BTreeSet;
use std::sync::Arc;

use ap_types::{
    ApResult, Column, ColumnKind, DataError, DataHandle, DataView, Estimator, FittedTransformer,
    Table, Value,
};
use tracing::debug;

/// Width a column contributes to a concatenated vector.
fn numeric_width(kind: ColumnKind) -> Option<usize> {
    match kind {
        ColumnKind::Numeric | ColumnKind::Boolean => Some(1),
        ColumnKind::Vector(n) => Some(n),
        ColumnKind::Text => None,
    }
}

// ---- Mean imputation ----

/// Replaces missing values of a numeric column with the training mean.
#[derive(Debug, Clone)]
pub struct MeanImputer {
    column: String,
}

impl MeanImputer {
    pub fn new(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
        }
    }
}

#[derive(Debug)]
struct FittedMeanImputer {
    column: String,
    mean: f64,
}

impl Estimator for MeanImputer {
    fn name(&self) -> &str {
        "MeanImputer"
    }

    fn fit(&self, data: &DataHandle) -> ApResult<Arc<dyn FittedTransformer>> {
        let table = Table::from_view(data.as_ref());
        let mut sum = 0.0;
        let mut count = 0usize;
        for value in table.column_values(&self.column)? {
            if let Some(x) = value.as_f64().filter(|x| !x.is_nan()) {
                sum += x;
                count += 1;
            }
        }
        let mean = if count == 0 { 0.0 } else { sum / count as f64 };
        debug!("Imputing {} with mean {mean}", self.column);
        Ok(Arc::new(FittedMeanImputer {
            column: self.column.clone(),
            mean,
        }))
    }
}

impl FittedTransformer for FittedMeanImputer {
    fn transform(&self, data: &DataHandle) -> ApResult<DataHandle> {
        let mut table = Table::from_view(data.as_ref());
        let values = table
            .column_values(&self.column)?
            .into_iter()
            .map(|v| match v.as_f64() {
                Some(x) if !x.is_nan() => Value::Number(x),
                _ => Value::Number(self.mean),
            })
            .collect();
        table.append_column(Column::new(self.column.clone(), ColumnKind::Numeric), values)?;
        Ok(table.into_handle())
    }
}

// ---- One-hot encoding ----

/// Encodes a text column as an indicator vector over the training categories.
#[derive(Debug, Clone)]
pub struct OneHotEncoder {
    column: String,
    output: String,
}

impl OneHotEncoder {
    pub fn new(column: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            output: output.into(),
        }
    }
}

#[derive(Debug)]
struct FittedOneHot {
    column: String,
    output: String,
    categories: Vec<String>,
}

impl Estimator for OneHotEncoder {
    fn name(&self) -> &str {
        "OneHotEncoder"
    }

    fn fit(&self, data: &DataHandle) -> ApResult<Arc<dyn FittedTransformer>> {
        let table = Table::from_view(data.as_ref());
        let categories: BTreeSet<String> = table
            .column_values(&self.column)?
            .into_iter()
            .filter_map(|v| match v {
                Value::Text(s) => Some(s.clone()),
                _ => None,
            })
            .collect();
        Ok(Arc::new(FittedOneHot {
            column: self.column.clone(),
            output: self.output.clone(),
            categories: categories.into_iter().collect(),
        }))
    }
}

impl FittedTransformer for FittedOneHot {
    fn transform(&self, data: &DataHandle) -> ApResult<DataHandle> {
        let mut table = Table::from_view(data.as_ref());
        let width = self.categories.len();
        let values = table
            .column_values(&self.column)?
            .into_iter()
            .map(|v| {
                let mut encoded = vec![0.0; width];
                if let Value::Text(s) = v {
                    if let Ok(idx) = self.categories.binary_search(s) {
                        encoded[idx] = 1.0;
                    }
                }
                Value::Vector(encoded)
            })
            .collect();
        table.append_column(
            Column::new(self.output.clone(), ColumnKind::Vector(width)),
            values,
        )?;
        Ok(table.into_handle())
    }
}

// ---- Concatenation ----

/// Concatenates numeric columns into one vector column.
#[derive(Debug, Clone)]
pub struct ColumnConcat {
    inputs: Vec<String>,
    output: String,
}

impl ColumnConcat {
    pub fn new(inputs: Vec<String>, output: impl Into<String>) -> Self {
        Self {
            inputs,
            output: output.into(),
        }
    }

    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }
}

impl Estimator for ColumnConcat {
    fn name(&self) -> &str {
        "ColumnConcat"
    }

    fn fit(&self, _data: &DataHandle) -> ApResult<Arc<dyn FittedTransformer>> {
        Ok(Arc::new(self.clone()))
    }
}

impl FittedTransformer for ColumnConcat {
    fn transform(&self, data: &DataHandle) -> ApResult<DataHandle> {
        let mut table = Table::from_view(data.as_ref());
        let mut indices = Vec::with_capacity(self.inputs.len());
        let mut width = 0;
        for name in &self.inputs {
            let idx = table.schema().require(name)?;
            let kind = table.schema().columns()[idx].kind;
            width += numeric_width(kind).ok_or_else(|| DataError::TypeMismatch {
                column: name.clone(),
                expected: "numeric".to_string(),
                actual: kind.to_string(),
            })?;
            indices.push(idx);
        }

        let values = table
            .rows()
            .iter()
            .map(|row| {
                let mut out = Vec::with_capacity(width);
                for &idx in &indices {
                    match &row[idx] {
                        Value::Vector(v) => out.extend_from_slice(v),
                        other => out.push(other.as_f64().unwrap_or(f64::NAN)),
                    }
                }
                Value::Vector(out)
            })
            .collect();
        table.append_column(
            Column::new(self.output.clone(), ColumnKind::Vector(width)),
            values,
        )?;
        Ok(table.into_handle())
    }
}

// ---- Min-max normalization ----

/// Rescales each dimension of a vector column to [0, 1] using training ranges.
#[derive(Debug, Clone)]
pub struct MinMaxNormalizer {
    column: String,
}

impl MinMaxNormalizer {
    pub fn new(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
        }
    }
}

#[derive(Debug)]
struct FittedMinMax {
    column: String,
    min: Vec<f64>,
    max: Vec<f64>,
}

fn as_vector(value: &Value) -> Vec<f64> {
    match value {
        Value::Vector(v) => v.clone(),
        other => vec![other.as_f64().unwrap_or(f64::NAN)],
    }
}

impl Estimator for MinMaxNormalizer {
    fn name(&self) -> &str {
        "MinMaxNormalizer"
    }

    fn fit(&self, data: &DataHandle) -> ApResult<Arc<dyn FittedTransformer>> {
        let table = Table::from_view(data.as_ref());
        let mut min: Vec<f64> = Vec::new();
        let mut max: Vec<f64> = Vec::new();
        for value in table.column_values(&self.column)? {
            let v = as_vector(value);
            if min.is_empty() {
                min = vec![f64::INFINITY; v.len()];
                max = vec![f64::NEG_INFINITY; v.len()];
            }
            for (i, x) in v.iter().enumerate().take(min.len()) {
                if x.is_nan() {
                    continue;
                }
                min[i] = min[i].min(*x);
                max[i] = max[i].max(*x);
            }
        }
        Ok(Arc::new(FittedMinMax {
            column: self.column.clone(),
            min,
            max,
        }))
    }
}

impl FittedTransformer for FittedMinMax {
    fn transform(&self, data: &DataHandle) -> ApResult<DataHandle> {
        let mut table = Table::from_view(data.as_ref());
        let values = table
            .column_values(&self.column)?
            .into_iter()
            .map(|value| {
                let scaled = as_vector(value)
                    .iter()
                    .enumerate()
                    .map(|(i, x)| match (self.min.get(i), self.max.get(i)) {
                        (Some(lo), Some(hi)) if hi > lo => (x - lo) / (hi - lo),
                        _ => 0.0,
                    })
                    .collect();
                Value::Vector(scaled)
            })
            .collect();
        table.append_column(
            Column::new(self.column.clone(), ColumnKind::Vector(self.min.len())),
            values,
        )?;
        Ok(table.into_handle())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ap_types::{DataView, Schema};

    fn mixed() -> DataHandle {
        let schema = Schema::new(vec![
            Column::new("Age", ColumnKind::Numeric),
            Column::new("Color", ColumnKind::Text),
            Column::new("Label", ColumnKind::Numeric),
        ]);
        Table::new(schema)
            .with_rows(vec![
                vec![Value::Number(10.0), Value::Text("red".into()), Value::Number(1.0)],
                vec![Value::Missing, Value::Text("blue".into()), Value::Number(0.0)],
                vec![Value::Number(30.0), Value::Text("red".into()), Value::Number(1.0)],
            ])
            .unwrap()
            .into_handle()
    }

    fn numbers(data: &DataHandle, column: &str) -> Vec<Value> {
        Table::from_view(data.as_ref())
            .column_values(column)
            .unwrap()
            .into_iter()
            .cloned()
            .collect()
    }

    #[test]
    fn mean_imputer_fills_missing() {
        let data = mixed();
        let fitted = MeanImputer::new("Age").fit(&data).unwrap();
        let out = fitted.transform(&data).unwrap();
        assert_eq!(numbers(&out, "Age")[1], Value::Number(20.0));
    }

    #[test]
    fn one_hot_uses_sorted_training_categories() {
        let data = mixed();
        let fitted = OneHotEncoder::new("Color", "Color_onehot").fit(&data).unwrap();
        let out = fitted.transform(&data).unwrap();
        let encoded = numbers(&out, "Color_onehot");
        // categories: blue, red
        assert_eq!(encoded[0], Value::Vector(vec![0.0, 1.0]));
        assert_eq!(encoded[1], Value::Vector(vec![1.0, 0.0]));
        assert_eq!(
            out.schema().column("Color_onehot").unwrap().kind,
            ColumnKind::Vector(2)
        );
    }

    #[test]
    fn concat_rejects_text_columns() {
        let data = mixed();
        let concat = ColumnConcat::new(vec!["Age".into(), "Color".into()], "Features");
        assert!(concat.transform(&data).is_err());
    }

    #[test]
    fn concat_then_normalize() {
        let data = Table::from_numeric(
            &["a", "b", "Label"],
            vec![vec![0.0, 10.0, 1.0], vec![5.0, 20.0, 0.0], vec![10.0, 30.0, 1.0]],
        )
        .unwrap()
        .into_handle();
        let concat = ColumnConcat::new(vec!["a".into(), "b".into()], "Features");
        let concatenated = concat.transform(&data).unwrap();
        let normalizer = MinMaxNormalizer::new("Features").fit(&concatenated).unwrap();
        let out = normalizer.transform(&concatenated).unwrap();
        let features = numbers(&out, "Features");
        assert_eq!(features[0], Value::Vector(vec![0.0, 0.0]));
        assert_eq!(features[1], Value::Vector(vec![0.5, 0.5]));
        assert_eq!(features[2], Value::Vector(vec![1.0, 1.0]));
    }
}
