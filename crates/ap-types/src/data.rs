//! Abstract tabular data handle: schema introspection plus a forward-only
//! row cursor. Nothing here assumes the rows live in memory.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::errors::{ApResult, DataError};

/// Default column bound to the label role.
pub const LABEL_COLUMN: &str = "Label";
/// Default column bound to the feature role.
pub const FEATURES_COLUMN: &str = "Features";
/// Raw score produced by a predictor.
pub const SCORE_COLUMN: &str = "Score";
/// Calibrated probability (binary classification).
pub const PROBABILITY_COLUMN: &str = "Probability";
/// Hard prediction (classification).
pub const PREDICTED_LABEL_COLUMN: &str = "PredictedLabel";

/// Item type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ColumnKind {
    Numeric,
    Boolean,
    Text,
    /// Fixed-size numeric vector.
    Vector(usize),
}

impl ColumnKind {
    /// Numeric item type (scalars and numeric vectors).
    pub fn is_numeric(&self) -> bool {
        matches!(self, ColumnKind::Numeric | ColumnKind::Vector(_))
    }
}

impl fmt::Display for ColumnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnKind::Numeric => write!(f, "numeric"),
            ColumnKind::Boolean => write!(f, "boolean"),
            ColumnKind::Text => write!(f, "text"),
            ColumnKind::Vector(n) => write!(f, "vector<{n}>"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub kind: ColumnKind,
    /// Hidden columns are shadowed by a later column of the same name.
    pub hidden: bool,
}

impl Column {
    pub fn new(name: impl Into<String>, kind: ColumnKind) -> Self {
        Self {
            name: name.into(),
            kind,
            hidden: false,
        }
    }
}

/// Ordered list of named, typed columns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    columns: Vec<Column>,
}

impl Schema {
    pub fn new(columns: Vec<Column>) -> Self {
        Self { columns }
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Index of the visible column named `name`.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .rposition(|c| c.name == name && !c.hidden)
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.index_of(name).map(|i| &self.columns[i])
    }

    pub fn require(&self, name: &str) -> ApResult<usize> {
        self.index_of(name).ok_or_else(|| {
            DataError::ColumnNotFound {
                name: name.to_string(),
            }
            .into()
        })
    }

    /// Append a column. An existing visible column of the same name becomes
    /// hidden, so readers by name see the new one.
    pub fn push(&mut self, column: Column) -> usize {
        if let Some(existing) = self.index_of(&column.name) {
            self.columns[existing].hidden = true;
        }
        self.columns.push(column);
        self.columns.len() - 1
    }
}

/// A single cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Number(f64),
    Boolean(bool),
    Text(String),
    Vector(Vec<f64>),
    Missing,
}

impl Value {
    /// Scalar numeric view. Booleans map to 1/0; missing maps to NaN.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(v) => Some(*v),
            Value::Boolean(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Missing => Some(f64::NAN),
            _ => None,
        }
    }

    pub fn is_missing(&self) -> bool {
        match self {
            Value::Missing => true,
            Value::Number(v) => v.is_nan(),
            _ => false,
        }
    }
}

pub type Row = Vec<Value>;

/// Forward-only cursor over rows.
pub trait RowCursor {
    fn next_row(&mut self) -> Option<Row>;
}

/// Abstract tabular data source. Can be re-read any number of times; each
/// `cursor` call starts from the first row.
pub trait DataView: Send + Sync + fmt::Debug {
    fn schema(&self) -> &Schema;

    fn cursor(&self) -> Box<dyn RowCursor + '_>;

    /// Row count when cheaply known.
    fn row_count(&self) -> Option<usize> {
        None
    }
}

/// Shared handle to a data view.
pub type DataHandle = Arc<dyn DataView>;

/// Which columns play which role during training and evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRoles {
    pub label: String,
    pub features: String,
    pub weight: Option<String>,
}

impl Default for DataRoles {
    fn default() -> Self {
        Self {
            label: LABEL_COLUMN.to_string(),
            features: FEATURES_COLUMN.to_string(),
            weight: None,
        }
    }
}

impl DataRoles {
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_features(mut self, features: impl Into<String>) -> Self {
        self.features = features.into();
        self
    }

    pub fn with_weight(mut self, weight: impl Into<String>) -> Self {
        self.weight = Some(weight.into());
        self
    }

    /// True if `name` is bound to a non-feature role.
    pub fn is_reserved(&self, name: &str) -> bool {
        name == self.label || self.weight.as_deref() == Some(name)
    }
}

/// A data view with roles bound to its columns.
#[derive(Debug, Clone)]
pub struct RoleMappedData {
    pub data: DataHandle,
    pub roles: DataRoles,
}

impl RoleMappedData {
    pub fn new(data: DataHandle, roles: DataRoles) -> Self {
        Self { data, roles }
    }

    /// Label values as floats (booleans as 1/0).
    pub fn labels(&self) -> ApResult<Vec<f64>> {
        self.scalar_column(&self.roles.label)
    }

    pub fn weights(&self) -> ApResult<Option<Vec<f64>>> {
        match &self.roles.weight {
            Some(name) => self.scalar_column(name).map(Some),
            None => Ok(None),
        }
    }

    /// Feature vectors, one per row.
    pub fn features(&self) -> ApResult<Vec<Vec<f64>>> {
        self.vector_column(&self.roles.features)
    }

    /// Read a numeric column as one float per row.
    pub fn scalar_column(&self, name: &str) -> ApResult<Vec<f64>> {
        let index = self.data.schema().require(name)?;
        let mut cursor = self.data.cursor();
        let mut values = Vec::with_capacity(self.data.row_count().unwrap_or(0));
        while let Some(row) = cursor.next_row() {
            let value = row[index].as_f64().ok_or_else(|| DataError::TypeMismatch {
                column: name.to_string(),
                expected: "numeric".to_string(),
                actual: format!("{:?}", row[index]),
            })?;
            values.push(value);
        }
        Ok(values)
    }

    /// Read a vector (or scalar numeric) column as one vector per row.
    pub fn vector_column(&self, name: &str) -> ApResult<Vec<Vec<f64>>> {
        let index = self.data.schema().require(name)?;
        let mut cursor = self.data.cursor();
        let mut values = Vec::with_capacity(self.data.row_count().unwrap_or(0));
        while let Some(row) = cursor.next_row() {
            let value = match &row[index] {
                Value::Vector(v) => v.clone(),
                other => match other.as_f64() {
                    Some(x) => vec![x],
                    None => {
                        return Err(DataError::TypeMismatch {
                            column: name.to_string(),
                            expected: "vector".to_string(),
                            actual: format!("{other:?}"),
                        }
                        .into())
                    }
                },
            };
            values.push(value);
        }
        Ok(values)
    }
}
