//! In-memory table and the row-limit view used for training subsamples.

use std::sync::Arc;

use crate::data::{Column, ColumnKind, DataHandle, DataView, Row, RowCursor, Schema, Value};
use crate::errors::{ApResult, DataError};

/// Row-major in-memory table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    schema: Schema,
    rows: Vec<Row>,
}

impl Table {
    pub fn new(schema: Schema) -> Self {
        Self {
            schema,
            rows: Vec::new(),
        }
    }

    /// Materialize any data view.
    pub fn from_view(view: &dyn DataView) -> Self {
        let mut rows = Vec::with_capacity(view.row_count().unwrap_or(0));
        let mut cursor = view.cursor();
        while let Some(row) = cursor.next_row() {
            rows.push(row);
        }
        Self {
            schema: view.schema().clone(),
            rows,
        }
    }

    pub fn push_row(&mut self, row: Row) -> ApResult<()> {
        if row.len() != self.schema.len() {
            return Err(DataError::RowLength {
                expected: self.schema.len(),
                actual: row.len(),
            }
            .into());
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn with_rows(mut self, rows: Vec<Row>) -> ApResult<Self> {
        for row in rows {
            self.push_row(row)?;
        }
        Ok(self)
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Values of the visible column named `name`.
    pub fn column_values(&self, name: &str) -> ApResult<Vec<&Value>> {
        let index = self.schema.require(name)?;
        Ok(self.rows.iter().map(|r| &r[index]).collect())
    }

    /// Append a computed column; shadows an existing column with the same name.
    pub fn append_column(&mut self, column: Column, values: Vec<Value>) -> ApResult<()> {
        if values.len() != self.rows.len() {
            return Err(DataError::InvalidValue {
                column: column.name.clone(),
                message: format!(
                    "{} values supplied for {} rows",
                    values.len(),
                    self.rows.len()
                ),
            }
            .into());
        }
        self.schema.push(column);
        for (row, value) in self.rows.iter_mut().zip(values) {
            row.push(value);
        }
        Ok(())
    }

    /// Build a table of numeric columns plus a numeric label, a common shape
    /// for tests and demos.
    pub fn from_numeric(names: &[&str], rows: Vec<Vec<f64>>) -> ApResult<Self> {
        let schema = Schema::new(
            names
                .iter()
                .map(|n| Column::new(*n, ColumnKind::Numeric))
                .collect(),
        );
        Table::new(schema).with_rows(
            rows.into_iter()
                .map(|r| r.into_iter().map(Value::Number).collect())
                .collect(),
        )
    }

    pub fn into_handle(self) -> DataHandle {
        Arc::new(self)
    }
}

struct TableCursor<'a> {
    rows: std::slice::Iter<'a, Row>,
}

impl RowCursor for TableCursor<'_> {
    fn next_row(&mut self) -> Option<Row> {
        self.rows.next().cloned()
    }
}

impl DataView for Table {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn cursor(&self) -> Box<dyn RowCursor + '_> {
        Box::new(TableCursor {
            rows: self.rows.iter(),
        })
    }

    fn row_count(&self) -> Option<usize> {
        Some(self.rows.len())
    }
}

/// View exposing at most `limit` leading rows of another view.
#[derive(Debug, Clone)]
pub struct RowLimit {
    inner: DataHandle,
    limit: usize,
}

impl RowLimit {
    pub fn new(inner: DataHandle, limit: usize) -> Self {
        Self { inner, limit }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

struct LimitedCursor<'a> {
    inner: Box<dyn RowCursor + 'a>,
    remaining: usize,
}

impl RowCursor for LimitedCursor<'_> {
    fn next_row(&mut self) -> Option<Row> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        self.inner.next_row()
    }
}

impl DataView for RowLimit {
    fn schema(&self) -> &Schema {
        self.inner.schema()
    }

    fn cursor(&self) -> Box<dyn RowCursor + '_> {
        Box::new(LimitedCursor {
            inner: self.inner.cursor(),
            remaining: self.limit,
        })
    }

    fn row_count(&self) -> Option<usize> {
        self.inner.row_count().map(|n| n.min(self.limit))
    }
}
