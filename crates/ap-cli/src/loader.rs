// CSV loading for the command-line runner.
// Column kinds are inferred from the cells: all-numeric columns are numeric,
// true/false columns are boolean, anything else is text. Empty and NA cells are
// missing values.

use std::path::Path;

use ap_types::{ApResult, Column, ColumnKind, DataError, Schema, Table, Value};
use csv::ReaderBuilder;
use tracing::{debug, info};

fn is_missing(cell: &str) -> bool {
    cell.is_empty() || cell.eq_ignore_ascii_case("na") || cell.eq_ignore_ascii_case("nan")
}

fn parse_bool(cell: &str) -> Option<bool> {
    match cell.to_ascii_lowercase().as_str() {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

fn infer_kind(cells: &[&str]) -> ColumnKind {
    let present: Vec<&str> = cells.iter().copied().filter(|c| !is_missing(c)).collect();
    if present.is_empty() || present.iter().all(|c| c.parse::<f64>().is_ok()) {
        ColumnKind::Numeric
    } else if present.iter().all(|c| parse_bool(c).is_some()) {
        ColumnKind::Boolean
    } else {
        ColumnKind::Text
    }
}

fn parse_cell(cell: &str, kind: ColumnKind) -> Value {
    if is_missing(cell) {
        return Value::Missing;
    }
    match kind {
        ColumnKind::Numeric => cell.parse().map(Value::Number).unwrap_or(Value::Missing),
        ColumnKind::Boolean => parse_bool(cell).map(Value::Boolean).unwrap_or(Value::Missing),
        _ => Value::Text(cell.to_string()),
    }
}

/// Load a headed CSV file into an in-memory table.
pub fn load_csv<P: AsRef<Path>>(path: P) -> ApResult<Table> {
    let path = path.as_ref();
    info!("Loading CSV data from: {}", path.display());

    let mut rdr = ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|e| DataError::LoadingFailed {
            message: format!("Failed to open CSV file {}: {}", path.display(), e),
        })?;

    let headers: Vec<String> = rdr
        .headers()
        .map_err(|e| DataError::LoadingFailed {
            message: format!("Failed to read CSV headers: {e}"),
        })?
        .iter()
        .map(str::to_string)
        .collect();
    debug!("CSV headers: {:?}", headers);

    let mut records = Vec::new();
    for (line_num, result) in rdr.records().enumerate() {
        let record = result.map_err(|e| DataError::LoadingFailed {
            message: format!("Failed to read CSV record at line {}: {}", line_num + 2, e),
        })?;
        records.push(record);
    }

    let kinds: Vec<ColumnKind> = (0..headers.len())
        .map(|idx| {
            let cells: Vec<&str> = records.iter().map(|r| r.get(idx).unwrap_or("")).collect();
            infer_kind(&cells)
        })
        .collect();

    let schema = Schema::new(
        headers
            .iter()
            .zip(&kinds)
            .map(|(name, kind)| Column::new(name.clone(), *kind))
            .collect(),
    );
    let rows = records
        .iter()
        .map(|record| {
            kinds
                .iter()
                .enumerate()
                .map(|(idx, kind)| parse_cell(record.get(idx).unwrap_or(""), *kind))
                .collect()
        })
        .collect();

    let table = Table::new(schema).with_rows(rows)?;
    info!(
        "Loaded {} rows x {} columns from {}",
        table.len(),
        headers.len(),
        path.display()
    );
    Ok(table)
}
