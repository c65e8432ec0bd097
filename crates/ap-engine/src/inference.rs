// Rule-based transform suggestions.
// Missing numeric values get a mean imputer; low-cardinality text columns get
// a one-hot encoding. Numeric columns are concatenated into the features
// column as a final step.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use ap_types::{
    ApResult, ColumnKind, DataHandle, DataRoles, InferenceArgs, ProducedColumn, RoutingInfo,
    Schema, TransformInference, TransformSpec, Value,
};
use tracing::debug;

use crate::transforms::{ColumnConcat, MeanImputer, OneHotEncoder};

/// Suffix of the vector column a one-hot encoding writes.
pub const ONE_HOT_SUFFIX: &str = "_onehot";

#[derive(Debug, Clone)]
pub struct ExpertTransformInference {
    /// Text columns with more distinct values than this are left alone.
    max_categories: usize,
}

impl Default for ExpertTransformInference {
    fn default() -> Self {
        Self { max_categories: 32 }
    }
}

impl ExpertTransformInference {
    pub fn with_max_categories(mut self, max_categories: usize) -> Self {
        self.max_categories = max_categories;
        self
    }
}

/// Per-column facts gathered in one pass over the data.
#[derive(Default)]
struct ColumnProfile {
    has_missing: bool,
    categories: BTreeSet<String>,
}

fn profile(data: &DataHandle, max_categories: usize) -> HashMap<usize, ColumnProfile> {
    let mut profiles: HashMap<usize, ColumnProfile> = HashMap::new();
    let mut cursor = data.cursor();
    while let Some(row) = cursor.next_row() {
        for (idx, value) in row.iter().enumerate() {
            let entry = profiles.entry(idx).or_default();
            match value {
                Value::Text(s) if entry.categories.len() <= max_categories => {
                    entry.categories.insert(s.clone());
                }
                v if v.is_missing() => entry.has_missing = true,
                _ => {}
            }
        }
    }
    profiles
}

fn routing(level: usize, atomic_group_id: u32, produced: &str) -> RoutingInfo {
    RoutingInfo {
        level,
        atomic_group_id,
        columns_produced: vec![ProducedColumn {
            name: produced.to_string(),
            is_numeric: true,
        }],
    }
}

impl TransformInference for ExpertTransformInference {
    fn infer(
        &self,
        data: &DataHandle,
        args: &InferenceArgs,
        roles: &DataRoles,
    ) -> ApResult<Vec<TransformSpec>> {
        let schema = data.schema();
        let profiles = profile(data, self.max_categories);
        let mut suggestions = Vec::new();
        let mut next_group = args.atomic_id_offset;

        for (idx, column) in schema.columns().iter().enumerate() {
            if column.hidden || roles.is_reserved(&column.name) || column.name == roles.features {
                continue;
            }
            let Some(profile) = profiles.get(&idx) else {
                continue;
            };
            match column.kind {
                ColumnKind::Numeric if profile.has_missing => {
                    suggestions.push(TransformSpec::new(
                        format!("MeanImputer({})", column.name),
                        Arc::new(MeanImputer::new(column.name.clone())),
                        routing(args.level, next_group, &column.name),
                    ));
                    next_group += 1;
                }
                ColumnKind::Text => {
                    let output = format!("{}{ONE_HOT_SUFFIX}", column.name);
                    if schema.index_of(&output).is_some()
                        || profile.categories.is_empty()
                        || profile.categories.len() > self.max_categories
                    {
                        continue;
                    }
                    suggestions.push(TransformSpec::new(
                        format!("OneHotEncoder({})", column.name),
                        Arc::new(OneHotEncoder::new(column.name.clone(), output.clone())),
                        routing(args.level, next_group, &output),
                    ));
                    next_group += 1;
                }
                _ => {}
            }
        }

        if !args.exclude_features_concat {
            let mut columns: Vec<String> = schema
                .columns()
                .iter()
                .filter(|c| !c.hidden && c.kind.is_numeric() && !roles.is_reserved(&c.name))
                .map(|c| c.name.clone())
                .collect();
            for spec in &suggestions {
                for produced in &spec.routing.columns_produced {
                    if !columns.contains(&produced.name) {
                        columns.push(produced.name.clone());
                    }
                }
            }
            let concat_routing = RoutingInfo {
                level: args.level,
                atomic_group_id: next_group,
                columns_produced: Vec::new(),
            };
            if let Some(concat) = self.features_concat(schema, &columns, concat_routing, roles)? {
                suggestions.push(concat);
            }
        }

        debug!(
            "Level {} inference suggested {} transforms",
            args.level,
            suggestions.len()
        );
        Ok(suggestions)
    }

    fn features_concat(
        &self,
        schema: &Schema,
        columns: &[String],
        routing: RoutingInfo,
        roles: &DataRoles,
    ) -> ApResult<Option<TransformSpec>> {
        if columns.is_empty() {
            return Ok(None);
        }
        let features_is_vector = matches!(
            schema.column(&roles.features).map(|c| c.kind),
            Some(ColumnKind::Vector(_))
        );
        if features_is_vector && columns.len() == 1 && columns[0] == roles.features {
            return Ok(None);
        }

        let routing = RoutingInfo {
            columns_produced: vec![ProducedColumn {
                name: roles.features.clone(),
                is_numeric: true,
            }],
            ..routing
        };
        Ok(Some(TransformSpec::new(
            format!("ColumnConcat({})", columns.join(",")),
            Arc::new(ColumnConcat::new(columns.to_vec(), roles.features.clone())),
            routing,
        )))
    }
}
