//! Search space: learner templates, transform templates by level, and the
//! column dependency map used to build the final features concatenation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use ap_types::{
    config_error, ApResult, DataHandle, DataRoles, ExecutionContext, InferenceArgs, LearnerSpec,
    RoutingInfo, Schema, SearchError, TransformInference, TransformSpec,
};
use tracing::{debug, info, warn};

use crate::candidate::PipelineCandidate;

/// Atomic group ids must fit a `u64` bitmask.
pub const MAX_ATOMIC_GROUPS: u32 = 64;

/// A column as seen by the dependency map.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ColumnKey {
    pub name: String,
    pub is_numeric: bool,
}

/// Column → ids of the transforms at one level that write it. Level 0 holds
/// the raw columns with no producers.
pub type LevelDependencyMap = BTreeMap<ColumnKey, Vec<String>>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DependencyMap {
    levels: BTreeMap<usize, LevelDependencyMap>,
}

impl DependencyMap {
    pub fn insert_level(&mut self, level: usize, columns: LevelDependencyMap) {
        self.levels.insert(level, columns);
    }

    pub fn level(&self, level: usize) -> Option<&LevelDependencyMap> {
        self.levels.get(&level)
    }

    pub fn max_level(&self) -> usize {
        self.levels.keys().next_back().copied().unwrap_or(0)
    }

    pub fn levels(&self) -> impl Iterator<Item = (&usize, &LevelDependencyMap)> {
        self.levels.iter()
    }
}

/// Raw columns for level 0.
pub fn raw_columns(schema: &Schema) -> LevelDependencyMap {
    schema
        .columns()
        .iter()
        .filter(|c| !c.hidden)
        .map(|c| {
            (
                ColumnKey {
                    name: c.name.clone(),
                    is_numeric: c.kind.is_numeric(),
                },
                Vec::new(),
            )
        })
        .collect()
}

/// For each visible column of `schema` written by one of `transforms`, the
/// ids of the transforms that write it.
pub fn compute_column_responsibilities(
    schema: &Schema,
    transforms: &[TransformSpec],
) -> LevelDependencyMap {
    let mut map = LevelDependencyMap::new();
    for column in schema.columns().iter().filter(|c| !c.hidden) {
        let is_numeric = column.kind.is_numeric();
        let producers: Vec<String> = transforms
            .iter()
            .filter(|t| t.produces(&column.name, is_numeric))
            .map(|t| t.id.clone())
            .collect();
        if !producers.is_empty() {
            map.insert(
                ColumnKey {
                    name: column.name.clone(),
                    is_numeric,
                },
                producers,
            );
        }
    }
    map
}

/// Encode selected transforms by atomic group.
pub fn transforms_to_bitmask(selected: &[TransformSpec]) -> u64 {
    selected
        .iter()
        .filter(|t| t.routing.atomic_group_id < MAX_ATOMIC_GROUPS)
        .fold(0u64, |mask, t| mask | (1u64 << t.routing.atomic_group_id))
}

/// Everything the optimizer may draw candidates from.
#[derive(Debug, Clone)]
pub struct SearchSpace {
    pub transforms: Vec<TransformSpec>,
    pub learners: Vec<LearnerSpec>,
    pub dependencies: DependencyMap,
    /// Schema after applying every available transform.
    pub transformed_schema: Schema,
    pub inference: Option<Arc<dyn TransformInference>>,
}

impl SearchSpace {
    /// Learner-only space: no transforms, no inference.
    pub fn learners_only(learners: Vec<LearnerSpec>, schema: Schema) -> Self {
        let mut dependencies = DependencyMap::default();
        dependencies.insert_level(0, raw_columns(&schema));
        Self {
            transforms: Vec::new(),
            learners,
            dependencies,
            transformed_schema: schema,
            inference: None,
        }
    }

    pub fn learner(&self, name: &str) -> Option<&LearnerSpec> {
        self.learners.iter().find(|l| l.name == name)
    }

    /// Distinct atomic groups, ascending.
    pub fn atomic_groups(&self) -> Vec<u32> {
        let mut groups: Vec<u32> = self
            .transforms
            .iter()
            .map(|t| t.routing.atomic_group_id)
            .collect();
        groups.sort_unstable();
        groups.dedup();
        groups
    }

    /// Transforms whose atomic group bit is set in `mask`, in level order.
    pub fn bitmask_to_transforms(&self, mask: u64) -> Vec<TransformSpec> {
        self.transforms
            .iter()
            .filter(|t| {
                t.routing.atomic_group_id < MAX_ATOMIC_GROUPS
                    && mask & (1u64 << t.routing.atomic_group_id) != 0
            })
            .cloned()
            .collect()
    }

    /// Columns that survive when only `selected` transforms run: the raw
    /// columns, replaced or extended by the outputs of the selected
    /// transforms level by level, restricted to numeric non-role columns.
    pub fn included_columns(&self, selected: &[TransformSpec], roles: &DataRoles) -> Vec<String> {
        let mut available: Vec<ColumnKey> = self
            .dependencies
            .level(0)
            .map(|level| level.keys().cloned().collect())
            .unwrap_or_default();
        // Level 0 is keyed by a sorted map; keep schema order instead.
        let order: Vec<&str> = self
            .transformed_schema
            .columns()
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        available.sort_by_key(|k| order.iter().position(|n| *n == k.name));

        for (level, columns) in self.dependencies.levels().filter(|(l, _)| **l > 0) {
            for (key, producers) in columns {
                let chosen = selected
                    .iter()
                    .any(|t| t.routing.level == *level && producers.contains(&t.id));
                if !chosen {
                    continue;
                }
                match available.iter_mut().find(|k| k.name == key.name) {
                    Some(existing) => *existing = key.clone(),
                    None => available.push(key.clone()),
                }
            }
        }

        available
            .into_iter()
            .filter(|k| k.is_numeric && !roles.is_reserved(&k.name))
            .map(|k| k.name)
            .collect()
    }

    /// The final features concatenation for `selected`, placed one level
    /// above the deepest level with an atomic group above all others.
    pub fn final_features_concat(
        &self,
        selected: &[TransformSpec],
        roles: &DataRoles,
    ) -> ApResult<Option<TransformSpec>> {
        let Some(inference) = &self.inference else {
            return Ok(None);
        };
        let columns = self.included_columns(selected, roles);
        let routing = RoutingInfo {
            level: self.dependencies.max_level() + 1,
            atomic_group_id: self
                .transforms
                .iter()
                .map(|t| t.routing.atomic_group_id + 1)
                .max()
                .unwrap_or(0),
            columns_produced: Vec::new(),
        };
        inference.features_concat(&self.transformed_schema, &columns, routing, roles)
    }

    /// Candidate running `selected` (sorted by level) then the final concat,
    /// with the learner template's current hyperparameters.
    pub fn compose(
        &self,
        selected: &[TransformSpec],
        learner: &LearnerSpec,
        roles: &DataRoles,
    ) -> ApResult<PipelineCandidate> {
        let mut transforms = selected.to_vec();
        transforms.sort_by_key(|t| (t.routing.level, t.routing.atomic_group_id));
        if let Some(concat) = self.final_features_concat(selected, roles)? {
            transforms.push(concat);
        }
        Ok(PipelineCandidate::new(&transforms, learner))
    }
}

/// Enumerates admissible learners and runs transform inference level by
/// level.
#[derive(Debug)]
pub struct SearchSpaceBuilder<'a> {
    context: &'a ExecutionContext,
    requested_learners: &'a [String],
}

impl<'a> SearchSpaceBuilder<'a> {
    pub fn new(context: &'a ExecutionContext) -> Self {
        Self {
            context,
            requested_learners: &[],
        }
    }

    /// Restrict the space to these learner names. Empty means all.
    pub fn with_requested_learners(mut self, names: &'a [String]) -> Self {
        self.requested_learners = names;
        self
    }

    /// Learners supporting the task, optionally filtered by name. Each
    /// learner must build with its default hyperparameters.
    pub fn enumerate_learners(&self) -> ApResult<Vec<LearnerSpec>> {
        let task = self.context.task;
        let admissible: Vec<LearnerSpec> = self
            .context
            .learners
            .iter()
            .filter(|b| b.supports(task))
            .map(|b| LearnerSpec::from_builder(b.clone()))
            .collect();

        let learners = if self.requested_learners.is_empty() {
            admissible
        } else {
            let unknown: Vec<String> = self
                .requested_learners
                .iter()
                .filter(|name| !admissible.iter().any(|l| &l.name == *name))
                .cloned()
                .collect();
            if !unknown.is_empty() {
                return Err(SearchError::UnknownLearners {
                    task: task.to_string(),
                    names: unknown,
                }
                .into());
            }
            admissible
                .into_iter()
                .filter(|l| self.requested_learners.contains(&l.name))
                .collect()
        };

        if learners.is_empty() {
            return Err(SearchError::NoLearners {
                task: task.to_string(),
            }
            .into());
        }
        for learner in &learners {
            learner.build_trainer().map_err(|e| {
                config_error!("learner {} rejects its defaults: {e}", learner.name)
            })?;
        }
        Ok(learners)
    }

    /// Build the space from `train` with up to `levels` inference levels.
    pub fn build(&self, train: &DataHandle, levels: usize) -> ApResult<SearchSpace> {
        let learners = self.enumerate_learners()?;
        let mut space = SearchSpace::learners_only(learners, train.schema().clone());
        let Some(inference) = &self.context.transform_inference else {
            info!(
                "No transform inference configured; searching {} learners only",
                space.learners.len()
            );
            return Ok(space);
        };
        space.inference = Some(inference.clone());

        let roles = &self.context.roles;
        let mut current = train.clone();
        let mut atomic_id_offset = 0u32;
        for level in 1..=levels {
            let args = InferenceArgs {
                level,
                atomic_id_offset,
                exclude_features_concat: true,
            };
            let suggested = inference.infer(&current, &args, roles)?;
            if suggested.is_empty() {
                debug!("Level {level} suggested no transforms");
                break;
            }
            let max_group = suggested
                .iter()
                .map(|t| t.routing.atomic_group_id)
                .max()
                .unwrap_or(atomic_id_offset);
            if max_group >= MAX_ATOMIC_GROUPS {
                warn!("Level {level} exceeds {MAX_ATOMIC_GROUPS} atomic groups; stopping inference");
                break;
            }

            for spec in &suggested {
                if let Some(estimator) = &spec.estimator {
                    current = estimator.fit(&current)?.transform(&current)?;
                }
            }
            space.dependencies.insert_level(
                level,
                compute_column_responsibilities(current.schema(), &suggested),
            );
            atomic_id_offset = max_group + 1;
            space.transforms.extend(suggested);
        }

        space.transformed_schema = current.schema().clone();
        info!(
            "Search space: {} learners, {} transforms over {} levels",
            space.learners.len(),
            space.transforms.len(),
            space.dependencies.max_level()
        );
        Ok(space)
    }
}
