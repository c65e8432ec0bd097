//! Optimizer contract and the bundled proposal strategies.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use ap_types::{ApResult, DataHandle, DataRoles, LearnerSpec, ParameterSet, SearchError};
use tracing::debug;

use crate::candidate::PipelineCandidate;
use crate::space::SearchSpace;
use crate::sweep::{parameter_grid, perturb_parameters, sample_parameters};

/// What an optimizer is told about the space before its first proposal.
#[derive(Debug, Clone)]
pub struct SpaceDefinition {
    pub space: Arc<SearchSpace>,
    pub train: DataHandle,
    /// A training sample with every available transform applied.
    pub transformed_sample: DataHandle,
    pub is_maximizing: bool,
}

/// Inputs to one proposal round.
#[derive(Debug, Clone, Copy)]
pub struct ProposalRequest<'a> {
    /// Evaluated candidates, best first.
    pub history: &'a [PipelineCandidate],
    pub batch_size: usize,
    pub roles: &'a DataRoles,
    /// Signatures of configurations that failed before.
    pub failed: &'a HashSet<String>,
}

impl ProposalRequest<'_> {
    /// Whether a proposal with `signature` is already known.
    pub fn is_known(&self, signature: &str) -> bool {
        self.failed.contains(signature) || self.history.iter().any(|c| c.signature() == signature)
    }
}

/// Pluggable proposal strategy. An empty batch means the space is exhausted.
pub trait PipelineOptimizer: Send + fmt::Debug {
    fn name(&self) -> &str;

    /// Called once before the first proposal, and again if the space is
    /// redefined.
    fn set_space(&mut self, definition: SpaceDefinition) -> ApResult<()>;

    fn next_candidates(&mut self, request: &ProposalRequest<'_>)
        -> ApResult<Vec<PipelineCandidate>>;
}

fn require_space<'a>(
    space: &'a Option<Arc<SearchSpace>>,
    optimizer: &str,
) -> ApResult<&'a Arc<SearchSpace>> {
    space.as_ref().ok_or_else(|| {
        SearchError::Optimizer {
            optimizer: optimizer.to_string(),
            message: SearchError::SpaceNotDefined.to_string(),
        }
        .into()
    })
}

fn with_values(learner: &LearnerSpec, values: &ParameterSet) -> ApResult<LearnerSpec> {
    let mut learner = learner.clone();
    learner.hyperparameters.reset();
    learner.hyperparameters.apply(values)?;
    Ok(learner)
}

// ---- Defaults ----

/// Every learner once with default hyperparameters and every transform.
#[derive(Debug, Default)]
pub struct DefaultsOptimizer {
    space: Option<Arc<SearchSpace>>,
    cursor: usize,
}

impl DefaultsOptimizer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PipelineOptimizer for DefaultsOptimizer {
    fn name(&self) -> &str {
        "defaults"
    }

    fn set_space(&mut self, definition: SpaceDefinition) -> ApResult<()> {
        self.space = Some(definition.space);
        self.cursor = 0;
        Ok(())
    }

    fn next_candidates(
        &mut self,
        request: &ProposalRequest<'_>,
    ) -> ApResult<Vec<PipelineCandidate>> {
        let space = require_space(&self.space, "defaults")?.clone();
        let mut batch = Vec::new();
        while batch.len() < request.batch_size && self.cursor < space.learners.len() {
            let learner = &space.learners[self.cursor];
            self.cursor += 1;
            let candidate = space.compose(&space.transforms, learner, request.roles)?;
            if !request.is_known(&candidate.signature()) {
                batch.push(candidate);
            }
        }
        Ok(batch)
    }
}

// ---- Grid ----

/// Learner × hyperparameter grid with every transform, walked in order.
#[derive(Debug)]
pub struct GridOptimizer {
    grid_steps: usize,
    space: Option<Arc<SearchSpace>>,
    combos: Vec<(usize, ParameterSet)>,
    cursor: usize,
}

impl GridOptimizer {
    pub fn new(grid_steps: usize) -> Self {
        Self {
            grid_steps,
            space: None,
            combos: Vec::new(),
            cursor: 0,
        }
    }

    pub fn grid_size(&self) -> usize {
        self.combos.len()
    }
}

impl PipelineOptimizer for GridOptimizer {
    fn name(&self) -> &str {
        "grid"
    }

    fn set_space(&mut self, definition: SpaceDefinition) -> ApResult<()> {
        self.combos = definition
            .space
            .learners
            .iter()
            .enumerate()
            .flat_map(|(idx, learner)| {
                parameter_grid(&learner.hyperparameters, self.grid_steps)
                    .into_iter()
                    .map(move |combo| (idx, combo))
            })
            .collect();
        debug!("Grid holds {} combinations", self.combos.len());
        self.space = Some(definition.space);
        self.cursor = 0;
        Ok(())
    }

    fn next_candidates(
        &mut self,
        request: &ProposalRequest<'_>,
    ) -> ApResult<Vec<PipelineCandidate>> {
        let space = require_space(&self.space, "grid")?.clone();
        let mut batch = Vec::new();
        while batch.len() < request.batch_size && self.cursor < self.combos.len() {
            let (learner_idx, values) = &self.combos[self.cursor];
            self.cursor += 1;
            let learner = with_values(&space.learners[*learner_idx], values)?;
            let candidate = space.compose(&space.transforms, &learner, request.roles)?;
            if !request.is_known(&candidate.signature()) {
                batch.push(candidate);
            }
        }
        Ok(batch)
    }
}

// ---- Random ----

/// Default number of draws per batch slot before giving up on finding an
/// unseen configuration.
pub const DEFAULT_RETRIES: usize = 10;

/// Random learner, random hyperparameters and a random subset of atomic
/// transform groups.
#[derive(Debug)]
pub struct RandomOptimizer {
    rng: ChaCha8Rng,
    retries: usize,
    space: Option<Arc<SearchSpace>>,
}

impl RandomOptimizer {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            retries: DEFAULT_RETRIES,
            space: None,
        }
    }

    pub fn with_retries(mut self, retries: usize) -> Self {
        self.retries = retries.max(1);
        self
    }

    fn sample(&mut self, space: &SearchSpace, roles: &DataRoles) -> ApResult<PipelineCandidate> {
        let learner = &space.learners[self.rng.gen_range(0..space.learners.len())];
        let values = sample_parameters(&learner.hyperparameters, &mut self.rng);
        let learner = with_values(learner, &values)?;

        let mut mask = 0u64;
        for group in space.atomic_groups() {
            if self.rng.gen_bool(0.5) {
                mask |= 1u64 << group;
            }
        }
        let selected = space.bitmask_to_transforms(mask);
        space.compose(&selected, &learner, roles)
    }

    /// Fill `batch` up to `request.batch_size` with unseen configurations.
    fn fill(
        &mut self,
        space: &SearchSpace,
        request: &ProposalRequest<'_>,
        batch: &mut Vec<PipelineCandidate>,
    ) -> ApResult<()> {
        let slots = request.batch_size.saturating_sub(batch.len());
        for _ in 0..slots {
            for _ in 0..self.retries {
                let candidate = self.sample(space, request.roles)?;
                let signature = candidate.signature();
                if request.is_known(&signature)
                    || batch.iter().any(|c| c.signature() == signature)
                {
                    continue;
                }
                batch.push(candidate);
                break;
            }
        }
        Ok(())
    }
}

impl PipelineOptimizer for RandomOptimizer {
    fn name(&self) -> &str {
        "random"
    }

    fn set_space(&mut self, definition: SpaceDefinition) -> ApResult<()> {
        if definition.space.learners.is_empty() {
            return Err(SearchError::Optimizer {
                optimizer: "random".to_string(),
                message: "space has no learners".to_string(),
            }
            .into());
        }
        self.space = Some(definition.space);
        Ok(())
    }

    fn next_candidates(
        &mut self,
        request: &ProposalRequest<'_>,
    ) -> ApResult<Vec<PipelineCandidate>> {
        let space = require_space(&self.space, "random")?.clone();
        let mut batch = Vec::with_capacity(request.batch_size);
        self.fill(&space, request, &mut batch)?;
        Ok(batch)
    }
}

// ---- Explore / exploit ----

/// Explores randomly with probability `exploration_weight`, otherwise
/// perturbs the hyperparameters of the best candidate so far.
#[derive(Debug)]
pub struct ExploitOptimizer {
    exploration_weight: f64,
    explorer: RandomOptimizer,
    rng: ChaCha8Rng,
}

impl ExploitOptimizer {
    pub fn new(seed: u64, exploration_weight: f64) -> Self {
        Self {
            exploration_weight: exploration_weight.clamp(0.0, 1.0),
            explorer: RandomOptimizer::new(seed),
            rng: ChaCha8Rng::seed_from_u64(seed.wrapping_add(1)),
        }
    }

    fn exploit(&mut self, best: &PipelineCandidate) -> ApResult<PipelineCandidate> {
        let values = perturb_parameters(&best.learner.hyperparameters, &mut self.rng);
        let learner = with_values(&best.learner, &values)?;
        Ok(PipelineCandidate::new(&best.transforms, &learner))
    }
}

impl PipelineOptimizer for ExploitOptimizer {
    fn name(&self) -> &str {
        "exploit"
    }

    fn set_space(&mut self, definition: SpaceDefinition) -> ApResult<()> {
        self.explorer.set_space(definition)
    }

    fn next_candidates(
        &mut self,
        request: &ProposalRequest<'_>,
    ) -> ApResult<Vec<PipelineCandidate>> {
        let space = require_space(&self.explorer.space, "exploit")?.clone();
        let mut batch: Vec<PipelineCandidate> = Vec::with_capacity(request.batch_size);

        if let Some(best) = request.history.first() {
            let slots = request.batch_size;
            for _ in 0..slots {
                if self.rng.gen::<f64>() < self.exploration_weight {
                    continue;
                }
                for _ in 0..self.explorer.retries {
                    let candidate = self.exploit(best)?;
                    let signature = candidate.signature();
                    if request.is_known(&signature)
                        || batch.iter().any(|c| c.signature() == signature)
                    {
                        continue;
                    }
                    batch.push(candidate);
                    break;
                }
            }
        }

        // Remaining slots explore.
        self.explorer.fill(&space, request, &mut batch)?;
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::RunSummary;
    use crate::space::SearchSpaceBuilder;
    use ap_engine::standard_context;
    use ap_types::{Table, TaskKind};

    fn definition(task: TaskKind) -> SpaceDefinition {
        let context = standard_context(task, DataRoles::default());
        let train = Table::from_numeric(
            &["x", "Label"],
            (0..10).map(|i| vec![i as f64, (i % 2) as f64]).collect(),
        )
        .unwrap()
        .into_handle();
        let space = SearchSpaceBuilder::new(&context).build(&train, 1).unwrap();
        SpaceDefinition {
            space: Arc::new(space),
            transformed_sample: train.clone(),
            train,
            is_maximizing: true,
        }
    }

    fn request<'a>(
        history: &'a [PipelineCandidate],
        failed: &'a HashSet<String>,
        roles: &'a DataRoles,
        batch_size: usize,
    ) -> ProposalRequest<'a> {
        ProposalRequest {
            history,
            batch_size,
            roles,
            failed,
        }
    }

    #[test]
    fn proposal_before_space_fails() {
        let roles = DataRoles::default();
        let failed = HashSet::new();
        let mut optimizer = DefaultsOptimizer::new();
        assert!(optimizer
            .next_candidates(&request(&[], &failed, &roles, 1))
            .is_err());
    }

    #[test]
    fn defaults_exhaust_after_each_learner() {
        let roles = DataRoles::default();
        let failed = HashSet::new();
        let mut optimizer = DefaultsOptimizer::new();
        optimizer.set_space(definition(TaskKind::Regression)).unwrap();

        let first = optimizer
            .next_candidates(&request(&[], &failed, &roles, 5))
            .unwrap();
        assert_eq!(first.len(), 2);
        assert!(first
            .iter()
            .all(|c| c.transforms.last().unwrap().id.starts_with("ColumnConcat")));
        assert!(optimizer
            .next_candidates(&request(&[], &failed, &roles, 5))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn defaults_skip_failed_configurations() {
        let roles = DataRoles::default();
        let mut optimizer = DefaultsOptimizer::new();
        optimizer.set_space(definition(TaskKind::Regression)).unwrap();
        let mut probe = DefaultsOptimizer::new();
        probe.set_space(definition(TaskKind::Regression)).unwrap();
        let none = HashSet::new();
        let first = probe
            .next_candidates(&request(&[], &none, &roles, 1))
            .unwrap();

        let failed: HashSet<String> = first.iter().map(|c| c.signature()).collect();
        let batch = optimizer
            .next_candidates(&request(&[], &failed, &roles, 5))
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert_ne!(batch[0].signature(), first[0].signature());
    }

    #[test]
    fn grid_walks_every_combination_once() {
        let roles = DataRoles::default();
        let failed = HashSet::new();
        let mut optimizer = GridOptimizer::new(2);
        optimizer
            .set_space(definition(TaskKind::BinaryClassification))
            .unwrap();
        let total = optimizer.grid_size();
        assert!(total > 0);

        let mut seen = HashSet::new();
        loop {
            let batch = optimizer
                .next_candidates(&request(&[], &failed, &roles, 7))
                .unwrap();
            if batch.is_empty() {
                break;
            }
            for candidate in batch {
                assert!(seen.insert(candidate.signature()));
            }
        }
        assert!(seen.len() <= total);
    }

    #[test]
    fn random_avoids_duplicates_in_batch() {
        let roles = DataRoles::default();
        let failed = HashSet::new();
        let mut optimizer = RandomOptimizer::new(11);
        optimizer
            .set_space(definition(TaskKind::BinaryClassification))
            .unwrap();
        let batch = optimizer
            .next_candidates(&request(&[], &failed, &roles, 6))
            .unwrap();
        let signatures: HashSet<String> = batch.iter().map(|c| c.signature()).collect();
        assert_eq!(signatures.len(), batch.len());
    }

    #[test]
    fn random_is_reproducible_for_a_seed() {
        let roles = DataRoles::default();
        let failed = HashSet::new();
        let run = || {
            let mut optimizer = RandomOptimizer::new(5);
            optimizer.set_space(definition(TaskKind::Regression)).unwrap();
            optimizer
                .next_candidates(&request(&[], &failed, &roles, 3))
                .unwrap()
                .iter()
                .map(|c| c.signature())
                .collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn exploit_perturbs_the_best_learner() {
        let roles = DataRoles::default();
        let failed = HashSet::new();
        let definition = definition(TaskKind::Regression);
        let space = definition.space.clone();
        let mut optimizer = ExploitOptimizer::new(1, 0.0);
        optimizer.set_space(definition).unwrap();

        let learner = space.learner("SgdRegressor").unwrap();
        let mut best = space.compose(&space.transforms, learner, &roles).unwrap();
        best.summary = Some(RunSummary {
            metric_value: 0.8,
            rows_used: 10,
            elapsed_ms: 1,
        });
        let history = vec![best];
        let batch = optimizer
            .next_candidates(&request(&history, &failed, &roles, 3))
            .unwrap();
        assert!(!batch.is_empty());
        assert!(batch.iter().all(|c| c.learner.name == "SgdRegressor"));
        assert!(batch.iter().all(|c| c.signature() != history[0].signature()));
    }
}
