//! Pipeline search for AutoPipe.
//!
//! A [`SearchState`] infers a [`SearchSpace`] of transforms and learners,
//! asks a pluggable [`PipelineOptimizer`] for candidate batches, trains and
//! scores each [`PipelineCandidate`], and keeps a ranked history until its
//! [`Terminator`] says stop. Progress is published to subscribed
//! [`IterationObserver`]s. [`AutoMlExperiment`] wires all of it from a
//! [`SearchConfig`].

pub mod candidate;
pub mod experiment;
pub mod history;
pub mod notify;
pub mod optimizer;
pub mod space;
pub mod state;
pub mod sweep;
pub mod terminator;

pub use candidate::{CandidateRecord, PipelineCandidate, PipelineModel, RunSummary};
pub use experiment::{AutoMlExperiment, ExperimentResult, SearchConfig, StrategyKind};
pub use history::SearchHistory;
pub use notify::{
    ChannelObserver, IterationFailure, IterationMonitor, IterationObserver, IterationResult,
    IterationResultRecorder, LoggingObserver, SearchEvent,
};
pub use optimizer::{
    DefaultsOptimizer, ExploitOptimizer, GridOptimizer, PipelineOptimizer, ProposalRequest,
    RandomOptimizer, SpaceDefinition,
};
pub use space::{DependencyMap, SearchSpace, SearchSpaceBuilder};
pub use state::{SearchPhase, SearchState, SearchStatus, StopReason};
pub use terminator::{Budget, IterationTerminator, Terminator};
