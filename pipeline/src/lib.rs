//! Interpretability Pipeline Library
//!
//! This library provides:
//! - Block partitioning of a dataset and per-block dispatch to a cluster queue
//! - An `afterany` dependency chain that runs merge and finalize once every
//!   block job has ended, however it ended
//! - Consensus reducers combining global and local attribution tables
//! - A weighted voting ensemble over independently trained base models
//!
//! # Flow
//!
//! ```text
//! snapshot ─▶ partition ─▶ dispatch (M methods × K blocks)
//!                               │ afterany
//!                               ▼
//!                             merge ─▶ consensus ─▶ finalize
//! ```
//!
//! # Queues
//!
//! - [`SlurmQueue`]: `sbatch --parsable --wrap`, locally or over `ssh`
//! - [`ScriptQueue`]: one `#SBATCH` script per job
//! - [`InProcessQueue`]: synchronous local execution, used by tests

#![allow(clippy::uninlined_format_args)]

pub mod attribution;
pub mod config;
pub mod consensus;
pub mod dispatch;
pub mod ensemble;
pub mod error;
pub mod merge;
pub mod partition;
pub mod queue;
pub mod snapshot;
pub mod worker;

// Re-export error types
pub use error::{PipelineError, PipelineResult};

// Re-export configuration types
pub use config::{DispatchMode, JobResources, PipelineConfig, SubmissionLayout};

// Re-export dispatch types
pub use dispatch::{DispatchRun, Dispatcher};
pub use partition::{partition, BlockRange};
pub use snapshot::{snapshot_path, ContextSnapshot, SnapshotWrite};

// Re-export queue types
pub use queue::{
    Dependency, DependencyMode, InProcessQueue, JobId, JobQueue, JobRunner, JobSpec, JobState,
    ProcessRunner, ScriptQueue, SlurmQueue,
};

// Re-export merge and consensus types
pub use attribution::{aggregate_global, block_output_path, AttributionRecord, GlobalAttribution};
pub use consensus::{AttributionRow, ConsensusReducer, ConsensusRow, ReducerKind};
pub use merge::{collect_block_outputs, finalize_run, merge_run, MergeReport, RunSummary};
pub use worker::{run_block, BlockExplainer, BlockTask};

// Re-export ensemble types
pub use ensemble::{
    BaseModel, FeatureFrame, Predictor, ProbabilisticPredictor, TaskMode, WeightedVotingEnsemble,
};
