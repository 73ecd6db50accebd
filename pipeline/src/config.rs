//! Pipeline configuration
//!
//! Values resolve in three layers: built-in defaults, then `INTERP_*`
//! environment variables, then an optional TOML file. The CLI applies its
//! flags on top and calls [`PipelineConfig::validate`] last.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::consensus::ReducerKind;
use crate::error::{PipelineError, PipelineResult};

/// Default number of samples per block
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// How jobs reach the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// `sbatch --wrap` with native `--dependency` chains
    Native,
    /// One self-contained batch script per job
    Script,
    /// Run every job synchronously on this machine
    InProcess,
}

impl FromStr for DispatchMode {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "native" | "slurm" => Ok(Self::Native),
            "script" | "scripts" => Ok(Self::Script),
            "in_process" | "in-process" | "local" => Ok(Self::InProcess),
            other => Err(PipelineError::config(format!(
                "unknown dispatch mode '{}'",
                other
            ))),
        }
    }
}

/// How (method, block) pairs map onto queue jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionLayout {
    /// One job per (method, block) pair
    PerBlock,
    /// One array job per method, one array task per block
    ArrayPerMethod,
}

impl FromStr for SubmissionLayout {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "per_block" | "per-block" | "block" => Ok(Self::PerBlock),
            "array_per_method" | "array-per-method" | "array" => Ok(Self::ArrayPerMethod),
            other => Err(PipelineError::config(format!(
                "unknown submission layout '{}'",
                other
            ))),
        }
    }
}

/// Resource request for one class of jobs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResources {
    /// CPUs per task
    pub cpus: u32,
    /// Wall-clock limit in SLURM `HH:MM:SS` form
    pub time_limit: String,
}

/// Configuration for a dispatch/merge run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Samples per block
    pub batch_size: usize,

    /// Folder receiving job stdout/stderr and generated scripts
    pub job_folder: PathBuf,

    /// Prefix for queue job names
    pub job_prefix: String,

    /// Resources for block jobs
    pub block: JobResources,

    /// Resources for merge and finalize jobs
    pub merge: JobResources,

    /// Entry point computing one block's attributions
    pub worker_program: String,

    /// This pipeline's own CLI, invoked by merge/finalize jobs
    pub program: String,

    /// Submission mechanism
    pub dispatch_mode: DispatchMode,

    /// Job layout
    pub submit_layout: SubmissionLayout,

    /// SSH host for the SLURM controller (None = run locally)
    pub slurm_host: Option<String>,

    /// SLURM partition, if the cluster needs one
    pub partition: Option<String>,

    /// Reducer applied by the merge step
    pub reducer: ReducerKind,

    /// Lower bound for rescaled values in the geometric reducer (off when None)
    pub consensus_floor: Option<f64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: env_parse("INTERP_BATCH_SIZE").unwrap_or(DEFAULT_BATCH_SIZE),
            job_folder: std::env::var("INTERP_JOB_FOLDER")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("jobs")),
            job_prefix: std::env::var("INTERP_JOB_PREFIX").unwrap_or_else(|_| "INTERP".into()),
            block: JobResources {
                cpus: env_parse("INTERP_BLOCK_CPUS").unwrap_or(2),
                time_limit: std::env::var("INTERP_BLOCK_TIME")
                    .unwrap_or_else(|_| "72:00:00".into()),
            },
            merge: JobResources {
                cpus: env_parse("INTERP_MERGE_CPUS").unwrap_or(1),
                time_limit: std::env::var("INTERP_MERGE_TIME")
                    .unwrap_or_else(|_| "2:00:00".into()),
            },
            worker_program: std::env::var("INTERP_WORKER_PROGRAM")
                .unwrap_or_else(|_| "interp-worker".into()),
            program: std::env::var("INTERP_PROGRAM").unwrap_or_else(|_| "interp".into()),
            dispatch_mode: env_parse("INTERP_DISPATCH_MODE").unwrap_or(DispatchMode::Native),
            submit_layout: env_parse("INTERP_SUBMIT_LAYOUT")
                .unwrap_or(SubmissionLayout::PerBlock),
            // SLURM_HOST: empty or "local" means run sbatch directly
            slurm_host: std::env::var("SLURM_HOST")
                .ok()
                .filter(|s| !s.is_empty() && s != "local"),
            partition: std::env::var("INTERP_PARTITION")
                .ok()
                .filter(|s| !s.is_empty()),
            reducer: env_parse("INTERP_REDUCER").unwrap_or(ReducerKind::AverageMean),
            consensus_floor: env_parse("INTERP_CONSENSUS_FLOOR"),
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

impl PipelineConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        Self::default()
    }

    /// Load a TOML file; keys it omits fall back to the environment/defaults
    pub fn from_toml_file(path: &Path) -> PipelineResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config: PipelineConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Check invariants the dispatcher relies on
    pub fn validate(&self) -> PipelineResult<()> {
        if self.batch_size == 0 {
            return Err(PipelineError::config("batch_size must be greater than 0"));
        }
        if self.block.cpus == 0 || self.merge.cpus == 0 {
            return Err(PipelineError::config("cpu count must be greater than 0"));
        }
        for limit in [&self.block.time_limit, &self.merge.time_limit] {
            if !is_valid_time_limit(limit) {
                return Err(PipelineError::config(format!(
                    "invalid wall-clock limit '{}', expected [D-]HH:MM:SS",
                    limit
                )));
            }
        }
        if self.worker_program.trim().is_empty() || self.program.trim().is_empty() {
            return Err(PipelineError::config("program names must not be empty"));
        }
        if let Some(floor) = self.consensus_floor {
            if !(floor > 0.0 && floor <= 1.0) {
                return Err(PipelineError::config(format!(
                    "consensus_floor must be in (0, 1], got {}",
                    floor
                )));
            }
        }
        Ok(())
    }
}

/// Accepts `HH:MM:SS`, `MM:SS` and `D-HH:MM:SS`
fn is_valid_time_limit(limit: &str) -> bool {
    let clock = match limit.split_once('-') {
        Some((days, rest)) => {
            if days.is_empty() || !days.chars().all(|c| c.is_ascii_digit()) {
                return false;
            }
            rest
        }
        None => limit,
    };
    let parts: Vec<&str> = clock.split(':').collect();
    (2..=3).contains(&parts.len())
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
}
