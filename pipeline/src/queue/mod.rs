//! Typed job queue interface
//!
//! Jobs are described by a [`JobSpec`] and handed to a [`JobQueue`]
//! adapter, which returns the identifier the queue assigned.
//!
//! # Adapters
//!
//! - [`SlurmQueue`]: native `sbatch --wrap` submission with `--dependency`
//! - [`ScriptQueue`]: one self-contained batch script per job
//! - [`InProcessQueue`]: runs each job synchronously at submit time
//!
//! All three accept the same specs and hand out ids in submission order, so
//! the dispatcher and merge scheduling behave identically on top of them.

pub mod local;
pub mod script;
pub mod slurm;

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};

pub use local::{InProcessQueue, JobOutcome, JobRunner, ProcessRunner};
pub use script::ScriptQueue;
pub use slurm::{JobState, SlurmError, SlurmQueue};

/// Shell variable holding the array task index inside a SLURM array job
pub const ARRAY_TASK_ID_VAR: &str = "$SLURM_ARRAY_TASK_ID";

/// Identifier assigned by the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u32);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// When a dependent job may start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyMode {
    /// Every listed job reached a terminal state, success or failure
    AfterAny,
    /// Every listed job completed successfully
    AfterOk,
}

impl DependencyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AfterAny => "afterany",
            Self::AfterOk => "afterok",
        }
    }
}

/// Start condition of a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub mode: DependencyMode,
    pub on: Vec<JobId>,
}

impl Dependency {
    pub fn after_any(on: Vec<JobId>) -> Self {
        Self {
            mode: DependencyMode::AfterAny,
            on,
        }
    }

    /// SLURM form, e.g. `afterany:101:102`
    pub fn to_slurm(&self) -> String {
        let mut clause = self.mode.as_str().to_string();
        for id in &self.on {
            clause.push(':');
            clause.push_str(&id.to_string());
        }
        clause
    }
}

/// Inclusive array task range, SLURM `--array=start-end`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrayRange {
    pub start: u32,
    pub end: u32,
}

impl ArrayRange {
    pub fn indices(&self) -> impl Iterator<Item = u32> {
        self.start..=self.end
    }

    pub fn to_slurm(&self) -> String {
        format!("{}-{}", self.start, self.end)
    }
}

/// Job descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub array: Option<ArrayRange>,
    pub cpus: u32,
    pub time_limit: String,
    pub output: PathBuf,
    pub error: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dependency: Option<Dependency>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partition: Option<String>,
}

impl JobSpec {
    /// Shell command line for the payload.
    ///
    /// Every token is quoted except [`ARRAY_TASK_ID_VAR`], which must stay
    /// expandable.
    pub fn render_command(&self) -> PipelineResult<String> {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        for token in std::iter::once(&self.program).chain(self.args.iter()) {
            if token == ARRAY_TASK_ID_VAR {
                parts.push(format!("\"{}\"", ARRAY_TASK_ID_VAR));
                continue;
            }
            let quoted = shlex::try_quote(token).map_err(|e| {
                PipelineError::submission(&self.name, format!("cannot quote '{}': {}", token, e))
            })?;
            parts.push(quoted.into_owned());
        }
        Ok(parts.join(" "))
    }

    /// Arguments with the array placeholder replaced by a concrete index
    pub fn args_for_task(&self, array_index: Option<u32>) -> Vec<String> {
        self.args
            .iter()
            .map(|a| match (a.as_str(), array_index) {
                (ARRAY_TASK_ID_VAR, Some(i)) => i.to_string(),
                _ => a.clone(),
            })
            .collect()
    }
}

/// A cluster job queue
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Submit a job and return the id the queue assigned
    async fn submit(&self, spec: &JobSpec) -> PipelineResult<JobId>;

    /// Adapter name for logs
    fn name(&self) -> &'static str;
}

#[cfg(test)]
pub(crate) fn test_spec(name: &str) -> JobSpec {
    JobSpec {
        name: name.to_string(),
        program: "interp-worker".to_string(),
        args: vec!["compute-block".into(), "run_params.bin".into(), "lime".into(), "0".into()],
        array: None,
        cpus: 2,
        time_limit: "72:00:00".to_string(),
        output: PathBuf::from("jobs/lime-0.out"),
        error: PathBuf::from("jobs/lime-0.err"),
        dependency: None,
        partition: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dependency_clause() {
        let dep = Dependency::after_any(vec![JobId(11), JobId(12), JobId(13)]);
        assert_eq!(dep.to_slurm(), "afterany:11:12:13");

        let dep = Dependency {
            mode: DependencyMode::AfterOk,
            on: vec![JobId(7)],
        };
        assert_eq!(dep.to_slurm(), "afterok:7");
    }

    #[test]
    fn test_render_command_quotes_tokens() {
        let mut spec = test_spec("job");
        spec.args[1] = "my runs/params.bin".into();
        let rendered = spec.render_command().unwrap();
        assert!(rendered.starts_with("interp-worker compute-block "));
        assert_eq!(
            shlex::split(&rendered).unwrap(),
            vec!["interp-worker", "compute-block", "my runs/params.bin", "lime", "0"]
        );
    }

    #[test]
    fn test_array_placeholder_left_expandable() {
        let mut spec = test_spec("job");
        spec.args[3] = ARRAY_TASK_ID_VAR.into();
        assert_eq!(
            spec.render_command().unwrap(),
            "interp-worker compute-block run_params.bin lime \"$SLURM_ARRAY_TASK_ID\""
        );
        assert_eq!(spec.args_for_task(Some(4))[3], "4");
        assert_eq!(spec.args_for_task(None)[3], ARRAY_TASK_ID_VAR);
    }

    #[test]
    fn test_array_range() {
        let range = ArrayRange { start: 0, end: 3 };
        assert_eq!(range.to_slurm(), "0-3");
        assert_eq!(range.indices().collect::<Vec<_>>(), vec![0, 1, 2, 3]);
    }
}
