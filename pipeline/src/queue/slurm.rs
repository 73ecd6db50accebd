//! SLURM adapter
//!
//! Submits jobs with `sbatch --parsable`, either directly or through
//! `ssh <host>` when the controller is remote, and queries job state with
//! `squeue`/`sacct` for run status reports.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

use super::{JobId, JobQueue, JobSpec};
use crate::error::{PipelineError, PipelineResult};

/// Error types for SLURM operations
#[derive(Debug, Error)]
pub enum SlurmError {
    #[error("SLURM command failed: {0}")]
    CommandFailed(String),

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(String),
}

/// SLURM job state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobState {
    Pending,
    Running,
    Completing,
    Completed,
    Failed,
    Cancelled,
    Timeout,
    NodeFail,
    OutOfMemory,
    Preempted,
    Suspended,
    Unknown,
}

impl From<&str> for JobState {
    fn from(s: &str) -> Self {
        // sacct reports e.g. "CANCELLED by 1000"
        let head = s.split_whitespace().next().unwrap_or("");
        match head.to_uppercase().as_str() {
            "PENDING" | "PD" => Self::Pending,
            "RUNNING" | "R" => Self::Running,
            "COMPLETING" | "CG" => Self::Completing,
            "COMPLETED" | "CD" => Self::Completed,
            "FAILED" | "F" => Self::Failed,
            "CANCELLED" | "CA" => Self::Cancelled,
            "TIMEOUT" | "TO" => Self::Timeout,
            "NODE_FAIL" | "NF" => Self::NodeFail,
            "OUT_OF_MEMORY" | "OOM" => Self::OutOfMemory,
            "PREEMPTED" | "PR" => Self::Preempted,
            "SUSPENDED" | "S" => Self::Suspended,
            _ => Self::Unknown,
        }
    }
}

impl JobState {
    /// Whether an `afterany` dependency on this job is satisfied
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed
                | Self::Failed
                | Self::Cancelled
                | Self::Timeout
                | Self::NodeFail
                | Self::OutOfMemory
        )
    }
}

/// Native SLURM queue
#[derive(Debug, Clone, Default)]
pub struct SlurmQueue {
    /// SSH host for the SLURM controller (None = local commands)
    host: Option<String>,
}

impl SlurmQueue {
    pub fn new(host: Option<String>) -> Self {
        Self { host }
    }

    /// Run a SLURM command, optionally via SSH
    pub(crate) async fn run_slurm_cmd(&self, cmd: &str, args: &[String]) -> Result<String, SlurmError> {
        let output = if let Some(ref host) = self.host {
            let full_cmd = shlex::try_join(
                std::iter::once(cmd).chain(args.iter().map(String::as_str)),
            )
            .map_err(|e| SlurmError::CommandFailed(format!("cannot quote command: {}", e)))?;
            Command::new("ssh").args([host.as_str(), &full_cmd]).output().await?
        } else {
            Command::new(cmd).args(args).output().await?
        };

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            Err(SlurmError::CommandFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }

    /// Submit `sbatch --parsable` with extra arguments and parse the job id
    pub(crate) async fn sbatch(&self, args: Vec<String>) -> Result<JobId, SlurmError> {
        let output = self.run_slurm_cmd("sbatch", &args).await?;
        parse_job_id(&output)
    }

    /// Current state of a job, falling back to accounting once it left the queue
    pub async fn job_state(&self, job_id: JobId) -> Result<JobState, SlurmError> {
        let output = self
            .run_slurm_cmd(
                "squeue",
                &[
                    "-j".into(),
                    job_id.to_string(),
                    "-o".into(),
                    "%T".into(),
                    "--noheader".into(),
                ],
            )
            .await;

        // squeue errors on ids that have already been purged from the queue
        if let Ok(out) = output {
            if let Some(line) = out.lines().map(str::trim).find(|l| !l.is_empty()) {
                return Ok(JobState::from(line));
            }
        }

        let output = self
            .run_slurm_cmd(
                "sacct",
                &[
                    "-j".into(),
                    job_id.to_string(),
                    "-o".into(),
                    "JobID,State".into(),
                    "--noheader".into(),
                    "-P".into(),
                ],
            )
            .await?;

        parse_sacct_state(&output, job_id)
    }
}

/// `--parsable` prints `<id>` or `<id>;<cluster>`
pub(crate) fn parse_job_id(output: &str) -> Result<JobId, SlurmError> {
    output
        .trim()
        .split(';')
        .next()
        .and_then(|s| s.trim().parse::<u32>().ok())
        .map(JobId)
        .ok_or_else(|| SlurmError::Parse(format!("Failed to parse job ID from: {}", output)))
}

/// Pick the allocation line (no `.batch`/`.extern` step suffix).
/// Array jobs report one line per task; the worst non-terminal state wins.
fn parse_sacct_state(output: &str, job_id: JobId) -> Result<JobState, SlurmError> {
    let states: Vec<JobState> = output
        .lines()
        .filter_map(|l| l.split_once('|'))
        .filter(|(id, _)| !id.contains('.'))
        .map(|(_, state)| JobState::from(state))
        .collect();

    if states.is_empty() {
        return Err(SlurmError::JobNotFound(job_id));
    }
    Ok(states
        .iter()
        .find(|s| !s.is_terminal())
        .cloned()
        .unwrap_or_else(|| states[0].clone()))
}

/// `sbatch` flags for a spec; the payload goes through `--wrap`
pub(crate) fn directives(spec: &JobSpec) -> Vec<String> {
    let mut args = vec![
        format!("--job-name={}", spec.name),
        format!("--cpus-per-task={}", spec.cpus),
        format!("--time={}", spec.time_limit),
        format!("--output={}", spec.output.display()),
        format!("--error={}", spec.error.display()),
    ];
    if let Some(array) = spec.array {
        args.push(format!("--array={}", array.to_slurm()));
    }
    if let Some(ref partition) = spec.partition {
        args.push(format!("--partition={}", partition));
    }
    if let Some(ref dep) = spec.dependency {
        args.push(format!("--dependency={}", dep.to_slurm()));
    }
    args
}

pub(crate) fn sbatch_args(spec: &JobSpec) -> PipelineResult<Vec<String>> {
    let mut args = vec!["--parsable".to_string()];
    args.extend(directives(spec));
    args.push(format!("--wrap={}", spec.render_command()?));
    Ok(args)
}

#[async_trait]
impl JobQueue for SlurmQueue {
    async fn submit(&self, spec: &JobSpec) -> PipelineResult<JobId> {
        let args = sbatch_args(spec)?;
        debug!(job = %spec.name, ?args, "sbatch");
        let job_id = self
            .sbatch(args)
            .await
            .map_err(|e| PipelineError::submission(&spec.name, e.to_string()))?;
        info!(job = %spec.name, %job_id, "Submitted SLURM job");
        Ok(job_id)
    }

    fn name(&self) -> &'static str {
        "slurm"
    }
}
