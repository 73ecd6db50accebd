//! Script-per-job adapter
//!
//! Writes each job as a standalone batch script (`#SBATCH` directives
//! followed by the payload command) and submits the script file. Useful on
//! clusters where `--wrap` or command-line dependency flags are not
//! available to the submitting user, and as an on-disk record of exactly
//! what was queued.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info};

use super::slurm::{directives, SlurmQueue};
use super::{JobId, JobQueue, JobSpec};
use crate::error::{PipelineError, PipelineResult};

pub struct ScriptQueue {
    script_dir: PathBuf,
    slurm: SlurmQueue,
}

impl ScriptQueue {
    pub fn new(script_dir: impl Into<PathBuf>, slurm: SlurmQueue) -> Self {
        Self {
            script_dir: script_dir.into(),
            slurm,
        }
    }

    /// Script file for a job name
    pub fn script_path(&self, spec: &JobSpec) -> PathBuf {
        let safe: String = spec
            .name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.script_dir.join(format!("{}.sh", safe))
    }

    /// Write the script for `spec` and return its path
    pub fn write_script(&self, spec: &JobSpec) -> PipelineResult<PathBuf> {
        std::fs::create_dir_all(&self.script_dir)?;
        let path = self.script_path(spec);
        std::fs::write(&path, render_script(spec)?)?;
        set_executable(&path)?;
        debug!(job = %spec.name, path = %path.display(), "Wrote job script");
        Ok(path)
    }
}

/// Full script text
pub fn render_script(spec: &JobSpec) -> PipelineResult<String> {
    let mut script = String::from("#!/bin/bash\n");
    for directive in directives(spec) {
        script.push_str("#SBATCH ");
        script.push_str(&directive);
        script.push('\n');
    }
    script.push('\n');
    script.push_str(&spec.render_command()?);
    script.push('\n');
    Ok(script)
}

#[cfg(unix)]
fn set_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[async_trait]
impl JobQueue for ScriptQueue {
    async fn submit(&self, spec: &JobSpec) -> PipelineResult<JobId> {
        let path = self.write_script(spec)?;
        let job_id = self
            .slurm
            .sbatch(vec!["--parsable".into(), path.display().to_string()])
            .await
            .map_err(|e| PipelineError::submission(&spec.name, e.to_string()))?;
        info!(job = %spec.name, %job_id, script = %path.display(), "Submitted job script");
        Ok(job_id)
    }

    fn name(&self) -> &'static str {
        "script"
    }
}
