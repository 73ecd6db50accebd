//! In-process queue
//!
//! Runs every job to completion inside `submit`, on tokio's blocking pool so
//! the runtime stays responsive, so by the time a
//! dependent job is submitted all of its dependencies are already in a
//! terminal state. A failing job is recorded as failed and still gets an
//! id, mirroring a cluster where the job ran and exited non-zero.

use std::collections::HashSet;
use std::fs::File;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use super::{JobId, JobQueue, JobSpec};
use crate::error::{PipelineError, PipelineResult};

/// Executes one job (or one array task) to completion
pub trait JobRunner: Send + Sync {
    fn run(&self, spec: &JobSpec, array_index: Option<u32>) -> anyhow::Result<()>;
}

impl<F> JobRunner for F
where
    F: Fn(&JobSpec, Option<u32>) -> anyhow::Result<()> + Send + Sync,
{
    fn run(&self, spec: &JobSpec, array_index: Option<u32>) -> anyhow::Result<()> {
        self(spec, array_index)
    }
}

/// Runs the job's command as a child process, appending stdout/stderr to
/// the spec's sinks
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner;

impl JobRunner for ProcessRunner {
    fn run(&self, spec: &JobSpec, array_index: Option<u32>) -> anyhow::Result<()> {
        let open = |path: &std::path::Path| -> anyhow::Result<File> {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("cannot open job sink {}", path.display()))
        };

        let mut cmd = Command::new(&spec.program);
        cmd.args(spec.args_for_task(array_index))
            .stdin(Stdio::null())
            .stdout(open(&spec.output)?)
            .stderr(open(&spec.error)?);
        if let Some(i) = array_index {
            cmd.env("SLURM_ARRAY_TASK_ID", i.to_string());
        }

        let status = cmd
            .status()
            .with_context(|| format!("cannot start '{}'", spec.program))?;
        if !status.success() {
            bail!("'{}' exited with {}", spec.program, status);
        }
        Ok(())
    }
}

/// Terminal state of a job run in-process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    Completed,
    Failed,
}

#[derive(Default)]
struct LocalState {
    next_id: u32,
    known: HashSet<JobId>,
    submitted: Vec<(JobId, JobSpec, JobOutcome)>,
}

pub struct InProcessQueue {
    runner: Arc<dyn JobRunner>,
    state: Mutex<LocalState>,
}

impl InProcessQueue {
    pub fn new(runner: impl JobRunner + 'static) -> Self {
        Self {
            runner: Arc::new(runner),
            state: Mutex::new(LocalState {
                next_id: 1,
                ..Default::default()
            }),
        }
    }

    /// Every submitted job in submission order
    pub fn submitted(&self) -> Vec<(JobId, JobSpec, JobOutcome)> {
        self.state
            .lock()
            .map(|s| s.submitted.clone())
            .unwrap_or_default()
    }
}

fn execute(runner: &dyn JobRunner, spec: &JobSpec) -> JobOutcome {
    let tasks: Vec<Option<u32>> = match spec.array {
        Some(range) => range.indices().map(Some).collect(),
        None => vec![None],
    };

    let mut outcome = JobOutcome::Completed;
    for task in tasks {
        if let Err(e) = runner.run(spec, task) {
            error!(job = %spec.name, task = ?task, "In-process job failed: {:#}", e);
            outcome = JobOutcome::Failed;
        }
    }
    outcome
}

#[async_trait]
impl JobQueue for InProcessQueue {
    async fn submit(&self, spec: &JobSpec) -> PipelineResult<JobId> {
        {
            let state = self
                .state
                .lock()
                .map_err(|_| PipelineError::submission(&spec.name, "queue state lock poisoned"))?;
            if let Some(ref dep) = spec.dependency {
                if let Some(unknown) = dep.on.iter().find(|id| !state.known.contains(id)) {
                    return Err(PipelineError::submission(
                        &spec.name,
                        format!("dependency on unknown job {}", unknown),
                    ));
                }
            }
        }

        // every dependency already ran to a terminal state inside its own submit()
        debug!(job = %spec.name, "Running job in-process");
        let runner = Arc::clone(&self.runner);
        let job = spec.clone();
        let outcome = tokio::task::spawn_blocking(move || execute(runner.as_ref(), &job))
            .await
            .map_err(|e| PipelineError::submission(&spec.name, format!("job task aborted: {}", e)))?;

        let mut state = self
            .state
            .lock()
            .map_err(|_| PipelineError::submission(&spec.name, "queue state lock poisoned"))?;
        let job_id = JobId(state.next_id);
        state.next_id += 1;
        state.known.insert(job_id);
        state.submitted.push((job_id, spec.clone(), outcome));
        info!(job = %spec.name, %job_id, ?outcome, "In-process job finished");
        Ok(job_id)
    }

    fn name(&self) -> &'static str {
        "in_process"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{test_spec, ArrayRange, Dependency};
    use std::sync::mpsc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_sequential_ids_and_outcomes() {
        let queue = InProcessQueue::new(|spec: &JobSpec, _task: Option<u32>| -> anyhow::Result<()> {
            if spec.name == "bad" {
                anyhow::bail!("boom");
            }
            Ok(())
        });

        let a = queue.submit(&test_spec("good")).await.unwrap();
        let b = queue.submit(&test_spec("bad")).await.unwrap();
        assert_eq!((a, b), (JobId(1), JobId(2)));

        let submitted = queue.submitted();
        assert_eq!(submitted[0].2, JobOutcome::Completed);
        assert_eq!(submitted[1].2, JobOutcome::Failed);
    }

    #[tokio::test]
    async fn test_unknown_dependency_rejected() {
        let queue = InProcessQueue::new(|_: &JobSpec, _: Option<u32>| -> anyhow::Result<()> { Ok(()) });
        let mut spec = test_spec("merge");
        spec.dependency = Some(Dependency::after_any(vec![JobId(99)]));

        let err = queue.submit(&spec).await.unwrap_err();
        assert!(matches!(err, PipelineError::SubmissionError { .. }));
        assert!(queue.submitted().is_empty());
    }

    #[tokio::test]
    async fn test_array_job_runs_every_task() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let queue = InProcessQueue::new(move |_: &JobSpec, task: Option<u32>| -> anyhow::Result<()> {
            sink.lock().unwrap().push(task);
            Ok(())
        });

        let mut spec = test_spec("array");
        spec.array = Some(ArrayRange { start: 0, end: 2 });
        queue.submit(&spec).await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![Some(0), Some(1), Some(2)]);
    }

    #[tokio::test]
    async fn test_blocking_job_does_not_stall_runtime() {
        let (tx, rx) = mpsc::channel::<()>();
        let rx = Mutex::new(rx);
        let queue = InProcessQueue::new(move |_: &JobSpec, _: Option<u32>| -> anyhow::Result<()> {
            // waits for a task on the (single-threaded) test runtime
            rx.lock()
                .map_err(|_| anyhow::anyhow!("poisoned"))?
                .recv_timeout(Duration::from_secs(5))?;
            Ok(())
        });

        tokio::spawn(async move {
            let _ = tx.send(());
        });
        queue.submit(&test_spec("wait")).await.unwrap();
        assert_eq!(queue.submitted()[0].2, JobOutcome::Completed);
    }

    #[cfg(unix)]
    #[test]
    fn test_process_runner_writes_sinks() {
        let dir = tempfile::tempdir().unwrap();
        let mut spec = test_spec("echo");
        spec.program = "sh".into();
        spec.args = vec!["-c".into(), "echo task=$SLURM_ARRAY_TASK_ID".into()];
        spec.output = dir.path().join("logs/echo.out");
        spec.error = dir.path().join("logs/echo.err");

        ProcessRunner.run(&spec, Some(3)).unwrap();
        let out = std::fs::read_to_string(&spec.output).unwrap();
        assert_eq!(out.trim(), "task=3");

        spec.args = vec!["-c".into(), "exit 4".into()];
        assert!(ProcessRunner.run(&spec, None).is_err());
    }
}
