//! Block dispatch and dependency scheduling
//!
//! A [`DispatchRun`] owns one run's Job Registry: the ordered list of ids
//! returned by the queue for block jobs. The merge job's `afterany` clause
//! is built positionally from that list, and the finalize job depends on the
//! merge job. Each run has its own `DispatchRun`, so registries never leak
//! between runs sharing a process.
//!
//! The run is also persisted as `{run_prefix}_run.json`; the merge and
//! finalize jobs read it back to learn which block outputs to expect.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{PipelineConfig, SubmissionLayout};
use crate::error::{PipelineError, PipelineResult};
use crate::partition::{self, BlockRange};
use crate::queue::{ArrayRange, Dependency, JobId, JobQueue, JobSpec, ARRAY_TASK_ID_VAR};
use crate::snapshot::{self, ContextSnapshot, SnapshotWrite};

/// File suffix of the persisted run manifest
pub const MANIFEST_SUFFIX: &str = "_run.json";

/// One dispatch run and its Job Registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRun {
    pub run_id: String,
    pub run_prefix: String,
    pub snapshot_path: PathBuf,
    pub model: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub n_samples: usize,
    #[serde(default)]
    pub batch_size: usize,
    #[serde(default)]
    pub n_blocks: usize,
    #[serde(default)]
    pub layout: Option<SubmissionLayout>,
    /// Block job ids in submission order
    #[serde(default)]
    registry: Vec<JobId>,
    #[serde(default)]
    pub merge_job: Option<JobId>,
    #[serde(default)]
    pub finalize_job: Option<JobId>,
}

impl DispatchRun {
    pub fn new(
        run_prefix: impl Into<String>,
        snapshot_path: impl Into<PathBuf>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            run_prefix: run_prefix.into(),
            snapshot_path: snapshot_path.into(),
            model: model.into(),
            created_at: Utc::now(),
            methods: Vec::new(),
            n_samples: 0,
            batch_size: 0,
            n_blocks: 0,
            layout: None,
            registry: Vec::new(),
            merge_job: None,
            finalize_job: None,
        }
    }

    /// Job ids in submission order
    pub fn registry(&self) -> &[JobId] {
        &self.registry
    }

    fn record(&mut self, job_id: JobId) {
        self.registry.push(job_id);
    }

    pub fn manifest_path(&self) -> PathBuf {
        manifest_path(&self.run_prefix)
    }

    /// Persist the run as JSON next to its outputs
    pub fn save(&self) -> PipelineResult<PathBuf> {
        let path = self.manifest_path();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, serde_json::to_string_pretty(self)?)?;
        debug!(path = %path.display(), jobs = self.registry.len(), "Run manifest saved");
        Ok(path)
    }

    pub fn load(path: &Path) -> PipelineResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::config(format!("cannot read run manifest {}: {}", path.display(), e))
        })?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Batch size the workers must re-partition with to reproduce `blocks`.
///
/// Workers only receive a block index and a batch size, so the blocks must
/// be exactly what [`partition::partition`] yields: indexed in order,
/// contiguous from 0 and of equal size apart from a shorter last block.
fn batch_size_of(blocks: &[BlockRange]) -> PipelineResult<usize> {
    let (first, last) = match (blocks.first(), blocks.last()) {
        (Some(first), Some(last)) => (first, last),
        _ => return Err(PipelineError::partition("no blocks to dispatch")),
    };
    let batch_size = first.len();
    let expected = partition::partition(last.end, batch_size)?;
    if expected.as_slice() != blocks {
        return Err(PipelineError::partition(format!(
            "blocks are not a partition of [0, {}) into batches of {}",
            last.end, batch_size
        )));
    }
    Ok(batch_size)
}

/// Path of the run manifest for a run prefix
pub fn manifest_path(run_prefix: &str) -> PathBuf {
    PathBuf::from(format!("{}{}", run_prefix, MANIFEST_SUFFIX))
}

/// Builds job descriptors and submits them to a queue
pub struct Dispatcher {
    queue: Arc<dyn JobQueue>,
    config: PipelineConfig,
}

impl Dispatcher {
    pub fn new(queue: Arc<dyn JobQueue>, config: PipelineConfig) -> Self {
        Self { queue, config }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn worker_args(&self, run: &DispatchRun, method: &str, block: String) -> Vec<String> {
        vec![
            "compute-block".to_string(),
            run.snapshot_path.display().to_string(),
            method.to_string(),
            block,
            "--batch-size".to_string(),
            run.batch_size.to_string(),
            "--run-prefix".to_string(),
            run.run_prefix.clone(),
        ]
    }

    /// Descriptor for one (method, block) pair
    pub fn block_spec(&self, run: &DispatchRun, method: &str, block: &BlockRange) -> JobSpec {
        let stem = format!("{}-{}-{}", method, run.model, block.index);
        JobSpec {
            name: format!("{}-{}", self.config.job_prefix, stem),
            program: self.config.worker_program.clone(),
            args: self.worker_args(run, method, block.index.to_string()),
            array: None,
            cpus: self.config.block.cpus,
            time_limit: self.config.block.time_limit.clone(),
            output: self.config.job_folder.join(format!("{}.out", stem)),
            error: self.config.job_folder.join(format!("{}.err", stem)),
            dependency: None,
            partition: self.config.partition.clone(),
        }
    }

    /// Descriptor for one array job covering every block of a method
    pub fn array_spec(&self, run: &DispatchRun, method: &str, n_blocks: usize) -> PipelineResult<JobSpec> {
        let last = n_blocks
            .checked_sub(1)
            .ok_or_else(|| PipelineError::partition("array job needs at least one block"))?;
        let end = u32::try_from(last).map_err(|_| {
            PipelineError::partition(format!("{} blocks exceed the array index range", n_blocks))
        })?;
        let stem = format!("{}-{}", method, run.model);
        Ok(JobSpec {
            name: format!("{}-{}", self.config.job_prefix, stem),
            program: self.config.worker_program.clone(),
            args: self.worker_args(run, method, ARRAY_TASK_ID_VAR.to_string()),
            array: Some(ArrayRange { start: 0, end }),
            cpus: self.config.block.cpus,
            time_limit: self.config.block.time_limit.clone(),
            // %a expands to the array task index
            output: self.config.job_folder.join(format!("{}-%a.out", stem)),
            error: self.config.job_folder.join(format!("{}-%a.err", stem)),
            dependency: None,
            partition: self.config.partition.clone(),
        })
    }

    fn step_spec(&self, run: &DispatchRun, step: &str, tag: &str, dependency: Dependency) -> JobSpec {
        // runs sharing a job folder keep separate sinks
        let stem = Path::new(&run.run_prefix)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| run.run_id.clone());
        JobSpec {
            name: format!("{}-{}", self.config.job_prefix, tag),
            program: self.config.program.clone(),
            args: vec![step.to_string(), run.manifest_path().display().to_string()],
            array: None,
            cpus: self.config.merge.cpus,
            time_limit: self.config.merge.time_limit.clone(),
            output: self.config.job_folder.join(format!("{}-{}.out", stem, step)),
            error: self.config.job_folder.join(format!("{}-{}.err", stem, step)),
            dependency: Some(dependency),
            partition: self.config.partition.clone(),
        }
    }

    /// Submit one job per (method, block) pair, method-major, recording ids
    /// in the run's registry in submission order.
    ///
    /// With [`SubmissionLayout::ArrayPerMethod`] one array job per method is
    /// submitted instead.
    pub async fn dispatch(
        &self,
        run: &mut DispatchRun,
        methods: &[String],
        blocks: &[BlockRange],
    ) -> PipelineResult<Vec<JobId>> {
        if methods.is_empty() {
            return Err(PipelineError::config("no interpretability methods given"));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = methods.iter().find(|m| !seen.insert(m.as_str())) {
            return Err(PipelineError::config(format!("method '{}' listed twice", dup)));
        }
        let batch_size = batch_size_of(blocks)?;
        if run.batch_size != 0 && run.batch_size != batch_size {
            return Err(PipelineError::partition(format!(
                "blocks hold {} samples but the run uses a batch size of {}",
                batch_size, run.batch_size
            )));
        }

        run.methods = methods.to_vec();
        run.n_blocks = blocks.len();
        run.n_samples = blocks.iter().map(|b| b.end).max().unwrap_or(0);
        run.batch_size = batch_size;
        run.layout = Some(self.config.submit_layout);

        info!(
            run_prefix = %run.run_prefix,
            queue = self.queue.name(),
            methods = methods.len(),
            blocks = blocks.len(),
            layout = ?self.config.submit_layout,
            "Dispatching block jobs"
        );

        let mut submitted = Vec::new();
        for method in methods {
            let specs = match self.config.submit_layout {
                SubmissionLayout::PerBlock => blocks
                    .iter()
                    .map(|block| self.block_spec(run, method, block))
                    .collect(),
                SubmissionLayout::ArrayPerMethod => vec![self.array_spec(run, method, blocks.len())?],
            };
            for spec in specs {
                let job_id = self.queue.submit(&spec).await?;
                run.record(job_id);
                submitted.push(job_id);
                debug!(job = %spec.name, %job_id, "Recorded block job");
            }
        }

        Ok(submitted)
    }

    /// Submit the merge job (afterany on every registered block job), then
    /// the finalize job (afterany on the merge job).
    pub async fn schedule_merge(&self, run: &mut DispatchRun) -> PipelineResult<(JobId, JobId)> {
        if run.registry.is_empty() {
            return Err(PipelineError::config(
                "cannot schedule merge: no block jobs were submitted in this run",
            ));
        }
        if run.merge_job.is_some() {
            warn!(run_prefix = %run.run_prefix, "Merge already scheduled, scheduling again");
        }

        // merge/finalize jobs read the manifest, so it must exist before they can start
        run.save()?;

        let merge_spec = self.step_spec(
            run,
            "merge",
            "MR",
            Dependency::after_any(run.registry.clone()),
        );
        let merge_id = self.queue.submit(&merge_spec).await?;
        run.merge_job = Some(merge_id);
        run.save()?;

        let finalize_spec = self.step_spec(run, "finalize", "END", Dependency::after_any(vec![merge_id]));
        let finalize_id = self.queue.submit(&finalize_spec).await?;
        run.finalize_job = Some(finalize_id);
        run.save()?;

        info!(
            run_prefix = %run.run_prefix,
            %merge_id,
            %finalize_id,
            depends_on = run.registry.len(),
            "Scheduled merge and finalize"
        );
        Ok((merge_id, finalize_id))
    }

    /// Snapshot, partition, dispatch and schedule the merge for one run
    pub async fn run(
        &self,
        snapshot: &ContextSnapshot,
        run_prefix: &str,
        methods: &[String],
    ) -> PipelineResult<DispatchRun> {
        let snapshot_path = snapshot::snapshot_path(run_prefix);
        if let SnapshotWrite::AlreadyPresent = snapshot.write_once(&snapshot_path)? {
            info!(path = %snapshot_path.display(), "Reusing existing context snapshot");
        }

        let blocks = partition::partition(snapshot.n_samples(), self.config.batch_size)?;
        let mut run = DispatchRun::new(run_prefix, snapshot_path, snapshot.model.clone());
        run.batch_size = self.config.batch_size;

        self.dispatch(&mut run, methods, &blocks).await?;
        self.schedule_merge(&mut run).await?;
        Ok(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MockJobQueue;
    use mockall::Sequence;
    use tempfile::tempdir;

    fn config() -> PipelineConfig {
        PipelineConfig {
            batch_size: 10,
            job_folder: PathBuf::from("jobs"),
            job_prefix: "INTERP".into(),
            submit_layout: SubmissionLayout::PerBlock,
            partition: None,
            ..Default::default()
        }
    }

    fn methods(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_dispatch_records_ids_in_submission_order() {
        let dir = tempdir().unwrap();
        let prefix = dir.path().join("RF_tox").display().to_string();

        let mut mock = MockJobQueue::new();
        let mut seq = Sequence::new();
        let expected = [
            "INTERP-lime-RF-0",
            "INTERP-lime-RF-1",
            "INTERP-lime-RF-2",
            "INTERP-shap-RF-0",
            "INTERP-shap-RF-1",
            "INTERP-shap-RF-2",
        ];
        for (i, name) in expected.iter().enumerate() {
            let name = name.to_string();
            mock.expect_submit()
                .withf(move |spec: &JobSpec| spec.name == name && spec.dependency.is_none())
                .times(1)
                .in_sequence(&mut seq)
                .returning(move |_| Ok(JobId(100 + i as u32)));
        }
        mock.expect_name().return_const("mock");

        let dispatcher = Dispatcher::new(Arc::new(mock), config());
        let mut run = DispatchRun::new(prefix, "RF_tox_params.bin", "RF");
        let blocks = partition::partition(25, 10).unwrap();

        let ids = dispatcher
            .dispatch(&mut run, &methods(&["lime", "shap"]), &blocks)
            .await
            .unwrap();

        let want: Vec<JobId> = (100..106).map(JobId).collect();
        assert_eq!(ids, want);
        assert_eq!(run.registry(), want.as_slice());
        assert_eq!(run.n_blocks, 3);
        assert_eq!(run.n_samples, 25);
    }

    #[tokio::test]
    async fn test_merge_depends_on_every_block_job_once() {
        let dir = tempdir().unwrap();
        let prefix = dir.path().join("RF_tox").display().to_string();

        let mut mock = MockJobQueue::new();
        mock.expect_submit()
            .withf(|spec: &JobSpec| spec.dependency.is_none())
            .times(4)
            .returning({
                let mut next = 0u32;
                move |_| {
                    next += 1;
                    Ok(JobId(next))
                }
            });
        mock.expect_submit()
            .withf(|spec: &JobSpec| {
                spec.name == "INTERP-MR"
                    && spec.args[0] == "merge"
                    && spec.dependency
                        == Some(Dependency::after_any(vec![
                            JobId(1),
                            JobId(2),
                            JobId(3),
                            JobId(4),
                        ]))
            })
            .times(1)
            .returning(|_| Ok(JobId(50)));
        mock.expect_submit()
            .withf(|spec: &JobSpec| {
                spec.name == "INTERP-END"
                    && spec.args[0] == "finalize"
                    && spec.dependency == Some(Dependency::after_any(vec![JobId(50)]))
            })
            .times(1)
            .returning(|_| Ok(JobId(51)));
        mock.expect_name().return_const("mock");

        let dispatcher = Dispatcher::new(Arc::new(mock), config());
        let mut run = DispatchRun::new(prefix, "p.bin", "RF");
        let blocks = partition::partition(20, 10).unwrap();
        dispatcher
            .dispatch(&mut run, &methods(&["lime", "shap"]), &blocks)
            .await
            .unwrap();

        let (merge, finalize) = dispatcher.schedule_merge(&mut run).await.unwrap();
        assert_eq!((merge, finalize), (JobId(50), JobId(51)));

        let saved = DispatchRun::load(&run.manifest_path()).unwrap();
        assert_eq!(saved, run);
        assert_eq!(saved.registry().len(), 4);
    }

    #[tokio::test]
    async fn test_schedule_merge_requires_block_jobs() {
        let mock = MockJobQueue::new();
        let dispatcher = Dispatcher::new(Arc::new(mock), config());
        let mut run = DispatchRun::new("x", "x_params.bin", "RF");
        assert!(matches!(
            dispatcher.schedule_merge(&mut run).await,
            Err(PipelineError::ConfigurationError { .. })
        ));
    }

    #[tokio::test]
    async fn test_rejected_submission_keeps_earlier_ids() {
        let mut mock = MockJobQueue::new();
        mock.expect_name().return_const("mock");
        mock.expect_submit()
            .withf(|spec: &JobSpec| spec.name.ends_with("-0"))
            .returning(|_| Ok(JobId(7)));
        mock.expect_submit()
            .returning(|spec| Err(PipelineError::submission(&spec.name, "QOSMaxSubmitJobPerUserLimit")));

        let dispatcher = Dispatcher::new(Arc::new(mock), config());
        let mut run = DispatchRun::new("x", "x_params.bin", "RF");
        let blocks = partition::partition(15, 10).unwrap();

        let err = dispatcher
            .dispatch(&mut run, &methods(&["lime"]), &blocks)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::SubmissionError { .. }));
        assert_eq!(run.registry(), &[JobId(7)]);
    }

    #[tokio::test]
    async fn test_dispatch_validates_methods() {
        let mock = MockJobQueue::new();
        let dispatcher = Dispatcher::new(Arc::new(mock), config());
        let mut run = DispatchRun::new("x", "x_params.bin", "RF");
        let blocks = partition::partition(5, 10).unwrap();

        assert!(dispatcher.dispatch(&mut run, &[], &blocks).await.is_err());
        assert!(dispatcher
            .dispatch(&mut run, &methods(&["lime", "lime"]), &blocks)
            .await
            .is_err());
        assert!(run.registry().is_empty());
    }

    #[test]
    fn test_block_spec_shape() {
        let dispatcher = Dispatcher::new(Arc::new(MockJobQueue::new()), config());
        let mut run = DispatchRun::new("out/RF_tox", "out/RF_tox_params.bin", "RF");
        run.batch_size = 10;
        let block = partition::partition(25, 10).unwrap()[2];

        let spec = dispatcher.block_spec(&run, "lime", &block);
        assert_eq!(spec.name, "INTERP-lime-RF-2");
        assert_eq!(spec.cpus, 2);
        assert_eq!(spec.time_limit, "72:00:00");
        assert_eq!(spec.output, PathBuf::from("jobs/lime-RF-2.out"));
        assert_eq!(
            spec.args,
            vec![
                "compute-block",
                "out/RF_tox_params.bin",
                "lime",
                "2",
                "--batch-size",
                "10",
                "--run-prefix",
                "out/RF_tox"
            ]
        );
    }

    #[test]
    fn test_array_spec_covers_all_blocks() {
        let dispatcher = Dispatcher::new(Arc::new(MockJobQueue::new()), config());
        let run = DispatchRun::new("p", "p_params.bin", "RF");
        let spec = dispatcher.array_spec(&run, "shap", 4).unwrap();
        assert_eq!(spec.array, Some(ArrayRange { start: 0, end: 3 }));
        assert_eq!(spec.args[3], ARRAY_TASK_ID_VAR);
        assert_eq!(spec.output, PathBuf::from("jobs/shap-RF-%a.out"));

        assert!(matches!(
            dispatcher.array_spec(&run, "shap", 0),
            Err(PipelineError::PartitionError { .. })
        ));
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_array_spec_rejects_index_overflow() {
        let dispatcher = Dispatcher::new(Arc::new(MockJobQueue::new()), config());
        let run = DispatchRun::new("p", "p_params.bin", "RF");
        let too_many = u32::MAX as usize + 2;
        assert!(matches!(
            dispatcher.array_spec(&run, "shap", too_many),
            Err(PipelineError::PartitionError { .. })
        ));
    }

    #[test]
    fn test_step_sinks_carry_run_prefix() {
        let dispatcher = Dispatcher::new(Arc::new(MockJobQueue::new()), config());
        let run = DispatchRun::new("out/RF_tox", "out/RF_tox_params.bin", "RF");
        let spec = dispatcher.step_spec(&run, "merge", "MR", Dependency::after_any(vec![JobId(1)]));
        assert_eq!(spec.output, PathBuf::from("jobs/RF_tox-merge.out"));
        assert_eq!(spec.error, PathBuf::from("jobs/RF_tox-merge.err"));
    }

    #[tokio::test]
    async fn test_worker_batch_size_follows_blocks() {
        let mut mock = MockJobQueue::new();
        mock.expect_name().return_const("mock");
        mock.expect_submit()
            .withf(|spec: &JobSpec| spec.args[4] == "--batch-size" && spec.args[5] == "5")
            .times(5)
            .returning(|_| Ok(JobId(1)));

        // config says 10; the blocks say 5
        let dispatcher = Dispatcher::new(Arc::new(mock), config());
        let mut run = DispatchRun::new("x", "x_params.bin", "RF");
        let blocks = partition::partition(25, 5).unwrap();
        dispatcher
            .dispatch(&mut run, &methods(&["lime"]), &blocks)
            .await
            .unwrap();
        assert_eq!(run.batch_size, 5);
        assert_eq!(run.n_blocks, 5);
    }

    #[tokio::test]
    async fn test_dispatch_rejects_blocks_workers_cannot_rebuild() {
        let dispatcher = Dispatcher::new(Arc::new(MockJobQueue::new()), config());
        let lime = methods(&["lime"]);

        // run already pinned to 10, blocks of 5
        let mut run = DispatchRun::new("x", "x_params.bin", "RF");
        run.batch_size = 10;
        let blocks = partition::partition(25, 5).unwrap();
        assert!(matches!(
            dispatcher.dispatch(&mut run, &lime, &blocks).await,
            Err(PipelineError::PartitionError { .. })
        ));

        let gap = vec![
            BlockRange { index: 0, start: 0, end: 10 },
            BlockRange { index: 1, start: 12, end: 20 },
        ];
        let uneven = vec![
            BlockRange { index: 0, start: 0, end: 10 },
            BlockRange { index: 1, start: 10, end: 15 },
            BlockRange { index: 2, start: 15, end: 25 },
        ];
        let mut reordered = partition::partition(25, 10).unwrap();
        reordered.swap(0, 1);

        for blocks in [gap, uneven, reordered, Vec::new()] {
            let mut run = DispatchRun::new("x", "x_params.bin", "RF");
            assert!(matches!(
                dispatcher.dispatch(&mut run, &lime, &blocks).await,
                Err(PipelineError::PartitionError { .. })
            ));
            assert!(run.registry().is_empty());
        }
    }
}
