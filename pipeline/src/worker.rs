//! Block worker contract
//!
//! A block job loads the run's context snapshot, takes the rows of its
//! block and hands them to an explainer. The records it returns are written
//! to the block output path the merge step expects. How attributions are
//! computed is up to the [`BlockExplainer`].

use std::path::{Path, PathBuf};

use ndarray::ArrayView2;
use tracing::{info, instrument};

use crate::attribution::{self, block_output_path, AttributionRecord};
use crate::error::{PipelineError, PipelineResult};
use crate::partition;
use crate::snapshot::ContextSnapshot;

/// Computes attributions for the samples of one block
pub trait BlockExplainer: Send + Sync {
    /// `offset` is the index of the first row in the full dataset
    fn explain(
        &self,
        method: &str,
        rows: ArrayView2<'_, f64>,
        feature_names: &[String],
        offset: usize,
    ) -> anyhow::Result<Vec<AttributionRecord>>;
}

/// What a `compute-block` invocation asks for
#[derive(Debug, Clone, PartialEq)]
pub struct BlockTask {
    pub snapshot: PathBuf,
    pub method: String,
    pub block: usize,
    pub batch_size: usize,
    pub run_prefix: String,
}

/// Load the snapshot, explain one block and write its output file
#[instrument(skip(explainer), fields(method = %task.method, block = task.block))]
pub fn run_block(task: &BlockTask, explainer: &dyn BlockExplainer) -> PipelineResult<PathBuf> {
    let snapshot = ContextSnapshot::load(&task.snapshot)?;
    let blocks = partition::partition(snapshot.n_samples(), task.batch_size)?;
    let block = blocks.get(task.block).ok_or_else(|| {
        PipelineError::partition(format!(
            "block {} outside [0, {})",
            task.block,
            blocks.len()
        ))
    })?;

    let rows = block.slice_rows(&snapshot.features)?;
    let records = explainer
        .explain(&task.method, rows, &snapshot.ids, block.start)
        .map_err(|e| {
            PipelineError::aggregation(format!(
                "{} failed on block {}: {:#}",
                task.method, block, e
            ))
        })?;

    let path = block_output_path(&task.run_prefix, &task.method, block.index);
    write_output(&path, &records)?;
    info!(records = records.len(), path = %path.display(), "Block output written");
    Ok(path)
}

fn write_output(path: &Path, records: &[AttributionRecord]) -> PipelineResult<()> {
    // write under a temporary name so the merge never sees a half-written file
    let tmp = path.with_extension("csv.part");
    attribution::write_records(&tmp, records)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use tempfile::tempdir;

    /// Attribution = raw feature value
    struct Identity;

    impl BlockExplainer for Identity {
        fn explain(
            &self,
            _method: &str,
            rows: ArrayView2<'_, f64>,
            feature_names: &[String],
            offset: usize,
        ) -> anyhow::Result<Vec<AttributionRecord>> {
            let mut out = Vec::new();
            for (i, row) in rows.outer_iter().enumerate() {
                for (name, value) in feature_names.iter().zip(row.iter()) {
                    out.push(AttributionRecord {
                        feature_name: name.clone(),
                        attribution: *value,
                        raw_token: String::new(),
                        predicted_class: (offset + i).to_string(),
                    });
                }
            }
            Ok(out)
        }
    }

    fn task(dir: &Path, block: usize) -> BlockTask {
        let snapshot = ContextSnapshot::new(
            array![[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]],
            vec!["age".into(), "dose".into()],
            "tox",
            "RF",
            "cfg.json",
        )
        .unwrap();
        let path = dir.join("RF_tox_params.bin");
        snapshot.write_once(&path).unwrap();
        BlockTask {
            snapshot: path,
            method: "lime".into(),
            block,
            batch_size: 2,
            run_prefix: dir.join("RF_tox").display().to_string(),
        }
    }

    #[test]
    fn test_run_block_writes_expected_path() {
        let dir = tempdir().unwrap();
        let task = task(dir.path(), 1);

        let path = run_block(&task, &Identity).unwrap();
        assert_eq!(path, block_output_path(&task.run_prefix, "lime", 1));

        let records = attribution::read_records(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].attribution, 5.0);
        assert_eq!(records[0].predicted_class, "2");
        assert!(!path.with_extension("csv.part").exists());
    }

    #[test]
    fn test_block_out_of_range() {
        let dir = tempdir().unwrap();
        let task = task(dir.path(), 2);
        assert!(matches!(
            run_block(&task, &Identity),
            Err(PipelineError::PartitionError { .. })
        ));
    }
}
