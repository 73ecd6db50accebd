//! Merge and finalize steps
//!
//! Both run as queue jobs after the block jobs have reached a terminal
//! state, with the run manifest as their only argument. A block job may have
//! failed or timed out, so the merge step reads whatever outputs exist and
//! records the rest as gaps. It only fails when nothing at all was produced.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::attribution::{
    self, block_output_path, global_output_path, AttributionRecord, GlobalAttribution,
};
use crate::consensus::{AttributionRow, ConsensusReducer};
use crate::dispatch::DispatchRun;
use crate::error::{PipelineError, PipelineResult};

/// A block output that was expected but could not be used
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockGap {
    pub method: String,
    pub block: usize,
    pub path: PathBuf,
    pub reason: String,
}

/// Records read from every available block output, per method in run order
#[derive(Debug, Clone, Default)]
pub struct BlockOutputs {
    pub methods: Vec<(String, Vec<AttributionRecord>)>,
    pub gaps: Vec<BlockGap>,
}

impl BlockOutputs {
    pub fn record_count(&self) -> usize {
        self.methods.iter().map(|(_, r)| r.len()).sum()
    }
}

/// Written by the merge step, read by finalize
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeReport {
    pub run_id: String,
    pub run_prefix: String,
    pub reducer: String,
    /// Methods with at least one block output
    pub methods: Vec<String>,
    pub gaps: Vec<BlockGap>,
    pub outputs: Vec<PathBuf>,
    pub merged_at: DateTime<Utc>,
}

/// Final run summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub run_prefix: String,
    pub model: String,
    pub created_at: DateTime<Utc>,
    pub merged_at: DateTime<Utc>,
    pub finalized_at: DateTime<Utc>,
    pub blocks_expected: usize,
    pub gap_count: usize,
    pub methods: Vec<String>,
    pub outputs: Vec<PathBuf>,
}

pub fn merge_report_path(run_prefix: &str) -> PathBuf {
    PathBuf::from(format!("{}_merge.json", run_prefix))
}

pub fn summary_path(run_prefix: &str) -> PathBuf {
    PathBuf::from(format!("{}_summary.json", run_prefix))
}

pub fn consensus_output_path(run_prefix: &str, reducer: &str) -> PathBuf {
    PathBuf::from(format!("{}_consensus_{}.csv", run_prefix, reducer))
}

/// Read every block output the run expects.
///
/// Missing or unreadable outputs, and outputs holding a non-finite
/// attribution, become [`BlockGap`]s. Fails with
/// `AggregationError` only when no block produced a single record.
pub fn collect_block_outputs(run: &DispatchRun) -> PipelineResult<BlockOutputs> {
    let mut outputs = BlockOutputs::default();

    for method in &run.methods {
        let mut records = Vec::new();
        for block in 0..run.n_blocks {
            let path = block_output_path(&run.run_prefix, method, block);
            let result = if path.exists() {
                attribution::read_records(&path).and_then(reject_non_finite)
            } else {
                Err(PipelineError::gap(method.as_str(), block, &path))
            };

            match result {
                Ok(mut rows) => records.append(&mut rows),
                Err(e) => {
                    warn!(method = %method, block, path = %path.display(), "Block output unavailable: {}", e);
                    outputs.gaps.push(BlockGap {
                        method: method.clone(),
                        block,
                        path,
                        reason: e.to_string(),
                    });
                }
            }
        }

        if records.is_empty() {
            warn!(method = %method, "No block output for method, skipping");
            continue;
        }
        outputs.methods.push((method.clone(), records));
    }

    if outputs.methods.is_empty() {
        return Err(PipelineError::aggregation(format!(
            "no block produced output for run '{}' ({} gap(s))",
            run.run_prefix,
            outputs.gaps.len()
        )));
    }
    Ok(outputs)
}

fn reject_non_finite(records: Vec<AttributionRecord>) -> PipelineResult<Vec<AttributionRecord>> {
    match records.iter().find(|r| !r.attribution.is_finite()) {
        Some(bad) => Err(PipelineError::aggregation(format!(
            "non-finite attribution {} for feature '{}'",
            bad.attribution, bad.feature_name
        ))),
        None => Ok(records),
    }
}

/// Aggregate each method, combine all methods with `reducer` and write the
/// merge report
pub fn merge_run(run: &DispatchRun, reducer: &dyn ConsensusReducer) -> PipelineResult<MergeReport> {
    let collected = collect_block_outputs(run)?;
    info!(
        run = %run.run_prefix,
        methods = collected.methods.len(),
        records = collected.record_count(),
        gaps = collected.gaps.len(),
        "Merging block outputs"
    );

    let mut outputs = Vec::new();
    let mut global_rows: Vec<AttributionRow> = Vec::new();
    let mut local_rows: Vec<AttributionRow> = Vec::new();
    let mut methods = Vec::new();

    for (method, records) in &collected.methods {
        let global: Vec<GlobalAttribution> = attribution::aggregate_global(records)?;
        let path = global_output_path(&run.run_prefix, method);
        attribution::write_global(&path, &global)?;
        info!(method = %method, features = global.len(), path = %path.display(), "Wrote global attributions");

        global_rows.extend(global.iter().map(AttributionRow::from));
        local_rows.extend(records.iter().map(AttributionRow::from));
        methods.push(method.clone());
        outputs.push(path);
    }

    let consensus = reducer.combine(&global_rows, &local_rows)?;
    let consensus_path = consensus_output_path(&run.run_prefix, reducer.name());
    attribution::write_consensus(&consensus_path, &consensus)?;
    info!(reducer = reducer.name(), features = consensus.len(), "Wrote consensus");
    outputs.push(consensus_path);

    let report = MergeReport {
        run_id: run.run_id.clone(),
        run_prefix: run.run_prefix.clone(),
        reducer: reducer.name().to_string(),
        methods,
        gaps: collected.gaps,
        outputs,
        merged_at: Utc::now(),
    };
    write_json(&merge_report_path(&run.run_prefix), &report)?;
    Ok(report)
}

/// Summarize a merged run
pub fn finalize_run(run: &DispatchRun) -> PipelineResult<RunSummary> {
    let report_path = merge_report_path(&run.run_prefix);
    let report: MergeReport = match std::fs::read_to_string(&report_path) {
        Ok(content) => serde_json::from_str(&content)?,
        Err(e) => {
            return Err(PipelineError::aggregation(format!(
                "merge report {} unavailable: {}",
                report_path.display(),
                e
            )))
        }
    };

    let summary = RunSummary {
        run_id: run.run_id.clone(),
        run_prefix: run.run_prefix.clone(),
        model: run.model.clone(),
        created_at: run.created_at,
        merged_at: report.merged_at,
        finalized_at: Utc::now(),
        blocks_expected: run.methods.len() * run.n_blocks,
        gap_count: report.gaps.len(),
        methods: report.methods,
        outputs: report.outputs,
    };
    let path = summary_path(&run.run_prefix);
    write_json(&path, &summary)?;
    if summary.gap_count > 0 {
        warn!(run = %run.run_prefix, gaps = summary.gap_count, "Run finished with missing blocks");
    }
    info!(run = %run.run_prefix, path = %path.display(), "Run finalized");
    Ok(summary)
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> PipelineResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(value)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::AverageMean;
    use tempfile::tempdir;

    fn run_in(dir: &Path, methods: &[&str], n_blocks: usize) -> DispatchRun {
        let prefix = dir.join("RF_tox").display().to_string();
        let mut run = DispatchRun::new(prefix, dir.join("RF_tox_params.bin"), "RF");
        run.methods = methods.iter().map(|m| m.to_string()).collect();
        run.n_blocks = n_blocks;
        run
    }

    fn write_block(run: &DispatchRun, method: &str, block: usize, rows: &[(&str, f64)]) {
        let records: Vec<AttributionRecord> = rows
            .iter()
            .map(|(f, v)| AttributionRecord {
                feature_name: f.to_string(),
                attribution: *v,
                raw_token: String::new(),
                predicted_class: "0".into(),
            })
            .collect();
        attribution::write_records(&block_output_path(&run.run_prefix, method, block), &records)
            .unwrap();
    }

    #[test]
    fn test_missing_block_is_a_gap() {
        let dir = tempdir().unwrap();
        let run = run_in(dir.path(), &["lime"], 3);
        write_block(&run, "lime", 0, &[("age", 0.1)]);
        write_block(&run, "lime", 2, &[("age", 0.3)]);

        let outputs = collect_block_outputs(&run).unwrap();
        assert_eq!(outputs.record_count(), 2);
        assert_eq!(outputs.gaps.len(), 1);
        assert_eq!(outputs.gaps[0].block, 1);
        assert_eq!(outputs.gaps[0].method, "lime");
    }

    #[test]
    fn test_corrupt_block_is_a_gap() {
        let dir = tempdir().unwrap();
        let run = run_in(dir.path(), &["shap"], 2);
        write_block(&run, "shap", 0, &[("dose", 1.0)]);
        std::fs::write(
            block_output_path(&run.run_prefix, "shap", 1),
            "feature_name,attribution\ndose,not-a-number\n",
        )
        .unwrap();

        let outputs = collect_block_outputs(&run).unwrap();
        assert_eq!(outputs.record_count(), 1);
        assert_eq!(outputs.gaps.len(), 1);
    }

    #[test]
    fn test_nan_block_is_a_gap() {
        let dir = tempdir().unwrap();
        let run = run_in(dir.path(), &["lime"], 3);
        write_block(&run, "lime", 0, &[("age", 0.2)]);
        write_block(&run, "lime", 1, &[("age", 0.4)]);
        write_block(&run, "lime", 2, &[("age", f64::NAN), ("dose", 1.0)]);

        let report = merge_run(&run, &AverageMean).unwrap();
        assert_eq!(report.gaps.len(), 1);
        assert_eq!(report.gaps[0].block, 2);
        assert!(report.gaps[0].reason.contains("non-finite"));

        // the whole NaN block is dropped, dose included
        let lime = attribution::read_attribution_table(&global_output_path(&run.run_prefix, "lime"))
            .unwrap();
        assert_eq!(lime.len(), 1);
        assert!((lime[0].attribution - 0.3).abs() < 1e-12);
    }

    #[test]
    fn test_all_blocks_missing_is_fatal() {
        let dir = tempdir().unwrap();
        let run = run_in(dir.path(), &["lime", "shap"], 2);
        assert!(matches!(
            collect_block_outputs(&run),
            Err(PipelineError::AggregationError { .. })
        ));
    }

    #[test]
    fn test_merge_then_finalize() {
        let dir = tempdir().unwrap();
        let run = run_in(dir.path(), &["lime", "shap"], 2);
        write_block(&run, "lime", 0, &[("age", 0.2), ("dose", -0.4)]);
        write_block(&run, "lime", 1, &[("age", 0.4)]);
        write_block(&run, "shap", 0, &[("age", 0.6)]);

        let report = merge_run(&run, &AverageMean).unwrap();
        assert_eq!(report.methods, vec!["lime", "shap"]);
        assert_eq!(report.gaps.len(), 1);
        assert_eq!(report.reducer, "average");

        let lime = attribution::read_attribution_table(&global_output_path(&run.run_prefix, "lime"))
            .unwrap();
        assert_eq!(lime[0].feature_name, "dose");
        assert!((lime[1].attribution - 0.3).abs() < 1e-12);

        let consensus_path = consensus_output_path(&run.run_prefix, "average");
        assert!(report.outputs.contains(&consensus_path));
        // global age: 0.3 (lime), 0.6 (shap); local age: 0.2, 0.4, 0.6
        let consensus = attribution::read_attribution_table(&consensus_path).unwrap();
        assert_eq!(consensus[0].feature_name, "age");
        assert!((consensus[0].attribution - 0.42).abs() < 1e-12);

        let summary = finalize_run(&run).unwrap();
        assert_eq!(summary.blocks_expected, 4);
        assert_eq!(summary.gap_count, 1);
        assert!(summary_path(&run.run_prefix).exists());
    }

    #[test]
    fn test_finalize_without_merge_report() {
        let dir = tempdir().unwrap();
        let run = run_in(dir.path(), &["lime"], 1);
        assert!(matches!(
            finalize_run(&run),
            Err(PipelineError::AggregationError { .. })
        ));
    }
}
