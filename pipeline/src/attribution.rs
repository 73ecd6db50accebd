//! Attribution tables
//!
//! Block jobs write one CSV per (method, block) with the columns
//! `feature_name, attribution, raw_token, predicted_class`. The merge step
//! reads them back, keeps the per-instance rows (local) and reduces them to
//! one `{feature_name, mean, std}` row per feature (global).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::consensus::{AttributionRow, ConsensusRow};
use crate::error::{PipelineError, PipelineResult};

/// Output path of one block job
pub fn block_output_path(run_prefix: &str, method: &str, block: usize) -> PathBuf {
    PathBuf::from(format!("{}_{}_block{}.csv", run_prefix, method, block))
}

/// Per-method global table written by the merge step
pub fn global_output_path(run_prefix: &str, method: &str) -> PathBuf {
    PathBuf::from(format!("{}_{}.csv", run_prefix, method))
}

/// One feature's contribution to one sample's prediction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributionRecord {
    pub feature_name: String,
    pub attribution: f64,
    /// Explainer's own token, e.g. a LIME range like `0.5 < age <= 3.0`
    #[serde(default)]
    pub raw_token: String,
    #[serde(default)]
    pub predicted_class: String,
}

/// Aggregated attribution of one feature across samples
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalAttribution {
    pub feature_name: String,
    pub attribution: f64,
    pub std: f64,
}

impl From<&GlobalAttribution> for AttributionRow {
    fn from(g: &GlobalAttribution) -> Self {
        AttributionRow {
            feature_name: g.feature_name.clone(),
            attribution: g.attribution,
            std: Some(g.std),
        }
    }
}

impl From<&AttributionRecord> for AttributionRow {
    fn from(r: &AttributionRecord) -> Self {
        AttributionRow {
            feature_name: r.feature_name.clone(),
            attribution: r.attribution,
            std: None,
        }
    }
}

/// Comparison operator between a feature name and a bound, e.g. ` <= `
static OPERATOR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\s+(?:<=|>=|<|>|=)\s+").expect("OPERATOR_RE regex should compile")
});

/// Feature name inside a range token.
///
/// `0.50 < age <= 3.00` gives `age`, `age > 3.00` gives `age`, and a token
/// without operators is returned trimmed.
pub fn feature_from_token(token: &str) -> String {
    let parts: Vec<&str> = OPERATOR_RE.split(token.trim()).collect();
    let name = if parts.len() > 2 { parts[1] } else { parts[0] };
    name.trim().to_string()
}

/// Read a block output, filling empty feature names from the raw token
pub fn read_records(path: &Path) -> PipelineResult<Vec<AttributionRecord>> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut records = Vec::new();
    for row in reader.deserialize() {
        let mut record: AttributionRecord = row?;
        if record.feature_name.trim().is_empty() {
            record.feature_name = feature_from_token(&record.raw_token);
        }
        records.push(record);
    }
    Ok(records)
}

pub fn write_records(path: &Path, records: &[AttributionRecord]) -> PipelineResult<()> {
    write_rows(path, records)
}

pub fn write_global(path: &Path, rows: &[GlobalAttribution]) -> PipelineResult<()> {
    write_rows(path, rows)
}

pub fn write_consensus(path: &Path, rows: &[ConsensusRow]) -> PipelineResult<()> {
    write_rows(path, rows)
}

fn write_rows<T: Serialize>(path: &Path, rows: &[T]) -> PipelineResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = csv::Writer::from_path(path)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

/// Read a `{feature_name, attribution[, std]}` table
pub fn read_attribution_table(path: &Path) -> PipelineResult<Vec<AttributionRow>> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut rows = Vec::new();
    for row in reader.deserialize() {
        rows.push(row?);
    }
    Ok(rows)
}

/// Per-feature mean and sample standard deviation, ordered by |mean|
/// descending (feature name breaks ties).
pub fn aggregate_global(records: &[AttributionRecord]) -> PipelineResult<Vec<GlobalAttribution>> {
    if records.is_empty() {
        return Err(PipelineError::aggregation("no attribution records to aggregate"));
    }

    let mut groups: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
    for r in records {
        groups.entry(r.feature_name.as_str()).or_default().push(r.attribution);
    }

    let mut rows: Vec<GlobalAttribution> = groups
        .into_iter()
        .map(|(feature, values)| {
            let n = values.len() as f64;
            let mean = values.iter().sum::<f64>() / n;
            let std = if values.len() > 1 {
                (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt()
            } else {
                0.0
            };
            GlobalAttribution {
                feature_name: feature.to_string(),
                attribution: mean,
                std,
            }
        })
        .collect();

    rows.sort_by(|a, b| {
        b.attribution
            .abs()
            .total_cmp(&a.attribution.abs())
            .then_with(|| a.feature_name.cmp(&b.feature_name))
    });
    Ok(rows)
}
