//! Weighted voting ensemble
//!
//! Combines already-trained base models: weighted vote for classification,
//! weighted average for regression, weighted probability sum for
//! `predict_proba`. A base model that fails on a call is dropped from that
//! call only.

mod manifest;
mod model;
mod voting;
mod weights;

pub use manifest::{
    scan_artifacts, Capability, ModelEntry, ModelManifest, DEFAULT_EXTENSIONS, MANIFEST_FILE,
};
pub use model::{ArtifactLoader, BaseModel, LinearArtifact, LinearLoader, Predictor, ProbabilisticPredictor};
pub use voting::WeightedVotingEnsemble;
pub use weights::{load_permutation_weights, normalize_weights, permutation_importance_path};

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use ndarray::{Array2, ArrayView1};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};

/// What the ensemble predicts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskMode {
    Classification,
    Regression,
}

impl FromStr for TaskMode {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "classification" => Ok(Self::Classification),
            "regression" => Ok(Self::Regression),
            other => Err(PipelineError::unsupported_task(other)),
        }
    }
}

impl fmt::Display for TaskMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Classification => f.write_str("classification"),
            Self::Regression => f.write_str("regression"),
        }
    }
}

/// Sample matrix with named columns
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureFrame {
    columns: Vec<String>,
    values: Array2<f64>,
}

impl FeatureFrame {
    pub fn new(columns: Vec<String>, values: Array2<f64>) -> PipelineResult<Self> {
        if columns.len() != values.ncols() {
            return Err(PipelineError::config(format!(
                "{} column name(s) for {} column(s)",
                columns.len(),
                values.ncols()
            )));
        }
        Ok(Self { columns, values })
    }

    /// Read a numeric CSV with a header row
    pub fn from_csv(path: &Path) -> PipelineResult<Self> {
        let mut reader = csv::Reader::from_path(path)?;
        let columns: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();

        let mut flat = Vec::new();
        let mut rows = 0;
        for record in reader.records() {
            let record = record?;
            for (i, field) in record.iter().enumerate() {
                let value: f64 = field.trim().parse().map_err(|_| {
                    PipelineError::config(format!(
                        "{}: row {} column '{}' is not numeric: '{}'",
                        path.display(),
                        rows + 1,
                        columns.get(i).map(String::as_str).unwrap_or("?"),
                        field
                    ))
                })?;
                flat.push(value);
            }
            rows += 1;
        }

        let values = Array2::from_shape_vec((rows, columns.len()), flat)
            .map_err(|e| PipelineError::config(format!("{}: {}", path.display(), e)))?;
        Self::new(columns, values)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &Array2<f64> {
        &self.values
    }

    pub fn nrows(&self) -> usize {
        self.values.nrows()
    }

    pub fn column(&self, name: &str) -> Option<ArrayView1<'_, f64>> {
        self.columns
            .iter()
            .position(|c| c == name)
            .map(|i| self.values.column(i))
    }

    /// Expected names absent from this frame
    pub fn missing<'a>(&self, expected: &'a [String]) -> Vec<&'a str> {
        expected
            .iter()
            .filter(|name| !self.columns.contains(*name))
            .map(String::as_str)
            .collect()
    }
}
