//! Consensus reducers
//!
//! A reducer merges the global attribution table (one row per feature) and
//! the local table (one row per explained instance) into a single score per
//! feature.

mod average;
mod geometric;

pub use average::AverageMean;
pub use geometric::GeometricMean;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};

/// Input row for a reducer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributionRow {
    pub feature_name: String,
    pub attribution: f64,
    #[serde(default)]
    pub std: Option<f64>,
}

impl AttributionRow {
    pub fn new(feature_name: impl Into<String>, attribution: f64) -> Self {
        Self {
            feature_name: feature_name.into(),
            attribution,
            std: None,
        }
    }
}

/// One combined score per feature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusRow {
    pub feature_name: String,
    pub attribution: f64,
}

pub trait ConsensusReducer: Send + Sync {
    /// Short name used in output file names
    fn name(&self) -> &'static str;

    /// Combine both tables; one output row per feature in their union,
    /// sorted by feature name
    fn combine(
        &self,
        global: &[AttributionRow],
        local: &[AttributionRow],
    ) -> PipelineResult<Vec<ConsensusRow>>;
}

/// Selectable reducer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReducerKind {
    #[default]
    AverageMean,
    GeometricMean,
}

impl ReducerKind {
    /// Build the reducer; `floor` only affects the geometric mean
    pub fn build(self, floor: Option<f64>) -> Box<dyn ConsensusReducer> {
        match self {
            Self::AverageMean => Box::new(AverageMean),
            Self::GeometricMean => Box::new(match floor {
                Some(f) => GeometricMean::with_floor(f),
                None => GeometricMean::default(),
            }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AverageMean => "average",
            Self::GeometricMean => "geometric",
        }
    }
}

impl fmt::Display for ReducerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReducerKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "average" | "mean" | "average_mean" => Ok(Self::AverageMean),
            "geometric" | "gmean" | "geometric_mean" => Ok(Self::GeometricMean),
            other => Err(PipelineError::config(format!("unknown reducer '{}'", other))),
        }
    }
}

/// Union of both tables, rejecting empty input and non-finite values
pub(crate) fn union_rows<'a>(
    global: &'a [AttributionRow],
    local: &'a [AttributionRow],
) -> PipelineResult<Vec<&'a AttributionRow>> {
    if global.is_empty() && local.is_empty() {
        return Err(PipelineError::aggregation("both attribution tables are empty"));
    }
    let rows: Vec<&AttributionRow> = global.iter().chain(local).collect();
    if let Some(bad) = rows.iter().find(|r| !r.attribution.is_finite()) {
        return Err(PipelineError::aggregation(format!(
            "non-finite attribution {} for feature '{}'",
            bad.attribution, bad.feature_name
        )));
    }
    Ok(rows)
}

/// Group values by feature name; BTreeMap keeps the output sorted
pub(crate) fn group_by_feature<'a>(
    rows: impl IntoIterator<Item = (&'a str, f64)>,
) -> BTreeMap<&'a str, Vec<f64>> {
    let mut groups: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
    for (feature, value) in rows {
        groups.entry(feature).or_default().push(value);
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reducer_kind_parsing() {
        assert_eq!("mean".parse::<ReducerKind>().unwrap(), ReducerKind::AverageMean);
        assert_eq!("Average".parse::<ReducerKind>().unwrap(), ReducerKind::AverageMean);
        assert_eq!("gmean".parse::<ReducerKind>().unwrap(), ReducerKind::GeometricMean);
        assert_eq!(
            "geometric".parse::<ReducerKind>().unwrap(),
            ReducerKind::GeometricMean
        );
        assert!(matches!(
            "median".parse::<ReducerKind>(),
            Err(PipelineError::ConfigurationError { .. })
        ));
    }

    #[test]
    fn test_build_names() {
        assert_eq!(ReducerKind::AverageMean.build(None).name(), "average");
        assert_eq!(ReducerKind::GeometricMean.build(Some(0.01)).name(), "geometric");
    }

    #[test]
    fn test_union_rejects_empty_and_nan() {
        assert!(matches!(
            union_rows(&[], &[]),
            Err(PipelineError::AggregationError { .. })
        ));
        let bad = [AttributionRow::new("f1", f64::NAN)];
        assert!(matches!(
            union_rows(&bad, &[]),
            Err(PipelineError::AggregationError { .. })
        ));
    }
}
