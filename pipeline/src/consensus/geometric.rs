use tracing::debug;

use super::{group_by_feature, union_rows, AttributionRow, ConsensusReducer, ConsensusRow};
use crate::error::PipelineResult;

/// Geometric mean of min-max rescaled attributions.
///
/// Values are rescaled to `[0, 1]` over the union of both tables. When every
/// value is equal the rescaled column is all zeros. A zero anywhere in a
/// feature's group makes its consensus zero unless a floor is set.
#[derive(Debug, Clone, Copy, Default)]
pub struct GeometricMean {
    floor: Option<f64>,
}

impl GeometricMean {
    /// Clamp rescaled values to at least `floor` before taking the product
    pub fn with_floor(floor: f64) -> Self {
        Self { floor: Some(floor) }
    }
}

impl ConsensusReducer for GeometricMean {
    fn name(&self) -> &'static str {
        "geometric"
    }

    fn combine(
        &self,
        global: &[AttributionRow],
        local: &[AttributionRow],
    ) -> PipelineResult<Vec<ConsensusRow>> {
        let rows = union_rows(global, local)?;

        let (min, max) = rows.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), r| {
            (lo.min(r.attribution), hi.max(r.attribution))
        });
        let span = max - min;
        debug!(min, max, rows = rows.len(), "Rescaling attributions");

        let rescale = |v: f64| -> f64 {
            let scaled = if span > 0.0 { (v - min) / span } else { 0.0 };
            match self.floor {
                Some(floor) => scaled.max(floor),
                None => scaled,
            }
        };

        let groups = group_by_feature(
            rows.iter()
                .map(|r| (r.feature_name.as_str(), rescale(r.attribution))),
        );

        Ok(groups
            .into_iter()
            .map(|(feature, values)| ConsensusRow {
                feature_name: feature.to_string(),
                attribution: geometric_mean(&values),
            })
            .collect())
    }
}

/// n-th root of the product; computed in log space unless a zero is present
fn geometric_mean(values: &[f64]) -> f64 {
    if values.iter().any(|v| *v <= 0.0) {
        return 0.0;
    }
    let log_sum: f64 = values.iter().map(|v| v.ln()).sum();
    (log_sum / values.len() as f64).exp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_equal_inputs_give_zeros() {
        let global = [AttributionRow::new("a", 0.5), AttributionRow::new("b", 0.5)];
        let local = [AttributionRow::new("a", 0.5)];

        let out = GeometricMean::default().combine(&global, &local).unwrap();
        assert_eq!(out.len(), 2);
        for row in &out {
            assert_eq!(row.attribution, 0.0);
            assert!(!row.attribution.is_nan());
        }
    }

    #[test]
    fn test_rescaled_geometric_mean() {
        // union min 0, max 4: a -> {0.5, 1.0}, b -> {0.25}, c -> {0.0}
        let global = [
            AttributionRow::new("a", 2.0),
            AttributionRow::new("b", 1.0),
            AttributionRow::new("c", 0.0),
        ];
        let local = [AttributionRow::new("a", 4.0)];

        let out = GeometricMean::default().combine(&global, &local).unwrap();
        let names: Vec<&str> = out.iter().map(|r| r.feature_name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert!((out[0].attribution - 0.5f64.sqrt()).abs() < 1e-12);
        assert!((out[1].attribution - 0.25).abs() < 1e-12);
        assert_eq!(out[2].attribution, 0.0);
    }

    #[test]
    fn test_floor_prevents_zero_collapse() {
        let global = [AttributionRow::new("a", 0.0), AttributionRow::new("b", 1.0)];
        let local = [AttributionRow::new("a", 1.0)];

        let collapsed = GeometricMean::default().combine(&global, &local).unwrap();
        assert_eq!(collapsed[0].attribution, 0.0);

        let floored = GeometricMean::with_floor(0.01).combine(&global, &local).unwrap();
        assert!((floored[0].attribution - 0.1).abs() < 1e-12);
        assert!((floored[1].attribution - 1.0).abs() < 1e-12);
    }
}
