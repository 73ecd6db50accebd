use super::{group_by_feature, union_rows, AttributionRow, ConsensusReducer, ConsensusRow};
use crate::error::PipelineResult;

/// Arithmetic mean of every row for a feature, global and local alike
#[derive(Debug, Clone, Copy, Default)]
pub struct AverageMean;

impl ConsensusReducer for AverageMean {
    fn name(&self) -> &'static str {
        "average"
    }

    fn combine(
        &self,
        global: &[AttributionRow],
        local: &[AttributionRow],
    ) -> PipelineResult<Vec<ConsensusRow>> {
        let rows = union_rows(global, local)?;
        let groups = group_by_feature(
            rows.iter()
                .map(|r| (r.feature_name.as_str(), r.attribution)),
        );

        Ok(groups
            .into_iter()
            .map(|(feature, values)| ConsensusRow {
                feature_name: feature.to_string(),
                attribution: values.iter().sum::<f64>() / values.len() as f64,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_over_union() {
        let global = [AttributionRow::new("f1", 0.2)];
        let local = [AttributionRow::new("f1", 0.4), AttributionRow::new("f2", 0.6)];

        let out = AverageMean.combine(&global, &local).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].feature_name, "f1");
        assert!((out[0].attribution - 0.3).abs() < 1e-12);
        assert_eq!(out[1].feature_name, "f2");
        assert!((out[1].attribution - 0.6).abs() < 1e-12);
    }

    #[test]
    fn test_negative_values_kept_unscaled() {
        let local = [
            AttributionRow::new("b", -1.0),
            AttributionRow::new("a", 3.0),
            AttributionRow::new("b", -3.0),
        ];
        let out = AverageMean.combine(&[], &local).unwrap();
        let pairs: Vec<(&str, f64)> = out
            .iter()
            .map(|r| (r.feature_name.as_str(), r.attribution))
            .collect();
        assert_eq!(pairs, vec![("a", 3.0), ("b", -2.0)]);
    }
}
