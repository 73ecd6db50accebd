use std::path::{Path, PathBuf};

use anyhow::{ensure, Context};
use tracing::{info, warn};

/// `{dir}/{model_name}_PermutationImportance.csv`
pub fn permutation_importance_path(dir: &Path, model_name: &str) -> PathBuf {
    dir.join(format!("{}_PermutationImportance.csv", model_name))
}

/// Raw weight per model, in `names` order: the mean of the `attribution`
/// column of its permutation importance table, or `1.0` when the table is
/// missing or unusable.
pub fn load_permutation_weights(dir: &Path, names: &[&str]) -> Vec<f64> {
    names
        .iter()
        .map(|name| {
            let path = permutation_importance_path(dir, name);
            if !path.is_file() {
                warn!(model = %name, path = %path.display(), "No permutation importance, using default weight");
                return 1.0;
            }
            match mean_attribution(&path) {
                Ok(weight) => {
                    info!(model = %name, weight, "Loaded permutation weight");
                    weight
                }
                Err(reason) => {
                    warn!(model = %name, path = %path.display(), "{:#}, using default weight", reason);
                    1.0
                }
            }
        })
        .collect()
}

fn mean_attribution(path: &Path) -> anyhow::Result<f64> {
    let mut reader = csv::Reader::from_path(path)?;
    let column = reader
        .headers()?
        .iter()
        .position(|h| h.trim() == "attribution")
        .context("no 'attribution' column")?;

    let mut sum = 0.0;
    let mut count = 0usize;
    for record in reader.records() {
        let record = record?;
        let field = record.get(column).unwrap_or("").trim();
        let value = field
            .parse::<f64>()
            .with_context(|| format!("unparseable attribution '{}'", field))?;
        sum += value;
        count += 1;
    }

    let mean = sum / count as f64;
    ensure!(count > 0 && mean.is_finite(), "no usable attribution values");
    Ok(mean)
}

/// Scale weights to sum to one; uniform when the total is not positive
pub fn normalize_weights(raw: &[f64]) -> Vec<f64> {
    if raw.is_empty() {
        return Vec::new();
    }
    let total: f64 = raw.iter().sum();
    if total > 0.0 && total.is_finite() {
        raw.iter().map(|w| w / total).collect()
    } else {
        warn!(total, "Invalid weight total, using uniform weights");
        vec![1.0 / raw.len() as f64; raw.len()]
    }
}
