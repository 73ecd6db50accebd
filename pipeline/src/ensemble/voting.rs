use std::collections::BTreeMap;
use std::path::Path;

use ndarray::{Array1, Array2, Axis};
use tracing::{debug, error, info, warn};

use super::manifest::ModelManifest;
use super::model::{ArtifactLoader, BaseModel};
use super::weights::{load_permutation_weights, normalize_weights};
use super::{FeatureFrame, TaskMode};
use crate::error::{PipelineError, PipelineResult};

/// Weighted combination of already-trained base models.
///
/// Weights stay as given for every call. When a model fails, its weight is
/// simply absent from that call; the rest are not rescaled.
#[derive(Debug, Clone)]
pub struct WeightedVotingEnsemble {
    models: Vec<BaseModel>,
    weights: Vec<f64>,
    task: TaskMode,
}

impl WeightedVotingEnsemble {
    pub fn new(models: Vec<BaseModel>, weights: Vec<f64>, task: TaskMode) -> PipelineResult<Self> {
        if models.is_empty() {
            return Err(PipelineError::config("ensemble needs at least one base model"));
        }
        if weights.len() != models.len() {
            return Err(PipelineError::config(format!(
                "{} weight(s) for {} base model(s)",
                weights.len(),
                models.len()
            )));
        }
        Ok(Self {
            models,
            weights,
            task,
        })
    }

    /// Discover, load and weight every base model in a results folder
    pub fn from_directory(
        dir: &Path,
        extensions: &[&str],
        loader: &dyn ArtifactLoader,
        task: TaskMode,
    ) -> PipelineResult<Self> {
        let manifest = ModelManifest::discover(dir, extensions)?;
        let models = manifest.load_models(loader);
        let names: Vec<&str> = models.iter().map(BaseModel::name).collect();
        let weights = normalize_weights(&load_permutation_weights(dir, &names));
        info!(models = ?names, ?weights, %task, "Built voting ensemble");
        Self::new(models, weights, task)
    }

    pub fn task(&self) -> TaskMode {
        self.task
    }

    pub fn models(&self) -> &[BaseModel] {
        &self.models
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    /// Warn about expected columns missing from `x`; never fails
    pub fn validate_features(&self, x: &FeatureFrame) {
        for model in &self.models {
            if let Some(expected) = model.expected_features() {
                let missing = x.missing(expected);
                if !missing.is_empty() {
                    warn!(model = %model.name(), ?missing, "Input lacks expected features");
                }
            }
        }
    }

    /// Weighted vote (classification) or weighted average (regression)
    pub fn predict(&self, x: &FeatureFrame) -> PipelineResult<Array1<f64>> {
        self.validate_features(x);

        let mut predictions = Vec::new();
        let mut weights = Vec::new();
        for (model, &weight) in self.models.iter().zip(&self.weights) {
            match model.predict(x) {
                Ok(p) if p.len() != x.nrows() => {
                    error!(model = %model.name(), got = p.len(), expected = x.nrows(), "Prediction length mismatch");
                }
                Ok(p) => match invalid_output(self.task, &p) {
                    Some(value) => {
                        error!(model = %model.name(), value, task = %self.task, "Invalid prediction, skipping model");
                    }
                    None => {
                        predictions.push(p);
                        weights.push(weight);
                    }
                },
                Err(e) => {
                    error!(model = %model.name(), "predict failed: {:#}", e);
                }
            }
        }

        if predictions.is_empty() {
            return Err(PipelineError::no_valid_output("predict", self.models.len()));
        }
        debug!(used = predictions.len(), of = self.models.len(), "Combining predictions");

        match self.task {
            TaskMode::Classification => Ok(weighted_vote(&predictions, &weights, x.nrows())),
            TaskMode::Regression => weighted_average(&predictions, &weights, x.nrows()),
        }
    }

    /// Row-normalized weighted sum of base model probabilities
    pub fn predict_proba(&self, x: &FeatureFrame) -> PipelineResult<Array2<f64>> {
        if self.task != TaskMode::Classification {
            return Err(PipelineError::unsupported_task(format!(
                "predict_proba in {} mode",
                self.task
            )));
        }
        self.validate_features(x);

        let mut total: Option<Array2<f64>> = None;
        let mut attempted = 0;
        for (model, &weight) in self.models.iter().zip(&self.weights) {
            let Some(proba_model) = model.as_probabilistic() else {
                debug!(model = %model.name(), "No predict_proba, skipping");
                continue;
            };
            attempted += 1;

            let proba = match proba_model.predict_proba(x) {
                Ok(p) => p,
                Err(e) => {
                    error!(model = %model.name(), "predict_proba failed: {:#}", e);
                    continue;
                }
            };
            let expected_rows = x.nrows();
            let shape_ok = proba.nrows() == expected_rows
                && proba.ncols() > 0
                && total.as_ref().map_or(true, |t| t.dim() == proba.dim());
            if !shape_ok {
                error!(model = %model.name(), shape = ?proba.dim(), "Probability shape mismatch");
                continue;
            }

            match total.as_mut() {
                Some(t) => t.scaled_add(weight, &proba),
                None => total = Some(proba * weight),
            }
        }

        let Some(mut total) = total else {
            return Err(PipelineError::no_valid_output("predict_proba", attempted));
        };

        let n_classes = total.ncols() as f64;
        for mut row in total.axis_iter_mut(Axis(0)) {
            let sum = row.sum();
            if sum != 0.0 && sum.is_finite() {
                row.mapv_inplace(|v| v / sum);
            } else {
                row.fill(1.0 / n_classes);
            }
        }
        Ok(total)
    }
}

/// First value a model may not contribute: non-finite in any mode, and not a
/// whole class label in classification
fn invalid_output(task: TaskMode, prediction: &Array1<f64>) -> Option<f64> {
    prediction.iter().copied().find(|v| match task {
        TaskMode::Classification => !v.is_finite() || v.fract() != 0.0,
        TaskMode::Regression => !v.is_finite(),
    })
}

/// Per sample, the class with the largest summed weight; ties go to the
/// lowest class label
fn weighted_vote(predictions: &[Array1<f64>], weights: &[f64], n_samples: usize) -> Array1<f64> {
    let mut result = Array1::zeros(n_samples);
    for i in 0..n_samples {
        let mut votes: BTreeMap<i64, f64> = BTreeMap::new();
        for (pred, &weight) in predictions.iter().zip(weights) {
            // labels are whole and finite, see `invalid_output`
            *votes.entry(pred[i] as i64).or_insert(0.0) += weight;
        }

        let mut winner: Option<(i64, f64)> = None;
        for (class, score) in votes {
            if winner.map_or(true, |(_, best)| score > best) {
                winner = Some((class, score));
            }
        }
        result[i] = winner.map_or(0.0, |(class, _)| class as f64);
    }
    result
}

fn weighted_average(
    predictions: &[Array1<f64>],
    weights: &[f64],
    n_samples: usize,
) -> PipelineResult<Array1<f64>> {
    let weight_sum: f64 = weights.iter().sum();
    if weight_sum == 0.0 || !weight_sum.is_finite() {
        return Err(PipelineError::aggregation(format!(
            "weights of the surviving models sum to {}",
            weight_sum
        )));
    }

    let mut result = Array1::zeros(n_samples);
    for (pred, &weight) in predictions.iter().zip(weights) {
        result.scaled_add(weight, pred);
    }
    Ok(result / weight_sum)
}
