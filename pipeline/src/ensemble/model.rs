use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, ensure, Context};
use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};

use super::manifest::{Capability, ModelEntry};
use super::FeatureFrame;

/// A trained model that produces one value per sample
pub trait Predictor: Send + Sync {
    fn predict(&self, x: &FeatureFrame) -> anyhow::Result<Array1<f64>>;

    /// Column names the model was trained on, when it records them
    fn expected_features(&self) -> Option<&[String]> {
        None
    }
}

impl<F> Predictor for F
where
    F: Fn(&FeatureFrame) -> anyhow::Result<Array1<f64>> + Send + Sync,
{
    fn predict(&self, x: &FeatureFrame) -> anyhow::Result<Array1<f64>> {
        self(x)
    }
}

/// A classifier that also reports per-class probabilities (`n_samples x n_classes`)
pub trait ProbabilisticPredictor: Predictor {
    fn predict_proba(&self, x: &FeatureFrame) -> anyhow::Result<Array2<f64>>;
}

/// A loaded base model with its capabilities resolved once
#[derive(Clone)]
pub struct BaseModel {
    name: String,
    predictor: Arc<dyn Predictor>,
    probabilistic: Option<Arc<dyn ProbabilisticPredictor>>,
}

impl std::fmt::Debug for BaseModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BaseModel")
            .field("name", &self.name)
            .field("probabilistic", &self.probabilistic.is_some())
            .finish()
    }
}

impl BaseModel {
    /// Model that can only `predict`
    pub fn predictor(name: impl Into<String>, model: impl Predictor + 'static) -> Self {
        Self {
            name: name.into(),
            predictor: Arc::new(model),
            probabilistic: None,
        }
    }

    /// Model that can `predict` and `predict_proba`
    pub fn probabilistic<M>(name: impl Into<String>, model: M) -> Self
    where
        M: ProbabilisticPredictor + 'static,
    {
        let model = Arc::new(model);
        let probabilistic: Arc<dyn ProbabilisticPredictor> = model.clone();
        Self {
            name: name.into(),
            predictor: model,
            probabilistic: Some(probabilistic),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn predict(&self, x: &FeatureFrame) -> anyhow::Result<Array1<f64>> {
        self.predictor.predict(x)
    }

    /// `None` when the model has no probabilistic capability
    pub fn as_probabilistic(&self) -> Option<&dyn ProbabilisticPredictor> {
        self.probabilistic.as_deref()
    }

    pub fn expected_features(&self) -> Option<&[String]> {
        self.predictor.expected_features()
    }

    pub fn capabilities(&self) -> Vec<Capability> {
        let mut caps = vec![Capability::Predict];
        if self.probabilistic.is_some() {
            caps.push(Capability::PredictProba);
        }
        caps
    }
}

/// Turns a manifest entry into a model
pub trait ArtifactLoader: Send + Sync {
    fn load(&self, entry: &ModelEntry) -> anyhow::Result<BaseModel>;
}

/// Linear model stored as JSON.
///
/// One coefficient row is a regressor (`x . w + b`). Two or more rows form a
/// classifier over classes `0..n`, scored per class with softmax
/// probabilities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearArtifact {
    pub features: Vec<String>,
    pub coefficients: Vec<Vec<f64>>,
    pub intercepts: Vec<f64>,
}

impl LinearArtifact {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read artifact {}", path.display()))?;
        let artifact: LinearArtifact = serde_json::from_str(&content)
            .with_context(|| format!("invalid linear artifact {}", path.display()))?;
        artifact.check()?;
        Ok(artifact)
    }

    fn check(&self) -> anyhow::Result<()> {
        ensure!(!self.coefficients.is_empty(), "artifact has no coefficient rows");
        ensure!(
            self.intercepts.len() == self.coefficients.len(),
            "{} intercept(s) for {} coefficient row(s)",
            self.intercepts.len(),
            self.coefficients.len()
        );
        for row in &self.coefficients {
            ensure!(
                row.len() == self.features.len(),
                "coefficient row has {} value(s) for {} feature(s)",
                row.len(),
                self.features.len()
            );
        }
        Ok(())
    }

    pub fn is_classifier(&self) -> bool {
        self.coefficients.len() > 1
    }

    /// `n_samples x n_outputs` raw scores
    fn scores(&self, x: &FeatureFrame) -> anyhow::Result<Array2<f64>> {
        let mut selected = Array2::zeros((x.nrows(), self.features.len()));
        for (j, name) in self.features.iter().enumerate() {
            let Some(col) = x.column(name) else {
                bail!("missing feature column '{}'", name);
            };
            selected.column_mut(j).assign(&col);
        }

        let flat: Vec<f64> = self.coefficients.iter().flatten().copied().collect();
        let weights = Array2::from_shape_vec((self.coefficients.len(), self.features.len()), flat)?;
        let intercepts = Array1::from_vec(self.intercepts.clone());
        Ok(selected.dot(&weights.t()) + &intercepts)
    }
}

impl Predictor for LinearArtifact {
    fn predict(&self, x: &FeatureFrame) -> anyhow::Result<Array1<f64>> {
        let scores = self.scores(x)?;
        if !self.is_classifier() {
            return Ok(scores.column(0).to_owned());
        }
        Ok(scores
            .axis_iter(Axis(0))
            .map(|row| {
                row.iter()
                    .enumerate()
                    .fold((0usize, f64::NEG_INFINITY), |best, (i, &v)| {
                        if v > best.1 {
                            (i, v)
                        } else {
                            best
                        }
                    })
                    .0 as f64
            })
            .collect())
    }

    fn expected_features(&self) -> Option<&[String]> {
        Some(&self.features)
    }
}

impl ProbabilisticPredictor for LinearArtifact {
    fn predict_proba(&self, x: &FeatureFrame) -> anyhow::Result<Array2<f64>> {
        ensure!(self.is_classifier(), "regression artifact has no class probabilities");
        let mut scores = self.scores(x)?;
        for mut row in scores.axis_iter_mut(Axis(0)) {
            let max = row.fold(f64::NEG_INFINITY, |m, &v| m.max(v));
            row.mapv_inplace(|v| (v - max).exp());
            let total = row.sum();
            row.mapv_inplace(|v| v / total);
        }
        Ok(scores)
    }
}

/// Loads [`LinearArtifact`] JSON files
#[derive(Debug, Clone, Copy, Default)]
pub struct LinearLoader;

impl ArtifactLoader for LinearLoader {
    fn load(&self, entry: &ModelEntry) -> anyhow::Result<BaseModel> {
        let artifact = LinearArtifact::from_file(&entry.artifact)?;
        Ok(if artifact.is_classifier() {
            BaseModel::probabilistic(&entry.name, artifact)
        } else {
            BaseModel::predictor(&entry.name, artifact)
        })
    }
}
