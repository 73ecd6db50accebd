//! Base model discovery
//!
//! A `models.json` manifest lists each model's name, artifact and declared
//! capabilities. Without one, a results folder is scanned for artifacts and
//! each file's name up to the first `_` becomes the model name.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::model::{ArtifactLoader, BaseModel};
use crate::error::{PipelineError, PipelineResult};

/// Manifest file name looked up inside a models folder
pub const MANIFEST_FILE: &str = "models.json";

/// Default artifact extensions for the directory scan
pub const DEFAULT_EXTENSIONS: &[&str] = &["joblib"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Predict,
    PredictProba,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEntry {
    pub name: String,
    pub artifact: PathBuf,
    #[serde(default = "default_capabilities")]
    pub capabilities: Vec<Capability>,
}

fn default_capabilities() -> Vec<Capability> {
    vec![Capability::Predict]
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelManifest {
    pub models: Vec<ModelEntry>,
}

impl ModelManifest {
    /// Read a manifest; relative artifact paths resolve against its folder
    pub fn load(path: &Path) -> PipelineResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::config(format!("cannot read model manifest {}: {}", path.display(), e))
        })?;
        let mut manifest: ModelManifest = serde_json::from_str(&content)?;
        let base = path.parent().unwrap_or_else(|| Path::new(""));
        for entry in &mut manifest.models {
            if entry.artifact.is_relative() {
                entry.artifact = base.join(&entry.artifact);
            }
        }
        Ok(manifest)
    }

    /// `models.json` inside `dir` if present, otherwise a directory scan
    pub fn discover(dir: &Path, extensions: &[&str]) -> PipelineResult<Self> {
        let manifest = dir.join(MANIFEST_FILE);
        if manifest.is_file() {
            info!(path = %manifest.display(), "Using model manifest");
            Self::load(&manifest)
        } else {
            debug!(dir = %dir.display(), "No model manifest, scanning artifacts");
            scan_artifacts(dir, extensions)
        }
    }

    pub fn names(&self) -> Vec<&str> {
        self.models.iter().map(|m| m.name.as_str()).collect()
    }

    /// Load every entry, logging and skipping the ones that fail
    pub fn load_models(&self, loader: &dyn ArtifactLoader) -> Vec<BaseModel> {
        let mut models = Vec::new();
        for entry in &self.models {
            match loader.load(entry) {
                Ok(model) => {
                    if entry.capabilities.contains(&Capability::PredictProba)
                        && model.as_probabilistic().is_none()
                    {
                        warn!(model = %entry.name, "Declared predict_proba but the loaded model has none");
                    }
                    info!(model = %entry.name, artifact = %entry.artifact.display(), "Loaded base model");
                    models.push(model);
                }
                Err(e) => {
                    error!(model = %entry.name, artifact = %entry.artifact.display(), "Failed to load base model: {:#}", e);
                }
            }
        }
        if models.is_empty() {
            warn!("No base model could be loaded");
        }
        models
    }
}

/// Build a manifest from the artifacts in `dir`.
///
/// Files are visited in name order; when two artifacts map to the same model
/// name the first one is kept.
pub fn scan_artifacts(dir: &Path, extensions: &[&str]) -> PipelineResult<ModelManifest> {
    let extensions = if extensions.is_empty() {
        DEFAULT_EXTENSIONS
    } else {
        extensions
    };

    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(|e| PipelineError::config(format!("cannot scan {}: {}", dir.display(), e)))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file())
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| extensions.iter().any(|want| want.eq_ignore_ascii_case(ext)))
        })
        .collect();
    files.sort();

    let mut seen = HashSet::new();
    let mut models = Vec::new();
    for path in files {
        let Some(stem) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let name = stem.split('_').next().unwrap_or(stem);
        let name = name.split('.').next().unwrap_or(name).to_string();
        if !seen.insert(name.clone()) {
            warn!(model = %name, path = %path.display(), "Duplicate model name, keeping the first artifact");
            continue;
        }
        models.push(ModelEntry {
            name,
            artifact: path,
            capabilities: default_capabilities(),
        });
    }
    Ok(ModelManifest { models })
}
