//! Context snapshot store
//!
//! A run's shared parameters are encoded once to `{run_prefix}_params.bin`
//! and read back by every block job. The first writer wins: if the file
//! already exists the write is skipped. The bytes go to a temporary file
//! in the same directory and are published with a no-clobber rename, so a
//! reader never sees a partial snapshot.

use std::io::Write;
use std::path::{Path, PathBuf};

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::error::{PipelineError, PipelineResult};

/// File suffix appended to the run prefix
pub const SNAPSHOT_SUFFIX: &str = "_params.bin";

/// Path of the snapshot for a run prefix
pub fn snapshot_path(run_prefix: &str) -> PathBuf {
    PathBuf::from(format!("{}{}", run_prefix, SNAPSHOT_SUFFIX))
}

/// Read-only bundle of shared run parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    /// Samples to explain, one row per sample
    pub features: Array2<f64>,
    /// Feature names, one per column
    pub ids: Vec<String>,
    /// Dataset name
    pub dataset: String,
    /// Name of the model being explained
    pub model: String,
    /// Run identifier (UUID v4)
    pub run_id: String,
    /// Path of the configuration the run was launched with
    pub config_ref: PathBuf,
}

/// Outcome of [`ContextSnapshot::write_once`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotWrite {
    /// This call created the file
    Written { fingerprint: String },
    /// A snapshot was already present; nothing was written
    AlreadyPresent,
}

impl ContextSnapshot {
    /// Create a snapshot, checking that every column has a name
    pub fn new(
        features: Array2<f64>,
        ids: Vec<String>,
        dataset: impl Into<String>,
        model: impl Into<String>,
        config_ref: impl Into<PathBuf>,
    ) -> PipelineResult<Self> {
        if ids.len() != features.ncols() {
            return Err(PipelineError::config(format!(
                "id list has {} names but the feature matrix has {} columns",
                ids.len(),
                features.ncols()
            )));
        }
        Ok(Self {
            features,
            ids,
            dataset: dataset.into(),
            model: model.into(),
            run_id: uuid::Uuid::new_v4().to_string(),
            config_ref: config_ref.into(),
        })
    }

    /// Number of samples
    pub fn n_samples(&self) -> usize {
        self.features.nrows()
    }

    fn encode(&self) -> PipelineResult<Vec<u8>> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| PipelineError::config(format!("failed to encode snapshot: {}", e)))
    }

    /// Write the snapshot unless `path` already exists
    pub fn write_once(&self, path: &Path) -> PipelineResult<SnapshotWrite> {
        if path.exists() {
            debug!(path = %path.display(), "Snapshot already present, skipping write");
            return Ok(SnapshotWrite::AlreadyPresent);
        }

        let bytes = self.encode()?;
        let parent = match path.parent().filter(|p| !p.as_os_str().is_empty()) {
            Some(parent) => {
                std::fs::create_dir_all(parent)?;
                parent
            }
            None => Path::new("."),
        };

        // the file only appears at `path` once it is complete
        let mut tmp = NamedTempFile::new_in(parent)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        match tmp.persist_noclobber(path) {
            Ok(_) => {}
            Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => {
                debug!(path = %path.display(), "Snapshot created concurrently, skipping write");
                return Ok(SnapshotWrite::AlreadyPresent);
            }
            Err(e) => return Err(e.error.into()),
        }

        let fingerprint = blake3::hash(&bytes).to_hex().to_string();
        info!(
            path = %path.display(),
            samples = self.n_samples(),
            features = self.ids.len(),
            fingerprint = %fingerprint,
            "Context snapshot written"
        );
        Ok(SnapshotWrite::Written { fingerprint })
    }

    /// Load a snapshot written by [`ContextSnapshot::write_once`]
    pub fn load(path: &Path) -> PipelineResult<Self> {
        let bytes = std::fs::read(path).map_err(|e| {
            PipelineError::config(format!(
                "cannot read context snapshot {}: {}",
                path.display(),
                e
            ))
        })?;
        let (snapshot, _): (ContextSnapshot, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard()).map_err(
                |e| {
                    PipelineError::config(format!(
                        "corrupt context snapshot {}: {}",
                        path.display(),
                        e
                    ))
                },
            )?;
        debug!(
            path = %path.display(),
            fingerprint = %blake3::hash(&bytes).to_hex(),
            "Context snapshot loaded"
        );
        Ok(snapshot)
    }
}
