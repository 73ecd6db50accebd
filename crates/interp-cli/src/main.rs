//! `interp` command-line driver
//!
//! Subcommands map onto the pipeline stages. `dispatch` runs on the login
//! node; `merge` and `finalize` are what the queued merge/finalize jobs
//! execute.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use interp_pipeline::ensemble::{
    load_permutation_weights, normalize_weights, LinearLoader, ModelManifest, DEFAULT_EXTENSIONS,
};
use interp_pipeline::{
    finalize_run, merge_run, ContextSnapshot, DispatchMode, DispatchRun, Dispatcher, FeatureFrame,
    InProcessQueue, JobId, JobQueue, PipelineConfig, ProcessRunner, ReducerKind, ScriptQueue,
    SlurmQueue, SubmissionLayout, TaskMode, WeightedVotingEnsemble,
};
use serde_json::json;
use tracing::{info, warn};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file (values it omits come from INTERP_* variables)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Submit block jobs for a snapshot, then the merge and finalize jobs
    Dispatch {
        /// Context snapshot written by the data preparation step
        #[arg(long)]
        snapshot: PathBuf,

        /// Output prefix shared by every file of the run
        #[arg(long)]
        run_prefix: String,

        /// Interpretability method (repeatable)
        #[arg(long = "method", required = true)]
        methods: Vec<String>,

        /// Samples per block (overrides INTERP_BATCH_SIZE)
        #[arg(long)]
        batch_size: Option<usize>,

        /// native, script or in-process (overrides INTERP_DISPATCH_MODE)
        #[arg(long)]
        mode: Option<DispatchMode>,

        /// per-block or array (overrides INTERP_SUBMIT_LAYOUT)
        #[arg(long)]
        layout: Option<SubmissionLayout>,
    },

    /// Merge block outputs of a run (run by the merge job)
    Merge {
        /// Run manifest (`{run_prefix}_run.json`)
        manifest: PathBuf,

        /// average or geometric (overrides INTERP_REDUCER)
        #[arg(long)]
        reducer: Option<ReducerKind>,
    },

    /// Write the run summary (run by the finalize job)
    Finalize {
        /// Run manifest (`{run_prefix}_run.json`)
        manifest: PathBuf,
    },

    /// Query SLURM for the state of every job of a run
    Status {
        /// Run manifest (`{run_prefix}_run.json`)
        manifest: PathBuf,
    },

    /// Print the normalized voting weight of each base model in a folder
    EnsembleWeights {
        /// Folder with model artifacts and permutation importance tables
        dir: PathBuf,

        /// Artifact extension for the directory scan (repeatable)
        #[arg(long = "ext")]
        extensions: Vec<String>,
    },

    /// Predict with a weighted voting ensemble of linear JSON artifacts
    EnsemblePredict {
        /// Folder with model artifacts and permutation importance tables
        dir: PathBuf,

        /// Numeric CSV with a header row
        #[arg(long)]
        input: PathBuf,

        /// classification or regression
        #[arg(long)]
        task: String,

        /// Print class probabilities instead of predictions
        #[arg(long, default_value_t = false)]
        proba: bool,
    },
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    let config = match path {
        Some(path) => PipelineConfig::from_toml_file(path)?,
        None => PipelineConfig::from_env(),
    };
    Ok(config)
}

fn build_queue(config: &PipelineConfig) -> Arc<dyn JobQueue> {
    let slurm = SlurmQueue::new(config.slurm_host.clone());
    match config.dispatch_mode {
        DispatchMode::Native => Arc::new(slurm),
        DispatchMode::Script => Arc::new(ScriptQueue::new(config.job_folder.join("scripts"), slurm)),
        DispatchMode::InProcess => Arc::new(InProcessQueue::new(ProcessRunner)),
    }
}

async fn dispatch(
    config: PipelineConfig,
    snapshot: &Path,
    run_prefix: &str,
    methods: &[String],
) -> Result<()> {
    config.validate()?;
    let snapshot = ContextSnapshot::load(snapshot)?;
    info!(
        dataset = %snapshot.dataset,
        model = %snapshot.model,
        samples = snapshot.n_samples(),
        "Loaded context snapshot"
    );

    std::fs::create_dir_all(&config.job_folder)
        .with_context(|| format!("cannot create {}", config.job_folder.display()))?;
    let queue = build_queue(&config);
    let dispatcher = Dispatcher::new(queue, config);
    let run = dispatcher.run(&snapshot, run_prefix, methods).await?;

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "run_id": run.run_id,
            "manifest": run.manifest_path(),
            "block_jobs": run.registry(),
            "merge_job": run.merge_job,
            "finalize_job": run.finalize_job,
        }))?
    );
    Ok(())
}

async fn status(config: &PipelineConfig, manifest: &Path) -> Result<()> {
    let run = DispatchRun::load(manifest)?;
    let slurm = SlurmQueue::new(config.slurm_host.clone());

    let mut jobs: Vec<(&str, JobId)> = run.registry().iter().map(|id| ("block", *id)).collect();
    jobs.extend(run.merge_job.map(|id| ("merge", id)));
    jobs.extend(run.finalize_job.map(|id| ("finalize", id)));
    if jobs.is_empty() {
        bail!("run {} has no submitted jobs", run.run_prefix);
    }

    for (kind, id) in jobs {
        let state = match slurm.job_state(id).await {
            Ok(state) => json!(state),
            Err(e) => {
                warn!(job = %id, "State query failed: {}", e);
                json!(null)
            }
        };
        println!("{}", json!({ "job": id, "kind": kind, "state": state }));
    }
    Ok(())
}

fn ensemble_weights(dir: &Path, extensions: &[String]) -> Result<()> {
    let extensions: Vec<&str> = if extensions.is_empty() {
        DEFAULT_EXTENSIONS.to_vec()
    } else {
        extensions.iter().map(String::as_str).collect()
    };
    let manifest = ModelManifest::discover(dir, &extensions)?;
    let names = manifest.names();
    if names.is_empty() {
        bail!("no base models found in {}", dir.display());
    }
    let weights = normalize_weights(&load_permutation_weights(dir, &names));
    for (name, weight) in names.iter().zip(weights) {
        println!("{}", json!({ "model": name, "weight": weight }));
    }
    Ok(())
}

fn ensemble_predict(dir: &Path, input: &Path, task: &str, proba: bool) -> Result<()> {
    let task: TaskMode = task.parse()?;
    let ensemble = WeightedVotingEnsemble::from_directory(dir, &["json"], &LinearLoader, task)?;
    let frame = FeatureFrame::from_csv(input)?;

    if proba {
        let probabilities = ensemble.predict_proba(&frame)?;
        for row in probabilities.rows() {
            println!("{}", json!(row.to_vec()));
        }
    } else {
        for value in ensemble.predict(&frame)?.iter() {
            println!("{}", value);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "interp_pipeline=info,interp=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = load_config(args.config.as_deref())?;

    match args.command {
        Command::Dispatch {
            snapshot,
            run_prefix,
            methods,
            batch_size,
            mode,
            layout,
        } => {
            if let Some(batch_size) = batch_size {
                config.batch_size = batch_size;
            }
            if let Some(mode) = mode {
                config.dispatch_mode = mode;
            }
            if let Some(layout) = layout {
                config.submit_layout = layout;
            }
            dispatch(config, &snapshot, &run_prefix, &methods).await
        }
        Command::Merge { manifest, reducer } => {
            let run = DispatchRun::load(&manifest)?;
            let reducer = reducer.unwrap_or(config.reducer).build(config.consensus_floor);
            let report = merge_run(&run, reducer.as_ref())?;
            for gap in &report.gaps {
                warn!(method = %gap.method, block = gap.block, "Merged without block output");
            }
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Finalize { manifest } => {
            let run = DispatchRun::load(&manifest)?;
            let summary = finalize_run(&run)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Command::Status { manifest } => status(&config, &manifest).await,
        Command::EnsembleWeights { dir, extensions } => ensemble_weights(&dir, &extensions),
        Command::EnsemblePredict {
            dir,
            input,
            task,
            proba,
        } => ensemble_predict(&dir, &input, &task, proba),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dispatch() {
        let args = Args::try_parse_from([
            "interp",
            "dispatch",
            "--snapshot",
            "out/RF_tox_params.bin",
            "--run-prefix",
            "out/RF_tox",
            "--method",
            "lime",
            "--method",
            "shap",
            "--mode",
            "in-process",
            "--layout",
            "array",
        ])
        .unwrap();

        match args.command {
            Command::Dispatch {
                methods,
                mode,
                layout,
                batch_size,
                ..
            } => {
                assert_eq!(methods, vec!["lime", "shap"]);
                assert_eq!(mode, Some(DispatchMode::InProcess));
                assert_eq!(layout, Some(SubmissionLayout::ArrayPerMethod));
                assert_eq!(batch_size, None);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_dispatch_requires_a_method() {
        assert!(Args::try_parse_from([
            "interp",
            "dispatch",
            "--snapshot",
            "s.bin",
            "--run-prefix",
            "p"
        ])
        .is_err());
    }

    #[test]
    fn test_parse_merge_reducer() {
        let args = Args::try_parse_from(["interp", "merge", "run.json", "--reducer", "gmean"]).unwrap();
        match args.command {
            Command::Merge { manifest, reducer } => {
                assert_eq!(manifest, PathBuf::from("run.json"));
                assert_eq!(reducer, Some(ReducerKind::GeometricMean));
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert!(Args::try_parse_from(["interp", "merge", "run.json", "--reducer", "median"]).is_err());
    }

    #[test]
    fn test_ensemble_weights_prints_for_scanned_models() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("RF_tox.joblib"), b"").unwrap();
        assert!(ensemble_weights(dir.path(), &[]).is_ok());
        assert!(ensemble_weights(dir.path(), &["json".to_string()]).is_err());
    }
}
