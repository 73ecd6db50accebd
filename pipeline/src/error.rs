//! Pipeline error types
//!
//! One error enum covers the whole pipeline. Recoverable conditions
//! (a missing block output, a failing base model) are normally logged and
//! absorbed where they happen; they only surface here when every source
//! failed and there is nothing left to return.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Errors that can occur while partitioning, dispatching or combining results
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Shared run context is invalid or missing
    #[error("Configuration error: {message}")]
    ConfigurationError { message: String },

    /// Invalid batch size or empty dataset
    #[error("Partition error: {message}")]
    PartitionError { message: String },

    /// The job queue rejected a job
    #[error("Job submission failed for '{job}': {message}")]
    SubmissionError { job: String, message: String },

    /// An expected block output was missing at merge time
    #[error("Missing output for method '{method}' block {block}: {path}")]
    PartialResultGap {
        method: String,
        block: usize,
        path: PathBuf,
    },

    /// A reducer or merge step had nothing to work with
    #[error("Aggregation error: {message}")]
    AggregationError { message: String },

    /// Every base model failed for a single call
    #[error("No valid {operation} output from any of {attempted} base model(s)")]
    NoValidBaseModelOutput { operation: String, attempted: usize },

    /// Task mode the ensemble cannot combine
    #[error("Unsupported task mode: {mode}")]
    UnsupportedTaskMode { mode: String },

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV read/write error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// TOML config parse error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl PipelineError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigurationError {
            message: message.into(),
        }
    }

    /// Create a partition error
    pub fn partition(message: impl Into<String>) -> Self {
        Self::PartitionError {
            message: message.into(),
        }
    }

    /// Create a submission error
    pub fn submission(job: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SubmissionError {
            job: job.into(),
            message: message.into(),
        }
    }

    /// Create a partial result gap
    pub fn gap(method: impl Into<String>, block: usize, path: impl Into<PathBuf>) -> Self {
        Self::PartialResultGap {
            method: method.into(),
            block,
            path: path.into(),
        }
    }

    /// Create an aggregation error
    pub fn aggregation(message: impl Into<String>) -> Self {
        Self::AggregationError {
            message: message.into(),
        }
    }

    /// Create a no-valid-output error for an ensemble call
    pub fn no_valid_output(operation: impl Into<String>, attempted: usize) -> Self {
        Self::NoValidBaseModelOutput {
            operation: operation.into(),
            attempted,
        }
    }

    /// Create an unsupported task mode error
    pub fn unsupported_task(mode: impl Into<String>) -> Self {
        Self::UnsupportedTaskMode { mode: mode.into() }
    }

    /// Whether the caller is expected to log this and carry on
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::PartialResultGap { .. })
    }

    /// Stable machine-readable code, used in run summaries
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConfigurationError { .. } => "CONFIGURATION_ERROR",
            Self::PartitionError { .. } => "PARTITION_ERROR",
            Self::SubmissionError { .. } => "SUBMISSION_ERROR",
            Self::PartialResultGap { .. } => "PARTIAL_RESULT_GAP",
            Self::AggregationError { .. } => "AGGREGATION_ERROR",
            Self::NoValidBaseModelOutput { .. } => "NO_VALID_BASE_MODEL_OUTPUT",
            Self::UnsupportedTaskMode { .. } => "UNSUPPORTED_TASK_MODE",
            Self::Io(_) => "IO_ERROR",
            Self::Json(_) => "JSON_ERROR",
            Self::Csv(_) => "CSV_ERROR",
            Self::Toml(_) => "TOML_ERROR",
        }
    }
}
