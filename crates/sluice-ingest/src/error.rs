//! Error taxonomy for the ingest pipeline
//!
//! Per-task failures ([`FetchError`]) are converted into placeholders at the
//! task boundary. Stage-level failures ([`LoadError`], [`LocateError`], or a
//! failed total probe) reach the orchestrator as a [`PipelineError`].

use thiserror::Error;

use crate::pipeline::Stage;

/// Failure of a single request against the source API
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("Failed to decode response from {url}: {reason}")]
    Decode { url: String, reason: String },

    #[error("Invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Credential provider failed: {0}")]
    Credentials(String),
}

/// Failure while staging or loading a dataset into the warehouse
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Failed to connect to warehouse: {0}")]
    Connect(String),

    #[error("Warehouse {operation} failed: {reason}")]
    Sink {
        operation: &'static str,
        reason: String,
    },

    #[error("Staging I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize dataset: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Load into {table} failed: {reason}")]
    TotalFailure { table: String, reason: String },
}

impl LoadError {
    pub fn sink(operation: &'static str, reason: impl std::fmt::Display) -> Self {
        Self::Sink {
            operation,
            reason: reason.to_string(),
        }
    }

    /// True when the sink rejected the whole batch, as opposed to the sink
    /// itself being unusable
    pub fn is_total_failure(&self) -> bool {
        matches!(self, LoadError::TotalFailure { .. })
    }
}

/// Failure while resolving or downloading a published resource
#[derive(Error, Debug)]
pub enum LocateError {
    #[error("No loadable resources found for {0}")]
    NoCandidates(String),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("Failed to write download: {0}")]
    Io(#[from] std::io::Error),
}

/// Missing or invalid configuration, reported before any work starts
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required environment variable(s): {}", .0.join(", "))]
    Missing(Vec<String>),

    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },
}

/// Underlying cause of a stage failure
#[derive(Error, Debug)]
pub enum StageError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Locate(#[from] LocateError),

    #[error("{0}")]
    Aborted(String),
}

/// A fatal failure that halted the pipeline
#[derive(Error, Debug)]
#[error("{stage} stage failed (last completed stage: {}): {source}", last_completed_label(.last_completed))]
pub struct PipelineError {
    pub stage: Stage,
    pub last_completed: Option<Stage>,
    #[source]
    pub source: StageError,
}

fn last_completed_label(stage: &Option<Stage>) -> String {
    stage
        .map(|s| s.to_string())
        .unwrap_or_else(|| "none".to_string())
}
