//! Warehouse bulk loading
//!
//! A dataset travels `local file -> named stage -> table`. The [`BulkSink`]
//! trait is that three-step protocol over a single connection; the
//! [`BulkLoader`] drives it and folds the sink's per-file statuses into a
//! [`LoadOutcome`].
//!
//! Two sinks ship with the crate:
//! - [`PostgresSink`] stages into a local directory and inserts JSONB rows
//! - [`MemorySink`] keeps everything in process, for dry runs and tests

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sluice_common::types::Identifier;
use std::path::Path;

use crate::error::LoadError;

mod bulk;
pub mod format;
mod memory;
mod postgres;

pub use bulk::BulkLoader;
pub use format::{into_batches, parse_records, FileFormat, LoadBatch, ParsedRecord, ParsedRecords};
pub use memory::{MemoryConnector, MemorySink, MemoryWarehouse, StoredRow};
pub use postgres::{PostgresConnector, PostgresSink};

/// A file inside a named stage, written `@stage/file`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StageLocation {
    pub stage: String,
    pub file_name: String,
}

impl StageLocation {
    pub fn new(stage: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            file_name: file_name.into(),
        }
    }

    /// Same stage, file name with an extra suffix (e.g. `.gz`)
    pub fn with_suffix(&self, suffix: &str) -> Self {
        Self::new(self.stage.clone(), format!("{}{}", self.file_name, suffix))
    }
}

impl std::fmt::Display for StageLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "@{}/{}", self.stage, self.file_name)
    }
}

/// What the sink recorded for a staged file
#[derive(Debug, Clone)]
pub struct StageReceipt {
    pub file_name: String,
    pub size: u64,
    /// `sha256:<hex>`
    pub checksum: String,
}

/// Column names a load writes into
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnLayout {
    /// Receives each row as JSON
    pub payload: Identifier,
    /// Receives the staged file name
    pub source_file: Option<Identifier>,
    /// Receives the load time, supplied by the sink
    pub ingested_at: Option<Identifier>,
}

/// Row-level error handling requested from the sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    /// Load every valid row, count the rest
    #[default]
    Continue,
    /// Load nothing if any row is bad
    Abort,
}

impl std::str::FromStr for OnError {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "continue" => Ok(Self::Continue),
            "abort" | "abort_statement" => Ok(Self::Abort),
            other => Err(format!("expected 'continue' or 'abort', got '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadCategory {
    Loaded,
    PartiallyLoaded,
    LoadFailed,
}

/// Status the sink reports for one file of one load
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadStatus {
    pub file: String,
    pub category: LoadCategory,
    pub rows_parsed: u64,
    pub rows_loaded: u64,
    pub errors_seen: u64,
    pub first_error: Option<String>,
}

impl LoadStatus {
    /// Classify a load from its counts
    pub fn from_counts(
        file: impl Into<String>,
        rows_parsed: u64,
        rows_loaded: u64,
        errors_seen: u64,
        first_error: Option<String>,
    ) -> Self {
        let category = match (rows_loaded, errors_seen) {
            (_, 0) => LoadCategory::Loaded,
            (0, _) => LoadCategory::LoadFailed,
            _ => LoadCategory::PartiallyLoaded,
        };
        Self {
            file: file.into(),
            category,
            rows_parsed,
            rows_loaded,
            errors_seen,
            first_error,
        }
    }

    /// A file the sink could not read at all
    pub fn failed(file: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            category: LoadCategory::LoadFailed,
            rows_parsed: 0,
            rows_loaded: 0,
            errors_seen: 1,
            first_error: Some(reason.into()),
        }
    }
}

/// Summary of one dataset load
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadOutcome {
    pub table: String,
    pub file: String,
    pub loaded: u64,
    pub failed: u64,
    pub first_error: Option<String>,
    pub truncated: bool,
}

impl LoadOutcome {
    pub fn is_partial(&self) -> bool {
        self.failed > 0
    }
}

/// Where and how one dataset lands in the warehouse
#[derive(Debug, Clone)]
pub struct LoadTarget {
    pub table: Identifier,
    pub stage: String,
    pub layout: ColumnLayout,
    pub format: FileFormat,
    /// Empty the table before loading (full refresh)
    pub truncate: bool,
    pub on_error: OnError,
}

/// Arguments for [`BulkSink::load`]
#[derive(Debug, Clone)]
pub struct LoadRequest<'a> {
    pub table: &'a Identifier,
    pub source: &'a StageLocation,
    pub layout: &'a ColumnLayout,
    pub format: FileFormat,
    pub on_error: OnError,
    pub batch_size: usize,
}

/// One open warehouse connection
#[async_trait]
pub trait BulkSink: Send {
    /// Upload a local file into a named stage
    async fn stage(
        &mut self,
        local_path: &Path,
        location: &StageLocation,
        overwrite: bool,
    ) -> Result<StageReceipt, LoadError>;

    /// Remove a staged file. Returns whether anything was removed.
    async fn remove(&mut self, location: &StageLocation) -> Result<bool, LoadError>;

    /// Delete every row of `table`
    async fn clear(&mut self, table: &Identifier) -> Result<(), LoadError>;

    /// Load a staged file into a table
    async fn load(&mut self, request: &LoadRequest<'_>) -> Result<Vec<LoadStatus>, LoadError>;

    async fn close(&mut self) -> Result<(), LoadError>;
}

/// Opens sink connections
#[async_trait]
pub trait SinkConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn BulkSink>, LoadError>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_status_categories() {
        assert_eq!(LoadStatus::from_counts("f", 10, 10, 0, None).category, LoadCategory::Loaded);
        assert_eq!(LoadStatus::from_counts("f", 0, 0, 0, None).category, LoadCategory::Loaded);
        assert_eq!(
            LoadStatus::from_counts("f", 10, 9, 1, Some("row 3".into())).category,
            LoadCategory::PartiallyLoaded
        );
        assert_eq!(
            LoadStatus::from_counts("f", 10, 0, 1, None).category,
            LoadCategory::LoadFailed
        );
        assert_eq!(LoadStatus::failed("f", "bad").errors_seen, 1);
    }

    #[test]
    fn test_stage_location_display() {
        let location = StageLocation::new("spotify_stage", "all_items.json");
        assert_eq!(location.to_string(), "@spotify_stage/all_items.json");
        assert_eq!(location.with_suffix(".gz").file_name, "all_items.json.gz");
    }

    #[test]
    fn test_on_error_from_str() {
        assert_eq!("CONTINUE".parse::<OnError>().unwrap(), OnError::Continue);
        assert_eq!("abort_statement".parse::<OnError>().unwrap(), OnError::Abort);
        assert!("skip".parse::<OnError>().is_err());
    }
}
