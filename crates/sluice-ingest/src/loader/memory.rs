//! In-process warehouse used by `--dry-run` and the test suite

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sluice_common::checksum::Checksum;
use sluice_common::types::Identifier;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::format::parse_records;
use super::{BulkSink, LoadRequest, LoadStatus, OnError, SinkConnector, StageLocation, StageReceipt};
use crate::error::LoadError;

/// One row as the sink wrote it
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub payload: Value,
    pub source_file: Option<String>,
    pub ingested_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct WarehouseState {
    tables: HashMap<String, Vec<StoredRow>>,
    stages: HashMap<StageLocation, Vec<u8>>,
    connections_opened: usize,
    connections_closed: usize,
}

/// Shared tables and stages. Clones see the same data, so contents outlive
/// any single connection.
#[derive(Debug, Clone, Default)]
pub struct MemoryWarehouse {
    state: Arc<Mutex<WarehouseState>>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            warehouse: self.clone(),
        }
    }

    fn state(&self) -> MutexGuard<'_, WarehouseState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn rows(&self, table: &str) -> Vec<StoredRow> {
        self.state().tables.get(table).cloned().unwrap_or_default()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.state().tables.get(table).map_or(0, Vec::len)
    }

    pub fn tables(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state().tables.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_staged(&self, location: &StageLocation) -> bool {
        self.state().stages.contains_key(location)
    }

    /// Place raw bytes in a stage directly
    pub fn put_staged(&self, location: &StageLocation, contents: Vec<u8>) {
        self.state().stages.insert(location.clone(), contents);
    }

    pub fn connections_opened(&self) -> usize {
        self.state().connections_opened
    }

    pub fn connections_closed(&self) -> usize {
        self.state().connections_closed
    }
}

pub struct MemoryConnector {
    warehouse: MemoryWarehouse,
}

#[async_trait]
impl SinkConnector for MemoryConnector {
    async fn connect(&self) -> Result<Box<dyn BulkSink>, LoadError> {
        self.warehouse.state().connections_opened += 1;
        Ok(Box::new(MemorySink {
            warehouse: self.warehouse.clone(),
            closed: false,
        }))
    }
}

/// One connection to a [`MemoryWarehouse`]
pub struct MemorySink {
    warehouse: MemoryWarehouse,
    closed: bool,
}

impl MemorySink {
    fn ensure_open(&self, operation: &'static str) -> Result<(), LoadError> {
        if self.closed {
            return Err(LoadError::sink(operation, "connection is closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl BulkSink for MemorySink {
    async fn stage(
        &mut self,
        local_path: &Path,
        location: &StageLocation,
        overwrite: bool,
    ) -> Result<StageReceipt, LoadError> {
        self.ensure_open("stage")?;
        let contents = tokio::fs::read(local_path).await?;
        let checksum = Checksum::from_bytes(&contents);

        let mut state = self.warehouse.state();
        if !overwrite && state.stages.contains_key(location) {
            return Err(LoadError::sink("stage", format!("{} already exists", location)));
        }
        state.stages.insert(location.clone(), contents);

        Ok(StageReceipt {
            file_name: location.file_name.clone(),
            size: checksum.size,
            checksum: checksum.to_string(),
        })
    }

    async fn remove(&mut self, location: &StageLocation) -> Result<bool, LoadError> {
        self.ensure_open("remove")?;
        Ok(self.warehouse.state().stages.remove(location).is_some())
    }

    async fn clear(&mut self, table: &Identifier) -> Result<(), LoadError> {
        self.ensure_open("clear")?;
        self.warehouse
            .state()
            .tables
            .entry(table.to_string())
            .or_default()
            .clear();
        Ok(())
    }

    async fn load(&mut self, request: &LoadRequest<'_>) -> Result<Vec<LoadStatus>, LoadError> {
        self.ensure_open("load")?;
        let file = request.source.to_string();

        let mut state = self.warehouse.state();
        let Some(bytes) = state.stages.get(request.source) else {
            return Err(LoadError::sink("load", format!("{} is not staged", file)));
        };

        let text = match std::str::from_utf8(bytes) {
            Ok(text) => text,
            Err(e) => return Ok(vec![LoadStatus::failed(file, e.to_string())]),
        };
        let parsed = match parse_records(text, request.format) {
            Ok(parsed) => parsed,
            Err(reason) => return Ok(vec![LoadStatus::failed(file, reason)]),
        };

        let total = parsed.total() as u64;
        let rejected = parsed.rejected.len() as u64;
        let first_error = parsed.first_error();

        if request.on_error == OnError::Abort && rejected > 0 {
            return Ok(vec![LoadStatus::from_counts(file, total, 0, rejected, first_error)]);
        }

        let now = Utc::now();
        let source_file = request.source.file_name.clone();
        let rows: Vec<StoredRow> = parsed
            .rows
            .into_iter()
            .map(|row| StoredRow {
                payload: row.value,
                source_file: request.layout.source_file.as_ref().map(|_| source_file.clone()),
                ingested_at: request.layout.ingested_at.as_ref().map(|_| now),
            })
            .collect();
        let loaded = rows.len() as u64;

        state
            .tables
            .entry(request.table.to_string())
            .or_default()
            .extend(rows);

        Ok(vec![LoadStatus::from_counts(file, total, loaded, rejected, first_error)])
    }

    async fn close(&mut self) -> Result<(), LoadError> {
        if !self.closed {
            self.closed = true;
            self.warehouse.state().connections_closed += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::loader::{ColumnLayout, FileFormat};

    fn layout() -> ColumnLayout {
        ColumnLayout {
            payload: Identifier::parse("content").unwrap(),
            source_file: Some(Identifier::parse("source_file").unwrap()),
            ingested_at: None,
        }
    }

    #[tokio::test]
    async fn test_stage_without_overwrite_refuses_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.json");
        std::fs::write(&path, "[]").unwrap();

        let warehouse = MemoryWarehouse::new();
        let mut sink = warehouse.connector().connect().await.unwrap();
        let location = StageLocation::new("s", "a.json");

        let receipt = sink.stage(&path, &location, false).await.unwrap();
        assert_eq!(receipt.size, 2);
        assert!(receipt.checksum.starts_with("sha256:"));

        assert!(sink.stage(&path, &location, false).await.is_err());
        assert!(sink.stage(&path, &location, true).await.is_ok());
    }

    #[tokio::test]
    async fn test_load_records_source_file() {
        let warehouse = MemoryWarehouse::new();
        let location = StageLocation::new("s", "rows.json");
        warehouse.put_staged(&location, br#"[{"x":1},{"x":2}]"#.to_vec());

        let mut sink = warehouse.connector().connect().await.unwrap();
        let table = Identifier::parse("raw_rows").unwrap();
        let layout = layout();
        let statuses = sink
            .load(&LoadRequest {
                table: &table,
                source: &location,
                layout: &layout,
                format: FileFormat::Auto,
                on_error: OnError::Continue,
                batch_size: 10,
            })
            .await
            .unwrap();
        sink.close().await.unwrap();
        sink.close().await.unwrap();

        assert_eq!(statuses[0].rows_loaded, 2);
        let rows = warehouse.rows("raw_rows");
        assert_eq!(rows[0].source_file.as_deref(), Some("rows.json"));
        assert!(rows[0].ingested_at.is_none());
        assert_eq!(warehouse.connections_closed(), 1);
    }

    #[tokio::test]
    async fn test_closed_sink_rejects_work() {
        let warehouse = MemoryWarehouse::new();
        let mut sink = warehouse.connector().connect().await.unwrap();
        sink.close().await.unwrap();
        assert!(sink.clear(&Identifier::parse("t").unwrap()).await.is_err());
    }
}
