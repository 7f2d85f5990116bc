//! Stage-then-load driver shared by every dataset

use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use super::{
    BulkSink, LoadCategory, LoadOutcome, LoadRequest, LoadStatus, LoadTarget, SinkConnector,
    StageLocation,
};
use crate::config::LoaderConfig;
use crate::error::LoadError;
use crate::models::Dataset;

/// Loads datasets and files through one sink connection per call
pub struct BulkLoader {
    connector: Arc<dyn SinkConnector>,
    config: LoaderConfig,
}

impl BulkLoader {
    pub fn new(connector: Arc<dyn SinkConnector>, config: &LoaderConfig) -> Self {
        Self {
            connector,
            config: config.clone(),
        }
    }

    /// Override the rows-per-insert chunk size
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.config.batch_size = batch_size.max(1);
        self
    }

    /// Open and close one connection so an unreachable sink fails before any
    /// fetch or download
    pub async fn check_connection(&self) -> Result<(), LoadError> {
        let mut sink = self.connector.connect().await?;
        sink.close().await?;
        debug!("Warehouse connection verified");
        Ok(())
    }

    /// Serialize a dataset under the work directory, then stage and load it
    #[instrument(skip(self, dataset, target), fields(dataset = %dataset.name, table = %target.table, rows = dataset.len()))]
    pub async fn load_dataset(
        &self,
        dataset: &Dataset,
        target: &LoadTarget,
    ) -> Result<LoadOutcome, LoadError> {
        let path = dataset.write_to(&self.config.work_dir, target.format)?;
        debug!(path = %path.display(), "Wrote dataset file");
        self.load_file(&path, target).await
    }

    /// Stage and load an existing local file
    pub async fn load_file(&self, path: &Path, target: &LoadTarget) -> Result<LoadOutcome, LoadError> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("{} has no file name", path.display()),
                )
            })?;
        let location = StageLocation::new(target.stage.clone(), file_name);

        let mut sink = self.connector.connect().await?;
        let result = self.stage_and_load(sink.as_mut(), path, &location, target).await;

        // Close on every path; a close failure never replaces the load result
        if let Err(e) = sink.close().await {
            warn!(error = %e, "Failed to close warehouse connection");
        }

        summarize(target, &location, result?)
    }

    async fn stage_and_load(
        &self,
        sink: &mut dyn BulkSink,
        path: &Path,
        location: &StageLocation,
        target: &LoadTarget,
    ) -> Result<(bool, Vec<LoadStatus>), LoadError> {
        if self.config.remove_stale_compressed {
            let stale = location.with_suffix(".gz");
            if sink.remove(&stale).await? {
                debug!(stage = %stale, "Removed stale compressed copy");
            }
        }

        let receipt = sink.stage(path, location, true).await?;
        info!(
            stage = %location,
            size = receipt.size,
            checksum = %receipt.checksum,
            "Staged file"
        );

        if target.truncate {
            sink.clear(&target.table).await?;
            info!(table = %target.table, "Truncated table");
        }

        let statuses = sink
            .load(&LoadRequest {
                table: &target.table,
                source: location,
                layout: &target.layout,
                format: target.format,
                on_error: target.on_error,
                batch_size: self.config.batch_size,
            })
            .await?;

        Ok((target.truncate, statuses))
    }
}

/// Fold sink statuses into one outcome; any `LoadFailed` is a total failure
fn summarize(
    target: &LoadTarget,
    location: &StageLocation,
    (truncated, statuses): (bool, Vec<LoadStatus>),
) -> Result<LoadOutcome, LoadError> {
    let table = target.table.to_string();

    if let Some(failed) = statuses.iter().find(|s| s.category == LoadCategory::LoadFailed) {
        return Err(LoadError::TotalFailure {
            table,
            reason: failed
                .first_error
                .clone()
                .unwrap_or_else(|| format!("{} was rejected", failed.file)),
        });
    }

    let outcome = LoadOutcome {
        table,
        file: location.to_string(),
        loaded: statuses.iter().map(|s| s.rows_loaded).sum(),
        failed: statuses.iter().map(|s| s.errors_seen).sum(),
        first_error: statuses.iter().find_map(|s| s.first_error.clone()),
        truncated,
    };

    if outcome.is_partial() {
        warn!(
            table = %outcome.table,
            loaded = outcome.loaded,
            failed = outcome.failed,
            first_error = outcome.first_error.as_deref().unwrap_or(""),
            "Partial load"
        );
    } else {
        info!(table = %outcome.table, loaded = outcome.loaded, "Load complete");
    }

    Ok(outcome)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::DatasetTargets;
    use crate::loader::{FileFormat, MemoryWarehouse, OnError};
    use serde_json::json;

    fn loader(warehouse: &MemoryWarehouse, work_dir: &Path) -> BulkLoader {
        BulkLoader::new(
            Arc::new(warehouse.connector()),
            &LoaderConfig {
                work_dir: work_dir.to_path_buf(),
                batch_size: 4,
                remove_stale_compressed: true,
            },
        )
    }

    fn ndjson_target() -> LoadTarget {
        LoadTarget {
            format: FileFormat::Ndjson,
            ..DatasetTargets::default().primary
        }
    }

    #[tokio::test]
    async fn test_malformed_row_is_counted_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let warehouse = MemoryWarehouse::new();
        let text: Vec<String> = (1..=10)
            .map(|n| if n == 3 { "{oops".into() } else { format!(r#"{{"n":{n}}}"#) })
            .collect();
        let path = dir.path().join("rows.ndjson");
        std::fs::write(&path, text.join("\n")).unwrap();

        let outcome = loader(&warehouse, dir.path())
            .load_file(&path, &ndjson_target())
            .await
            .unwrap();

        assert_eq!(outcome.loaded, 9);
        assert_eq!(outcome.failed, 1);
        assert!(outcome.first_error.unwrap().starts_with("row 3"));
        assert_eq!(warehouse.row_count("bronze_sp_all_items"), 9);
    }

    #[tokio::test]
    async fn test_abort_loads_nothing_on_bad_row() {
        let dir = tempfile::tempdir().unwrap();
        let warehouse = MemoryWarehouse::new();
        let path = dir.path().join("rows.ndjson");
        std::fs::write(&path, "{\"n\":1}\nnope\n").unwrap();

        let target = LoadTarget {
            on_error: OnError::Abort,
            ..ndjson_target()
        };
        let err = loader(&warehouse, dir.path()).load_file(&path, &target).await.unwrap_err();

        assert!(err.is_total_failure());
        assert_eq!(warehouse.row_count("bronze_sp_all_items"), 0);
    }

    #[tokio::test]
    async fn test_unparseable_file_is_total_failure_and_closes() {
        let dir = tempfile::tempdir().unwrap();
        let warehouse = MemoryWarehouse::new();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "<html>not json</html>").unwrap();

        let err = loader(&warehouse, dir.path())
            .load_file(&path, &DatasetTargets::default().primary)
            .await
            .unwrap_err();

        assert!(matches!(err, LoadError::TotalFailure { ref table, .. } if table == "bronze_sp_all_items"));
        assert_eq!(warehouse.connections_opened(), 1);
        assert_eq!(warehouse.connections_closed(), 1);
    }

    #[tokio::test]
    async fn test_truncate_replaces_and_append_accumulates() {
        let dir = tempfile::tempdir().unwrap();
        let warehouse = MemoryWarehouse::new();
        let loader = loader(&warehouse, dir.path());
        let dataset = Dataset::new("items", "all_items.json", vec![json!({"a": 1}), json!({"a": 2})]);

        let mut target = DatasetTargets::default().primary;
        loader.load_dataset(&dataset, &target).await.unwrap();
        let outcome = loader.load_dataset(&dataset, &target).await.unwrap();
        assert!(outcome.truncated);
        assert_eq!(warehouse.row_count("bronze_sp_all_items"), 2);

        target.truncate = false;
        loader.load_dataset(&dataset, &target).await.unwrap();
        assert_eq!(warehouse.row_count("bronze_sp_all_items"), 4);
    }

    #[tokio::test]
    async fn test_stale_compressed_copy_removed() {
        let dir = tempfile::tempdir().unwrap();
        let warehouse = MemoryWarehouse::new();
        let target = DatasetTargets::default().primary;
        let stale = StageLocation::new(target.stage.clone(), "all_items.json.gz");
        warehouse.put_staged(&stale, b"old".to_vec());

        let dataset = Dataset::new("items", "all_items.json", vec![json!({"a": 1})]);
        loader(&warehouse, dir.path()).load_dataset(&dataset, &target).await.unwrap();

        assert!(!warehouse.is_staged(&stale));
        assert!(warehouse.is_staged(&StageLocation::new(target.stage, "all_items.json")));
    }
}
