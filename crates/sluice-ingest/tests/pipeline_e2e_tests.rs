//! End-to-end pipeline runs against a mocked source API and the in-memory
//! warehouse

mod common;

use async_trait::async_trait;
use common::*;
use sluice_common::types::Identifier;
use sluice_ingest::config::LoadFailurePolicy;
use sluice_ingest::error::{LoadError, StageError};
use sluice_ingest::loader::{
    BulkSink, FileFormat, LoadRequest, LoadStatus, MemoryWarehouse, SinkConnector, StageLocation,
    StageReceipt,
};
use sluice_ingest::pipeline::{Pipeline, PipelineState, Stage, ITEMS_FILE_NAME};
use sluice_ingest::source::{HttpSourceClient, StaticToken};
use std::path::Path;
use std::sync::Arc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(config: &sluice_ingest::IngestConfig) -> HttpSourceClient {
    HttpSourceClient::new(&config.source, Arc::new(StaticToken::new(TOKEN))).unwrap()
}

// ============================================================================
// Happy path
// ============================================================================

#[tokio::test]
async fn test_full_run_fetches_pages_enriches_and_loads() {
    let server = MockServer::start().await;
    mount_collection(&server, 45, 20).await;
    mount_artist(&server, "A1", &["indie"], 1).await;
    mount_artist(&server, "A2", &["jazz", "soul"], 1).await;

    let dir = tempfile::tempdir().unwrap();
    let config = config_for(&server, dir.path());
    let source = client(&config);
    let warehouse = MemoryWarehouse::new();

    let mut pipeline = Pipeline::new(&config, &source, Arc::new(warehouse.connector()));
    let report = pipeline.run().await.unwrap();

    assert_eq!(report.items_fetched, 45);
    assert_eq!(report.failed_pages, 0);
    assert_eq!(report.unique_entities, 2);
    assert_eq!(report.unresolved_entities, 0);
    assert_eq!(report.outcomes.len(), 2);
    assert!(report.outcomes.iter().all(|o| o.truncated));

    assert_eq!(warehouse.row_count(PRIMARY_TABLE), 45);
    assert_eq!(warehouse.row_count(ENTITY_TABLE), 2);

    // One probe plus pages at offsets 0, 20 and 40
    let requests = server.received_requests().await.unwrap();
    let collection_requests: Vec<_> = requests
        .iter()
        .filter(|r| r.url.path() == "/v1/me/tracks")
        .collect();
    assert_eq!(collection_requests.len(), 4);
    let mut offsets: Vec<String> = collection_requests
        .iter()
        .filter(|r| r.url.query().is_some_and(|q| q.contains("limit=20")))
        .filter_map(|r| {
            r.url
                .query_pairs()
                .find(|(k, _)| k == "offset")
                .map(|(_, v)| v.into_owned())
        })
        .collect();
    offsets.sort();
    assert_eq!(offsets, vec!["0", "20", "40"]);

    assert_eq!(pipeline.state(), PipelineState::Done);
    assert_eq!(warehouse.connections_opened(), warehouse.connections_closed());
}

#[tokio::test]
async fn test_repeated_runs_are_idempotent() {
    let server = MockServer::start().await;
    mount_collection(&server, 45, 20).await;
    mount_artist(&server, "A1", &["indie"], 2).await;
    mount_artist(&server, "A2", &["jazz"], 2).await;

    let dir = tempfile::tempdir().unwrap();
    let config = config_for(&server, dir.path());
    let source = client(&config);
    let warehouse = MemoryWarehouse::new();

    let mut pipeline = Pipeline::new(&config, &source, Arc::new(warehouse.connector()));
    pipeline.run().await.unwrap();
    let first = (warehouse.row_count(PRIMARY_TABLE), warehouse.row_count(ENTITY_TABLE));
    pipeline.run().await.unwrap();
    let second = (warehouse.row_count(PRIMARY_TABLE), warehouse.row_count(ENTITY_TABLE));

    assert_eq!(first, (45, 2));
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_failed_lookup_yields_placeholder_row() {
    let server = MockServer::start().await;
    mount_collection(&server, 10, 20).await;
    mount_artist(&server, "A1", &["indie"], 1).await;
    Mock::given(method("GET"))
        .and(path("/v1/artists/A2"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let config = config_for(&server, dir.path());
    let source = client(&config);
    let warehouse = MemoryWarehouse::new();

    let report = Pipeline::new(&config, &source, Arc::new(warehouse.connector()))
        .run()
        .await
        .unwrap();

    assert_eq!(report.unresolved_entities, 1);
    let rows = warehouse.rows(ENTITY_TABLE);
    assert_eq!(rows.len(), 2);
    let placeholder = rows.iter().find(|r| r.payload["id"] == "A2").unwrap();
    assert!(placeholder.payload["name"].is_null());
    assert_eq!(placeholder.payload["genres"], serde_json::json!([]));
}

// ============================================================================
// Failure handling
// ============================================================================

#[tokio::test]
async fn test_rejected_probe_fails_before_any_page() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/me/tracks"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let config = config_for(&server, dir.path());
    let source = client(&config);
    let warehouse = MemoryWarehouse::new();

    let mut pipeline = Pipeline::new(&config, &source, Arc::new(warehouse.connector()));
    let err = pipeline.run().await.unwrap_err();

    assert_eq!(err.stage, Stage::Fetching);
    assert_eq!(err.last_completed, None);
    assert!(err.to_string().contains("401"));
    // Only the up-front connection check touched the warehouse
    assert_eq!(warehouse.connections_opened(), 1);
    assert_eq!(warehouse.row_count(PRIMARY_TABLE), 0);
}

/// A warehouse that refuses every connection
struct UnreachableConnector;

#[async_trait]
impl SinkConnector for UnreachableConnector {
    async fn connect(&self) -> Result<Box<dyn BulkSink>, LoadError> {
        Err(LoadError::Connect("connection refused".to_string()))
    }
}

#[tokio::test]
async fn test_unreachable_warehouse_fails_before_any_request() {
    let server = MockServer::start().await;

    let dir = tempfile::tempdir().unwrap();
    let config = config_for(&server, dir.path());
    let source = client(&config);

    let mut pipeline = Pipeline::new(&config, &source, Arc::new(UnreachableConnector));
    let err = pipeline.run().await.unwrap_err();

    assert_eq!(err.stage, Stage::Connecting);
    assert_eq!(err.last_completed, None);
    assert!(matches!(err.source, StageError::Load(LoadError::Connect(_))));
    assert!(server.received_requests().await.unwrap().is_empty());
    assert_eq!(
        pipeline.transitions(),
        &[
            PipelineState::Idle,
            PipelineState::Failed {
                stage: Stage::Connecting,
                reason: err.source.to_string(),
            },
        ]
    );
}

/// Wraps the memory sink and refuses every load into one table
struct RejectingConnector {
    warehouse: MemoryWarehouse,
    table: &'static str,
}

struct RejectingSink {
    inner: Box<dyn BulkSink>,
    table: &'static str,
}

#[async_trait]
impl SinkConnector for RejectingConnector {
    async fn connect(&self) -> Result<Box<dyn BulkSink>, LoadError> {
        Ok(Box::new(RejectingSink {
            inner: self.warehouse.connector().connect().await?,
            table: self.table,
        }))
    }
}

#[async_trait]
impl BulkSink for RejectingSink {
    async fn stage(
        &mut self,
        local_path: &Path,
        location: &StageLocation,
        overwrite: bool,
    ) -> Result<StageReceipt, LoadError> {
        self.inner.stage(local_path, location, overwrite).await
    }

    async fn remove(&mut self, location: &StageLocation) -> Result<bool, LoadError> {
        self.inner.remove(location).await
    }

    async fn clear(&mut self, table: &Identifier) -> Result<(), LoadError> {
        self.inner.clear(table).await
    }

    async fn load(&mut self, request: &LoadRequest<'_>) -> Result<Vec<LoadStatus>, LoadError> {
        if request.table.as_str() == self.table {
            return Ok(vec![LoadStatus::failed(request.source.to_string(), "warehouse rejected the file")]);
        }
        self.inner.load(request).await
    }

    async fn close(&mut self) -> Result<(), LoadError> {
        self.inner.close().await
    }
}

#[tokio::test]
async fn test_total_load_failure_halts_by_default() {
    let server = MockServer::start().await;
    mount_collection(&server, 5, 20).await;
    mount_artist(&server, "A1", &[], 1).await;
    mount_artist(&server, "A2", &[], 1).await;

    let dir = tempfile::tempdir().unwrap();
    let config = config_for(&server, dir.path());
    let source = client(&config);
    let warehouse = MemoryWarehouse::new();
    let connector = RejectingConnector {
        warehouse: warehouse.clone(),
        table: PRIMARY_TABLE,
    };

    let mut pipeline = Pipeline::new(&config, &source, Arc::new(connector));
    let err = pipeline.run().await.unwrap_err();

    assert_eq!(err.stage, Stage::Loading);
    assert_eq!(err.last_completed, Some(Stage::Enriching));
    assert!(matches!(err.source, StageError::Load(ref e) if e.is_total_failure()));
    assert!(matches!(pipeline.state(), PipelineState::Failed { stage: Stage::Loading, .. }));

    // The entity dataset was never attempted, and every connection closed:
    // one for the up-front check, one for the rejected load
    assert_eq!(warehouse.row_count(ENTITY_TABLE), 0);
    assert_eq!(warehouse.connections_opened(), 2);
    assert_eq!(warehouse.connections_closed(), 2);
}

#[tokio::test]
async fn test_skip_policy_continues_past_total_failure() {
    let server = MockServer::start().await;
    mount_collection(&server, 5, 20).await;
    mount_artist(&server, "A1", &[], 1).await;
    mount_artist(&server, "A2", &[], 1).await;

    let dir = tempfile::tempdir().unwrap();
    let mut config = config_for(&server, dir.path());
    config.failure_policy = LoadFailurePolicy::SkipDataset;
    let source = client(&config);
    let warehouse = MemoryWarehouse::new();
    let connector = RejectingConnector {
        warehouse: warehouse.clone(),
        table: PRIMARY_TABLE,
    };

    let mut pipeline = Pipeline::new(&config, &source, Arc::new(connector));
    let report = pipeline.run().await.unwrap();

    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].table, PRIMARY_TABLE);
    assert_eq!(report.outcomes.len(), 1);
    assert_eq!(warehouse.row_count(ENTITY_TABLE), 2);
    assert_eq!(pipeline.state(), PipelineState::Done);
}

/// Stages normally, then damages the third line of the items file
struct CorruptingConnector {
    warehouse: MemoryWarehouse,
}

struct CorruptingSink {
    inner: Box<dyn BulkSink>,
    warehouse: MemoryWarehouse,
}

#[async_trait]
impl SinkConnector for CorruptingConnector {
    async fn connect(&self) -> Result<Box<dyn BulkSink>, LoadError> {
        Ok(Box::new(CorruptingSink {
            inner: self.warehouse.connector().connect().await?,
            warehouse: self.warehouse.clone(),
        }))
    }
}

#[async_trait]
impl BulkSink for CorruptingSink {
    async fn stage(
        &mut self,
        local_path: &Path,
        location: &StageLocation,
        overwrite: bool,
    ) -> Result<StageReceipt, LoadError> {
        let receipt = self.inner.stage(local_path, location, overwrite).await?;
        if location.file_name == ITEMS_FILE_NAME {
            let text = std::fs::read_to_string(local_path).unwrap();
            let lines: Vec<&str> = text
                .lines()
                .enumerate()
                .map(|(i, line)| if i == 2 { "{\"track\": " } else { line })
                .collect();
            self.warehouse.put_staged(location, lines.join("\n").into_bytes());
        }
        Ok(receipt)
    }

    async fn remove(&mut self, location: &StageLocation) -> Result<bool, LoadError> {
        self.inner.remove(location).await
    }

    async fn clear(&mut self, table: &Identifier) -> Result<(), LoadError> {
        self.inner.clear(table).await
    }

    async fn load(&mut self, request: &LoadRequest<'_>) -> Result<Vec<LoadStatus>, LoadError> {
        self.inner.load(request).await
    }

    async fn close(&mut self) -> Result<(), LoadError> {
        self.inner.close().await
    }
}

#[tokio::test]
async fn test_malformed_row_is_reported_without_halting() {
    let server = MockServer::start().await;
    mount_collection(&server, 10, 20).await;
    mount_artist(&server, "A1", &["indie"], 1).await;
    mount_artist(&server, "A2", &["jazz"], 1).await;

    let dir = tempfile::tempdir().unwrap();
    let mut config = config_for(&server, dir.path());
    config.targets.primary.format = FileFormat::Ndjson;
    let source = client(&config);
    let warehouse = MemoryWarehouse::new();
    let connector = CorruptingConnector {
        warehouse: warehouse.clone(),
    };

    let mut pipeline = Pipeline::new(&config, &source, Arc::new(connector));
    let report = pipeline.run().await.unwrap();

    let items = report.outcomes.iter().find(|o| o.table == PRIMARY_TABLE).unwrap();
    assert_eq!(items.loaded, 9);
    assert_eq!(items.failed, 1);
    assert!(items.first_error.as_deref().unwrap().starts_with("row 3"));

    // The entity dataset still loads after the partial one
    assert_eq!(report.outcomes.len(), 2);
    assert_eq!(warehouse.row_count(PRIMARY_TABLE), 9);
    assert_eq!(warehouse.row_count(ENTITY_TABLE), 2);
    assert_eq!(pipeline.state(), PipelineState::Done);
}
