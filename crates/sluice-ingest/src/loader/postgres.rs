//! Postgres warehouse sink
//!
//! Named stages are directories under a local stage root. Loading parses the
//! staged file and inserts one JSONB row per record with batched
//! `INSERT ... VALUES` statements.

use async_trait::async_trait;
use sluice_common::checksum::Checksum;
use sluice_common::types::Identifier;
use sqlx::types::Json;
use sqlx::{Connection, PgConnection, Postgres, QueryBuilder};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::format::{into_batches, parse_records, ParsedRecord, ParsedRecords};
use super::{
    BulkSink, ColumnLayout, LoadRequest, LoadStatus, OnError, SinkConnector, StageLocation,
    StageReceipt,
};
use crate::config::WarehouseConfig;
use crate::error::LoadError;

/// Opens one `PgConnection` per loader invocation
#[derive(Debug, Clone)]
pub struct PostgresConnector {
    database_url: String,
    stage_root: PathBuf,
    create_tables: bool,
}

impl PostgresConnector {
    pub fn new(database_url: impl Into<String>, stage_root: impl Into<PathBuf>) -> Self {
        Self {
            database_url: database_url.into(),
            stage_root: stage_root.into(),
            create_tables: false,
        }
    }

    pub fn from_config(config: &WarehouseConfig) -> Result<Self, LoadError> {
        let url = config
            .database_url
            .clone()
            .ok_or_else(|| LoadError::Connect("DATABASE_URL is not set".to_string()))?;
        Ok(Self::new(url, config.stage_dir.clone()).with_create_tables(config.create_tables))
    }

    /// Create missing target tables on load
    pub fn with_create_tables(mut self, create: bool) -> Self {
        self.create_tables = create;
        self
    }
}

#[async_trait]
impl SinkConnector for PostgresConnector {
    async fn connect(&self) -> Result<Box<dyn BulkSink>, LoadError> {
        let conn = PgConnection::connect(&self.database_url)
            .await
            .map_err(|e| LoadError::Connect(e.to_string()))?;
        debug!("Opened warehouse connection");

        Ok(Box::new(PostgresSink {
            conn: Some(conn),
            stage_root: self.stage_root.clone(),
            create_tables: self.create_tables,
        }))
    }
}

pub struct PostgresSink {
    conn: Option<PgConnection>,
    stage_root: PathBuf,
    create_tables: bool,
}

impl PostgresSink {
    fn conn(&mut self, operation: &'static str) -> Result<&mut PgConnection, LoadError> {
        self.conn
            .as_mut()
            .ok_or_else(|| LoadError::sink(operation, "connection is closed"))
    }

    fn stage_path(&self, location: &StageLocation) -> PathBuf {
        self.stage_root.join(&location.stage).join(&location.file_name)
    }

    async fn ensure_table(&mut self, table: &Identifier, layout: &ColumnLayout) -> Result<(), LoadError> {
        let sql = create_table_sql(table, layout);
        sqlx::query(&sql)
            .execute(self.conn("create table")?)
            .await
            .map_err(|e| LoadError::sink("create table", e))?;
        Ok(())
    }

    /// Insert valid rows batch by batch; a failed batch is retried one row at
    /// a time so only the bad rows are lost
    async fn load_continue(
        &mut self,
        request: &LoadRequest<'_>,
        mut parsed: ParsedRecords,
    ) -> Result<(u64, ParsedRecords), LoadError> {
        let conn = self.conn("load")?;
        let file_name = request.source.file_name.as_str();
        let mut loaded = 0u64;

        let rows = std::mem::take(&mut parsed.rows);
        for batch in into_batches(rows, request.batch_size) {
            match insert_rows(conn, request.table, request.layout, file_name, &batch.rows).await {
                Ok(n) => loaded += n,
                Err(e) => {
                    debug!(batch = batch.index, error = %e, "Batch insert failed, isolating rows");
                    for row in &batch.rows {
                        match insert_rows(conn, request.table, request.layout, file_name, std::slice::from_ref(row)).await {
                            Ok(n) => loaded += n,
                            Err(e) => parsed.rejected.push(super::format::RowRejection {
                                row_number: row.row_number,
                                reason: e.to_string(),
                            }),
                        }
                    }
                },
            }
        }

        Ok((loaded, parsed))
    }

    /// All-or-nothing insert inside one transaction
    async fn load_abort(
        &mut self,
        request: &LoadRequest<'_>,
        rows: Vec<ParsedRecord>,
    ) -> Result<Result<u64, String>, LoadError> {
        let conn = self.conn("load")?;
        let file_name = request.source.file_name.as_str();

        let mut tx = conn.begin().await.map_err(|e| LoadError::sink("begin", e))?;
        let mut loaded = 0u64;
        for batch in into_batches(rows, request.batch_size) {
            match insert_rows(&mut tx, request.table, request.layout, file_name, &batch.rows).await {
                Ok(n) => loaded += n,
                Err(e) => {
                    let first_row = batch.rows.first().map_or(0, |r| r.row_number);
                    tx.rollback().await.map_err(|e| LoadError::sink("rollback", e))?;
                    return Ok(Err(format!("batch starting at row {}: {}", first_row, e)));
                },
            }
        }
        tx.commit().await.map_err(|e| LoadError::sink("commit", e))?;

        Ok(Ok(loaded))
    }
}

#[async_trait]
impl BulkSink for PostgresSink {
    async fn stage(
        &mut self,
        local_path: &Path,
        location: &StageLocation,
        overwrite: bool,
    ) -> Result<StageReceipt, LoadError> {
        let dest = self.stage_path(location);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if !overwrite && tokio::fs::try_exists(&dest).await? {
            return Err(LoadError::sink("stage", format!("{} already exists", location)));
        }

        tokio::fs::copy(local_path, &dest).await?;
        let checksum = Checksum::from_file(&dest).map_err(|e| LoadError::sink("stage", e))?;

        Ok(StageReceipt {
            file_name: location.file_name.clone(),
            size: checksum.size,
            checksum: checksum.to_string(),
        })
    }

    async fn remove(&mut self, location: &StageLocation) -> Result<bool, LoadError> {
        match tokio::fs::remove_file(self.stage_path(location)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn clear(&mut self, table: &Identifier) -> Result<(), LoadError> {
        let sql = format!("TRUNCATE TABLE {}", table);
        sqlx::query(&sql)
            .execute(self.conn("truncate")?)
            .await
            .map_err(|e| LoadError::sink("truncate", e))?;
        Ok(())
    }

    async fn load(&mut self, request: &LoadRequest<'_>) -> Result<Vec<LoadStatus>, LoadError> {
        let file = request.source.to_string();
        let path = self.stage_path(request.source);

        let text = match tokio::fs::read(&path).await {
            Ok(bytes) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(e) => return Ok(vec![LoadStatus::failed(file, e.to_string())]),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(LoadError::sink("load", format!("{} is not staged", file)));
            },
            Err(e) => return Err(e.into()),
        };

        let parsed = match parse_records(&text, request.format) {
            Ok(parsed) => parsed,
            Err(reason) => {
                warn!(file = %file, reason = %reason, "Staged file could not be parsed");
                return Ok(vec![LoadStatus::failed(file, reason)]);
            },
        };
        let total = parsed.total() as u64;

        if self.create_tables {
            self.ensure_table(request.table, request.layout).await?;
        }

        let status = match request.on_error {
            OnError::Continue => {
                let (loaded, parsed) = self.load_continue(request, parsed).await?;
                let rejected = parsed.rejected.len() as u64;
                LoadStatus::from_counts(file, total, loaded, rejected, parsed.first_error())
            },
            OnError::Abort if !parsed.rejected.is_empty() => {
                let rejected = parsed.rejected.len() as u64;
                LoadStatus::from_counts(file, total, 0, rejected, parsed.first_error())
            },
            OnError::Abort => match self.load_abort(request, parsed.rows).await? {
                Ok(loaded) => LoadStatus::from_counts(file, total, loaded, 0, None),
                Err(reason) => LoadStatus::from_counts(file, total, 0, total.max(1), Some(reason)),
            },
        };

        info!(
            table = %request.table,
            rows_parsed = status.rows_parsed,
            rows_loaded = status.rows_loaded,
            errors = status.errors_seen,
            "Postgres load finished"
        );
        Ok(vec![status])
    }

    async fn close(&mut self) -> Result<(), LoadError> {
        if let Some(conn) = self.conn.take() {
            conn.close().await.map_err(|e| LoadError::sink("close", e))?;
        }
        Ok(())
    }
}

fn create_table_sql(table: &Identifier, layout: &ColumnLayout) -> String {
    let mut columns = vec![format!("{} JSONB NOT NULL", layout.payload)];
    if let Some(col) = &layout.source_file {
        columns.push(format!("{} TEXT", col));
    }
    if let Some(col) = &layout.ingested_at {
        columns.push(format!("{} TIMESTAMPTZ NOT NULL DEFAULT now()", col));
    }
    format!("CREATE TABLE IF NOT EXISTS {} ({})", table, columns.join(", "))
}

fn insert_prefix(table: &Identifier, layout: &ColumnLayout) -> String {
    let mut columns = vec![layout.payload.as_str()];
    if let Some(col) = &layout.source_file {
        columns.push(col.as_str());
    }
    if let Some(col) = &layout.ingested_at {
        columns.push(col.as_str());
    }
    format!("INSERT INTO {} ({}) ", table, columns.join(", "))
}

async fn insert_rows(
    conn: &mut PgConnection,
    table: &Identifier,
    layout: &ColumnLayout,
    file_name: &str,
    rows: &[ParsedRecord],
) -> Result<u64, sqlx::Error> {
    if rows.is_empty() {
        return Ok(0);
    }

    let mut query_builder: QueryBuilder<Postgres> = QueryBuilder::new(insert_prefix(table, layout));
    query_builder.push_values(rows, |mut b, row| {
        b.push_bind(Json(row.value.clone()));
        if layout.source_file.is_some() {
            b.push_bind(file_name.to_string());
        }
        if layout.ingested_at.is_some() {
            b.push("now()");
        }
    });

    let result = query_builder.build().execute(conn).await?;
    Ok(result.rows_affected())
}
