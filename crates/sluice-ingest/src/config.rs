//! Ingestion configuration
//!
//! One [`IngestConfig`] is built at startup (from the environment, optionally
//! seeded by a `.env` file) and passed by reference into the collector,
//! enricher, loader and orchestrator.

use serde::{Deserialize, Serialize};
use sluice_common::types::Identifier;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::keys::NamePolicy;
use crate::loader::{ColumnLayout, FileFormat, LoadTarget, OnError};
use crate::models::RefPath;
use crate::pool::DEFAULT_CONCURRENCY;
use crate::progress::DEFAULT_REPORT_EVERY;

// ============================================================================
// Defaults
// ============================================================================

pub const DEFAULT_API_BASE_URL: &str = "https://api.spotify.com";
pub const DEFAULT_COLLECTION_PATH: &str = "/v1/me/tracks";
pub const DEFAULT_ENTITY_PATH: &str = "/v1/artists";
pub const DEFAULT_PAGE_SIZE: u64 = 20;
pub const DEFAULT_BATCH_SIZE: usize = 500;
pub const DEFAULT_STAGE_NAME: &str = "spotify_stage";
pub const DEFAULT_PRIMARY_TABLE: &str = "bronze_sp_all_items";
pub const DEFAULT_ENTITY_TABLE: &str = "bronze_sp_artist_genre";
pub const DEFAULT_DOWNLOAD_TABLE: &str = "bronze_border";
pub const DEFAULT_DOWNLOAD_STAGE: &str = "border_stage";

/// What to do when the warehouse rejects an entire dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadFailurePolicy {
    /// Stop the pipeline; remaining datasets are not loaded
    #[default]
    HaltPipeline,
    /// Record the failure and continue with the next dataset
    SkipDataset,
}

impl std::str::FromStr for LoadFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "halt" | "halt_pipeline" => Ok(Self::HaltPipeline),
            "skip" | "skip_dataset" => Ok(Self::SkipDataset),
            other => Err(format!("expected 'halt' or 'skip', got '{}'", other)),
        }
    }
}

/// Source API endpoints and credentials
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub base_url: String,
    pub collection_path: String,
    pub entity_path: String,
    /// Path from an item to its entity reference array
    pub ref_path: RefPath,
    /// Bearer token; acquisition and refresh happen outside Sluice
    pub api_token: Option<String>,
    pub request_timeout: Duration,
    pub user_agent: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_BASE_URL.to_string(),
            collection_path: DEFAULT_COLLECTION_PATH.to_string(),
            entity_path: DEFAULT_ENTITY_PATH.to_string(),
            ref_path: RefPath::default(),
            api_token: None,
            request_timeout: Duration::from_secs(30),
            user_agent: format!("sluice/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub page_size: u64,
    pub concurrency: usize,
    pub show_progress: bool,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
            show_progress: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EnricherConfig {
    pub concurrency: usize,
    pub report_every: u64,
    pub show_progress: bool,
}

impl Default for EnricherConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            report_every: DEFAULT_REPORT_EVERY,
            show_progress: false,
        }
    }
}

/// Warehouse connection settings
#[derive(Debug, Clone, Default)]
pub struct WarehouseConfig {
    /// Postgres connection string
    pub database_url: Option<String>,
    /// Root directory standing in for the warehouse's named stages
    pub stage_dir: PathBuf,
    /// Create missing target tables before loading
    pub create_tables: bool,
}

/// Local behaviour of the bulk loader
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Where datasets are serialized before staging
    pub work_dir: PathBuf,
    /// Rows per insert batch
    pub batch_size: usize,
    /// Remove a stale compressed copy (`<file>.gz`) before staging
    pub remove_stale_compressed: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            work_dir: std::env::temp_dir().join("sluice-work"),
            batch_size: DEFAULT_BATCH_SIZE,
            remove_stale_compressed: true,
        }
    }
}

/// Target tables for every dataset Sluice produces
#[derive(Debug, Clone)]
pub struct DatasetTargets {
    pub primary: LoadTarget,
    pub entities: LoadTarget,
    pub download: LoadTarget,
}

impl Default for DatasetTargets {
    fn default() -> Self {
        Self {
            primary: api_target(DEFAULT_PRIMARY_TABLE, DEFAULT_STAGE_NAME),
            entities: api_target(DEFAULT_ENTITY_TABLE, DEFAULT_STAGE_NAME),
            download: LoadTarget {
                table: fixed_identifier(DEFAULT_DOWNLOAD_TABLE),
                stage: DEFAULT_DOWNLOAD_STAGE.to_string(),
                layout: ColumnLayout {
                    payload: fixed_identifier("content"),
                    source_file: Some(fixed_identifier("source_file")),
                    ingested_at: Some(fixed_identifier("ingestion_time")),
                },
                format: FileFormat::Auto,
                truncate: true,
                on_error: OnError::Continue,
            },
        }
    }
}

fn api_target(table: &'static str, stage: &str) -> LoadTarget {
    LoadTarget {
        table: fixed_identifier(table),
        stage: stage.to_string(),
        layout: ColumnLayout {
            payload: fixed_identifier("item_data"),
            source_file: None,
            ingested_at: Some(fixed_identifier("load_timestamp")),
        },
        format: FileFormat::JsonArray,
        truncate: true,
        on_error: OnError::Continue,
    }
}

fn fixed_identifier(name: &'static str) -> Identifier {
    // Compile-time constants above are all valid identifiers
    Identifier::parse(name).unwrap_or_else(|_| unreachable!("invalid built-in identifier {name}"))
}

/// Main ingestion configuration
#[derive(Debug, Clone, Default)]
pub struct IngestConfig {
    pub source: SourceConfig,
    pub collector: CollectorConfig,
    pub enricher: EnricherConfig,
    pub warehouse: WarehouseConfig,
    pub loader: LoaderConfig,
    pub targets: DatasetTargets,
    pub failure_policy: LoadFailurePolicy,
    pub name_policy: NamePolicy,
}

impl IngestConfig {
    /// Load configuration from the process environment, reading `.env` first
    /// when present
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    ///
    /// Recognised keys:
    /// - `SLUICE_API_BASE_URL`, `SLUICE_COLLECTION_PATH`, `SLUICE_ENTITY_PATH`, `SLUICE_REF_PATH`
    /// - `SLUICE_API_TOKEN`, `SLUICE_REQUEST_TIMEOUT_SECS`
    /// - `SLUICE_PAGE_SIZE`, `SLUICE_CONCURRENCY`, `SLUICE_REPORT_EVERY`
    /// - `DATABASE_URL`, `SLUICE_STAGE_DIR`, `SLUICE_CREATE_TABLES`
    /// - `SLUICE_WORK_DIR`, `SLUICE_BATCH_SIZE`
    /// - `SLUICE_STAGE_NAME`, `SLUICE_PRIMARY_TABLE`, `SLUICE_ENTITY_TABLE`
    /// - `SLUICE_DOWNLOAD_TABLE`, `SLUICE_DOWNLOAD_STAGE`
    /// - `TRUNCATE_BEFORE_LOAD`, `SLUICE_ON_ERROR`, `SLUICE_FILE_FORMAT`
    /// - `SLUICE_LOAD_FAILURE_POLICY`, `SLUICE_NAME_POLICY`
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);
        let mut config = Self::default();

        let source = &mut config.source;
        source.base_url = env.string("SLUICE_API_BASE_URL", &source.base_url);
        source.collection_path = env.string("SLUICE_COLLECTION_PATH", &source.collection_path);
        source.entity_path = env.string("SLUICE_ENTITY_PATH", &source.entity_path);
        if let Some(path) = env.get("SLUICE_REF_PATH") {
            source.ref_path = RefPath::parse(&path);
        }
        source.api_token = env.get("SLUICE_API_TOKEN");
        source.request_timeout =
            Duration::from_secs(env.parse("SLUICE_REQUEST_TIMEOUT_SECS", 30u64)?);

        config.collector.page_size = env.parse("SLUICE_PAGE_SIZE", DEFAULT_PAGE_SIZE)?;
        let concurrency = env.parse("SLUICE_CONCURRENCY", DEFAULT_CONCURRENCY)?;
        config.collector.concurrency = concurrency;
        config.enricher.concurrency = concurrency;
        config.enricher.report_every = env.parse("SLUICE_REPORT_EVERY", DEFAULT_REPORT_EVERY)?;

        config.warehouse.database_url = env.get("DATABASE_URL");
        config.warehouse.stage_dir = env
            .get("SLUICE_STAGE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("sluice-stages"));
        config.warehouse.create_tables = env.flag("SLUICE_CREATE_TABLES", false);

        if let Some(dir) = env.get("SLUICE_WORK_DIR") {
            config.loader.work_dir = PathBuf::from(dir);
        }
        config.loader.batch_size = env.parse("SLUICE_BATCH_SIZE", DEFAULT_BATCH_SIZE)?;

        let stage = env.string("SLUICE_STAGE_NAME", DEFAULT_STAGE_NAME);
        let truncate = env.flag("TRUNCATE_BEFORE_LOAD", true);
        let on_error: OnError = env.parse("SLUICE_ON_ERROR", OnError::Continue)?;
        let format: FileFormat = env.parse("SLUICE_FILE_FORMAT", FileFormat::JsonArray)?;

        let targets = &mut config.targets;
        for (target, key) in [
            (&mut targets.primary, "SLUICE_PRIMARY_TABLE"),
            (&mut targets.entities, "SLUICE_ENTITY_TABLE"),
        ] {
            if let Some(table) = env.get(key) {
                target.table = env.identifier(key, &table)?;
            }
            target.stage = stage.clone();
            target.truncate = truncate;
            target.on_error = on_error;
            target.format = format;
        }

        if let Some(table) = env.get("SLUICE_DOWNLOAD_TABLE") {
            targets.download.table = env.identifier("SLUICE_DOWNLOAD_TABLE", &table)?;
        }
        targets.download.stage = env.string("SLUICE_DOWNLOAD_STAGE", DEFAULT_DOWNLOAD_STAGE);
        targets.download.truncate = truncate;
        targets.download.on_error = on_error;

        config.failure_policy =
            env.parse("SLUICE_LOAD_FAILURE_POLICY", LoadFailurePolicy::HaltPipeline)?;
        config.name_policy = env.parse("SLUICE_NAME_POLICY", NamePolicy::FirstSeen)?;

        config.validate()?;
        Ok(config)
    }

    /// Sanity checks that hold regardless of which command runs
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.collector.page_size == 0 {
            return Err(invalid("SLUICE_PAGE_SIZE", "must be greater than zero"));
        }
        if self.loader.batch_size == 0 {
            return Err(invalid("SLUICE_BATCH_SIZE", "must be greater than zero"));
        }
        if self.collector.concurrency == 0 {
            return Err(invalid("SLUICE_CONCURRENCY", "must be greater than zero"));
        }
        url::Url::parse(&self.source.base_url)
            .map_err(|e| invalid("SLUICE_API_BASE_URL", e.to_string()))?;
        Ok(())
    }

    /// Report every setting the API pipeline needs but does not have
    pub fn require_for_run(&self, dry_run: bool) -> Result<(), ConfigError> {
        let mut missing = Vec::new();
        if self.source.api_token.as_deref().map_or(true, str::is_empty) {
            missing.push("SLUICE_API_TOKEN".to_string());
        }
        if !dry_run && self.warehouse.database_url.is_none() {
            missing.push("DATABASE_URL".to_string());
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Missing(missing))
        }
    }

    /// Report every setting the download variant needs but does not have
    pub fn require_for_download(&self, dry_run: bool) -> Result<(), ConfigError> {
        if !dry_run && self.warehouse.database_url.is_none() {
            return Err(ConfigError::Missing(vec!["DATABASE_URL".to_string()]));
        }
        Ok(())
    }
}

fn invalid(key: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        reason: reason.into(),
    }
}

/// Typed accessors over a key lookup
struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.trim().is_empty())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    /// `1`, `true` and `yes` (any case) are true; anything else set is false
    fn flag(&self, key: &str, default: bool) -> bool {
        self.get(key)
            .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(default)
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            Some(raw) => raw.trim().parse().map_err(|e: T::Err| invalid(key, e.to_string())),
            None => Ok(default),
        }
    }

    fn identifier(&self, key: &str, raw: &str) -> Result<Identifier, ConfigError> {
        Identifier::parse(raw).map_err(|e| invalid(key, e.to_string()))
    }
}
