//! Sluice ingest library
//!
//! Pulls a paginated collection from a bearer-token JSON API, enriches the
//! entities it references with one lookup per unique id, and bulk-loads both
//! record sets into warehouse tables.
//!
//! # Stages
//!
//! - **Collect**: [`collector::ParallelCollector`] fetches every page on a bounded pool
//! - **Extract**: [`keys::extract_keys`] deduplicates entity references
//! - **Enrich**: [`enricher::ParallelEnricher`] resolves each unique id
//! - **Load**: [`loader::BulkLoader`] stages each dataset and loads it through a [`loader::BulkSink`]
//!
//! [`pipeline::Pipeline`] chains them. [`locator::run_download`] is a second
//! entry point that loads a published dataset file through the same loader.
//!
//! # Example
//!
//! ```no_run
//! use sluice_ingest::config::IngestConfig;
//! use sluice_ingest::loader::MemoryWarehouse;
//! use sluice_ingest::pipeline::Pipeline;
//! use sluice_ingest::source::{HttpSourceClient, StaticToken};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = IngestConfig::from_env()?;
//!     let token = StaticToken::new(config.source.api_token.clone().unwrap_or_default());
//!     let client = HttpSourceClient::new(&config.source, Arc::new(token))?;
//!     let warehouse = MemoryWarehouse::new();
//!
//!     let report = Pipeline::new(&config, &client, Arc::new(warehouse.connector()))
//!         .run()
//!         .await?;
//!     println!("loaded {} datasets", report.outcomes.len());
//!     Ok(())
//! }
//! ```

pub mod collector;
pub mod config;
pub mod enricher;
pub mod error;
pub mod keys;
pub mod loader;
pub mod locator;
pub mod models;
pub mod pipeline;
pub mod pool;
pub mod progress;
pub mod source;

pub use config::IngestConfig;
pub use error::{ConfigError, FetchError, LoadError, LocateError, PipelineError};
pub use pipeline::{Pipeline, PipelineReport, PipelineState, Stage};
