//! Sluice - API-to-warehouse ingestion tool

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sluice_common::logging::{init_logging, LogConfig, LogLevel};
use sluice_common::types::Identifier;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use sluice_ingest::config::IngestConfig;
use sluice_ingest::loader::{BulkLoader, MemoryWarehouse, PostgresConnector, SinkConnector};
use sluice_ingest::locator::{
    fetch_resources, run_download, CkanLocator, DirectLocator, DownloadJob, ResourceLocator,
    DEFAULT_CKAN_BASE_URL,
};
use sluice_ingest::pipeline::Pipeline;
use sluice_ingest::source::{HttpSourceClient, StaticToken};

const DEFAULT_LANDING_URL: &str = "https://catalog.data.gov/dataset/border-crossing-entry-data-683ae";

#[derive(Parser, Debug)]
#[command(name = "sluice")]
#[command(author, version, about = "Load API collections and published datasets into a warehouse")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Hide progress bars
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch the collection, enrich its entities and load both datasets
    Run {
        /// Load into an in-memory warehouse instead of Postgres
        #[arg(long)]
        dry_run: bool,

        /// Requests in flight per stage
        #[arg(long)]
        concurrency: Option<usize>,

        /// Items per page request
        #[arg(long)]
        page_size: Option<u64>,

        /// Append instead of replacing table contents
        #[arg(long)]
        no_truncate: bool,
    },

    /// Download a published dataset and load it
    Download {
        /// Dataset landing page or direct file URL
        #[arg(default_value = DEFAULT_LANDING_URL)]
        url: String,

        /// Download directory
        #[arg(short, long, default_value = "downloads")]
        out: PathBuf,

        /// Save under this file name
        #[arg(long)]
        file_name: Option<String>,

        /// Rows per insert batch
        #[arg(long)]
        batch: Option<usize>,

        /// Target table
        #[arg(long)]
        table: Option<String>,

        /// CKAN catalog used to list dataset resources
        #[arg(long, default_value = DEFAULT_CKAN_BASE_URL)]
        catalog: String,

        /// Load into an in-memory warehouse instead of Postgres
        #[arg(long)]
        dry_run: bool,
    },

    /// Save every JSON resource of a published dataset without loading it
    Fetch {
        /// Dataset landing page or direct file URL
        #[arg(default_value = DEFAULT_LANDING_URL)]
        url: String,

        /// Download directory
        #[arg(short, long, default_value = "downloads")]
        out: PathBuf,

        /// Download all formats, not just JSON
        #[arg(long)]
        all: bool,

        /// CKAN catalog used to list dataset resources
        #[arg(long, default_value = DEFAULT_CKAN_BASE_URL)]
        catalog: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("sluice")
        .build();

    // Environment variables take precedence
    let log_config = log_config.clone().with_env_overrides().unwrap_or(log_config);
    let _guard = init_logging(&log_config)?;

    let mut config = IngestConfig::from_env()?;
    let show_progress = !cli.quiet && std::io::stderr().is_terminal();
    config.collector.show_progress = show_progress;
    config.enricher.show_progress = show_progress;

    match cli.command {
        Command::Run {
            dry_run,
            concurrency,
            page_size,
            no_truncate,
        } => {
            if let Some(n) = concurrency {
                config.collector.concurrency = n;
                config.enricher.concurrency = n;
            }
            if let Some(n) = page_size {
                config.collector.page_size = n;
            }
            if no_truncate {
                config.targets.primary.truncate = false;
                config.targets.entities.truncate = false;
            }
            config.validate()?;
            config.require_for_run(dry_run)?;

            run_pipeline(&config, dry_run).await?;
        },
        Command::Download {
            url,
            out,
            file_name,
            batch,
            table,
            catalog,
            dry_run,
        } => {
            if let Some(n) = batch {
                config.loader.batch_size = n;
            }
            if let Some(table) = table {
                config.targets.download.table =
                    Identifier::parse(&table).context("Invalid --table")?;
            }
            config.validate()?;
            config.require_for_download(dry_run)?;

            let client = download_client(&config)?;
            let (connector, _warehouse) = open_connector(&config, dry_run)?;
            let loader = BulkLoader::new(connector, &config.loader);

            let ckan = CkanLocator::new(client.clone(), catalog);
            let locators: [&dyn ResourceLocator; 2] = [&ckan, &DirectLocator];

            let job = DownloadJob {
                landing_url: &url,
                out_dir: &out,
                file_name: file_name.as_deref(),
                target: &config.targets.download,
                show_progress,
            };
            let report = run_download(&client, &locators, &loader, &job).await?;

            info!(
                resource = %report.resource.url,
                path = %report.path.display(),
                table = %report.outcome.table,
                loaded = report.outcome.loaded,
                failed = report.outcome.failed,
                "Download loaded"
            );
        },
        Command::Fetch {
            url,
            out,
            all,
            catalog,
        } => {
            config.validate()?;

            let client = download_client(&config)?;
            let ckan = CkanLocator::new(client.clone(), catalog);
            let locators: [&dyn ResourceLocator; 2] = [&ckan, &DirectLocator];

            let report = fetch_resources(&client, &locators, &url, &out, all, show_progress).await?;
            for (resource, path) in &report.saved {
                info!(resource = %resource.url, path = %path.display(), "Saved resource");
            }
            for failed in &report.failed {
                info!(resource = %failed.resource.url, reason = %failed.reason, "Resource not saved");
            }
        },
    }

    info!("Ingestion complete");
    Ok(())
}

async fn run_pipeline(config: &IngestConfig, dry_run: bool) -> Result<()> {
    let token = StaticToken::new(config.source.api_token.clone().unwrap_or_default());
    let client = HttpSourceClient::new(&config.source, Arc::new(token))?;
    let (connector, warehouse) = open_connector(config, dry_run)?;

    let mut pipeline = Pipeline::new(config, &client, connector);
    let report = pipeline.run().await?;

    for outcome in &report.outcomes {
        info!(
            table = %outcome.table,
            loaded = outcome.loaded,
            failed = outcome.failed,
            truncated = outcome.truncated,
            "Dataset loaded"
        );
    }
    for skipped in &report.skipped {
        info!(dataset = %skipped.dataset, table = %skipped.table, reason = %skipped.reason, "Dataset skipped");
    }
    if let Some(warehouse) = warehouse {
        info!(tables = ?warehouse.tables(), "Dry run finished; nothing was written to Postgres");
    }

    Ok(())
}

fn download_client(config: &IngestConfig) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .user_agent(config.source.user_agent.clone())
        .timeout(config.source.request_timeout)
        .build()?)
}

/// Postgres normally; an in-memory warehouse for dry runs
fn open_connector(
    config: &IngestConfig,
    dry_run: bool,
) -> Result<(Arc<dyn SinkConnector>, Option<MemoryWarehouse>)> {
    if dry_run {
        let warehouse = MemoryWarehouse::new();
        return Ok((Arc::new(warehouse.connector()), Some(warehouse)));
    }
    let connector = PostgresConnector::from_config(&config.warehouse)?;
    Ok((Arc::new(connector), None))
}
