//! Pipeline orchestrator
//!
//! Runs fetch, enrich and load strictly in sequence:
//!
//! ```text
//! Idle -> Fetching{total} -> Enriching{total} -> Loading{datasets} -> Done
//!                                                                   \-> Failed{stage, reason}
//! ```
//!
//! The warehouse connection is checked before the first request, so an
//! unreachable sink fails the run in `Connecting` with nothing fetched.
//!
//! Per-request failures never reach this level; the collector and enricher
//! absorb them. What does reach it is an unreachable sink, a failed total
//! probe, a collection in which every page failed, or a load the warehouse
//! refused.

use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::collector::ParallelCollector;
use crate::config::{IngestConfig, LoadFailurePolicy};
use crate::enricher::ParallelEnricher;
use crate::error::{LoadError, PipelineError, StageError};
use crate::keys::extract_keys;
use crate::loader::{BulkLoader, LoadOutcome, LoadTarget, SinkConnector};
use crate::models::Dataset;
use crate::source::{EnrichmentFetcher, PageFetcher};

pub const ITEMS_FILE_NAME: &str = "all_items.json";
pub const ENTITIES_FILE_NAME: &str = "genre_by_artists.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Connecting,
    Fetching,
    Enriching,
    Loading,
    Locating,
    Downloading,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Connecting => "connecting",
            Stage::Fetching => "fetching",
            Stage::Enriching => "enriching",
            Stage::Loading => "loading",
            Stage::Locating => "locating",
            Stage::Downloading => "downloading",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Fetching { total: u64 },
    Enriching { total: usize },
    Loading { datasets: usize },
    Done,
    Failed { stage: Stage, reason: String },
}

/// A dataset left unloaded under [`LoadFailurePolicy::SkipDataset`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetFailure {
    pub dataset: String,
    pub table: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct PipelineReport {
    pub run_id: Uuid,
    pub items_fetched: usize,
    pub failed_pages: usize,
    pub unique_entities: usize,
    pub unresolved_entities: usize,
    /// One per loaded dataset, in load order
    pub outcomes: Vec<LoadOutcome>,
    pub skipped: Vec<DatasetFailure>,
}

pub struct Pipeline<'a, S> {
    config: &'a IngestConfig,
    source: &'a S,
    loader: BulkLoader,
    transitions: Vec<PipelineState>,
    last_completed: Option<Stage>,
}

impl<'a, S> Pipeline<'a, S>
where
    S: PageFetcher + EnrichmentFetcher,
{
    pub fn new(config: &'a IngestConfig, source: &'a S, connector: Arc<dyn SinkConnector>) -> Self {
        Self {
            config,
            source,
            loader: BulkLoader::new(connector, &config.loader),
            transitions: vec![PipelineState::Idle],
            last_completed: None,
        }
    }

    /// Every state visited by the most recent run, starting with `Idle`
    pub fn transitions(&self) -> &[PipelineState] {
        &self.transitions
    }

    pub fn state(&self) -> PipelineState {
        self.transitions.last().cloned().unwrap_or(PipelineState::Idle)
    }

    fn enter(&mut self, state: PipelineState) {
        info!(state = ?state, "Pipeline transition");
        self.transitions.push(state);
    }

    fn fail(&mut self, stage: Stage, source: StageError) -> PipelineError {
        let err = PipelineError {
            stage,
            last_completed: self.last_completed,
            source,
        };
        error!(error = %err, "Pipeline failed");
        self.enter(PipelineState::Failed {
            stage,
            reason: err.source.to_string(),
        });
        err
    }

    pub async fn run(&mut self) -> Result<PipelineReport, PipelineError> {
        self.transitions = vec![PipelineState::Idle];
        self.last_completed = None;

        let start = Instant::now();
        let mut report = PipelineReport {
            run_id: Uuid::new_v4(),
            ..PipelineReport::default()
        };
        info!(run_id = %report.run_id, "Starting pipeline run");

        let config = self.config;
        let source = self.source;

        let connection = self.loader.check_connection().await;
        if let Err(e) = connection {
            return Err(self.fail(Stage::Connecting, e.into()));
        }

        // Fetch
        let probe = source.fetch_total().await;
        let total = match probe {
            Ok(total) => total,
            Err(e) => return Err(self.fail(Stage::Fetching, e.into())),
        };
        self.enter(PipelineState::Fetching { total });

        let collector = ParallelCollector::new(&config.collector);
        let collection = collector.collect(source, total).await;
        if collection.all_pages_failed() {
            let reason = format!("all {} pages failed", collection.pages_requested);
            return Err(self.fail(Stage::Fetching, StageError::Aborted(reason)));
        }
        report.items_fetched = collection.items.len();
        report.failed_pages = collection.failed_pages.len();
        self.last_completed = Some(Stage::Fetching);

        // Enrich
        let index = extract_keys(&collection.items, config.name_policy);
        self.enter(PipelineState::Enriching { total: index.len() });

        let enricher = ParallelEnricher::new(&config.enricher);
        let mut enrichment = enricher.enrich(source, index.ids()).await;
        enrichment.fill_missing_names(&index);
        report.unique_entities = index.len();
        report.unresolved_entities = enrichment.failed.len();
        self.last_completed = Some(Stage::Enriching);

        // Load
        let items = Dataset::new(
            "items",
            ITEMS_FILE_NAME,
            collection.items.into_iter().map(|item| item.payload).collect(),
        );
        let entities = match Dataset::from_rows("entities", ENTITIES_FILE_NAME, &enrichment.entities) {
            Ok(dataset) => dataset,
            Err(e) => return Err(self.fail(Stage::Loading, LoadError::from(e).into())),
        };
        let targets = &config.targets;
        let plan: [(Dataset, &LoadTarget); 2] = [(items, &targets.primary), (entities, &targets.entities)];
        self.enter(PipelineState::Loading { datasets: plan.len() });

        for (dataset, target) in &plan {
            let result = self.loader.load_dataset(dataset, target).await;
            match result {
                Ok(outcome) => report.outcomes.push(outcome),
                Err(e)
                    if e.is_total_failure()
                        && config.failure_policy == LoadFailurePolicy::SkipDataset =>
                {
                    warn!(dataset = %dataset.name, error = %e, "Skipping dataset after load failure");
                    report.skipped.push(DatasetFailure {
                        dataset: dataset.name.clone(),
                        table: target.table.to_string(),
                        reason: e.to_string(),
                    });
                },
                Err(e) => return Err(self.fail(Stage::Loading, e.into())),
            }
        }
        self.last_completed = Some(Stage::Loading);
        self.enter(PipelineState::Done);

        info!(
            run_id = %report.run_id,
            items = report.items_fetched,
            entities = report.unique_entities,
            unresolved = report.unresolved_entities,
            datasets_loaded = report.outcomes.len(),
            datasets_skipped = report.skipped.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Pipeline complete"
        );

        Ok(report)
    }
}
