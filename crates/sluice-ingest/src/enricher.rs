//! Parallel entity enrichment

use futures::StreamExt;
use std::collections::HashSet;
use std::pin::pin;
use tracing::{debug, info, instrument, warn};

use crate::config::EnricherConfig;
use crate::keys::EntityIndex;
use crate::models::EnrichedEntity;
use crate::pool::run_bounded;
use crate::progress::StageProgress;
use crate::source::EnrichmentFetcher;

/// Output of one enrichment pass
#[derive(Debug, Default)]
pub struct Enrichment {
    /// Exactly one entity per requested id, in completion order
    pub entities: Vec<EnrichedEntity>,
    /// Ids whose lookup failed; their entities are unresolved placeholders
    pub failed: Vec<String>,
}

impl Enrichment {
    /// Fill names the detail endpoint left empty from the names seen on the
    /// items. Failed lookups stay unresolved.
    pub fn fill_missing_names(&mut self, index: &EntityIndex) {
        let failed: HashSet<&str> = self.failed.iter().map(String::as_str).collect();
        for entity in &mut self.entities {
            if entity.name.is_none() && !failed.contains(entity.id.as_str()) {
                entity.name = index.name(&entity.id).map(str::to_string);
            }
        }
    }
}

pub struct ParallelEnricher {
    concurrency: usize,
    report_every: u64,
    show_progress: bool,
}

impl ParallelEnricher {
    pub fn new(config: &EnricherConfig) -> Self {
        Self {
            concurrency: config.concurrency,
            report_every: config.report_every,
            show_progress: config.show_progress,
        }
    }

    /// Look up every id once. A failed lookup yields an unresolved entity and
    /// never affects the others.
    #[instrument(skip(self, fetcher, ids), fields(total = ids.len(), concurrency = self.concurrency))]
    pub async fn enrich<F>(&self, fetcher: &F, ids: &[String]) -> Enrichment
    where
        F: EnrichmentFetcher + ?Sized,
    {
        let mut enrichment = Enrichment {
            entities: Vec::with_capacity(ids.len()),
            failed: Vec::new(),
        };

        if ids.is_empty() {
            info!("No entities to enrich");
            return enrichment;
        }

        let total = ids.len() as u64;
        let progress =
            StageProgress::new(total, "Fetching entity details", self.report_every, self.show_progress);

        let mut lookups = pin!(run_bounded(ids, self.concurrency, |id| async move {
            (id, fetcher.fetch_entity(id).await)
        }));

        let mut done = 0u64;
        while let Some((id, result)) = lookups.next().await {
            let entity = match result {
                Ok(detail) => EnrichedEntity::resolved(id.clone(), detail),
                Err(e) => {
                    warn!(entity_id = %id, error = %e, "Entity lookup failed, recording placeholder");
                    enrichment.failed.push(id.clone());
                    EnrichedEntity::unresolved(id.clone())
                },
            };
            enrichment.entities.push(entity);

            done += 1;
            if progress.update(done) {
                debug!(done, total, "Enrichment progress");
            }
        }

        progress.finish(format!("Enriched {} entities", done));
        info!(
            entities = enrichment.entities.len(),
            failed = enrichment.failed.len(),
            "Enrichment complete"
        );

        enrichment
    }
}
