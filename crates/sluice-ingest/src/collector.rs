//! Parallel page collection
//!
//! Splits the collection into fixed-size pages and fetches them on the
//! bounded pool. A failed page is logged and dropped; it never aborts the run.

use futures::StreamExt;
use std::pin::pin;
use std::time::Instant;
use tracing::{info, instrument, warn};

use crate::config::CollectorConfig;
use crate::models::Item;
use crate::pool::run_bounded;
use crate::progress::{ProgressCounter, StageProgress};
use crate::source::PageFetcher;

/// Page offsets `0, size, 2*size, ...` covering `[0, total)`
pub fn page_offsets(total: u64, page_size: u64) -> Vec<u64> {
    if page_size == 0 {
        return Vec::new();
    }
    (0..total).step_by(page_size as usize).collect()
}

/// A page that could not be fetched
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageFailure {
    pub offset: u64,
    pub reason: String,
}

/// Everything one collection pass produced
#[derive(Debug, Default)]
pub struct Collection {
    /// Items in page-completion order; order within a page is preserved
    pub items: Vec<Item>,
    pub pages_requested: usize,
    pub failed_pages: Vec<PageFailure>,
}

impl Collection {
    /// True when pages were requested and none of them succeeded
    pub fn all_pages_failed(&self) -> bool {
        self.pages_requested > 0 && self.failed_pages.len() == self.pages_requested
    }
}

pub struct ParallelCollector {
    page_size: u64,
    concurrency: usize,
    show_progress: bool,
    items_fetched: ProgressCounter,
}

impl ParallelCollector {
    pub fn new(config: &CollectorConfig) -> Self {
        Self {
            page_size: config.page_size,
            concurrency: config.concurrency,
            show_progress: config.show_progress,
            items_fetched: ProgressCounter::new(),
        }
    }

    /// Running count of items fetched so far
    pub fn items_fetched(&self) -> u64 {
        self.items_fetched.get()
    }

    /// Fetch every page of a collection holding `total` items
    #[instrument(skip(self, fetcher), fields(page_size = self.page_size, concurrency = self.concurrency))]
    pub async fn collect<F>(&self, fetcher: &F, total: u64) -> Collection
    where
        F: PageFetcher + ?Sized,
    {
        let offsets = page_offsets(total, self.page_size);
        let mut collection = Collection {
            pages_requested: offsets.len(),
            ..Collection::default()
        };

        if offsets.is_empty() {
            info!("No items to fetch");
            return collection;
        }

        let start = Instant::now();
        let limit = self.page_size;
        let progress = StageProgress::new(total, "Fetching items", 1, self.show_progress);

        let mut pages = pin!(run_bounded(offsets, self.concurrency, |offset| {
            let counter = self.items_fetched.clone();
            async move {
                let result = fetcher.fetch_page(offset, limit).await;
                if let Ok(items) = &result {
                    counter.add(items.len() as u64);
                }
                (offset, result)
            }
        }));

        while let Some((offset, result)) = pages.next().await {
            match result {
                Ok(items) => collection.items.extend(items),
                Err(e) => {
                    warn!(offset, error = %e, "Page fetch failed, skipping page");
                    collection.failed_pages.push(PageFailure {
                        offset,
                        reason: e.to_string(),
                    });
                },
            }
            progress.update(self.items_fetched.get().min(total));
        }

        progress.finish(format!("Fetched {} items", collection.items.len()));
        info!(
            items = collection.items.len(),
            pages = collection.pages_requested,
            failed_pages = collection.failed_pages.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Collection complete"
        );

        collection
    }
}
