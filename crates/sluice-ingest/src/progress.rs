//! Progress accounting for the fetch stages
//!
//! [`ProgressCounter`] is the shared tally that concurrent tasks bump.
//! [`StageProgress`] renders it as an indicatif bar at a coarse cadence.

use indicatif::{ProgressBar, ProgressStyle};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Default number of completions between enrichment progress updates
pub const DEFAULT_REPORT_EVERY: u64 = 5;

/// Counter safe for concurrent increments from many tasks
#[derive(Debug, Clone, Default)]
pub struct ProgressCounter(Arc<AtomicU64>);

impl ProgressCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `n` and return the new total
    pub fn add(&self, n: u64) -> u64 {
        self.0.fetch_add(n, Ordering::Relaxed) + n
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Whether `done` of `total` completions deserves a progress update.
///
/// Reports every `every` completions and always on the last one.
pub fn should_report(done: u64, total: u64, every: u64) -> bool {
    if done == 0 {
        return false;
    }
    done >= total || (every > 0 && done % every == 0)
}

/// Progress bar for one pipeline stage
pub struct StageProgress {
    bar: ProgressBar,
    total: u64,
    every: u64,
}

impl StageProgress {
    pub fn new(total: u64, message: &str, every: u64, visible: bool) -> Self {
        let bar = if visible {
            let pb = ProgressBar::new(total);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{msg} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} ({percent}%)")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("#>-"),
            );
            pb
        } else {
            ProgressBar::hidden()
        };
        bar.set_message(message.to_string());

        Self { bar, total, every }
    }

    /// Record `done` completions. Returns true when the bar was redrawn.
    pub fn update(&self, done: u64) -> bool {
        if should_report(done, self.total, self.every) {
            self.bar.set_position(done);
            true
        } else {
            false
        }
    }

    pub fn finish(&self, message: impl Into<String>) {
        self.bar.finish_with_message(message.into());
    }
}
