//! Bounded worker pool shared by the collector and the enricher

use futures::stream::{self, Stream, StreamExt};
use std::future::Future;

/// Default number of requests in flight per stage
pub const DEFAULT_CONCURRENCY: usize = 10;

/// Run `task` over every input with at most `concurrency` futures in flight.
///
/// Results are yielded as tasks finish, not in input order. The stream ends
/// once every input has produced exactly one result.
pub fn run_bounded<I, F, Fut>(
    inputs: I,
    concurrency: usize,
    task: F,
) -> impl Stream<Item = Fut::Output>
where
    I: IntoIterator,
    F: FnMut(I::Item) -> Fut,
    Fut: Future,
{
    stream::iter(inputs)
        .map(task)
        .buffer_unordered(concurrency.max(1))
}
