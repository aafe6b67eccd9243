use futures::stream::{self, StreamExt};
use std::future::Future;

/// Runs every future with at most `limit` in flight, waits for all of them,
/// then returns the first error in submission order.
pub async fn join_barrier<I, F, T, E>(limit: usize, futures: I) -> Result<Vec<T>, E>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = Result<T, E>>,
{
    let results: Vec<Result<T, E>> = stream::iter(futures)
        .buffered(limit.max(1))
        .collect()
        .await;
    results.into_iter().collect()
}
