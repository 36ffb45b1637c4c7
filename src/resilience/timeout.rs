use std::future::Future;
use std::time::Duration;

use futures::{Stream, StreamExt};
use thiserror::Error;
use tokio::time::Instant;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TimeoutError {
    /// A single awaited operation exceeded its bound.
    #[error("{what} timed out after {}s", .after.as_secs())]
    Elapsed { what: String, after: Duration },

    /// No stream item arrived within the idle bound.
    #[error("no data received for {}s", .after.as_secs())]
    Idle { after: Duration },

    /// The stream as a whole ran past its deadline.
    #[error("stream exceeded total time limit of {}s", .after.as_secs())]
    Total { after: Duration },
}

/// Await `fut`, failing with [`TimeoutError::Elapsed`] after `duration`.
pub async fn with_timeout<F, T>(
    fut: F,
    duration: Duration,
    what: &str,
) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, fut)
        .await
        .map_err(|_| {
            tracing::warn!(operation = what, timeout_secs = duration.as_secs(), "Operation timed out");
            TimeoutError::Elapsed {
                what: what.to_string(),
                after: duration,
            }
        })
}

/// Bound a stream by a per-item idle timeout and an overall deadline.
///
/// The returned stream yields `Ok(item)` until the inner stream ends, or a
/// single `Err` once either bound is exceeded, after which it ends. A debug
/// heartbeat is logged every 10 s while items keep flowing.
pub fn timeout_stream<S>(
    inner: S,
    per_item: Duration,
    total: Duration,
) -> impl Stream<Item = Result<S::Item, TimeoutError>> + Send
where
    S: Stream + Send + 'static,
    S::Item: Send,
{
    async_stream::stream! {
        let started = Instant::now();
        let deadline = started + total;
        let mut last_heartbeat = started;
        let mut items: u64 = 0;

        futures::pin_mut!(inner);
        loop {
            let now = Instant::now();
            if now >= deadline {
                yield Err(TimeoutError::Total { after: total });
                break;
            }
            let wait_until = (now + per_item).min(deadline);

            match tokio::time::timeout_at(wait_until, inner.next()).await {
                Ok(Some(item)) => {
                    items += 1;
                    if last_heartbeat.elapsed() >= HEARTBEAT_INTERVAL {
                        last_heartbeat = Instant::now();
                        tracing::debug!(
                            items,
                            elapsed_secs = started.elapsed().as_secs(),
                            "Stream heartbeat"
                        );
                    }
                    yield Ok(item);
                }
                Ok(None) => break,
                Err(_) => {
                    if Instant::now() >= deadline {
                        yield Err(TimeoutError::Total { after: total });
                    } else {
                        yield Err(TimeoutError::Idle { after: per_item });
                    }
                    break;
                }
            }
        }
    }
}
