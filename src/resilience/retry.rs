use std::future::Future;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

/// Default wait when a rate limit gives no hint.
pub const DEFAULT_RATE_LIMIT_DELAY: Duration = Duration::from_secs(5);

/// Ceiling on any server-suggested wait.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

static RETRY_DELAY_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"retry_delay\s*\{\s*seconds:\s*(\d+)",
        r#""retryDelay"\s*:\s*"(\d+(?:\.\d+)?)s""#,
        r"(?i)retry\s+after\s+(\d+(?:\.\d+)?)",
        r"(?i)(\d+(?:\.\d+)?)\s*seconds?\b",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

/// Pull a server-suggested wait out of an error body or message.
///
/// Recognises `retry_delay { seconds: N }`, `"retryDelay": "Ns"`,
/// `retry after N` and `N second(s)`.
pub fn extract_retry_delay(text: &str) -> Option<Duration> {
    RETRY_DELAY_PATTERNS.iter().find_map(|re| {
        re.captures(text)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<f64>().ok())
            .and_then(delay_from_secs)
    })
}

/// Turn a server-provided number of seconds into a wait, capped at
/// [`MAX_RETRY_DELAY`]. `None` for negative or non-finite input.
pub fn delay_from_secs(secs: f64) -> Option<Duration> {
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    Some(Duration::try_from_secs_f64(secs).map_or(MAX_RETRY_DELAY, |d| d.min(MAX_RETRY_DELAY)))
}

/// How an error should be treated by [`retry_with_backoff`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Stop,
    Retry,
    /// Retry after the server-provided delay.
    RetryAfter(Duration),
}

/// Errors that know whether retrying can help.
pub trait Retryable {
    fn retry_decision(&self) -> RetryDecision;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: usize,
    /// Wait between attempts when the error carries no hint.
    pub delay: Duration,
    /// Upper bound on any single wait.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            delay: Duration::from_secs(1),
            max_delay: MAX_RETRY_DELAY,
        }
    }
}

/// Run `op` until it succeeds, the error says stop, or attempts run out.
/// The last error is returned.
pub async fn retry_with_backoff<T, E, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) => {
                let wait = match e.retry_decision() {
                    RetryDecision::Stop => return Err(e),
                    _ if attempt >= max_attempts => return Err(e),
                    RetryDecision::Retry => policy.delay,
                    RetryDecision::RetryAfter(d) => d,
                }
                .min(policy.max_delay);

                tracing::warn!(
                    attempt,
                    max_attempts,
                    wait_secs = wait.as_secs_f64(),
                    error = %e,
                    "Retrying after error"
                );
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
        }
    }
}
