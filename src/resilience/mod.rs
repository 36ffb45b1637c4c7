//! Bounded waits, retries and the operation watchdog.
//!
//! Every network wait in the agent goes through one of these: model streams
//! through [`timeout_stream`], tool calls through `tokio::time::timeout` in
//! the registry, model requests through [`retry_with_backoff`], and whole
//! chat turns through the [`Watchdog`].

pub mod retry;
pub mod timeout;
pub mod watchdog;

pub use retry::{
    DEFAULT_RATE_LIMIT_DELAY, MAX_RETRY_DELAY, RetryDecision, RetryPolicy, Retryable,
    delay_from_secs, extract_retry_delay, retry_with_backoff,
};
pub use timeout::{TimeoutError, timeout_stream, with_timeout};
pub use watchdog::{ActiveOperation, Watchdog};
