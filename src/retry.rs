use std::future::Future;
use std::time::Duration;

use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

static MAX_RETRIES: usize = 3;
static DELAY: u64 = 100;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
  pub base_delay_ms: u64,
  pub max_retries: usize,
  pub max_delay: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      base_delay_ms: DELAY,
      max_retries: MAX_RETRIES,
      max_delay: Duration::from_secs(2),
    }
  }
}

/// Runs `action`, retrying with exponential backoff while `is_retryable` holds.
pub async fn with_retry<T, E, A, Fut, P>(policy: &RetryPolicy, action: A, is_retryable: P) -> Result<T, E>
where
  A: FnMut() -> Fut,
  Fut: Future<Output = Result<T, E>>,
  P: FnMut(&E) -> bool,
{
  let strategy = ExponentialBackoff::from_millis(policy.base_delay_ms)
    .max_delay(policy.max_delay)
    .map(jitter)
    .take(policy.max_retries);
  RetryIf::start(strategy, action, is_retryable).await
}
