//! Bounded exponential backoff for page requests, driven by an injectable clock.

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;

/// Longest server-requested delay that is honoured as-is
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(120);

/// Time source for backoff sleeps and timestamps
#[async_trait]
pub trait Clock: Send + Sync {
    async fn sleep(&self, duration: Duration);

    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock backed by the tokio timer
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Retry bounds for transient failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl BackoffPolicy {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay: config.retry_initial_delay,
            max_delay: config.retry_max_delay,
        }
    }

    /// Delay before retry number `attempt` (0-based).
    ///
    /// `initial * 2^attempt`, capped at `max_delay`. A server-supplied
    /// Retry-After replaces the computed delay, up to [`MAX_RETRY_AFTER`].
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        if let Some(requested) = retry_after {
            return requested.min(MAX_RETRY_AFTER);
        }
        let factor = 2u32.saturating_pow(attempt);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&ClientConfig::default())
    }
}

/// Run `op`, retrying transient failures on the same request.
///
/// On failure returns the last error together with the number of attempts
/// made. Non-transient errors return after the first attempt.
pub async fn retry_transient<T, F, Fut>(
    policy: &BackoffPolicy,
    clock: &dyn Clock,
    dataset_id: &str,
    offset: u64,
    mut op: F,
) -> std::result::Result<T, (ClientError, u32)>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < policy.max_retries => {
                let delay = policy.delay_for(attempt, err.retry_after());
                tracing::warn!(
                    dataset = %dataset_id,
                    offset,
                    attempt = attempt + 1,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Transient failure, retrying"
                );
                clock.sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err((err, attempt + 1)),
        }
    }
}
