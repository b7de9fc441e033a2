use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::AnalyticsResult;

/// Bounded exponential backoff for read-path store calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_backoff: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            attempts: 1,
            base_backoff: Duration::ZERO,
        }
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_backoff
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }

    pub async fn run<T, F, Fut>(&self, operation: &'static str, mut call: F) -> AnalyticsResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = AnalyticsResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Err(error) if error.is_retryable() && attempt < self.attempts => {
                    let delay = self.backoff(attempt);
                    warn!(operation, attempt, ?delay, %error, "transient fetch failure; retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}
