//! Bounded retries with a backoff schedule for retriable index errors.

use std::future::Future;
use std::time::Duration;

use crate::error::Result;
use crate::metrics::WorkerMetrics;

/// Walks a delay schedule; once exhausted, the last delay repeats.
pub struct Backoff {
    schedule: Vec<Duration>,
    index: usize,
}

impl Backoff {
    pub fn new(schedule: Vec<Duration>) -> Self {
        Self { schedule, index: 0 }
    }

    pub fn on_failure(&mut self) -> Duration {
        let delay = self
            .schedule
            .get(self.index)
            .cloned()
            .unwrap_or_else(|| Duration::from_secs(1));
        if self.index + 1 < self.schedule.len() {
            self.index += 1;
        }
        delay
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included. Always at least 1.
    pub max_attempts: u32,
    pub schedule: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            schedule: [200, 500, 1000, 2000, 5000]
                .into_iter()
                .map(Duration::from_millis)
                .collect(),
        }
    }
}

/// Runs `attempt` until it succeeds, fails with a non-retriable error, or
/// `policy.max_attempts` is used up. The last error is returned unchanged.
pub async fn with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    metrics: &WorkerMetrics,
    operation: &'static str,
    mut attempt: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut backoff = Backoff::new(policy.schedule.clone());
    let mut tries: u32 = 1;
    loop {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retriable() && tries < policy.max_attempts => {
                let delay = backoff.on_failure();
                metrics.record_index_retry();
                tracing::warn!(
                    operation,
                    attempt = tries,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Index write failed, retrying"
                );
                tokio::time::sleep(delay).await;
                tries += 1;
            }
            Err(e) => {
                metrics.record_index_failure();
                tracing::error!(
                    operation,
                    attempts = tries,
                    error_class = e.class(),
                    error = %e,
                    "Index write failed"
                );
                return Err(e);
            }
        }
    }
}
