//! Capped exponential backoff shared by the retriever, judge, and sink
//! writers: 3 attempts, 200ms→2s by default.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::sleep;

use crate::error::{Error, Result};

/// Exponential backoff policy for a bounded number of retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum retries after the first attempt.
    pub max_retries: u32,
    /// Base delay used for exponential backoff.
    pub base_delay_ms: u64,
    /// Backoff multiplier applied per retry attempt.
    pub backoff_factor: f64,
    /// Upper bound on any single delay.
    pub max_delay_ms: u64,
}

impl RetryConfig {
    /// Build the retry policy for the retriever: up to 3 attempts,
    /// 200ms→2s capped exponential backoff.
    pub fn retriever_default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 200,
            backoff_factor: 2.0,
            max_delay_ms: 2_000,
        }
    }

    /// Build the retry policy for judge calls: 3 retries, then callers
    /// fall back to heuristic scoring.
    pub fn judge_default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 200,
            backoff_factor: 2.0,
            max_delay_ms: 2_000,
        }
    }

    /// Build the retry policy for sink appends: 3 retries against a
    /// disk/I-O failure before the retirement consumer halts rather than
    /// drop the record.
    pub fn sink_default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 200,
            backoff_factor: 2.0,
            max_delay_ms: 2_000,
        }
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.max(1.0).powi(attempt as i32);
        let millis = (self.base_delay_ms as f64 * factor).round().max(0.0) as u64;
        Duration::from_millis(millis.min(self.max_delay_ms))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::retriever_default()
    }
}

/// Run `op` with bounded exponential-backoff retries, retrying only while
/// `should_retry` returns true and the attempt budget remains.
pub async fn retry_with_backoff<T, F, Fut>(
    config: &RetryConfig,
    should_retry: impl Fn(&Error) -> bool,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if attempt >= config.max_retries || !should_retry(&error) {
                    return Err(error);
                }
                let delay = config.delay_for_attempt(attempt);
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
