//! Retries with exponential backoff and jitter.
//!
//! Writes that race with other writers fail with a conflict. [`retry_on_conflict`] re-runs such
//! an operation, which must re-read the object it updates, on a short bounded schedule. Other
//! transient failures are retried with [`retry_with_backoff`].

use gargantua_k8s_api::store;
use rand::Rng;
use std::{future::Future, time::Duration};
use tracing::{debug, error, warn};

#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// The most attempts made, or 0 to retry forever.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Five attempts, starting at 10ms and doubling up to 1s.
    pub fn conflict() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
        }
    }

    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }
}

/// Re-runs `op` while it fails with a conflict.
pub async fn retry_on_conflict<F, Fut, T>(mut op: F) -> store::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = store::Result<T>>,
{
    let config = RetryConfig::conflict();
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;
    loop {
        attempt += 1;
        match op().await {
            Err(error) if error.is_conflict() && attempt < config.max_attempts => {
                debug!(%error, attempt, "Conflict; retrying");
                tokio::time::sleep(jittered(delay)).await;
                delay = next_delay(&config, delay);
            }
            result => return result,
        }
    }
}

/// Re-runs `operation` until it succeeds or the configured attempts are exhausted.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;
    loop {
        attempt += 1;
        match operation().await {
            Ok(result) => return Ok(result),
            Err(error) => {
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    error!(operation = %operation_name, attempt, %error, "Operation failed");
                    return Err(error);
                }

                let delay_for = jittered(delay);
                warn!(
                    operation = %operation_name,
                    attempt,
                    %error,
                    delay_ms = delay_for.as_millis(),
                    "Operation failed; retrying"
                );
                tokio::time::sleep(delay_for).await;
                delay = next_delay(config, delay);
            }
        }
    }
}

/// Spreads the delay over half to one and a half times its length.
fn jittered(delay: Duration) -> Duration {
    let jitter = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_secs_f64(delay.as_secs_f64() * jitter)
}

fn next_delay(config: &RetryConfig, delay: Duration) -> Duration {
    Duration::from_secs_f64(
        (delay.as_secs_f64() * config.backoff_multiplier).min(config.max_delay.as_secs_f64()),
    )
}
