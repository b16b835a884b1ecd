//! Retry policy for driver calls
//!
//! Every call into a driver interface is bounded by the configured timeout.
//! Transient failures (including timeouts) are retried with exponential
//! backoff up to the attempt cap; configuration errors and hardware faults
//! are returned immediately.

use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use ferrite_common::ConductorConfig;
use ferrite_driver::{DriverError, DriverResult};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub call_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &ConductorConfig) -> Self {
        Self {
            max_attempts: config.max_retry_attempts.max(1),
            call_timeout: config.driver_call_timeout(),
            initial_backoff: config.retry_initial_backoff(),
            max_backoff: config.retry_max_backoff(),
        }
    }

    fn backoff(&self) -> impl Backoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_backoff)
            .with_max_interval(self.max_backoff)
            .with_max_elapsed_time(None)
            .build()
    }
}

/// Run a driver call under the policy.
///
/// `call` is invoked up to `max_attempts` times; each invocation is
/// bounded by the call timeout.
pub async fn call_driver<T, F, Fut>(policy: &RetryPolicy, op: &str, mut call: F) -> DriverResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = DriverResult<T>>,
{
    let mut backoff = policy.backoff();
    let mut attempt = 1u32;
    loop {
        let result = match tokio::time::timeout(policy.call_timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(DriverError::Timeout(policy.call_timeout)),
        };
        match result {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < policy.max_attempts => {
                let delay = backoff.next_backoff().unwrap_or(policy.max_backoff);
                warn!(
                    op,
                    attempt,
                    error = %err,
                    delay_ms = delay.as_millis() as u64,
                    "transient driver failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
