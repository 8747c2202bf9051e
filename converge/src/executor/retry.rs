//! Bounded exponential backoff for transient hypervisor failures.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::client::Operation;
use crate::error::{self, ResourceError};

/// Default attempt ceiling, first try included.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
/// Default delay before the first retry.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(200);
/// Default backoff cap.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(10);

/// Retry configuration for one hypervisor call.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, first try included. At least 1.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Delay after the `failures`-th consecutive failure (1-based).
    pub fn delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis = self.base_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let millis = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }
}

/// Run `call` until it succeeds, fails permanently, or exhausts the policy.
///
/// `attempts` is incremented for every issued call. Cancellation is checked
/// before each attempt; a call already issued is never interrupted.
pub(crate) async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: Operation,
    cancel: &watch::Receiver<bool>,
    attempts: &mut u32,
    mut call: F,
) -> Result<T, ResourceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = error::Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut failures = 0;
    loop {
        if *cancel.borrow() {
            return Err(ResourceError::Cancelled { operation });
        }

        *attempts += 1;
        failures += 1;
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && failures < max_attempts => {
                let delay = policy.delay(failures);
                warn!(
                    %operation,
                    attempt = failures,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) if e.is_transient() => {
                debug!(%operation, attempts = failures, "retries exhausted");
                return Err(ResourceError::RetriesExhausted {
                    operation,
                    attempts: failures,
                    source: e,
                });
            }
            Err(e) => {
                return Err(ResourceError::Permanent {
                    operation,
                    source: e,
                })
            }
        }
    }
}
