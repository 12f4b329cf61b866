//! Automatic error recovery strategies.
//
// Retry policies with bounded exponential backoff, and the `Recoverable`
// seam used to cycle a connection after a transient fault.

use crate::error::DaqError;
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Defines a policy for retrying an operation.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// The maximum number of attempts, including the first one.
    pub max_attempts: u32,
    /// The delay before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound for any single delay.
    pub max_backoff: Duration,
    /// Growth factor applied after every failed attempt.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Policy that retries immediately, mostly useful in tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    /// Delay to wait after `failed_attempts` failures (1-based).
    pub fn backoff_for(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(32) as i32;
        let secs = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = secs.min(self.max_backoff.as_secs_f64());
        if capped.is_finite() && capped > 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            Duration::ZERO
        }
    }

    /// Whether another attempt is allowed after `failed_attempts` failures.
    pub fn allows_retry(&self, failed_attempts: u32) -> bool {
        failed_attempts < self.max_attempts
    }
}

/// An object whose connection can be cycled after a fault.
#[async_trait]
pub trait Recoverable<E> {
    /// Tear down and re-establish the underlying connection.
    async fn recover(&mut self) -> Result<(), E>;
}

/// Handles a recoverable error by retrying the recovery according to a policy.
pub async fn handle_recoverable_error<T: Recoverable<DaqError> + Send>(
    recoverable: &mut T,
    policy: &RetryPolicy,
) -> Result<(), DaqError> {
    let mut last_error = None;
    for attempt in 1..=policy.max_attempts {
        match recoverable.recover().await {
            Ok(()) => {
                debug!(attempt, "recovery succeeded");
                return Ok(());
            }
            Err(err) => {
                warn!(attempt, error = %err, "recovery attempt failed");
                last_error = Some(err);
            }
        }
        if policy.allows_retry(attempt) {
            sleep(policy.backoff_for(attempt)).await;
        }
    }
    Err(DaqError::Transport(format!(
        "Failed to recover after {} attempts: {}",
        policy.max_attempts,
        last_error.map(|e| e.to_string()).unwrap_or_default()
    )))
}
