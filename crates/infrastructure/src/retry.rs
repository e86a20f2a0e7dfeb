//! Incremental backoff for broker dialing.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use auditflow_core::{AppError, AppResult};
use tokio::time::{Instant, sleep, timeout_at};
use tracing::warn;

/// Incremental backoff policy: the n-th failure waits `interval * min(n, cap)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Base delay between attempts.
    pub interval: Duration,
    /// Attempt count after which the delay stops growing.
    pub cap: u32,
    /// Hard ceiling on attempts, independent of any deadline.
    pub max_attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            cap: 10,
            max_attempts: 300,
        }
    }
}

impl Backoff {
    /// Returns the delay after failed attempt number `attempt`.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        self.interval.saturating_mul(attempt.clamp(1, self.cap.max(1)))
    }
}

/// Runs `operation` until it succeeds, the deadline passes or the attempt
/// ceiling is reached.
///
/// Every failure is logged with its attempt number. Exhaustion returns
/// `AppError::Unavailable` carrying the last failure.
pub async fn retry_with_backoff<T, E, F, Fut>(
    backoff: &Backoff,
    timeout: Duration,
    operation_name: &str,
    mut operation: F,
) -> AppResult<T>
where
    E: Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let deadline = Instant::now() + timeout;
    let max_attempts = backoff.max_attempts.max(1);
    let mut last_error = String::from("no attempt was made");

    for attempt in 1..=max_attempts {
        match timeout_at(deadline, operation(attempt)).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(error)) => {
                warn!(operation = operation_name, attempt, error = %error, "attempt failed");
                last_error = error.to_string();
            }
            Err(_) => {
                warn!(operation = operation_name, attempt, "attempt ran past the deadline");
                last_error = format!("timed out after {}ms", timeout.as_millis());
                break;
            }
        }

        if attempt == max_attempts {
            break;
        }

        let delay = backoff.delay(attempt);
        if Instant::now() + delay > deadline {
            break;
        }
        sleep(delay).await;
    }

    Err(AppError::Unavailable(format!(
        "{operation_name} gave up: {last_error}"
    )))
}
