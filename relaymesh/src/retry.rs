//! Fixed-delay retry with a hard attempt cap.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::{error, info, warn};

/// Bounded retry policy shared by the broker and database connectors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundedRetry {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Pause between two attempts
    pub delay: Duration,
}

/// Every attempt failed; carries the error of the last one
#[derive(Debug)]
pub struct RetryExhausted<E> {
    pub attempts: u32,
    pub last_error: E,
}

impl Default for BoundedRetry {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_millis(1_000),
        }
    }
}

impl BoundedRetry {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// Run `op` until it succeeds or the attempt cap is reached.
    ///
    /// `op` receives the 1-based attempt number. A cap of zero still makes
    /// one attempt.
    pub async fn run<T, E, F, Fut>(&self, label: &str, mut op: F) -> Result<T, RetryExhausted<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(target_name = label, attempt, "Succeeded after retrying");
                    }
                    return Ok(value);
                }
                Err(e) if attempt >= max_attempts => {
                    error!(
                        target_name = label,
                        attempts = attempt,
                        error = %e,
                        "Max retries reached"
                    );
                    return Err(RetryExhausted {
                        attempts: attempt,
                        last_error: e,
                    });
                }
                Err(e) => {
                    warn!(
                        target_name = label,
                        attempt,
                        delay_ms = self.delay.as_millis() as u64,
                        error = %e,
                        "Attempt failed, retrying"
                    );
                    tokio::time::sleep(self.delay).await;
                }
            }
        }
    }
}
