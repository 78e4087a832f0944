//! Capped retry with a fixed delay, wrapped around one remote operation.

use std::time::Duration;

use tracing::{info, warn};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub max_attempts: usize,
    pub wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(10, Duration::from_secs(120))
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, wait: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            wait,
        }
    }

    /// Single attempt, no waiting.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Run `operation` until it succeeds, fails with a non-transient error,
    /// or the attempt ceiling is reached.
    ///
    /// The operation must be safe to repeat: it is re-invoked from scratch
    /// after each transient failure.
    pub fn run<T, F>(&self, operation_name: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match operation() {
                Ok(value) => {
                    if attempt > 1 {
                        info!(
                            operation = operation_name,
                            attempt, "remote operation succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(err) if err.is_transient() && attempt < self.max_attempts => {
                    warn!(
                        operation = operation_name,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay = ?self.wait,
                        error = %err,
                        "transient remote failure, retrying"
                    );
                    if !self.wait.is_zero() {
                        std::thread::sleep(self.wait);
                    }
                }
                Err(err) => {
                    if err.is_transient() {
                        warn!(
                            operation = operation_name,
                            attempt, "giving up after repeated transient failures"
                        );
                        return Err(Error::remote(
                            format!(
                                "{operation_name} failed after {attempt} attempts: {err}"
                            ),
                            false,
                        ));
                    }
                    return Err(err);
                }
            }
        }
    }
}
