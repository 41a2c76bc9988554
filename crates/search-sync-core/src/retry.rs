//! Fixed-interval retry policy
//!
//! Two modes share one executor:
//! - bounded: a fixed number of retries, used for message redelivery
//! - unbounded: retry until success or cancellation, used for the startup fetch
//!
//! Neither mode grows its delay between attempts.

use crate::config::RetryConfig;
use crate::error::{Result, SyncError};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Retry mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryMode {
    /// Retry at most `max_retries` times after the first attempt
    Bounded { max_retries: u32 },
    /// Retry forever
    Unbounded,
}

/// Information about one failed attempt, handed to the failure callback
#[derive(Debug)]
pub struct RetryAttempt<'a> {
    /// 1-based attempt number that just failed
    pub attempt: u32,
    pub error: &'a SyncError,
    /// Delay before the next attempt, `None` once the budget is exhausted
    pub next_delay: Option<Duration>,
    /// Time since the first attempt started
    pub elapsed: Duration,
}

/// Fixed-interval retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub mode: RetryMode,
    pub interval: Duration,
}

impl RetryPolicy {
    pub fn bounded(max_retries: u32, interval: Duration) -> Self {
        Self {
            mode: RetryMode::Bounded { max_retries },
            interval,
        }
    }

    pub fn unbounded(interval: Duration) -> Self {
        Self {
            mode: RetryMode::Unbounded,
            interval,
        }
    }

    /// Message redelivery defaults: 5 retries, 5 seconds apart
    pub fn message_redelivery() -> Self {
        Self::bounded(5, Duration::from_secs(5))
    }

    /// Upstream fetch defaults: retry forever, 3 seconds apart
    pub fn upstream_fetch() -> Self {
        Self::unbounded(Duration::from_secs(3))
    }

    /// Whether another attempt is allowed after `attempt` attempts have failed
    pub fn should_retry(&self, attempt: u32) -> bool {
        match self.mode {
            RetryMode::Bounded { max_retries } => attempt <= max_retries,
            RetryMode::Unbounded => true,
        }
    }

    /// Budget left for a message the broker has delivered `delivered` times
    ///
    /// Every earlier delivery is charged one attempt. At least one attempt
    /// always remains, so a message redelivered past its budget is tried once
    /// more and then given up on.
    pub fn for_delivery(&self, delivered: u32) -> Self {
        match self.mode {
            RetryMode::Bounded { max_retries } => Self::bounded(
                max_retries.saturating_sub(delivered.saturating_sub(1)),
                self.interval,
            ),
            RetryMode::Unbounded => *self,
        }
    }

    /// Total attempts allowed, `None` when unbounded
    pub fn max_attempts(&self) -> Option<u32> {
        match self.mode {
            RetryMode::Bounded { max_retries } => Some(max_retries.saturating_add(1)),
            RetryMode::Unbounded => None,
        }
    }

    /// Run `operation` until it succeeds, the budget runs out or `cancel` fires
    ///
    /// `operation` receives the 1-based attempt number. `on_failure` is called
    /// after every failed attempt, before waiting. Cancellation interrupts both
    /// a running attempt and the wait between attempts.
    pub async fn execute<T, F, Fut, N>(
        &self,
        cancel: &CancellationToken,
        operation: F,
        on_failure: N,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
        N: FnMut(&RetryAttempt<'_>),
    {
        self.run(cancel, true, operation, on_failure).await
    }

    /// Like `execute`, but an attempt that has started always runs to the end
    ///
    /// Cancellation is only observed before an attempt and during the wait.
    pub async fn execute_to_completion<T, F, Fut, N>(
        &self,
        cancel: &CancellationToken,
        operation: F,
        on_failure: N,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
        N: FnMut(&RetryAttempt<'_>),
    {
        self.run(cancel, false, operation, on_failure).await
    }

    async fn run<T, F, Fut, N>(
        &self,
        cancel: &CancellationToken,
        interruptible: bool,
        mut operation: F,
        mut on_failure: N,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
        N: FnMut(&RetryAttempt<'_>),
    {
        let start = Instant::now();
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            if cancel.is_cancelled() {
                return Err(SyncError::cancelled(format!("attempt {}", attempt)));
            }

            let outcome = if interruptible {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        return Err(SyncError::cancelled(format!("attempt {}", attempt)));
                    }
                    outcome = operation(attempt) => outcome,
                }
            } else {
                operation(attempt).await
            };

            let error = match outcome {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            let retry = self.should_retry(attempt);
            on_failure(&RetryAttempt {
                attempt,
                error: &error,
                next_delay: retry.then_some(self.interval),
                elapsed: start.elapsed(),
            });

            if !retry {
                return Err(SyncError::RetryExhausted {
                    attempts: attempt,
                    message: error.to_string(),
                });
            }

            debug!(attempt, delay_ms = self.interval.as_millis() as u64, "Waiting before retry");

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(SyncError::cancelled(format!("retry wait after attempt {}", attempt)));
                }
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::message_redelivery()
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        match config.max_retries {
            Some(max_retries) => Self::bounded(max_retries, config.interval),
            None => Self::unbounded(config.interval),
        }
    }
}
