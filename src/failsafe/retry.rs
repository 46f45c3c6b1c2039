//! Retry logic with exponential backoff

use std::future::Future;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use tokio::time::{Instant, sleep};
use tracing::debug;

use crate::config::RetryConfig;

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum retries after the first attempt
    pub max_attempts: u32,
    /// Initial backoff
    pub initial_backoff: Duration,
    /// Maximum backoff
    pub max_backoff: Duration,
    /// Backoff multiplier
    pub multiplier: f32,
}

impl RetryPolicy {
    /// Create from config
    #[must_use]
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_backoff: config.initial_backoff,
            max_backoff: config.max_backoff,
            multiplier: config.multiplier,
        }
    }

    /// The delay sequence between attempts (no jitter)
    pub fn delays(&self) -> impl Iterator<Item = Duration> + use<> {
        ExponentialBuilder::default()
            .with_min_delay(self.initial_backoff)
            .with_max_delay(self.max_backoff)
            .with_factor(self.multiplier)
            .with_max_times(self.max_attempts as usize)
            .build()
    }
}

/// The last error once retrying stops
#[derive(Debug)]
pub struct RetryFailure<E> {
    /// Error from the final attempt
    pub error: E,
    /// Attempts made (see [`with_retry`] and [`retry_after_failure`])
    pub attempts: u32,
    /// Why retrying stopped
    pub stopped: StopReason,
}

/// Why a retry loop gave up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The error is not worth retrying
    NotRetryable,
    /// `max_attempts` reached
    Exhausted,
    /// The next backoff would overrun the time budget
    Budget,
}

/// Execute `f` until it succeeds, fails with a non-retryable error, runs out
/// of attempts, or the next backoff would overrun `budget`.
///
/// # Errors
///
/// Returns the last error from `f` along with the attempt count.
pub async fn with_retry<F, Fut, T, E>(
    policy: &RetryPolicy,
    budget: Option<Duration>,
    name: &str,
    retryable: impl Fn(&E) -> bool,
    mut f: F,
) -> Result<(T, u32), RetryFailure<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let deadline = budget.map(|b| Instant::now() + b);
    match f().await {
        Ok(value) => Ok((value, 1)),
        Err(error) => backoff_loop(policy, deadline, name, &retryable, error, 1, f).await,
    }
}

/// Retry an operation whose first call already failed with `error`.
///
/// The first re-attempt waits out the first backoff delay, and at most
/// `max_attempts` re-attempts are made. Attempt counts cover re-attempts
/// only, so a failure that is not retryable reports zero.
///
/// # Errors
///
/// Returns the last error (possibly `error` itself) along with the count.
pub async fn retry_after_failure<F, Fut, T, E>(
    policy: &RetryPolicy,
    budget: Option<Duration>,
    name: &str,
    retryable: impl Fn(&E) -> bool,
    error: E,
    f: F,
) -> Result<(T, u32), RetryFailure<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let deadline = budget.map(|b| Instant::now() + b);
    backoff_loop(policy, deadline, name, &retryable, error, 0, f).await
}

async fn backoff_loop<F, Fut, T, E>(
    policy: &RetryPolicy,
    deadline: Option<Instant>,
    name: &str,
    retryable: &impl Fn(&E) -> bool,
    mut error: E,
    mut attempts: u32,
    mut f: F,
) -> Result<(T, u32), RetryFailure<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut delays = policy.delays();
    loop {
        if !retryable(&error) {
            return Err(RetryFailure {
                error,
                attempts,
                stopped: StopReason::NotRetryable,
            });
        }

        let Some(delay) = delays.next() else {
            debug!(operation = name, attempts, "Max retry attempts reached");
            return Err(RetryFailure {
                error,
                attempts,
                stopped: StopReason::Exhausted,
            });
        };

        if deadline.is_some_and(|d| Instant::now() + delay > d) {
            debug!(operation = name, attempts, "Retry budget exhausted");
            return Err(RetryFailure {
                error,
                attempts,
                stopped: StopReason::Budget,
            });
        }

        debug!(
            operation = name,
            attempt = attempts,
            delay_ms = delay.as_millis(),
            error = %error,
            "Retrying after backoff"
        );
        sleep(delay).await;

        attempts += 1;
        error = match f().await {
            Ok(value) => return Ok((value, attempts)),
            Err(e) => e,
        };
    }
}
