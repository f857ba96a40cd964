//! Bounded polling and transient-error retry primitives.
//!
//! Every backend waits on provider-side transitions (an instance reaching
//! `running`, a snapshot completing) and retries calls rejected with
//! allow-listed transient errors. Both loops live here so that resources only
//! supply the check or the call.
//!
//! A poll returns a [`PollOutcome`] rather than raising on timeout; the call
//! site decides whether a timeout is fatal ([`PollOutcome::into_result`]) or
//! just a "did it happen" answer ([`PollOutcome::succeeded`]).

use std::future::Future;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, warn};

use crate::error::{DeployError, Result};

/// Result of a bounded poll.
#[derive(Debug)]
pub enum PollOutcome<T> {
    /// The condition held; carries the check's value.
    Ready(T),
    /// The budget ran out before the condition held.
    TimedOut {
        /// Time spent polling.
        elapsed: Duration,
    },
    /// The check failed with a non-retryable error.
    Fatal(DeployError),
}

impl<T> PollOutcome<T> {
    /// Treats a timeout as an error.
    ///
    /// # Errors
    ///
    /// Returns [`DeployError::Timeout`] on timeout and the check's error on a
    /// fatal check failure.
    pub fn into_result(self, what: &str) -> Result<T> {
        match self {
            Self::Ready(value) => Ok(value),
            Self::TimedOut { elapsed } => Err(DeployError::timeout(what, elapsed.as_secs())),
            Self::Fatal(err) => Err(err),
        }
    }

    /// Treats a timeout as a plain `false`.
    ///
    /// # Errors
    ///
    /// Returns the check's error on a fatal check failure.
    pub fn succeeded(self) -> Result<bool> {
        match self {
            Self::Ready(_) => Ok(true),
            Self::TimedOut { .. } => Ok(false),
            Self::Fatal(err) => Err(err),
        }
    }
}

/// Bounded poll-until-condition loop.
#[derive(Debug, Clone, Copy)]
pub struct Poller {
    /// Delay between checks.
    interval: Duration,
    /// Overall budget; `None` polls forever.
    timeout: Option<Duration>,
}

impl Poller {
    /// Creates a poller with a budget.
    #[must_use]
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout: Some(timeout),
        }
    }

    /// Creates a poller that only stops once the condition holds.
    #[must_use]
    pub const fn unbounded(interval: Duration) -> Self {
        Self {
            interval,
            timeout: None,
        }
    }

    /// Polls `check` until it yields a value.
    ///
    /// Retryable check errors are logged and polling continues; any other
    /// error ends the poll with [`PollOutcome::Fatal`].
    pub async fn until<T, F, Fut>(&self, mut check: F) -> PollOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        let start = Instant::now();
        loop {
            match check().await {
                Ok(Some(value)) => return PollOutcome::Ready(value),
                Ok(None) => {}
                Err(err) if err.is_retryable() => {
                    debug!("Transient error while polling, continuing: {err}");
                }
                Err(err) => return PollOutcome::Fatal(err),
            }

            let elapsed = start.elapsed();
            if let Some(timeout) = self.timeout {
                if elapsed >= timeout {
                    return PollOutcome::TimedOut { elapsed };
                }
            }

            tokio::time::sleep(self.interval).await;
        }
    }

    /// Polls a boolean condition.
    pub async fn until_true<F, Fut>(&self, mut check: F) -> PollOutcome<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        self.until(|| {
            let fut = check();
            async move { fut.await.map(|done| done.then_some(())) }
        })
        .await
    }
}

/// Budget and backoff shape for retrying transient provider errors.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Backoff before the second attempt.
    pub base_delay: Duration,
    /// Upper bound for a single backoff.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 7,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Randomized backoff before attempt `attempt + 1`.
    ///
    /// The ceiling doubles with each attempt up to `max_delay`; the actual
    /// delay is drawn uniformly from the upper half of the ceiling.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let ceiling = self
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);
        let ceiling_ms = u64::try_from(ceiling.as_millis()).unwrap_or(u64::MAX);
        if ceiling_ms == 0 {
            return Duration::ZERO;
        }
        let jittered = rand::thread_rng().gen_range(ceiling_ms / 2..=ceiling_ms);
        Duration::from_millis(jittered)
    }
}

/// Runs `op`, retrying with randomized backoff while it fails with a
/// retryable error and the attempt budget lasts.
///
/// # Errors
///
/// Returns the first non-retryable error, or the last transient error once
/// the budget is exhausted.
pub async fn retry_transient<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    "{what} failed with a transient error (attempt {attempt}/{}), retrying in {}ms: {err}",
                    policy.max_attempts,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
