//! Retries for calls to flaky dependencies.
//!
//! - `max_attempts` is the total number of tries, the first one included.
//! - Before attempt `n >= 2` the policy waits `backoff.delay(n - 1)` (jittered) on its
//!   [`Clock`], so `base × multiplier^(n-2)`.
//! - `ResilienceError::Inner(E)` is retried while the `should_retry` predicate says so.
//! - `ResilienceError::Timeout` is retried.
//! - `ResilienceError::CircuitOpen` ends the sequence at once, without sleeping through the
//!   remaining backoff.
//! - When attempts run out the error from the final attempt is returned unmodified.
//!
//! ```rust
//! use std::time::Duration;
//! use breakwater::{Backoff, Jitter, ResilienceError, RetryPolicy, StatusError};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let policy = RetryPolicy::<StatusError>::builder()
//!     .max_attempts(4)
//!     .backoff(Backoff::exponential(Duration::from_millis(1)))
//!     .with_jitter(Jitter::None)
//!     .retry_transient()
//!     .build()
//!     .unwrap();
//!
//! // 403 is a permanent answer: one attempt, returned as is.
//! let denied: Result<(), _> = policy
//!     .execute(|| async { Err(ResilienceError::Inner(StatusError::new(403, "forbidden"))) })
//!     .await;
//! assert_eq!(denied.unwrap_err().into_inner().map(|e| e.status), Some(403));
//! # });
//! ```

use crate::clock::{Clock, TokioClock};
use crate::error::{Classify, ErrorClass, ResilienceError};
use crate::{Backoff, Jitter};
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

type Predicate<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

/// Retry policy combining backoff, jitter, a retryability predicate, and a clock.
pub struct RetryPolicy<E> {
    max_attempts: usize,
    backoff: Backoff,
    jitter: Jitter,
    should_retry: Predicate<E>,
    clock: Arc<dyn Clock>,
}

impl<E> Clone for RetryPolicy<E> {
    fn clone(&self) -> Self {
        Self {
            max_attempts: self.max_attempts,
            backoff: self.backoff.clone(),
            jitter: self.jitter,
            should_retry: self.should_retry.clone(),
            clock: self.clock.clone(),
        }
    }
}

impl<E> std::fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("jitter", &self.jitter)
            .field("clock", &self.clock)
            .field("should_retry", &"<predicate>")
            .finish()
    }
}

impl<E> RetryPolicy<E> {
    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    pub fn jitter(&self) -> Jitter {
        self.jitter
    }
}

impl<E> RetryPolicy<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn builder() -> RetryPolicyBuilder<E> {
        RetryPolicyBuilder::new()
    }

    /// Run `operation` until it succeeds, hits a non-retryable error, or runs out of
    /// attempts.
    pub async fn execute<T, Fut, Op>(&self, operation: Op) -> Result<T, ResilienceError<E>>
    where
        T: Send,
        Fut: Future<Output = Result<T, ResilienceError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        self.execute_unless(operation, || false).await
    }

    /// Like [`execute`](Self::execute), but when `skip_wait` returns true after a failed
    /// attempt the next attempt starts at once instead of after the backoff.
    pub(crate) async fn execute_unless<T, Fut, Op, W>(
        &self,
        mut operation: Op,
        skip_wait: W,
    ) -> Result<T, ResilienceError<E>>
    where
        T: Send,
        Fut: Future<Output = Result<T, ResilienceError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
        W: Fn() -> bool + Send,
    {
        let mut attempt = 1;
        loop {
            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };
            let retryable = match &error {
                ResilienceError::CircuitOpen { .. } => false,
                ResilienceError::Timeout { .. } => true,
                ResilienceError::Inner(inner) => (self.should_retry)(inner),
            };
            if !retryable || attempt >= self.max_attempts {
                return Err(error);
            }

            if skip_wait() {
                debug!(target: "breakwater::retry", attempt, %error, "retrying without backoff");
            } else {
                let delay = self.jitter.apply(self.backoff.delay(attempt));
                debug!(target: "breakwater::retry", attempt, ?delay, %error, "retrying after failure");
                self.clock.after(delay).await;
            }
            attempt += 1;
        }
    }
}

pub struct RetryPolicyBuilder<E> {
    max_attempts: usize,
    backoff: Backoff,
    jitter: Jitter,
    should_retry: Predicate<E>,
    clock: Arc<dyn Clock>,
}

/// Rejected [`RetryPolicyBuilder`] settings.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    #[error("max_attempts must be > 0 (got {0})")]
    InvalidMaxAttempts(usize),
}

impl<E> RetryPolicyBuilder<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Three attempts, 100ms doubling backoff, full jitter, every error retryable.
    pub fn new() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::default(),
            jitter: Jitter::full(),
            should_retry: Arc::new(|_| true),
            clock: Arc::new(TokioClock::default()),
        }
    }

    /// Total tries, the first included. Zero is rejected by `build`.
    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Predicate deciding whether an `Inner` error is retryable.
    pub fn should_retry<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Arc::new(predicate);
        self
    }

    /// Retry only errors that classify as [`ErrorClass::Transient`].
    pub fn retry_transient(self) -> Self
    where
        E: Classify,
    {
        self.should_retry(|e: &E| e.classify() == ErrorClass::Transient)
    }

    /// Wait for backoff on `clock` instead of tokio's timer.
    pub fn with_clock<C: Clock + 'static>(self, clock: C) -> Self {
        self.with_shared_clock(Arc::new(clock))
    }

    pub fn with_shared_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> Result<RetryPolicy<E>, BuildError> {
        if self.max_attempts == 0 {
            return Err(BuildError::InvalidMaxAttempts(0));
        }
        Ok(RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: self.backoff,
            jitter: self.jitter,
            should_retry: self.should_retry,
            clock: self.clock,
        })
    }
}

impl<E> Default for RetryPolicyBuilder<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
