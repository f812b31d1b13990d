//! Guarded execution through a named circuit.
//!
//! [`CircuitRegistry::execute`] is the one entry point callers use to reach a protected
//! dependency:
//!
//! 1. resolve (or lazily create) the named circuit;
//! 2. ask it for admission; a rejection goes to the fallback or surfaces as
//!    [`ResilienceError::CircuitOpen`] without running the operation;
//! 3. run the operation, raced against the clock when a timeout is set;
//! 4. record the outcome (success, slow, failure, timeout) against the circuit;
//! 5. hand errors to the fallback, or propagate them unchanged.
//!
//! A timed-out operation future is dropped, which cancels it at its next suspension point.
//! Work that was already handed off elsewhere (a spawned task, a remote server) keeps running.

use std::future::Future;
use std::time::Duration;

use crate::circuit::{Admission, Circuit, Outcome};
use crate::error::ResilienceError;
use crate::registry::CircuitRegistry;
use crate::retry::RetryPolicy;
use tracing::debug;

/// Substitute result produced instead of an error; receives the error and the circuit name.
pub type Fallback<T, E> = Box<dyn FnOnce(ResilienceError<E>, &str) -> T + Send>;

/// Per-call options for [`CircuitRegistry::execute`].
pub struct ExecuteOptions<T, E> {
    timeout: Option<Duration>,
    fallback: Option<Fallback<T, E>>,
}

impl<T, E> Default for ExecuteOptions<T, E> {
    fn default() -> Self {
        Self { timeout: None, fallback: None }
    }
}

impl<T, E> std::fmt::Debug for ExecuteOptions<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecuteOptions")
            .field("timeout", &self.timeout)
            .field("fallback", &self.fallback.as_ref().map(|_| "<fallback>"))
            .finish()
    }
}

impl<T, E> ExecuteOptions<T, E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Give up waiting after `timeout`; the call counts as a failed, slow call.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_optional_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Replace any error (rejection, timeout, or failure) with the fallback's value.
    pub fn with_fallback<F>(mut self, fallback: F) -> Self
    where
        F: FnOnce(ResilienceError<E>, &str) -> T + Send + 'static,
    {
        self.fallback = Some(Box::new(fallback));
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn recover(self, error: ResilienceError<E>, circuit: &str) -> Result<T, ResilienceError<E>> {
        match self.fallback {
            Some(fallback) => {
                debug!(target: "breakwater::executor", circuit, error = error_kind(&error), "fallback invoked");
                Ok(fallback(error, circuit))
            }
            None => Err(error),
        }
    }
}

fn error_kind<E>(error: &ResilienceError<E>) -> &'static str {
    match error {
        ResilienceError::CircuitOpen { .. } => "circuit_open",
        ResilienceError::Timeout { .. } => "timeout",
        ResilienceError::Inner(_) => "inner",
    }
}

/// Holds an admission until its outcome is recorded; dropping it early (cancellation or a
/// panic in the operation) frees the half-open probe slot it may occupy.
struct Permit<'a> {
    circuit: &'a Circuit,
    admission: Option<Admission>,
}

impl Permit<'_> {
    fn take(&mut self) -> Option<Admission> {
        self.admission.take()
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if let Some(admission) = self.admission.take() {
            self.circuit.release(admission);
        }
    }
}

enum Completion<T, E> {
    Finished(Result<T, E>),
    TimedOut,
}

impl CircuitRegistry {
    /// Run `operation` under the protection of the circuit called `name`.
    ///
    /// # Errors
    /// - [`ResilienceError::CircuitOpen`] when the circuit rejects the call (the operation is
    ///   not invoked);
    /// - [`ResilienceError::Timeout`] when the timeout elapses first;
    /// - [`ResilienceError::Inner`] carrying the operation's own error.
    ///
    /// With a fallback configured none of these surface: the fallback's value is returned.
    pub async fn execute<T, E, Fut, Op>(
        &self,
        name: &str,
        operation: Op,
        options: ExecuteOptions<T, E>,
    ) -> Result<T, ResilienceError<E>>
    where
        Op: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let circuit = self.resolve(name);
        let (admission, transition) = circuit.try_acquire(self.clock.now_millis());
        if let Some(transition) = transition {
            self.publish(&circuit, transition);
        }
        let admission = match admission {
            Ok(admission) => admission,
            Err(retry_after) => {
                debug!(target: "breakwater::executor", circuit = name, ?retry_after, "call rejected");
                let rejection = ResilienceError::CircuitOpen { circuit: name.to_owned(), retry_after };
                return options.recover(rejection, name);
            }
        };

        let mut permit = Permit { circuit: &circuit, admission: Some(admission) };
        let started = self.clock.now_millis();
        let completion = match options.timeout {
            Some(limit) => {
                let deadline = self.clock.after(limit);
                tokio::select! {
                    biased;
                    result = operation() => Completion::Finished(result),
                    _ = deadline => Completion::TimedOut,
                }
            }
            None => Completion::Finished(operation().await),
        };
        let finished = self.clock.now_millis();
        let elapsed = Duration::from_millis(finished.saturating_sub(started));

        let (outcome, result) = match completion {
            Completion::Finished(Ok(value)) => {
                let slow = elapsed >= circuit.slow_call_threshold();
                (Outcome::Success { slow }, Ok(value))
            }
            Completion::Finished(Err(error)) => {
                (Outcome::Failure { slow: false }, Err(ResilienceError::Inner(error)))
            }
            Completion::TimedOut => {
                debug!(target: "breakwater::executor", circuit = name, ?elapsed, "call timed out");
                let timeout = options.timeout.unwrap_or(elapsed);
                (Outcome::Failure { slow: true }, Err(ResilienceError::Timeout { circuit: name.to_owned(), timeout }))
            }
        };

        if let Some(admission) = permit.take() {
            if let Some(transition) = circuit.record(finished, admission, outcome) {
                self.publish(&circuit, transition);
            }
        }
        drop(permit);

        match result {
            Ok(value) => Ok(value),
            Err(error) => options.recover(error, name),
        }
    }

    /// [`execute`](Self::execute) once per attempt of `retry`.
    ///
    /// The timeout applies to each attempt. The fallback, if any, only sees the error left
    /// after the retry sequence ends. Once the circuit is open no backoff is slept: the next
    /// attempt is rejected at once and ends the sequence.
    pub async fn execute_with_retry<T, E, Fut, Op>(
        &self,
        name: &str,
        mut operation: Op,
        options: ExecuteOptions<T, E>,
        retry: &RetryPolicy<E>,
    ) -> Result<T, ResilienceError<E>>
    where
        T: Send,
        E: std::error::Error + Send + Sync + 'static,
        Op: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
    {
        let timeout = options.timeout;
        let registry = self;
        let result = retry
            .execute_unless(
                move || {
                    let attempt = operation();
                    registry.execute(name, move || attempt, ExecuteOptions::new().with_optional_timeout(timeout))
                },
                || registry.is_open(name),
            )
            .await;
        match result {
            Ok(value) => Ok(value),
            Err(error) => options.recover(error, name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::{CircuitConfig, CircuitState};
    use crate::clock::ManualClock;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(String);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "TestError: {}", self.0)
        }
    }

    impl std::error::Error for TestError {}

    fn registry(config: CircuitConfig) -> (CircuitRegistry, ManualClock) {
        let clock = ManualClock::new();
        (CircuitRegistry::with_clock(clock.clone()).with_default_config(config), clock)
    }

    fn strict() -> CircuitConfig {
        CircuitConfig::builder()
            .failure_threshold(1)
            .volume_threshold(100)
            .timeout(Duration::from_millis(1_000))
            .success_threshold(1)
            .half_open_request_limit(1)
            .slow_call_threshold(Duration::from_millis(200))
            .build()
            .unwrap()
    }

    async fn fail(registry: &CircuitRegistry, name: &str) -> Result<(), ResilienceError<TestError>> {
        registry.execute(name, || async { Err::<(), _>(TestError("boom".into())) }, ExecuteOptions::new()).await
    }

    #[tokio::test]
    async fn success_is_recorded() {
        let (registry, _) = registry(CircuitConfig::default());
        let value = registry
            .execute("opa", || async { Ok::<_, TestError>(7) }, ExecuteOptions::new())
            .await
            .unwrap();
        assert_eq!(value, 7);
        let stats = registry.circuit_stats("opa").expect("created lazily");
        assert_eq!((stats.total_requests, stats.success_count), (1, 1));
    }

    #[tokio::test]
    async fn inner_error_is_propagated_unchanged() {
        let (registry, _) = registry(CircuitConfig::default());
        let err = fail(&registry, "opa").await.unwrap_err();
        assert_eq!(err.into_inner(), Some(TestError("boom".into())));
        assert_eq!(registry.circuit_stats("opa").unwrap().failure_count, 1);
    }

    #[tokio::test]
    async fn open_circuit_rejects_without_invoking() {
        let (registry, _) = registry(strict());
        let _ = fail(&registry, "opa").await;
        assert!(registry.is_open("opa"));

        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let err = registry
            .execute(
                "opa",
                || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, TestError>(())
                },
                ExecuteOptions::new(),
            )
            .await
            .unwrap_err();
        assert!(err.is_circuit_open());
        assert!(matches!(err, ResilienceError::CircuitOpen { ref circuit, retry_after } if circuit == "opa" && retry_after == Duration::from_millis(1_000)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fallback_receives_rejection_and_name() {
        let (registry, _) = registry(strict());
        registry.force_open_if_missing("opa");

        let value = registry
            .execute(
                "opa",
                || async { Ok::<_, TestError>("live".to_string()) },
                ExecuteOptions::new().with_fallback(|err, name| format!("{name}:{}", error_kind(&err))),
            )
            .await
            .unwrap();
        assert_eq!(value, "opa:circuit_open");
        assert_eq!(registry.circuit_stats("opa").unwrap().total_requests, 0, "rejections are not counted");
    }

    #[tokio::test]
    async fn fallback_swallows_inner_error_after_recording_it() {
        let (registry, _) = registry(CircuitConfig::default());
        let value = registry
            .execute(
                "opa",
                || async { Err::<u32, _>(TestError("down".into())) },
                ExecuteOptions::new().with_fallback(|_, _| 0),
            )
            .await
            .unwrap();
        assert_eq!(value, 0);
        assert_eq!(registry.circuit_stats("opa").unwrap().failure_count, 1);
    }

    #[tokio::test]
    async fn timeout_counts_as_failure_and_slow() {
        let (registry, clock) = registry(CircuitConfig::default());
        let driver = clock.clone();

        let call = registry.execute(
            "batches",
            || futures::future::pending::<Result<(), TestError>>(),
            ExecuteOptions::new().with_timeout(Duration::from_millis(300)),
        );
        let advance = async move {
            tokio::task::yield_now().await;
            driver.advance(Duration::from_millis(300));
        };
        let (result, ()) = tokio::join!(call, advance);

        let err = result.unwrap_err();
        assert!(matches!(err, ResilienceError::Timeout { ref circuit, timeout } if circuit == "batches" && timeout == Duration::from_millis(300)));
        let stats = registry.circuit_stats("batches").unwrap();
        assert_eq!((stats.failure_count, stats.slow_count), (1, 1));
    }

    #[tokio::test]
    async fn fallback_replaces_a_timeout() {
        let (registry, clock) = registry(CircuitConfig::default());
        let driver = clock.clone();

        let call = registry.execute(
            "batches",
            || futures::future::pending::<Result<&str, TestError>>(),
            ExecuteOptions::new()
                .with_timeout(Duration::from_millis(300))
                .with_fallback(|err: ResilienceError<TestError>, _| if err.is_timeout() { "cached plan" } else { "other" }),
        );
        let advance = async move {
            tokio::task::yield_now().await;
            driver.advance(Duration::from_millis(300));
        };
        let (result, ()) = tokio::join!(call, advance);

        assert_eq!(result.unwrap(), "cached plan");
        let stats = registry.circuit_stats("batches").unwrap();
        assert_eq!((stats.failure_count, stats.slow_count), (1, 1));
    }

    #[tokio::test]
    async fn slow_success_is_marked_slow() {
        let (registry, clock) = registry(CircuitConfig::default());
        let driver = &clock;
        let value = registry
            .execute(
                "harvest",
                || async move {
                    driver.advance(Duration::from_secs(11));
                    Ok::<_, TestError>(1)
                },
                ExecuteOptions::new(),
            )
            .await
            .unwrap();
        assert_eq!(value, 1);
        let stats = registry.circuit_stats("harvest").unwrap();
        assert_eq!((stats.success_count, stats.slow_count), (1, 1));
    }

    #[tokio::test]
    async fn half_open_probe_closes_circuit() {
        let (registry, clock) = registry(strict());
        let mut events = registry.subscribe();
        let _ = fail(&registry, "opa").await;
        clock.advance(Duration::from_millis(1_000));

        let observer = &registry;
        let seen_during_call = registry
            .execute("opa", || async move { Ok::<_, TestError>(observer.circuit_state("opa")) }, ExecuteOptions::new())
            .await
            .unwrap();
        assert_eq!(seen_during_call, CircuitState::HalfOpen);
        assert!(registry.is_closed("opa"));

        let states: Vec<CircuitState> = std::iter::from_fn(|| events.try_recv().ok()).map(|e| e.new_state).collect();
        assert_eq!(states, vec![CircuitState::Open, CircuitState::HalfOpen, CircuitState::Closed]);
    }

    #[tokio::test]
    async fn panicking_probe_frees_its_slot() {
        let (registry, clock) = registry(strict());
        let _ = fail(&registry, "opa").await;
        clock.advance(Duration::from_millis(1_000));

        let panicked = std::panic::AssertUnwindSafe(registry.execute(
            "opa",
            || async { panic!("probe blew up") },
            ExecuteOptions::<(), TestError>::new(),
        ))
        .catch_unwind()
        .await;
        assert!(panicked.is_err());
        assert!(registry.is_half_open("opa"));

        let value = registry.execute("opa", || async { Ok::<_, TestError>(5) }, ExecuteOptions::new()).await;
        assert_eq!(value.unwrap(), 5, "slot was released, next probe admitted");
    }

    #[tokio::test]
    async fn execute_with_retry_stops_when_circuit_opens() {
        use crate::{Backoff, Jitter};

        let (registry, _) = registry(
            CircuitConfig::builder().failure_threshold(2).volume_threshold(100).build().unwrap(),
        );
        let retry = RetryPolicy::builder()
            .max_attempts(5)
            .backoff(Backoff::constant(Duration::ZERO))
            .with_jitter(Jitter::None)
            .build()
            .unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let err = registry
            .execute_with_retry(
                "opa",
                || {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>(TestError("503".into()))
                    }
                },
                ExecuteOptions::new(),
                &retry,
            )
            .await
            .unwrap_err();

        assert!(err.is_circuit_open(), "third attempt is rejected: {err:?}");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    impl CircuitRegistry {
        fn force_open_if_missing(&self, name: &str) {
            self.register_circuit(name, None);
            self.force_open(name).unwrap();
        }
    }
}
