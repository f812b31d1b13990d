mod common;

use breakwater::{
    Backoff, CircuitRegistry, Clock, ExecuteOptions, Jitter, ManualClock, ResilienceError, RetryPolicy, TokioClock,
};
use common::test_helpers::{config, TestError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn exponential(attempts: usize) -> breakwater::RetryPolicyBuilder<TestError> {
    RetryPolicy::builder()
        .max_attempts(attempts)
        .backoff(Backoff::exponential(Duration::from_millis(100)))
        .with_jitter(Jitter::None)
        .retry_transient()
}

#[tokio::test(start_paused = true)]
async fn attempts_are_spaced_100ms_then_200ms() {
    let clock = Arc::new(TokioClock::default());
    let registry = CircuitRegistry::with_shared_clock(clock.clone());
    let retry = exponential(3).with_shared_clock(clock.clone()).build().unwrap();
    let stamps = Mutex::new(Vec::new());
    let stamps_ref = &stamps;
    let clock_ref = &clock;

    let result = registry
        .execute_with_retry(
            "opa",
            || async move {
                stamps_ref.lock().unwrap().push(clock_ref.now_millis());
                Err::<(), _>(TestError::transient("503"))
            },
            ExecuteOptions::new(),
            &retry,
        )
        .await;

    assert_eq!(*stamps.lock().unwrap(), vec![0, 100, 300]);
    let err = result.unwrap_err();
    assert_eq!(err.into_inner(), Some(TestError::transient("503")), "final error surfaces unmodified");
}

#[tokio::test]
async fn backoff_requests_are_recorded_by_a_manual_clock() {
    let clock = ManualClock::new();
    let retry = exponential(3).with_clock(clock.clone()).build().unwrap();
    let registry = CircuitRegistry::with_clock(clock.clone());

    let driver = clock.clone();
    let call = registry.execute_with_retry(
        "opa",
        || async { Err::<(), _>(TestError::transient("503")) },
        ExecuteOptions::new(),
        &retry,
    );
    let advance = async move {
        while driver.requested().len() < 2 || driver.pending_timers() > 0 {
            tokio::task::yield_now().await;
            driver.advance(Duration::from_millis(100));
        }
    };
    let (result, ()) = tokio::join!(call, advance);

    assert!(result.is_err());
    assert_eq!(clock.requested(), vec![Duration::from_millis(100), Duration::from_millis(200)]);
}

#[tokio::test]
async fn permanent_error_is_attempted_exactly_once() {
    let registry = CircuitRegistry::with_clock(ManualClock::new());
    let retry = exponential(3).build().unwrap();
    let calls = AtomicUsize::new(0);
    let counter = &calls;

    let err = registry
        .execute_with_retry(
            "opa",
            || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(TestError::permanent("422 invalid input"))
            },
            ExecuteOptions::new(),
            &retry,
        )
        .await
        .unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(err.into_inner().map(|e| e.permanent), Some(true));
}

#[tokio::test(start_paused = true)]
async fn circuit_opening_mid_sequence_stops_sleeping() {
    let clock = Arc::new(TokioClock::default());
    let registry = CircuitRegistry::with_shared_clock(clock.clone())
        .with_default_config(config().failure_threshold(2).volume_threshold(1_000).build().unwrap());
    let retry = exponential(5).with_shared_clock(clock.clone()).build().unwrap();
    let started = tokio::time::Instant::now();

    let err = registry
        .execute_with_retry("opa", || async { Err::<(), _>(TestError::transient("503")) }, ExecuteOptions::new(), &retry)
        .await
        .unwrap_err();

    assert!(err.is_circuit_open());
    assert_eq!(started.elapsed(), Duration::from_millis(100), "only the wait before the opening attempt");
}

#[tokio::test(start_paused = true)]
async fn no_backoff_is_slept_on_an_open_circuit() {
    let clock = Arc::new(TokioClock::default());
    let registry = CircuitRegistry::with_shared_clock(clock.clone())
        .with_default_config(config().failure_threshold(1).volume_threshold(1_000).build().unwrap());
    let retry = RetryPolicy::builder()
        .max_attempts(3)
        .backoff(Backoff::exponential(Duration::from_secs(1)))
        .with_jitter(Jitter::None)
        .with_shared_clock(clock.clone())
        .build()
        .unwrap();
    let calls = AtomicUsize::new(0);
    let counter = &calls;
    let started = tokio::time::Instant::now();

    let err = registry
        .execute_with_retry(
            "opa",
            || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(TestError::transient("503"))
            },
            ExecuteOptions::new(),
            &retry,
        )
        .await
        .unwrap_err();

    assert!(err.is_circuit_open());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(started.elapsed(), Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn timeouts_are_retried_per_attempt() {
    let clock = Arc::new(TokioClock::default());
    let registry = CircuitRegistry::with_shared_clock(clock.clone());
    let retry = exponential(2).with_shared_clock(clock.clone()).build().unwrap();
    let calls = AtomicUsize::new(0);
    let counter = &calls;

    let result = registry
        .execute_with_retry(
            "batches",
            || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                futures::future::pending::<Result<(), TestError>>().await
            },
            ExecuteOptions::new().with_timeout(Duration::from_millis(50)),
            &retry,
        )
        .await;

    assert!(matches!(result, Err(ResilienceError::Timeout { .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let stats = registry.circuit_stats("batches").unwrap();
    assert_eq!((stats.failure_count, stats.slow_count), (2, 2));
}

#[tokio::test]
async fn fallback_sees_only_the_final_error() {
    let registry = CircuitRegistry::with_clock(ManualClock::new());
    let retry = RetryPolicy::builder()
        .max_attempts(3)
        .backoff(Backoff::constant(Duration::ZERO))
        .with_jitter(Jitter::None)
        .build()
        .unwrap();
    let calls = AtomicUsize::new(0);
    let counter = &calls;

    let value = registry
        .execute_with_retry(
            "opa",
            || async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                Err::<String, _>(TestError::transient(&format!("attempt {n}")))
            },
            ExecuteOptions::new().with_fallback(|err: ResilienceError<TestError>, _| {
                format!("fallback after {}", err.into_inner().unwrap().message)
            }),
            &retry,
        )
        .await
        .unwrap();

    assert_eq!(value, "fallback after attempt 2");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}
