#![allow(dead_code)]

use breakwater::{
    CircuitConfig, CircuitRegistry, Classify, ErrorClass, ExecuteOptions, ManualClock, ResilienceError,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Error from a fake dependency; `permanent` marks 4xx-style answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestError {
    pub message: String,
    pub permanent: bool,
}

impl TestError {
    pub fn transient(message: &str) -> Self {
        Self { message: message.into(), permanent: false }
    }

    pub fn permanent(message: &str) -> Self {
        Self { message: message.into(), permanent: true }
    }
}

impl std::fmt::Display for TestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TestError: {}", self.message)
    }
}

impl std::error::Error for TestError {}

impl Classify for TestError {
    fn classify(&self) -> ErrorClass {
        if self.permanent {
            ErrorClass::Permanent
        } else {
            ErrorClass::Transient
        }
    }
}

pub fn manual_registry() -> (Arc<CircuitRegistry>, ManualClock) {
    let clock = ManualClock::new();
    (Arc::new(CircuitRegistry::with_clock(clock.clone())), clock)
}

pub fn config() -> breakwater::CircuitConfigBuilder {
    CircuitConfig::builder()
}

/// Run one call through `name`, counting invocations in `calls`.
pub async fn call(
    registry: &CircuitRegistry,
    name: &str,
    calls: &AtomicUsize,
    outcome: Result<u32, TestError>,
) -> Result<u32, ResilienceError<TestError>> {
    registry
        .execute(
            name,
            || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                outcome
            },
            ExecuteOptions::new(),
        )
        .await
}
