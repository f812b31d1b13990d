//! Convenient re-exports for the types most callers touch.
pub use crate::{
    backoff::Backoff,
    circuit::{CircuitConfig, CircuitState},
    clock::{Clock, ManualClock, TokioClock},
    decision::{DecisionClient, DecisionSource, EvaluateOptions},
    error::{Classify, ErrorClass, ResilienceError},
    executor::ExecuteOptions,
    jitter::Jitter,
    layer::CircuitBreakerLayer,
    registry::CircuitRegistry,
    retry::RetryPolicy,
};
