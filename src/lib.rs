#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # breakwater
//!
//! Resilience core for a gateway that calls unreliable dependencies (a policy engine,
//! downstream services): named circuit breakers, guarded execution with timeouts and
//! fallbacks, retries with backoff, and a TTL result cache composed into a decision client.
//!
//! ## Pieces
//!
//! - [`CircuitRegistry`] owns named circuits (Closed → Open → HalfOpen) and publishes every
//!   state change to subscribers.
//! - [`CircuitRegistry::execute`] runs an operation through a circuit: admission, timeout
//!   race, outcome accounting, fallback.
//! - [`RetryPolicy`] retries transient failures with [`Backoff`] and [`Jitter`], stopping
//!   at once when a circuit rejects.
//! - [`ResultCache`] stores successful results with a TTL.
//! - [`DecisionClient`] composes cache → retry → circuit → cache with per-key single-flight.
//! - [`Clock`] abstracts time; [`ManualClock`] makes every timing rule testable without
//!   sleeping.
//!
//! ## Quick Start
//!
//! ```rust
//! use breakwater::{CircuitConfig, CircuitRegistry, ExecuteOptions, ResilienceError};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let registry = CircuitRegistry::new();
//!     registry.register_circuit(
//!         "opa",
//!         Some(CircuitConfig::builder().failure_threshold(3).build().unwrap()),
//!     );
//!
//!     let result = registry
//!         .execute(
//!             "opa",
//!             || async { Ok::<_, std::io::Error>("allow") },
//!             ExecuteOptions::new().with_timeout(Duration::from_secs(2)),
//!         )
//!         .await;
//!     assert_eq!(result.unwrap(), "allow");
//!
//!     registry.force_open("opa").unwrap();
//!     let rejected: Result<&str, ResilienceError<std::io::Error>> =
//!         registry.execute("opa", || async { Ok("allow") }, ExecuteOptions::new()).await;
//!     assert!(rejected.unwrap_err().is_circuit_open());
//! }
//! ```

pub mod adaptive;
pub mod backoff;
pub mod cache;
pub mod circuit;
pub mod clock;
pub mod config;
pub mod decision;
pub mod error;
pub mod events;
pub mod executor;
pub mod jitter;
pub mod layer;
pub mod monitor;
pub mod prelude;
pub mod registry;
pub mod retry;

// Re-exports
pub use adaptive::DynamicConfig;
pub use backoff::{Backoff, BackoffError, MAX_BACKOFF};
pub use cache::{cache_key, ResultCache};
pub use circuit::{CircuitConfig, CircuitConfigBuilder, CircuitState, CircuitStats, ConfigError};
pub use clock::{Clock, ManualClock, TokioClock};
pub use config::{CircuitSettings, RegistryConfig, RetrySettings};
pub use decision::{DecisionClient, DecisionClientBuilder, DecisionSource, EvaluateOptions};
pub use error::{Classify, ErrorClass, ResilienceError, StatusError};
pub use events::{StateChange, StateChangeReceiver};
pub use executor::{ExecuteOptions, Fallback};
pub use jitter::Jitter;
pub use layer::{CircuitBreakerLayer, CircuitBreakerService};
pub use monitor::{HealthMonitor, HealthStatus};
pub use registry::{CircuitRegistry, RegistryError};
pub use retry::{BuildError, RetryPolicy, RetryPolicyBuilder};
