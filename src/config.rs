//! Declarative registry configuration.
//!
//! Deployments describe their circuits in JSON (or any serde format) instead of code:
//!
//! ```rust
//! use breakwater::config::RegistryConfig;
//! use breakwater::{CircuitRegistry, TokioClock};
//! use std::sync::Arc;
//!
//! let config = RegistryConfig::from_json(r#"{
//!     "defaults": { "timeoutMs": 30000 },
//!     "circuits": {
//!         "opa": { "failureThreshold": 3, "volumeThreshold": 1 },
//!         "harvest": { "slowCallThresholdMs": 2000 }
//!     },
//!     "retry": { "attempts": 3, "baseDelayMs": 100, "multiplier": 2.0, "jitter": "none" }
//! }"#).unwrap();
//!
//! let registry = CircuitRegistry::from_config(&config, Arc::new(TokioClock::default())).unwrap();
//! assert!(registry.contains("opa"));
//! assert_eq!(registry.circuit_config("opa").unwrap().failure_threshold(), 3);
//! ```
//!
//! Unset fields fall back to `defaults`, and unset defaults to [`CircuitConfig::default`].

use crate::backoff::Backoff;
use crate::circuit::{CircuitConfig, ConfigError};
use crate::clock::Clock;
use crate::jitter::Jitter;
use crate::registry::CircuitRegistry;
use crate::retry::RetryPolicy;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Partial circuit settings; every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CircuitSettings {
    pub failure_threshold: Option<usize>,
    pub failure_rate_threshold: Option<f64>,
    pub volume_threshold: Option<usize>,
    pub timeout_ms: Option<u64>,
    pub success_threshold: Option<usize>,
    pub half_open_request_limit: Option<usize>,
    pub slow_call_threshold_ms: Option<u64>,
    pub slow_call_rate_threshold: Option<f64>,
}

impl CircuitSettings {
    /// Overlay these settings on `base` and validate the result.
    pub fn apply(&self, base: &CircuitConfig) -> Result<CircuitConfig, ConfigError> {
        let mut builder = base.to_builder();
        if let Some(v) = self.failure_threshold {
            builder = builder.failure_threshold(v);
        }
        if let Some(v) = self.failure_rate_threshold {
            builder = builder.failure_rate_threshold(v);
        }
        if let Some(v) = self.volume_threshold {
            builder = builder.volume_threshold(v);
        }
        if let Some(v) = self.timeout_ms {
            builder = builder.timeout(Duration::from_millis(v));
        }
        if let Some(v) = self.success_threshold {
            builder = builder.success_threshold(v);
        }
        if let Some(v) = self.half_open_request_limit {
            builder = builder.half_open_request_limit(v);
        }
        if let Some(v) = self.slow_call_threshold_ms {
            builder = builder.slow_call_threshold(Duration::from_millis(v));
        }
        if let Some(v) = self.slow_call_rate_threshold {
            builder = builder.slow_call_rate_threshold(v);
        }
        builder.build()
    }
}

/// Retry settings: `attempts`, `baseDelayMs`, `multiplier`, optional `maxDelayMs` and
/// `jitter` (`none`, `full`, `equal`).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RetrySettings {
    #[serde(default = "default_attempts")]
    pub attempts: usize,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default)]
    pub max_delay_ms: Option<u64>,
    #[serde(default)]
    pub jitter: Jitter,
}

fn default_attempts() -> usize {
    3
}

fn default_base_delay_ms() -> u64 {
    100
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: None,
            jitter: Jitter::default(),
        }
    }
}

impl RetrySettings {
    pub fn backoff(&self) -> Result<Backoff, ConfigError> {
        let invalid = |e: crate::backoff::BackoffError| ConfigError::InvalidRetry(e.to_string());
        let backoff = Backoff::exponential(Duration::from_millis(self.base_delay_ms))
            .with_multiplier(self.multiplier)
            .map_err(invalid)?;
        match self.max_delay_ms {
            Some(max) => backoff.with_max(Duration::from_millis(max)).map_err(invalid),
            None => Ok(backoff),
        }
    }

    /// Policy waiting on `clock` with the given retryability predicate left at its default.
    pub fn to_policy<E>(&self, clock: Arc<dyn Clock>) -> Result<RetryPolicy<E>, ConfigError>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        RetryPolicy::builder()
            .max_attempts(self.attempts)
            .backoff(self.backoff()?)
            .with_jitter(self.jitter)
            .with_shared_clock(clock)
            .build()
            .map_err(|e| ConfigError::InvalidRetry(e.to_string()))
    }
}

/// Whole-registry configuration document.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RegistryConfig {
    #[serde(default)]
    pub defaults: CircuitSettings,
    #[serde(default)]
    pub circuits: BTreeMap<String, CircuitSettings>,
    #[serde(default)]
    pub retry: Option<RetrySettings>,
}

impl RegistryConfig {
    pub fn from_json(document: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(document).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Defaults overlaid on the built-in circuit config.
    pub fn default_circuit(&self) -> Result<CircuitConfig, ConfigError> {
        self.defaults.apply(&CircuitConfig::default())
    }

    /// Resolved config for every named circuit.
    pub fn resolve(&self) -> Result<BTreeMap<String, CircuitConfig>, ConfigError> {
        let defaults = self.default_circuit()?;
        self.circuits.iter().map(|(name, settings)| settings.apply(&defaults).map(|c| (name.clone(), c))).collect()
    }
}

impl CircuitRegistry {
    /// Registry with `config.defaults` as its default config and every listed circuit
    /// registered up front. Nothing is registered if any entry is invalid.
    pub fn from_config(config: &RegistryConfig, clock: Arc<dyn Clock>) -> Result<Self, ConfigError> {
        let defaults = config.default_circuit()?;
        let circuits = config.resolve()?;
        let registry = Self::with_shared_clock(clock).with_default_config(defaults);
        for (name, circuit) in circuits {
            registry.register_circuit(name, Some(circuit));
        }
        Ok(registry)
    }
}
