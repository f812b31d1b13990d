//! Per-dependency circuit state machine.
//!
//! ```text
//! Closed ──threshold breached──▶ Open ──timeout elapsed──▶ HalfOpen
//!   ▲                              ▲                          │
//!   │                              └──────any failure─────────┤
//!   └─────────────success_threshold successes─────────────────┘
//! ```
//!
//! A circuit counts outcomes inside a *window*: the span since the last transition into
//! Closed or HalfOpen. Every transition starts a new window with zeroed counters and a new
//! generation number; an outcome reported against an older generation is discarded, so
//! counters never mix results from different windows.
//!
//! Circuits are owned by [`CircuitRegistry`](crate::CircuitRegistry); nothing outside the
//! crate mutates one directly.

use crate::clock::millis;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Current state of a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operating mode.
    Closed,
    /// Short-circuits calls until the open timeout elapses.
    Open,
    /// Probe mode allowing a limited number of calls to test recovery.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => f.write_str("closed"),
            CircuitState::Open => f.write_str("open"),
            CircuitState::HalfOpen => f.write_str("half_open"),
        }
    }
}

/// Errors produced when validating circuit configuration.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    /// Count-style thresholds must be > 0.
    #[error("{field} must be > 0 (got {provided})")]
    InvalidThreshold {
        /// Name of the offending setting.
        field: &'static str,
        /// Value provided by caller.
        provided: usize,
    },
    /// Percentages must lie in (0, 100].
    #[error("{field} must be within (0, 100] (got {provided})")]
    InvalidRate {
        /// Name of the offending setting.
        field: &'static str,
        /// Value provided by caller.
        provided: f64,
    },
    /// More successes required to close than probes a half-open window admits.
    #[error("success_threshold ({success_threshold}) must be <= half_open_request_limit ({half_open_request_limit})")]
    UnreachableSuccessThreshold {
        success_threshold: usize,
        half_open_request_limit: usize,
    },
    /// The open timeout must be > 0.
    #[error("timeout must be > 0 (got {0:?})")]
    InvalidTimeout(Duration),
    /// Retry settings were rejected by the backoff or retry builder.
    #[error("invalid retry settings: {0}")]
    InvalidRetry(String),
    /// A configuration document could not be parsed.
    #[error("invalid configuration document: {0}")]
    Parse(String),
}

/// Validated configuration for a single circuit.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitConfig {
    failure_threshold: usize,
    failure_rate_threshold: f64,
    volume_threshold: usize,
    timeout: Duration,
    success_threshold: usize,
    half_open_request_limit: usize,
    slow_call_threshold: Duration,
    slow_call_rate_threshold: f64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_rate_threshold: 50.0,
            volume_threshold: 10,
            timeout: Duration::from_secs(60),
            success_threshold: 3,
            half_open_request_limit: 3,
            slow_call_threshold: Duration::from_secs(10),
            slow_call_rate_threshold: 80.0,
        }
    }
}

impl CircuitConfig {
    /// Builder seeded with the defaults.
    pub fn builder() -> CircuitConfigBuilder {
        CircuitConfigBuilder { config: Self::default() }
    }

    /// Builder seeded with this config, for deriving a variant.
    pub fn to_builder(&self) -> CircuitConfigBuilder {
        CircuitConfigBuilder { config: self.clone() }
    }

    /// Failures within one closed window that open the circuit.
    pub fn failure_threshold(&self) -> usize {
        self.failure_threshold
    }

    /// Failure percentage that opens the circuit once `volume_threshold` is reached.
    pub fn failure_rate_threshold(&self) -> f64 {
        self.failure_rate_threshold
    }

    /// Minimum requests in a window before rates are evaluated.
    pub fn volume_threshold(&self) -> usize {
        self.volume_threshold
    }

    /// Time spent Open before a probe is admitted.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Half-open successes needed to close.
    pub fn success_threshold(&self) -> usize {
        self.success_threshold
    }

    /// Probes admitted at once while half-open.
    pub fn half_open_request_limit(&self) -> usize {
        self.half_open_request_limit
    }

    /// Latency at or above which a call counts as slow.
    pub fn slow_call_threshold(&self) -> Duration {
        self.slow_call_threshold
    }

    /// Slow-call percentage that opens the circuit once `volume_threshold` is reached.
    pub fn slow_call_rate_threshold(&self) -> f64 {
        self.slow_call_rate_threshold
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let counts = [
            ("failure_threshold", self.failure_threshold),
            ("volume_threshold", self.volume_threshold),
            ("success_threshold", self.success_threshold),
            ("half_open_request_limit", self.half_open_request_limit),
        ];
        for (field, provided) in counts {
            if provided == 0 {
                return Err(ConfigError::InvalidThreshold { field, provided });
            }
        }

        let rates = [
            ("failure_rate_threshold", self.failure_rate_threshold),
            ("slow_call_rate_threshold", self.slow_call_rate_threshold),
        ];
        for (field, provided) in rates {
            if !(provided > 0.0 && provided <= 100.0) {
                return Err(ConfigError::InvalidRate { field, provided });
            }
        }

        if self.success_threshold > self.half_open_request_limit {
            return Err(ConfigError::UnreachableSuccessThreshold {
                success_threshold: self.success_threshold,
                half_open_request_limit: self.half_open_request_limit,
            });
        }

        if self.timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout(self.timeout));
        }
        Ok(())
    }
}

/// Builder for [`CircuitConfig`]; `build` validates every field.
#[derive(Debug, Clone)]
pub struct CircuitConfigBuilder {
    config: CircuitConfig,
}

impl CircuitConfigBuilder {
    pub fn failure_threshold(mut self, failures: usize) -> Self {
        self.config.failure_threshold = failures;
        self
    }

    pub fn failure_rate_threshold(mut self, percent: f64) -> Self {
        self.config.failure_rate_threshold = percent;
        self
    }

    pub fn volume_threshold(mut self, requests: usize) -> Self {
        self.config.volume_threshold = requests;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn success_threshold(mut self, successes: usize) -> Self {
        self.config.success_threshold = successes;
        self
    }

    pub fn half_open_request_limit(mut self, probes: usize) -> Self {
        self.config.half_open_request_limit = probes;
        self
    }

    pub fn slow_call_threshold(mut self, latency: Duration) -> Self {
        self.config.slow_call_threshold = latency;
        self
    }

    pub fn slow_call_rate_threshold(mut self, percent: f64) -> Self {
        self.config.slow_call_rate_threshold = percent;
        self
    }

    pub fn build(self) -> Result<CircuitConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Point-in-time view of a circuit's current window.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitStats {
    pub state: CircuitState,
    pub total_requests: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub slow_count: usize,
    /// Failure percentage of the window; 0 when the window is empty.
    pub failure_rate: f64,
    /// Clock reading of the most recent failure, across windows.
    pub last_failure_at_millis: Option<u64>,
    pub last_state_change_at_millis: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Window {
    pub(crate) total_requests: usize,
    pub(crate) success_count: usize,
    pub(crate) failure_count: usize,
    pub(crate) slow_count: usize,
}

impl Window {
    fn percent(part: usize, total: usize) -> f64 {
        if total == 0 {
            0.0
        } else {
            part as f64 / total as f64 * 100.0
        }
    }

    fn failure_rate(&self) -> f64 {
        Self::percent(self.failure_count, self.total_requests)
    }

    fn slow_rate(&self) -> f64 {
        Self::percent(self.slow_count, self.total_requests)
    }
}

/// A state change applied to a circuit, to be published by the registry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Transition {
    pub(crate) old_state: CircuitState,
    pub(crate) new_state: CircuitState,
    pub(crate) at_millis: u64,
    pub(crate) forced: bool,
    /// Counters of the window that just ended.
    pub(crate) window: Window,
}

/// Ticket for one admitted call; outcomes are only counted against its own window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Admission {
    generation: u64,
    probe: bool,
}

/// How an admitted call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Success { slow: bool },
    Failure { slow: bool },
}

#[derive(Debug)]
struct CircuitCore {
    state: CircuitState,
    window: Window,
    probes_admitted: usize,
    generation: u64,
    last_failure_time: Option<u64>,
    last_state_change_time: u64,
    config: CircuitConfig,
}

impl CircuitCore {
    fn transition(&mut self, to: CircuitState, now: u64, forced: bool) -> Option<Transition> {
        let from = self.state;
        let window = self.window;
        self.state = to;
        self.window = Window::default();
        self.probes_admitted = 0;
        self.generation = self.generation.wrapping_add(1);
        self.last_state_change_time = now;
        if from == to {
            return None;
        }
        Some(Transition { old_state: from, new_state: to, at_millis: now, forced, window })
    }

    fn breaches_open_condition(&self) -> bool {
        let window = &self.window;
        let config = &self.config;
        if window.failure_count >= config.failure_threshold {
            return true;
        }
        if window.total_requests < config.volume_threshold {
            return false;
        }
        window.failure_rate() >= config.failure_rate_threshold
            || window.slow_rate() >= config.slow_call_rate_threshold
    }

    fn on_success(&mut self, now: u64) -> Option<Transition> {
        self.window.total_requests += 1;
        self.window.success_count += 1;
        match self.state {
            CircuitState::Closed if self.breaches_open_condition() => {
                self.transition(CircuitState::Open, now, false)
            }
            CircuitState::HalfOpen if self.window.success_count >= self.config.success_threshold => {
                self.transition(CircuitState::Closed, now, false)
            }
            _ => None,
        }
    }

    fn on_failure(&mut self, now: u64) -> Option<Transition> {
        self.window.total_requests += 1;
        self.window.failure_count += 1;
        self.last_failure_time = Some(now);
        match self.state {
            CircuitState::Closed if self.breaches_open_condition() => {
                self.transition(CircuitState::Open, now, false)
            }
            CircuitState::HalfOpen => self.transition(CircuitState::Open, now, false),
            _ => None,
        }
    }

    fn on_slow(&mut self, now: u64) -> Option<Transition> {
        self.window.slow_count += 1;
        match self.state {
            CircuitState::Closed if self.breaches_open_condition() => {
                self.transition(CircuitState::Open, now, false)
            }
            _ => None,
        }
    }
}

/// A named circuit. All state sits behind one lock so counter updates and transitions
/// are applied atomically with respect to each other.
#[derive(Debug)]
pub(crate) struct Circuit {
    name: String,
    core: Mutex<CircuitCore>,
}

impl Circuit {
    pub(crate) fn new(name: impl Into<String>, config: CircuitConfig, now: u64) -> Self {
        Self {
            name: name.into(),
            core: Mutex::new(CircuitCore {
                state: CircuitState::Closed,
                window: Window::default(),
                probes_admitted: 0,
                generation: 0,
                last_failure_time: None,
                last_state_change_time: now,
                config,
            }),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, CircuitCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub(crate) fn config(&self) -> CircuitConfig {
        self.lock().config.clone()
    }

    pub(crate) fn slow_call_threshold(&self) -> Duration {
        self.lock().config.slow_call_threshold
    }

    pub(crate) fn reconfigure(&self, config: CircuitConfig) {
        self.lock().config = config;
    }

    pub(crate) fn stats(&self) -> CircuitStats {
        let core = self.lock();
        let window = core.window;
        CircuitStats {
            state: core.state,
            total_requests: window.total_requests,
            success_count: window.success_count,
            failure_count: window.failure_count,
            slow_count: window.slow_count,
            failure_rate: window.failure_rate(),
            last_failure_at_millis: core.last_failure_time,
            last_state_change_at_millis: core.last_state_change_time,
        }
    }

    /// Decide whether a call may proceed.
    ///
    /// Returns the admission (or the time until a probe will be admitted) together with the
    /// Open → HalfOpen transition when this call is the one that triggered it.
    pub(crate) fn try_acquire(&self, now: u64) -> (Result<Admission, Duration>, Option<Transition>) {
        let mut core = self.lock();
        match core.state {
            CircuitState::Closed => {
                (Ok(Admission { generation: core.generation, probe: false }), None)
            }
            CircuitState::Open => {
                let elapsed = now.saturating_sub(core.last_state_change_time);
                let timeout = millis(core.config.timeout);
                if elapsed < timeout {
                    return (Err(Duration::from_millis(timeout - elapsed)), None);
                }
                let transition = core.transition(CircuitState::HalfOpen, now, false);
                core.probes_admitted = 1;
                (Ok(Admission { generation: core.generation, probe: true }), transition)
            }
            CircuitState::HalfOpen => {
                if core.probes_admitted >= core.config.half_open_request_limit {
                    return (Err(Duration::ZERO), None);
                }
                core.probes_admitted += 1;
                tracing::debug!(
                    target: "breakwater::circuit",
                    circuit = %self.name,
                    admitted = core.probes_admitted,
                    max = core.config.half_open_request_limit,
                    "half-open probe admitted"
                );
                (Ok(Admission { generation: core.generation, probe: true }), None)
            }
        }
    }

    /// Count the outcome of an admitted call. Stale admissions are ignored.
    pub(crate) fn record(&self, now: u64, admission: Admission, outcome: Outcome) -> Option<Transition> {
        let mut core = self.lock();
        if admission.generation != core.generation {
            return None;
        }
        let (transition, slow) = match outcome {
            Outcome::Success { slow } => (core.on_success(now), slow),
            Outcome::Failure { slow } => (core.on_failure(now), slow),
        };
        // A transition starts a new window; the slow mark belonged to the old one.
        if transition.is_some() || !slow {
            return transition;
        }
        core.on_slow(now)
    }

    /// Give back a probe slot for a call that ended without an outcome (dropped or panicked).
    pub(crate) fn release(&self, admission: Admission) {
        let mut core = self.lock();
        if admission.probe && admission.generation == core.generation {
            core.probes_admitted = core.probes_admitted.saturating_sub(1);
        }
    }

    pub(crate) fn force(&self, state: CircuitState, now: u64) -> Option<Transition> {
        self.lock().transition(state, now, true)
    }
}
