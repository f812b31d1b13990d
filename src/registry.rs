//! Registry owning every named circuit.
//!
//! One registry is built at process start and shared (`Arc<CircuitRegistry>`) with every
//! consumer; tests build their own. Circuits are created lazily on first use or explicitly
//! with [`CircuitRegistry::register_circuit`], and live until
//! [`CircuitRegistry::unregister_circuit`].

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::adaptive::DynamicConfig;
use crate::circuit::{Circuit, CircuitConfig, CircuitState, CircuitStats, Transition};
use crate::clock::{Clock, TokioClock};
use crate::events::{EventChannel, StateChange, StateChangeReceiver, DEFAULT_EVENT_CAPACITY};
use tracing::{debug, error, info, warn};

/// Errors from registry operations that target a specific circuit.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// The requested circuit was never registered or used.
    #[error("circuit '{name}' not found")]
    NotFound {
        /// Name that could not be located.
        name: String,
    },
}

/// Owner of all circuits plus the state-change channel.
#[derive(Debug)]
pub struct CircuitRegistry {
    circuits: RwLock<HashMap<String, Arc<Circuit>>>,
    default_config: DynamicConfig<CircuitConfig>,
    pub(crate) clock: Arc<dyn Clock>,
    events: EventChannel,
}

impl Default for CircuitRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitRegistry {
    /// Registry on tokio time with default circuit settings.
    pub fn new() -> Self {
        Self::with_shared_clock(Arc::new(TokioClock::default()))
    }

    /// Registry reading time from `clock` (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(clock: C) -> Self {
        Self::with_shared_clock(Arc::new(clock))
    }

    pub fn with_shared_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            circuits: RwLock::new(HashMap::new()),
            default_config: DynamicConfig::new(CircuitConfig::default()),
            clock,
            events: EventChannel::new(DEFAULT_EVENT_CAPACITY),
        }
    }

    /// Config applied to circuits created without an explicit one.
    pub fn with_default_config(self, config: CircuitConfig) -> Self {
        self.default_config.set(config);
        self
    }

    /// Per-subscriber buffer of the state-change channel.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.events = EventChannel::new(capacity);
        self
    }

    /// The clock shared by every circuit in this registry.
    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    /// Snapshot of the current default config.
    pub fn default_config(&self) -> Arc<CircuitConfig> {
        self.default_config.get()
    }

    /// Change the default for circuits created from now on; existing circuits keep theirs.
    pub fn set_default_config(&self, config: CircuitConfig) {
        self.default_config.set(config);
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<Circuit>>> {
        self.circuits.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<Circuit>>> {
        self.circuits.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a circuit, replacing any existing one with the same name.
    ///
    /// The last registration wins and starts from a fresh Closed window.
    pub fn register_circuit(&self, name: impl Into<String>, config: Option<CircuitConfig>) {
        let name = name.into();
        let config = config.unwrap_or_else(|| (*self.default_config.get()).clone());
        let circuit = Arc::new(Circuit::new(name.clone(), config, self.clock.now_millis()));
        let mut map = self.write();
        if map.insert(name.clone(), circuit).is_some() {
            warn!(target: "breakwater::registry", circuit = %name, "circuit replaced; last registration wins");
        } else {
            debug!(target: "breakwater::registry", circuit = %name, "circuit registered");
        }
    }

    /// Drop a circuit and its state. Returns whether it existed.
    pub fn unregister_circuit(&self, name: &str) -> bool {
        self.write().remove(name).is_some()
    }

    /// Whether a circuit with this name exists.
    pub fn contains(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub(crate) fn get(&self, name: &str) -> Option<Arc<Circuit>> {
        self.read().get(name).cloned()
    }

    /// Resolve a circuit, creating it with the default config on first use.
    pub(crate) fn resolve(&self, name: &str) -> Arc<Circuit> {
        if let Some(circuit) = self.get(name) {
            return circuit;
        }
        let mut map = self.write();
        map.entry(name.to_owned())
            .or_insert_with(|| {
                debug!(target: "breakwater::registry", circuit = %name, "circuit created on first use");
                let config = (*self.default_config.get()).clone();
                Arc::new(Circuit::new(name, config, self.clock.now_millis()))
            })
            .clone()
    }

    fn require(&self, name: &str) -> Result<Arc<Circuit>, RegistryError> {
        self.get(name).ok_or_else(|| RegistryError::NotFound { name: name.to_owned() })
    }

    /// Current state; names never seen report Closed.
    pub fn circuit_state(&self, name: &str) -> CircuitState {
        self.get(name).map(|c| c.state()).unwrap_or(CircuitState::Closed)
    }

    pub fn is_open(&self, name: &str) -> bool {
        self.circuit_state(name) == CircuitState::Open
    }

    pub fn is_closed(&self, name: &str) -> bool {
        self.circuit_state(name) == CircuitState::Closed
    }

    pub fn is_half_open(&self, name: &str) -> bool {
        self.circuit_state(name) == CircuitState::HalfOpen
    }

    /// Counters of the circuit's current window, if it exists.
    pub fn circuit_stats(&self, name: &str) -> Option<CircuitStats> {
        self.get(name).map(|c| c.stats())
    }

    /// Stats for every circuit, keyed by name.
    pub fn all_circuit_stats(&self) -> BTreeMap<String, CircuitStats> {
        let circuits: Vec<Arc<Circuit>> = self.read().values().cloned().collect();
        circuits.into_iter().map(|c| (c.name().to_owned(), c.stats())).collect()
    }

    /// Config of a circuit, if it exists.
    pub fn circuit_config(&self, name: &str) -> Option<CircuitConfig> {
        self.get(name).map(|c| c.config())
    }

    /// Swap a circuit's config in place, keeping its state and counters.
    pub fn reconfigure(&self, name: &str, config: CircuitConfig) -> Result<(), RegistryError> {
        self.require(name)?.reconfigure(config);
        Ok(())
    }

    /// Open the circuit now; its timeout window starts from this moment.
    pub fn force_open(&self, name: &str) -> Result<(), RegistryError> {
        self.force(name, CircuitState::Open)
    }

    /// Close the circuit now with a fresh window.
    pub fn force_close(&self, name: &str) -> Result<(), RegistryError> {
        self.force(name, CircuitState::Closed)
    }

    /// Clear counters and force Closed.
    pub fn reset_circuit(&self, name: &str) -> Result<(), RegistryError> {
        self.force(name, CircuitState::Closed)
    }

    /// Reset every circuit.
    pub fn reset_all_circuits(&self) {
        let circuits: Vec<Arc<Circuit>> = self.read().values().cloned().collect();
        let now = self.clock.now_millis();
        for circuit in circuits {
            if let Some(transition) = circuit.force(CircuitState::Closed, now) {
                self.publish(&circuit, transition);
            }
        }
    }

    fn force(&self, name: &str, state: CircuitState) -> Result<(), RegistryError> {
        let circuit = self.require(name)?;
        if let Some(transition) = circuit.force(state, self.clock.now_millis()) {
            self.publish(&circuit, transition);
        }
        Ok(())
    }

    /// Subscribe to state changes of every circuit in this registry.
    pub fn subscribe(&self) -> StateChangeReceiver {
        self.events.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.events.subscriber_count()
    }

    pub(crate) fn publish(&self, circuit: &Circuit, transition: Transition) {
        let name = circuit.name();
        let window = transition.window;
        match (transition.old_state, transition.new_state) {
            _ if transition.forced => {
                info!(target: "breakwater::registry", circuit = %name, from = %transition.old_state, to = %transition.new_state, "circuit state forced");
            }
            (CircuitState::Closed, CircuitState::Open) => {
                error!(
                    target: "breakwater::registry",
                    circuit = %name,
                    failures = window.failure_count,
                    slow = window.slow_count,
                    total = window.total_requests,
                    "circuit → open"
                );
            }
            (CircuitState::HalfOpen, CircuitState::Open) => {
                warn!(target: "breakwater::registry", circuit = %name, "probe failed; circuit → open");
            }
            (_, CircuitState::HalfOpen) => {
                info!(target: "breakwater::registry", circuit = %name, "circuit → half-open");
            }
            _ => {
                info!(target: "breakwater::registry", circuit = %name, "circuit → closed");
            }
        }
        self.events.publish(StateChange::from_transition(name, &transition));
    }
}
