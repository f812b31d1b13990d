//! Decision-caching client.
//!
//! [`DecisionClient`] answers "evaluate `operation` for `input`" questions against a remote
//! [`DecisionSource`] (a policy engine, a pricing service, ...) by composing the pieces of
//! this crate in a fixed order:
//!
//! ```text
//! cache.get(key) ── hit ──▶ return
//!      │ miss
//!      ▼
//! single-flight gate for key ─▶ cache.get(key) again ── hit ──▶ return
//!      │ still a miss
//!      ▼
//! retry.execute(|| registry.execute(circuit, || source.evaluate(..)))
//!      │ Ok
//!      ▼
//! cache.set(key, value, ttl) ─▶ return
//! ```
//!
//! At most one attempt sequence per key is in flight at a time: concurrent callers for the
//! same key wait for the leader and then find its result in the cache. Errors of any kind
//! (rejections, timeouts, failures) are never cached.

use crate::cache::{cache_key, ResultCache};
use crate::circuit::CircuitState;
use crate::error::{Classify, ResilienceError};
use crate::executor::ExecuteOptions;
use crate::registry::CircuitRegistry;
use crate::retry::{BuildError, RetryPolicy};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tracing::{debug, warn};

/// Default lifetime of a cached decision.
pub const DEFAULT_DECISION_TTL: Duration = Duration::from_secs(60);

/// Remote decision endpoint guarded by a [`DecisionClient`].
#[async_trait]
pub trait DecisionSource: Send + Sync + 'static {
    type Input: Serialize + Send + Sync;
    type Output: Clone + Send + Sync + 'static;
    type Error: std::error::Error + Classify + Send + Sync + 'static;

    /// One network attempt. Retrying, timeouts and caching are layered on by the client.
    async fn evaluate(&self, operation: &str, input: &Self::Input) -> Result<Self::Output, Self::Error>;
}

/// Per-call knobs for [`DecisionClient::evaluate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluateOptions {
    /// Look up and store the result in the cache.
    pub use_cache: bool,
    /// Cache under this key instead of one derived from the operation and input.
    pub cache_key: Option<String>,
    /// Lifetime of the stored result; the client default when unset.
    pub ttl: Option<Duration>,
}

impl Default for EvaluateOptions {
    fn default() -> Self {
        Self { use_cache: true, cache_key: None, ttl: None }
    }
}

impl EvaluateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Skip both the lookup and the write.
    pub fn uncached() -> Self {
        Self { use_cache: false, ..Self::default() }
    }

    pub fn with_cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

type Gate = tokio::sync::Mutex<()>;

/// Cache-fronted, circuit-protected, retrying client for a [`DecisionSource`].
pub struct DecisionClient<S: DecisionSource> {
    source: S,
    registry: Arc<CircuitRegistry>,
    circuit: String,
    timeout: Option<Duration>,
    ttl: Duration,
    retry: RetryPolicy<S::Error>,
    cache: ResultCache<S::Output>,
    in_flight: Mutex<HashMap<String, Weak<Gate>>>,
}

impl<S: DecisionSource> std::fmt::Debug for DecisionClient<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecisionClient")
            .field("circuit", &self.circuit)
            .field("timeout", &self.timeout)
            .field("ttl", &self.ttl)
            .field("retry", &self.retry)
            .field("cached", &self.cache.len())
            .finish()
    }
}

impl<S: DecisionSource> DecisionClient<S> {
    /// Start building a client that calls `source` through the circuit `circuit` of
    /// `registry`.
    pub fn builder(
        circuit: impl Into<String>,
        source: S,
        registry: Arc<CircuitRegistry>,
    ) -> DecisionClientBuilder<S> {
        DecisionClientBuilder {
            source,
            registry,
            circuit: circuit.into(),
            timeout: None,
            ttl: DEFAULT_DECISION_TTL,
            retry: None,
        }
    }

    /// Evaluate `operation` for `input`, serving from cache when possible.
    ///
    /// # Errors
    /// The error left by the final attempt: [`ResilienceError::CircuitOpen`],
    /// [`ResilienceError::Timeout`] or the source's own error. None of them is cached.
    pub async fn evaluate(
        &self,
        operation: &str,
        input: &S::Input,
        options: EvaluateOptions,
    ) -> Result<S::Output, ResilienceError<S::Error>> {
        let Some(key) = self.key_for(operation, input, &options) else {
            return self.call(operation, input).await;
        };
        if let Some(hit) = self.cache.get(&key) {
            debug!(target: "breakwater::decision", operation, key = %key, "cache hit");
            return Ok(hit);
        }

        let gate = self.gate(&key);
        let _leader = gate.lock().await;
        if let Some(hit) = self.cache.get(&key) {
            debug!(target: "breakwater::decision", operation, key = %key, "filled while waiting");
            return Ok(hit);
        }

        let value = self.call(operation, input).await?;
        self.cache.set(key, value.clone(), options.ttl.unwrap_or(self.ttl));
        Ok(value)
    }

    /// Drop cached decisions whose key starts with `prefix`.
    pub fn invalidate(&self, prefix: &str) -> usize {
        self.cache.invalidate(prefix)
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.len()
    }

    /// State of the circuit guarding the source.
    pub fn circuit_state(&self) -> CircuitState {
        self.registry.circuit_state(&self.circuit)
    }

    pub fn circuit_name(&self) -> &str {
        &self.circuit
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    fn key_for(&self, operation: &str, input: &S::Input, options: &EvaluateOptions) -> Option<String> {
        if !options.use_cache {
            return None;
        }
        if let Some(key) = &options.cache_key {
            return Some(key.clone());
        }
        match cache_key(operation, input) {
            Ok(key) => Some(key),
            Err(error) => {
                warn!(target: "breakwater::decision", operation, %error, "input not hashable, calling uncached");
                None
            }
        }
    }

    async fn call(&self, operation: &str, input: &S::Input) -> Result<S::Output, ResilienceError<S::Error>> {
        let source = &self.source;
        let options = ExecuteOptions::new().with_optional_timeout(self.timeout);
        self.registry
            .execute_with_retry(&self.circuit, move || source.evaluate(operation, input), options, &self.retry)
            .await
    }

    fn gate(&self, key: &str) -> Arc<Gate> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(gate) = in_flight.get(key).and_then(Weak::upgrade) {
            return gate;
        }
        in_flight.retain(|_, gate| gate.strong_count() > 0);
        let gate = Arc::new(Gate::new(()));
        in_flight.insert(key.to_owned(), Arc::downgrade(&gate));
        gate
    }
}

/// Builder for [`DecisionClient`].
pub struct DecisionClientBuilder<S: DecisionSource> {
    source: S,
    registry: Arc<CircuitRegistry>,
    circuit: String,
    timeout: Option<Duration>,
    ttl: Duration,
    retry: Option<RetryPolicy<S::Error>>,
}

impl<S: DecisionSource> DecisionClientBuilder<S> {
    /// Per-attempt timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Default lifetime of cached decisions.
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Retry policy; defaults to three attempts retrying transient errors on the registry's
    /// clock.
    pub fn retry(mut self, retry: RetryPolicy<S::Error>) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn build(self) -> Result<DecisionClient<S>, BuildError> {
        let clock = self.registry.clock();
        let retry = match self.retry {
            Some(retry) => retry,
            None => RetryPolicy::builder().retry_transient().with_shared_clock(clock.clone()).build()?,
        };
        if !self.registry.contains(&self.circuit) {
            self.registry.register_circuit(self.circuit.clone(), None);
        }
        Ok(DecisionClient {
            source: self.source,
            registry: self.registry,
            circuit: self.circuit,
            timeout: self.timeout,
            ttl: self.ttl,
            retry,
            cache: ResultCache::with_shared_clock(clock),
            in_flight: Mutex::new(HashMap::new()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::StatusError;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct Echo {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DecisionSource for Echo {
        type Input = Value;
        type Output = String;
        type Error = StatusError;

        async fn evaluate(&self, operation: &str, input: &Value) -> Result<String, StatusError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("{operation}={input}"))
        }
    }

    fn client() -> (DecisionClient<Echo>, ManualClock) {
        let clock = ManualClock::new();
        let registry = Arc::new(CircuitRegistry::with_clock(clock.clone()));
        let client = DecisionClient::builder("opa", Echo::default(), registry)
            .cache_ttl(Duration::from_secs(10))
            .build()
            .unwrap();
        (client, clock)
    }

    #[tokio::test]
    async fn explicit_key_overrides_input_hash() {
        let (client, _) = client();
        let first = client
            .evaluate("allow", &json!({"user": "ana"}), EvaluateOptions::new().with_cache_key("tenant-1"))
            .await
            .unwrap();
        let second = client
            .evaluate("allow", &json!({"user": "bo"}), EvaluateOptions::new().with_cache_key("tenant-1"))
            .await
            .unwrap();
        assert_eq!(first, second, "same key, same cached answer");
        assert_eq!(client.source().calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn per_call_ttl_overrides_default() {
        let (client, clock) = client();
        let input = json!({"user": "ana"});
        client.evaluate("allow", &input, EvaluateOptions::new().with_ttl(Duration::from_secs(1))).await.unwrap();
        clock.advance(Duration::from_secs(1));
        client.evaluate("allow", &input, EvaluateOptions::new()).await.unwrap();
        assert_eq!(client.source().calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn build_keeps_an_existing_circuit() {
        let registry = Arc::new(CircuitRegistry::new());
        registry.register_circuit("opa", None);
        registry.force_open("opa").unwrap();
        let client = DecisionClient::builder("opa", Echo::default(), registry).build().unwrap();
        assert_eq!(client.circuit_state(), CircuitState::Open);
    }

    #[test]
    fn build_registers_the_circuit() {
        let registry = Arc::new(CircuitRegistry::new());
        let client = DecisionClient::builder("pricing", Echo::default(), registry.clone()).build().unwrap();
        assert!(registry.contains("pricing"));
        assert_eq!(client.circuit_state(), CircuitState::Closed);
    }

    #[test]
    fn gates_are_shared_while_held_and_pruned_after() {
        let (client, _) = client();
        let a = client.gate("k");
        let b = client.gate("k");
        assert!(Arc::ptr_eq(&a, &b));
        drop((a, b));
        let _other = client.gate("other");
        assert_eq!(client.in_flight.lock().unwrap().len(), 1);
    }
}
