//! Tower integration: guard any `Service` with a named circuit.
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use breakwater::{CircuitBreakerLayer, CircuitRegistry};
//! use tower::{service_fn, Layer};
//!
//! let registry = Arc::new(CircuitRegistry::new());
//! let layer = CircuitBreakerLayer::new(registry, "inventory").with_timeout(Duration::from_secs(2));
//! let _svc = layer.layer(service_fn(|sku: u32| async move { Ok::<_, std::io::Error>(sku) }));
//! ```

use crate::error::ResilienceError;
use crate::executor::ExecuteOptions;
use crate::registry::CircuitRegistry;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tower_layer::Layer;
use tower_service::Service;

/// Layer that routes each call through [`CircuitRegistry::execute`].
#[derive(Clone, Debug)]
pub struct CircuitBreakerLayer {
    registry: Arc<CircuitRegistry>,
    circuit: Arc<str>,
    timeout: Option<Duration>,
}

impl CircuitBreakerLayer {
    pub fn new(registry: Arc<CircuitRegistry>, circuit: impl Into<String>) -> Self {
        let circuit: String = circuit.into();
        Self { registry, circuit: circuit.into(), timeout: None }
    }

    /// Per-call timeout, counted as a failure on the circuit.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl<S> Layer<S> for CircuitBreakerLayer {
    type Service = CircuitBreakerService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CircuitBreakerService {
            inner,
            registry: self.registry.clone(),
            circuit: self.circuit.clone(),
            timeout: self.timeout,
        }
    }
}

/// Service produced by [`CircuitBreakerLayer`].
#[derive(Clone, Debug)]
pub struct CircuitBreakerService<S> {
    inner: S,
    registry: Arc<CircuitRegistry>,
    circuit: Arc<str>,
    timeout: Option<Duration>,
}

impl<S, Req> Service<Req> for CircuitBreakerService<S>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
    S::Error: Send + 'static,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = ResilienceError<S::Error>;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(ResilienceError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        // The driven-ready instance handles this request; a fresh clone stays behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let registry = self.registry.clone();
        let circuit = self.circuit.clone();
        let options = ExecuteOptions::new().with_optional_timeout(self.timeout);

        Box::pin(async move { registry.execute(&circuit, move || inner.call(req), options).await })
    }
}
