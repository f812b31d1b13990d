//! Error types for guarded calls.
//!
//! [`ResilienceError`] is what callers observe from [`CircuitRegistry::execute`]:
//! - `CircuitOpen`: the call was never attempted because the circuit rejected it.
//! - `Timeout`: the call started but did not finish within its time limit.
//! - `Inner`: the call itself failed; the original error is carried unchanged.
//!
//! Retry decisions are driven by [`ErrorClass`], obtained through the [`Classify`] trait.
//!
//! [`CircuitRegistry::execute`]: crate::CircuitRegistry::execute
use std::fmt;
use std::time::Duration;

/// Unified error type for guarded calls.
#[derive(Debug, Clone)]
pub enum ResilienceError<E> {
    /// The circuit is open (or its half-open probe slots are taken); nothing was attempted.
    CircuitOpen {
        /// Name of the rejecting circuit.
        circuit: String,
        /// Time until the circuit will admit a probe; zero when probes are merely saturated.
        retry_after: Duration,
    },
    /// The call exceeded its time limit.
    Timeout {
        /// Name of the circuit the call went through.
        circuit: String,
        /// The limit that was exceeded.
        timeout: Duration,
    },
    /// The underlying operation failed.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for ResilienceError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CircuitOpen { circuit, retry_after } => {
                write!(f, "dependency '{}' unavailable: circuit open (retry after {:?})", circuit, retry_after)
            }
            Self::Timeout { circuit, timeout } => {
                write!(f, "call through circuit '{}' timed out after {:?}", circuit, timeout)
            }
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for ResilienceError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}

impl<E> ResilienceError<E> {
    /// Check if this error is a circuit-open rejection.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Alias used by the HTTP layer: rejected calls map to "service unavailable".
    pub fn is_dependency_unavailable(&self) -> bool {
        self.is_circuit_open()
    }

    /// Check if this error is due to timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Check if this error wraps an inner error.
    pub fn is_inner(&self) -> bool {
        matches!(self, Self::Inner(_))
    }

    /// Name of the circuit involved, unless this is an inner error.
    pub fn circuit(&self) -> Option<&str> {
        match self {
            Self::CircuitOpen { circuit, .. } | Self::Timeout { circuit, .. } => Some(circuit),
            Self::Inner(_) => None,
        }
    }

    /// Get the inner error if this is an Inner variant
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Borrow the inner error if present.
    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Transform the inner error, keeping rejection and timeout variants as they are.
    pub fn map_inner<F, T>(self, f: F) -> ResilienceError<T>
    where
        F: FnOnce(E) -> T,
    {
        match self {
            Self::CircuitOpen { circuit, retry_after } => {
                ResilienceError::CircuitOpen { circuit, retry_after }
            }
            Self::Timeout { circuit, timeout } => ResilienceError::Timeout { circuit, timeout },
            Self::Inner(e) => ResilienceError::Inner(f(e)),
        }
    }
}

/// Whether a failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network errors and 5xx-equivalents; retrying may succeed.
    Transient,
    /// Validation errors and 4xx-equivalents; retrying repeats the same answer.
    Permanent,
}

/// Classification hook consulted by [`RetryPolicyBuilder::retry_transient`].
///
/// The default implementation treats everything as transient.
///
/// [`RetryPolicyBuilder::retry_transient`]: crate::RetryPolicyBuilder::retry_transient
pub trait Classify {
    fn classify(&self) -> ErrorClass {
        ErrorClass::Transient
    }
}

impl Classify for std::io::Error {}

impl<E: Classify> Classify for ResilienceError<E> {
    fn classify(&self) -> ErrorClass {
        match self {
            // Retrying into an open circuit only burns attempts.
            Self::CircuitOpen { .. } => ErrorClass::Permanent,
            Self::Timeout { .. } => ErrorClass::Transient,
            Self::Inner(e) => e.classify(),
        }
    }
}

/// Error carrying an HTTP-style status code; 4xx is permanent, everything else transient.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("status {status}: {message}")]
pub struct StatusError {
    pub status: u16,
    pub message: String,
}

impl StatusError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self { status, message: message.into() }
    }
}

impl Classify for StatusError {
    fn classify(&self) -> ErrorClass {
        if (400..500).contains(&self.status) {
            ErrorClass::Permanent
        } else {
            ErrorClass::Transient
        }
    }
}
