//! State-change events published by the registry.
//!
//! Every transition, including forced ones, is broadcast as a [`StateChange`] on the
//! registry's channel. Subscribers are independent: each gets its own
//! [`broadcast::Receiver`] and stops receiving as soon as it is dropped. A slow subscriber
//! that falls more than the channel capacity behind observes `RecvError::Lagged`; publishing
//! never blocks the guarded call path.

use crate::circuit::{CircuitState, Transition};
use serde::Serialize;
use std::fmt;
use tokio::sync::broadcast;

/// Default number of events buffered per subscriber.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// A circuit moved from one state to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateChange {
    /// Name of the circuit (the protected dependency).
    pub service_name: String,
    pub old_state: CircuitState,
    pub new_state: CircuitState,
    /// Clock reading at the transition, in milliseconds.
    pub at_millis: u64,
    /// True for operator overrides (`force_open`, `force_close`, resets).
    pub forced: bool,
}

impl StateChange {
    pub(crate) fn from_transition(service_name: &str, transition: &Transition) -> Self {
        Self {
            service_name: service_name.to_owned(),
            old_state: transition.old_state,
            new_state: transition.new_state,
            at_millis: transition.at_millis,
            forced: transition.forced,
        }
    }

    /// JSON form for audit and metrics collaborators.
    pub fn to_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }
}

impl fmt::Display for StateChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} → {}", self.service_name, self.old_state, self.new_state)?;
        if self.forced {
            f.write_str(" (forced)")?;
        }
        Ok(())
    }
}

/// Receiving half handed out by [`CircuitRegistry::subscribe`](crate::CircuitRegistry::subscribe).
pub type StateChangeReceiver = broadcast::Receiver<StateChange>;

/// Publishing half owned by the registry.
#[derive(Debug, Clone)]
pub(crate) struct EventChannel {
    sender: broadcast::Sender<StateChange>,
}

impl EventChannel {
    pub(crate) fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub(crate) fn subscribe(&self) -> StateChangeReceiver {
        self.sender.subscribe()
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub(crate) fn publish(&self, event: StateChange) {
        // No subscribers is not an error; events are fire-and-forget.
        let _ = self.sender.send(event);
    }
}
