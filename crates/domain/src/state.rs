//! State values — the timestamped payloads of the shared data space.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::time::{self, Timestamp};

/// One live value of a state id.
///
/// Produced by the store; the engine never mutates a value in place —
/// every write replaces it wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateValue {
    /// Payload.
    pub val: Value,
    /// Write time.
    pub ts: Timestamp,
    /// Acknowledged by the controlling device (as opposed to a command
    /// that has not been confirmed yet).
    #[serde(default)]
    pub ack: bool,
    /// Last time `val` actually changed, as opposed to being rewritten
    /// with the same payload.
    pub lc: Timestamp,
    /// Origin component that produced the write.
    #[serde(default)]
    pub from: String,
}

impl StateValue {
    /// New unacknowledged value stamped with the current time.
    #[must_use]
    pub fn new(val: impl Into<Value>) -> Self {
        let now = time::now();
        Self {
            val: val.into(),
            ts: now,
            ack: false,
            lc: now,
            from: String::new(),
        }
    }

    #[must_use]
    pub fn with_ack(mut self, ack: bool) -> Self {
        self.ack = ack;
        self
    }

    #[must_use]
    pub fn with_origin(mut self, from: impl Into<String>) -> Self {
        self.from = from.into();
        self
    }
}

impl Default for StateValue {
    /// The empty value carried by deletion events: null payload, epoch
    /// timestamps.
    fn default() -> Self {
        Self {
            val: Value::Null,
            ts: time::epoch(),
            ack: false,
            lc: time::epoch(),
            from: String::new(),
        }
    }
}
