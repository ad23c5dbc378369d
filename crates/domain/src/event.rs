//! Change events — the unit delivered to every matched subscription.

use crate::id::StateId;
use crate::state::StateValue;

/// A single state change as seen by subscriptions.
#[derive(Debug, Clone, PartialEq)]
pub struct EventObj {
    pub id: StateId,
    /// The value after the change. Deletions carry the default (null)
    /// value.
    pub new_state: StateValue,
    /// The value before the change; `None` when the id had no prior
    /// value.
    pub old_state: Option<StateValue>,
}

impl EventObj {
    #[must_use]
    pub fn new(id: StateId, new_state: StateValue, old_state: Option<StateValue>) -> Self {
        Self {
            id,
            new_state,
            old_state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_carry_missing_old_state_as_none() {
        let event = EventObj::new("hm.0.light".into(), StateValue::new(true), None);
        assert!(event.old_state.is_none());
        assert_eq!(event.new_state.val, serde_json::json!(true));
    }
}
