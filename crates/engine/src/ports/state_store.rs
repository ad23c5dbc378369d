//! State store port — the external object/state database.

use std::future::Future;
use std::sync::Arc;

use rulehub_domain::error::RuleHubError;
use rulehub_domain::id::StateId;
use rulehub_domain::object::ObjectMeta;
use rulehub_domain::state::StateValue;

/// One unit of the change-notification stream.
///
/// `None` payloads signal deletion.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    State(StateId, Option<StateValue>),
    Object(StateId, Option<ObjectMeta>),
}

/// The backing object/state store.
///
/// Implementations must deliver every accepted write back through
/// their change-notification stream; the engine updates its caches
/// from that stream, not from its own writes.
pub trait StateStore: Send + Sync + 'static {
    /// Read one state.
    fn get_state(
        &self,
        id: &StateId,
    ) -> impl Future<Output = Result<Option<StateValue>, RuleHubError>> + Send;

    /// Read every state matching an id pattern (`*` wildcards).
    fn get_states(
        &self,
        pattern: &str,
    ) -> impl Future<Output = Result<Vec<(StateId, StateValue)>, RuleHubError>> + Send;

    /// Write one state.
    fn set_state(
        &self,
        id: &StateId,
        state: StateValue,
    ) -> impl Future<Output = Result<(), RuleHubError>> + Send;

    /// Snapshot of the full object graph, used at bootstrap.
    fn get_objects(&self) -> impl Future<Output = Result<Vec<ObjectMeta>, RuleHubError>> + Send;

    /// Ask the store to start delivering changes for an id pattern.
    fn subscribe_states(
        &self,
        pattern: &str,
    ) -> impl Future<Output = Result<(), RuleHubError>> + Send;

    /// Release a pattern subscription.
    fn unsubscribe_states(
        &self,
        pattern: &str,
    ) -> impl Future<Output = Result<(), RuleHubError>> + Send;

    /// Ask a subscribable component instance to forward changes for a
    /// pattern it owns.
    fn request_instance_subscribe(
        &self,
        instance: &str,
        pattern: &str,
    ) -> impl Future<Output = Result<(), RuleHubError>> + Send;
}

impl<T: StateStore> StateStore for Arc<T> {
    fn get_state(
        &self,
        id: &StateId,
    ) -> impl Future<Output = Result<Option<StateValue>, RuleHubError>> + Send {
        (**self).get_state(id)
    }

    fn get_states(
        &self,
        pattern: &str,
    ) -> impl Future<Output = Result<Vec<(StateId, StateValue)>, RuleHubError>> + Send {
        (**self).get_states(pattern)
    }

    fn set_state(
        &self,
        id: &StateId,
        state: StateValue,
    ) -> impl Future<Output = Result<(), RuleHubError>> + Send {
        (**self).set_state(id, state)
    }

    fn get_objects(&self) -> impl Future<Output = Result<Vec<ObjectMeta>, RuleHubError>> + Send {
        (**self).get_objects()
    }

    fn subscribe_states(
        &self,
        pattern: &str,
    ) -> impl Future<Output = Result<(), RuleHubError>> + Send {
        (**self).subscribe_states(pattern)
    }

    fn unsubscribe_states(
        &self,
        pattern: &str,
    ) -> impl Future<Output = Result<(), RuleHubError>> + Send {
        (**self).unsubscribe_states(pattern)
    }

    fn request_instance_subscribe(
        &self,
        instance: &str,
        pattern: &str,
    ) -> impl Future<Output = Result<(), RuleHubError>> + Send {
        (**self).request_instance_subscribe(instance, pattern)
    }
}
