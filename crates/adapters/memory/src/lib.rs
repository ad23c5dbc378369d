//! # rulehub-adapter-memory
//!
//! In-memory implementation of the [`StateStore`] port, backed by a
//! tokio [`broadcast`] channel for change notification.
//!
//! Every accepted write is stamped (`ts` always, `lc` only when the
//! value actually changed) and delivered back through the change
//! stream — the engine updates its caches from that stream, never from
//! its own writes.
//!
//! ## Dependency rule
//!
//! Depends on `rulehub-engine` (port traits) and `rulehub-domain` only.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;
use tracing::debug;

use rulehub_domain::error::RuleHubError;
use rulehub_domain::id::StateId;
use rulehub_domain::object::ObjectMeta;
use rulehub_domain::state::StateValue;
use rulehub_domain::time;
use rulehub_domain::wildcard;
use rulehub_engine::ports::{StateStore, StoreEvent};

#[derive(Default)]
struct Inner {
    states: HashMap<StateId, StateValue>,
    objects: BTreeMap<StateId, ObjectMeta>,
    subscriptions: Vec<String>,
    instance_requests: Vec<(String, String)>,
}

/// In-memory object/state store.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    events: broadcast::Sender<StoreEvent>,
}

fn lock(mutex: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryStore {
    /// Create a store whose change stream buffers `capacity` events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        Self {
            inner: Mutex::new(Inner::default()),
            events,
        }
    }

    /// Subscribe to the change stream. Receivers only see events
    /// published after the subscription.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    /// Create or replace an object and notify the stream.
    pub fn put_object(&self, meta: ObjectMeta) {
        let id = meta.id.clone();
        lock(&self.inner).objects.insert(id.clone(), meta.clone());
        let _ = self.events.send(StoreEvent::Object(id, Some(meta)));
    }

    /// Remove an object and notify the stream.
    pub fn remove_object(&self, id: &StateId) {
        let removed = lock(&self.inner).objects.remove(id).is_some();
        if removed {
            let _ = self.events.send(StoreEvent::Object(id.clone(), None));
        }
    }

    /// Delete a state and notify the stream.
    pub fn remove_state(&self, id: &StateId) {
        let removed = lock(&self.inner).states.remove(id).is_some();
        if removed {
            let _ = self.events.send(StoreEvent::State(id.clone(), None));
        }
    }

    /// Patterns the engine currently subscribes to (introspection).
    #[must_use]
    pub fn subscriptions(&self) -> Vec<String> {
        lock(&self.inner).subscriptions.clone()
    }

    /// Forwarded instance-subscribe requests (introspection).
    #[must_use]
    pub fn instance_requests(&self) -> Vec<(String, String)> {
        lock(&self.inner).instance_requests.clone()
    }
}

impl StateStore for MemoryStore {
    fn get_state(
        &self,
        id: &StateId,
    ) -> impl Future<Output = Result<Option<StateValue>, RuleHubError>> + Send {
        let hit = lock(&self.inner).states.get(id).cloned();
        async move { Ok(hit) }
    }

    fn get_states(
        &self,
        pattern: &str,
    ) -> impl Future<Output = Result<Vec<(StateId, StateValue)>, RuleHubError>> + Send {
        let matcher = wildcard::compile(pattern).ok();
        let snapshot: Vec<(StateId, StateValue)> = lock(&self.inner)
            .states
            .iter()
            .filter(|(id, _)| {
                matcher
                    .as_ref()
                    .is_none_or(|re| re.is_match(id.as_str()))
            })
            .map(|(id, state)| (id.clone(), state.clone()))
            .collect();
        async move { Ok(snapshot) }
    }

    fn set_state(
        &self,
        id: &StateId,
        state: StateValue,
    ) -> impl Future<Output = Result<(), RuleHubError>> + Send {
        let stamped = {
            let mut inner = lock(&self.inner);
            let now = time::now();
            let mut stamped = state;
            stamped.ts = now;
            // `lc` moves only when the payload really changed.
            stamped.lc = match inner.states.get(id) {
                Some(previous) if previous.val == stamped.val => previous.lc,
                _ => now,
            };
            inner.states.insert(id.clone(), stamped.clone());
            stamped
        };
        let _ = self
            .events
            .send(StoreEvent::State(id.clone(), Some(stamped)));
        async { Ok(()) }
    }

    fn get_objects(&self) -> impl Future<Output = Result<Vec<ObjectMeta>, RuleHubError>> + Send {
        let snapshot: Vec<ObjectMeta> = lock(&self.inner).objects.values().cloned().collect();
        async move { Ok(snapshot) }
    }

    fn subscribe_states(
        &self,
        pattern: &str,
    ) -> impl Future<Output = Result<(), RuleHubError>> + Send {
        // The broadcast channel already carries everything; only the
        // bookkeeping is per pattern.
        lock(&self.inner).subscriptions.push(pattern.to_string());
        async { Ok(()) }
    }

    fn unsubscribe_states(
        &self,
        pattern: &str,
    ) -> impl Future<Output = Result<(), RuleHubError>> + Send {
        let mut inner = lock(&self.inner);
        if let Some(pos) = inner.subscriptions.iter().position(|p| p == pattern) {
            inner.subscriptions.remove(pos);
        }
        async { Ok(()) }
    }

    fn request_instance_subscribe(
        &self,
        instance: &str,
        pattern: &str,
    ) -> impl Future<Output = Result<(), RuleHubError>> + Send {
        debug!(instance, pattern, "instance subscribe requested");
        lock(&self.inner)
            .instance_requests
            .push((instance.to_string(), pattern.to_string()));
        async { Ok(()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn should_deliver_writes_to_subscribers() {
        let store = MemoryStore::new(16);
        let mut rx = store.subscribe();

        store
            .set_state(&"hm.0.light".into(), StateValue::new(true))
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            StoreEvent::State(id, Some(state)) => {
                assert_eq!(id.as_str(), "hm.0.light");
                assert_eq!(state.val, json!(true));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn should_keep_lc_when_value_is_rewritten_unchanged() {
        let store = MemoryStore::new(16);
        let id: StateId = "hm.0.temp".into();

        store.set_state(&id, StateValue::new(21)).await.unwrap();
        let first = store.get_state(&id).await.unwrap().unwrap();

        store.set_state(&id, StateValue::new(21)).await.unwrap();
        let second = store.get_state(&id).await.unwrap().unwrap();
        assert_eq!(second.lc, first.lc);
        assert!(second.ts >= first.ts);

        store.set_state(&id, StateValue::new(22)).await.unwrap();
        let third = store.get_state(&id).await.unwrap().unwrap();
        assert!(third.lc > first.lc);
    }

    #[tokio::test]
    async fn should_filter_states_by_wildcard_pattern() {
        let store = MemoryStore::new(16);
        store
            .set_state(&"hm.0.a.STATE".into(), StateValue::new(1))
            .await
            .unwrap();
        store
            .set_state(&"hm.0.b.LEVEL".into(), StateValue::new(2))
            .await
            .unwrap();
        store
            .set_state(&"hue.0.c.STATE".into(), StateValue::new(3))
            .await
            .unwrap();

        let hits = store.get_states("hm.0.*").await.unwrap();
        assert_eq!(hits.len(), 2);
        let all = store.get_states("*").await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn should_notify_object_changes_and_deletions() {
        let store = MemoryStore::new(16);
        let mut rx = store.subscribe();
        let meta = ObjectMeta::new("hm.0.light", rulehub_domain::object::ObjectKind::State);

        store.put_object(meta.clone());
        assert!(matches!(
            rx.recv().await.unwrap(),
            StoreEvent::Object(_, Some(_))
        ));

        store.remove_object(&meta.id);
        assert!(matches!(rx.recv().await.unwrap(), StoreEvent::Object(_, None)));
        // Removing again is silent.
        store.remove_object(&meta.id);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn should_succeed_when_no_subscribers() {
        let store = MemoryStore::new(16);
        let result = store
            .set_state(&"hm.0.light".into(), StateValue::new(false))
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn should_track_pattern_subscriptions() {
        let store = MemoryStore::new(16);
        store.subscribe_states("hm.0.*").await.unwrap();
        assert_eq!(store.subscriptions(), vec!["hm.0.*".to_string()]);
        store.unsubscribe_states("hm.0.*").await.unwrap();
        assert!(store.subscriptions().is_empty());
    }
}
