//! The engine instance — owned tables, caches, and the dispatch loop.
//!
//! Rule callbacks, store-change notifications, and timer firings all
//! funnel through one logical thread of control. Every shared table
//! sits behind its own mutex, held only for the duration of the
//! mutation and never across a store call or a rule callback.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use rulehub_domain::error::{ConfigError, NotFoundError, RuleHubError, ValidationError};
use rulehub_domain::event::EventObj;
use rulehub_domain::id::StateId;
use rulehub_domain::object::{ENUM_PREFIX, ObjectKind, ObjectMeta};
use rulehub_domain::state::StateValue;

use crate::delayed::DelayedTable;
use crate::ports::{StateStore, StoreEvent};
use crate::scheduler::ScheduleEntry;
use crate::subscription::Registry;

/// Prefix of component-instance objects (`system.component.<name>`).
pub(crate) const COMPONENT_PREFIX: &str = "system.component.";

/// Callback invoked for every event matching a subscription.
pub type SubscriptionCallback =
    Arc<dyn Fn(&EventObj) -> Result<(), RuleHubError> + Send + Sync>;

/// Engine-level settings, resolved once at construction.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Namespace used to qualify bare ids and stamp write origins.
    pub namespace: String,
    /// Geographic latitude for astro schedules.
    pub latitude: Option<f64>,
    /// Geographic longitude for astro schedules.
    pub longitude: Option<f64>,
    /// Whether the store pushes every state unconditionally. When
    /// false the engine subscribes per pattern and synchronous cached
    /// reads are unavailable.
    pub cache_all: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            namespace: "rules.0".to_string(),
            latitude: None,
            longitude: None,
            cache_all: true,
        }
    }
}

impl EngineConfig {
    /// Both coordinates, or `None` when either is missing.
    #[must_use]
    pub fn coordinates(&self) -> Option<(f64, f64)> {
        Some((self.latitude?, self.longitude?))
    }
}

/// Lazily derived parent → member-state maps for `channel`/`device`
/// selector modes. Dropped whole on any object change.
#[derive(Debug, Default)]
pub(crate) struct DerivedMaps {
    pub channels: BTreeMap<StateId, Vec<StateId>>,
    pub devices: BTreeMap<StateId, Vec<StateId>>,
}

/// One rule-evaluation engine instance.
///
/// All mutable registries are owned here; construct one per process
/// and share it behind an [`Arc`].
pub struct Engine<S> {
    pub(crate) store: S,
    pub(crate) config: EngineConfig,
    /// Last known value per id.
    pub(crate) states: Mutex<HashMap<StateId, StateValue>>,
    /// Sorted index of live (non-deleted) state ids.
    pub(crate) index: Mutex<BTreeSet<StateId>>,
    /// Cached object graph; iteration order is the discovery order of
    /// selector resolution.
    pub(crate) objects: Mutex<BTreeMap<StateId, ObjectMeta>>,
    pub(crate) registry: Mutex<Registry>,
    /// Enum memberships per id; cleared whenever an `enum.*` object
    /// changes.
    pub(crate) enum_cache: Mutex<HashMap<StateId, Arc<Vec<String>>>>,
    pub(crate) derived: Mutex<Option<DerivedMaps>>,
    pub(crate) schedules: Mutex<Vec<ScheduleEntry>>,
    pub(crate) delayed: Mutex<DelayedTable>,
}

/// Lock a table, recovering from a poisoned mutex — the tables hold no
/// invariants that a panicking callback could have broken halfway.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<S: StateStore> Engine<S> {
    /// Create a new engine over a store adapter.
    pub fn new(store: S, config: EngineConfig) -> Self {
        Self {
            store,
            config,
            states: Mutex::new(HashMap::new()),
            index: Mutex::new(BTreeSet::new()),
            objects: Mutex::new(BTreeMap::new()),
            registry: Mutex::new(Registry::default()),
            enum_cache: Mutex::new(HashMap::new()),
            derived: Mutex::new(None),
            schedules: Mutex::new(Vec::new()),
            delayed: Mutex::new(DelayedTable::default()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Load the object snapshot and (in all-cached mode) every current
    /// state value.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn bootstrap(&self) -> Result<(), RuleHubError> {
        let snapshot = self.store.get_objects().await?;
        let object_count = snapshot.len();
        {
            let mut objects = lock(&self.objects);
            for meta in snapshot {
                objects.insert(meta.id.clone(), meta);
            }
        }
        let mut state_count = 0;
        if self.config.cache_all {
            let snapshot = self.store.get_states("*").await?;
            state_count = snapshot.len();
            let mut states = lock(&self.states);
            let mut index = lock(&self.index);
            for (id, value) in snapshot {
                index.insert(id.clone());
                states.insert(id, value);
            }
        }
        *lock(&self.derived) = None;
        lock(&self.enum_cache).clear();
        info!(objects = object_count, states = state_count, "engine bootstrapped");
        Ok(())
    }

    /// Consume the store's change stream until it closes. This is the
    /// single dispatch loop; nothing else feeds events to the engine.
    pub async fn run(self: Arc<Self>, mut events: broadcast::Receiver<StoreEvent>) {
        loop {
            match events.recv().await {
                Ok(StoreEvent::State(id, state)) => self.handle_state_change(&id, state).await,
                Ok(StoreEvent::Object(id, meta)) => self.handle_object_change(&id, meta),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "change stream lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    /// Process one incoming state change: update the cache and live-id
    /// index, then dispatch to every matching subscription in
    /// registration order.
    pub async fn handle_state_change(&self, id: &StateId, state: Option<StateValue>) {
        let old = lock(&self.states).get(id).cloned();

        match &state {
            Some(value) => {
                if old.is_none() {
                    lock(&self.index).insert(id.clone());
                }
                lock(&self.states).insert(id.clone(), value.clone());
            }
            None => {
                lock(&self.states).remove(id);
                lock(&self.index).remove(id);
            }
        }

        // A component instance coming back online replays every
        // pattern that was requested from it.
        if let (Some(previous), Some(new)) = (&old, &state)
            && previous.val == Value::Bool(false)
            && is_truthy(&new.val)
        {
            self.replay_instance_subscriptions(id).await;
        }

        let event = EventObj::new(id.clone(), state.unwrap_or_default(), old);
        let matched: Vec<(rulehub_domain::id::SubscriptionId, SubscriptionCallback)> = {
            let registry = lock(&self.registry);
            registry
                .entries
                .iter()
                .filter(|entry| entry.compiled.matches(&event))
                .map(|entry| (entry.id, entry.callback.clone()))
                .collect()
        };
        for (subscription, callback) in matched {
            if let Err(err) = callback(&event) {
                tracing::error!(%subscription, error = %err, "error in subscription callback");
            }
        }
    }

    /// Process one object change: refresh the graph cache and drop
    /// every derived structure that depended on it.
    pub fn handle_object_change(&self, id: &StateId, meta: Option<ObjectMeta>) {
        if id.as_str().starts_with(ENUM_PREFIX) {
            lock(&self.enum_cache).clear();
        }
        *lock(&self.derived) = None;
        let mut objects = lock(&self.objects);
        match meta {
            Some(meta) => {
                objects.insert(id.clone(), meta);
            }
            None => {
                objects.remove(id);
            }
        }
    }

    /// Write one state through the store.
    ///
    /// The target's declared type is checked softly (a mismatch warns
    /// but the write proceeds) and numeric values are clamped into the
    /// declared `[min, max]` range without a report.
    ///
    /// # Errors
    ///
    /// [`NotFoundError`] for unknown ids, [`ValidationError::NotAState`]
    /// when the target object is not a state.
    pub async fn set_state(
        &self,
        id: &StateId,
        value: Value,
        ack: Option<bool>,
    ) -> Result<(), RuleHubError> {
        let id = self.resolve_id(id);
        let meta = lock(&self.objects).get(&id).cloned();
        let Some(meta) = meta else {
            warn!(id = %id, "state not found");
            return Err(NotFoundError {
                entity: "State",
                id: id.to_string(),
            }
            .into());
        };
        if meta.kind != ObjectKind::State {
            warn!(id = %id, "cannot set value of non-state object");
            return Err(ValidationError::NotAState(id.to_string()).into());
        }
        if let Some(declared) = meta.declared_type()
            && !matches!(declared, "mixed" | "file" | "json")
            && !value.is_null()
            && declared != value_type_name(&value)
        {
            warn!(
                id = %id,
                declared,
                actual = value_type_name(&value),
                "wrong value type for state, writing anyway"
            );
        }
        let value = clamp_value(&meta, value);
        let state = StateValue::new(value)
            .with_ack(ack.unwrap_or(false))
            .with_origin(self.config.namespace.clone());
        debug!(id = %id, "set_state");
        self.store.set_state(&id, state).await
    }

    /// Synchronously read the cached value of a state.
    ///
    /// # Errors
    ///
    /// [`ConfigError::NotCached`] when the store is not in all-cached
    /// mode — use [`Engine::fetch_state`] instead there.
    pub fn get_state(&self, id: &StateId) -> Result<Option<StateValue>, RuleHubError> {
        if !self.config.cache_all {
            return Err(ConfigError::NotCached.into());
        }
        let states = lock(&self.states);
        let hit = states
            .get(id)
            .or_else(|| states.get(&id.qualify(&self.config.namespace)))
            .cloned();
        Ok(hit)
    }

    /// Read a state from the store.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn fetch_state(&self, id: &StateId) -> Result<Option<StateValue>, RuleHubError> {
        self.store.get_state(&self.resolve_id(id)).await
    }

    #[must_use]
    pub fn exists_state(&self, id: &StateId) -> bool {
        lock(&self.states).contains_key(id)
    }

    #[must_use]
    pub fn exists_object(&self, id: &StateId) -> bool {
        lock(&self.objects).contains_key(id)
    }

    /// Qualify a bare id with the engine namespace when only the
    /// qualified form is a known object.
    pub(crate) fn resolve_id(&self, id: &StateId) -> StateId {
        let objects = lock(&self.objects);
        if objects.contains_key(id) {
            return id.clone();
        }
        let qualified = id.qualify(&self.config.namespace);
        if objects.contains_key(&qualified) {
            return qualified;
        }
        id.clone()
    }

    async fn replay_instance_subscriptions(&self, alive_id: &StateId) {
        let Some(instance) = alive_id
            .as_str()
            .strip_prefix(COMPONENT_PREFIX)
            .and_then(|rest| rest.strip_suffix(".alive"))
            .map(str::to_string)
        else {
            return;
        };
        let patterns: Vec<String> = lock(&self.registry)
            .instance_subs
            .get(alive_id)
            .cloned()
            .unwrap_or_default();
        for pattern in patterns {
            info!(instance, pattern, "component came back online, resending subscribe");
            if let Err(err) = self.store.request_instance_subscribe(&instance, &pattern).await {
                warn!(instance, pattern, error = %err, "resending subscribe failed");
            }
        }
    }
}

fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Silently clamp numeric values into the object's declared range.
fn clamp_value(meta: &ObjectMeta, value: Value) -> Value {
    let (min, max) = (meta.min(), meta.max());
    if min.is_none() && max.is_none() {
        return value;
    }
    let Some(n) = value.as_f64() else {
        return value;
    };
    let mut clamped = n;
    if let Some(min) = min {
        clamped = clamped.max(min);
    }
    if let Some(max) = max {
        clamped = clamped.min(max);
    }
    if (clamped - n).abs() < f64::EPSILON {
        value
    } else {
        serde_json::Number::from_f64(clamped).map_or(value, Value::Number)
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{engine_with, state_object, subscribable_component};
    use serde_json::json;

    #[tokio::test]
    async fn should_cache_and_index_new_states_before_dispatch() {
        let engine = engine_with(vec![state_object("hm.0.light", "boolean")], vec![]);
        engine
            .handle_state_change(&"hm.0.light".into(), Some(StateValue::new(true)))
            .await;
        assert!(engine.exists_state(&"hm.0.light".into()));
        assert!(lock(&engine.index).contains("hm.0.light"));
    }

    #[tokio::test]
    async fn should_remove_deleted_states_from_cache_and_index() {
        let engine = engine_with(vec![state_object("hm.0.light", "boolean")], vec![]);
        engine
            .handle_state_change(&"hm.0.light".into(), Some(StateValue::new(true)))
            .await;
        engine.handle_state_change(&"hm.0.light".into(), None).await;
        assert!(!engine.exists_state(&"hm.0.light".into()));
        assert!(!lock(&engine.index).contains("hm.0.light"));
    }

    #[tokio::test]
    async fn should_warn_and_error_when_setting_unknown_state() {
        let engine = engine_with(vec![], vec![]);
        let result = engine.set_state(&"ghost.0.x".into(), json!(1), None).await;
        assert!(matches!(result, Err(RuleHubError::NotFound(_))));
        assert!(engine.store.writes().is_empty());
    }

    #[tokio::test]
    async fn should_reject_writes_to_non_state_objects() {
        let engine = engine_with(
            vec![ObjectMeta::new("hm.0.device", ObjectKind::Device)],
            vec![],
        );
        let result = engine.set_state(&"hm.0.device".into(), json!(1), None).await;
        assert!(matches!(
            result,
            Err(RuleHubError::Validation(ValidationError::NotAState(_)))
        ));
    }

    #[tokio::test]
    async fn should_write_despite_declared_type_mismatch() {
        let engine = engine_with(vec![state_object("hm.0.light", "boolean")], vec![]);
        engine
            .set_state(&"hm.0.light".into(), json!("not a bool"), None)
            .await
            .unwrap();
        assert_eq!(engine.store.writes().len(), 1);
    }

    #[tokio::test]
    async fn should_clamp_numeric_values_into_declared_range() {
        let meta = state_object("hm.0.dimmer", "number")
            .with_common("min", 0)
            .with_common("max", 100);
        let engine = engine_with(vec![meta], vec![]);
        engine
            .set_state(&"hm.0.dimmer".into(), json!(150), None)
            .await
            .unwrap();
        let writes = engine.store.writes();
        assert_eq!(writes[0].1.val, json!(100.0));
    }

    #[tokio::test]
    async fn should_qualify_bare_ids_against_known_objects() {
        let engine = engine_with(vec![state_object("rules.0.counter", "number")], vec![]);
        engine
            .set_state(&"counter".into(), json!(7), Some(true))
            .await
            .unwrap();
        let writes = engine.store.writes();
        assert_eq!(writes[0].0.as_str(), "rules.0.counter");
        assert!(writes[0].1.ack);
    }

    #[tokio::test]
    async fn should_refuse_sync_reads_without_cache() {
        let config = EngineConfig {
            cache_all: false,
            ..EngineConfig::default()
        };
        let engine = crate::testing::engine_with_config(vec![], vec![], config);
        let result = engine.get_state(&"hm.0.light".into());
        assert!(matches!(
            result,
            Err(RuleHubError::Config(ConfigError::NotCached))
        ));
    }

    #[tokio::test]
    async fn should_serve_sync_reads_from_the_cache() {
        let engine = engine_with(vec![], vec![("hm.0.temp", json!(21.5))]);
        let state = engine.get_state(&"hm.0.temp".into()).unwrap().unwrap();
        assert_eq!(state.val, json!(21.5));
        assert!(engine.get_state(&"hm.0.missing".into()).unwrap().is_none());
    }

    #[tokio::test]
    async fn should_invalidate_enum_cache_on_enum_object_change() {
        let engine = engine_with(vec![], vec![]);
        lock(&engine.enum_cache).insert("hm.0.x".into(), Arc::new(vec![]));
        engine.handle_object_change(
            &"enum.rooms.kitchen".into(),
            Some(ObjectMeta::new("enum.rooms.kitchen", ObjectKind::Other)),
        );
        assert!(lock(&engine.enum_cache).is_empty());
    }

    #[tokio::test]
    async fn should_keep_enum_cache_for_ordinary_object_changes() {
        let engine = engine_with(vec![], vec![]);
        lock(&engine.enum_cache).insert("hm.0.x".into(), Arc::new(vec![]));
        engine.handle_object_change(
            &"hm.0.y".into(),
            Some(state_object("hm.0.y", "boolean")),
        );
        assert_eq!(lock(&engine.enum_cache).len(), 1);
    }

    #[tokio::test]
    async fn should_replay_instance_patterns_on_alive_transition() {
        let engine = engine_with(
            vec![
                subscribable_component("mqtt.0"),
                state_object("mqtt.0.topic.value", "string"),
            ],
            vec![],
        );
        let alive: StateId = "system.component.mqtt.0.alive".into();
        lock(&engine.registry)
            .instance_subs
            .insert(alive.clone(), vec!["mqtt.0.topic.value".to_string()]);

        engine
            .handle_state_change(&alive, Some(StateValue::new(false)))
            .await;
        assert!(engine.store.instance_requests().is_empty());

        engine
            .handle_state_change(&alive, Some(StateValue::new(true)))
            .await;
        let requests = engine.store.instance_requests();
        assert_eq!(requests, vec![("mqtt.0".to_string(), "mqtt.0.topic.value".to_string())]);
    }
}
