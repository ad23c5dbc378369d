//! Shared test doubles and fixtures for the engine test modules.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{Value, json};

use rulehub_domain::error::RuleHubError;
use rulehub_domain::event::EventObj;
use rulehub_domain::id::StateId;
use rulehub_domain::object::{ObjectKind, ObjectMeta};
use rulehub_domain::state::StateValue;
use rulehub_domain::wildcard;

use crate::engine::{Engine, EngineConfig, lock};
use crate::ports::StateStore;

// ── In-memory store double ─────────────────────────────────────────

#[derive(Default)]
pub(crate) struct StubStore {
    states: Mutex<HashMap<StateId, StateValue>>,
    objects: Mutex<Vec<ObjectMeta>>,
    writes: Mutex<Vec<(StateId, StateValue)>>,
    subscribed: Mutex<Vec<String>>,
    unsubscribed: Mutex<Vec<String>>,
    instance_requests: Mutex<Vec<(String, String)>>,
}

impl StubStore {
    pub fn writes(&self) -> Vec<(StateId, StateValue)> {
        self.writes.lock().unwrap().clone()
    }

    pub fn subscribed(&self) -> Vec<String> {
        self.subscribed.lock().unwrap().clone()
    }

    pub fn unsubscribed(&self) -> Vec<String> {
        self.unsubscribed.lock().unwrap().clone()
    }

    pub fn instance_requests(&self) -> Vec<(String, String)> {
        self.instance_requests.lock().unwrap().clone()
    }
}

impl StateStore for StubStore {
    fn get_state(
        &self,
        id: &StateId,
    ) -> impl Future<Output = Result<Option<StateValue>, RuleHubError>> + Send {
        let hit = self.states.lock().unwrap().get(id).cloned();
        async move { Ok(hit) }
    }

    fn get_states(
        &self,
        pattern: &str,
    ) -> impl Future<Output = Result<Vec<(StateId, StateValue)>, RuleHubError>> + Send {
        let matcher = wildcard::compile(pattern).ok();
        let snapshot: Vec<(StateId, StateValue)> = self
            .states
            .lock()
            .unwrap()
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
        self.states
            .lock()
            .unwrap()
            .insert(id.clone(), state.clone());
        self.writes.lock().unwrap().push((id.clone(), state));
        async { Ok(()) }
    }

    fn get_objects(&self) -> impl Future<Output = Result<Vec<ObjectMeta>, RuleHubError>> + Send {
        let snapshot = self.objects.lock().unwrap().clone();
        async move { Ok(snapshot) }
    }

    fn subscribe_states(
        &self,
        pattern: &str,
    ) -> impl Future<Output = Result<(), RuleHubError>> + Send {
        self.subscribed.lock().unwrap().push(pattern.to_string());
        async { Ok(()) }
    }

    fn unsubscribe_states(
        &self,
        pattern: &str,
    ) -> impl Future<Output = Result<(), RuleHubError>> + Send {
        self.unsubscribed.lock().unwrap().push(pattern.to_string());
        async { Ok(()) }
    }

    fn request_instance_subscribe(
        &self,
        instance: &str,
        pattern: &str,
    ) -> impl Future<Output = Result<(), RuleHubError>> + Send {
        self.instance_requests
            .lock()
            .unwrap()
            .push((instance.to_string(), pattern.to_string()));
        async { Ok(()) }
    }
}

// ── Engine fixtures ────────────────────────────────────────────────

pub(crate) fn engine_with(
    objects: Vec<ObjectMeta>,
    states: Vec<(&str, Value)>,
) -> Arc<Engine<StubStore>> {
    let config = EngineConfig {
        latitude: Some(52.52),
        longitude: Some(13.405),
        ..EngineConfig::default()
    };
    engine_with_config(objects, states, config)
}

pub(crate) fn engine_with_config(
    objects: Vec<ObjectMeta>,
    states: Vec<(&str, Value)>,
    config: EngineConfig,
) -> Arc<Engine<StubStore>> {
    let store = StubStore::default();
    *store.objects.lock().unwrap() = objects.clone();
    for (id, value) in &states {
        store
            .states
            .lock()
            .unwrap()
            .insert(StateId::new(*id), StateValue::new(value.clone()));
    }
    let cache_all = config.cache_all;
    let engine = Arc::new(Engine::new(store, config));
    {
        let mut table = lock(&engine.objects);
        for meta in objects {
            table.insert(meta.id.clone(), meta);
        }
    }
    if cache_all {
        let mut cached = lock(&engine.states);
        let mut index = lock(&engine.index);
        for (id, value) in states {
            let id = StateId::new(id);
            index.insert(id.clone());
            cached.insert(id, StateValue::new(value));
        }
    }
    engine
}

pub(crate) fn engine_without_coordinates() -> Arc<Engine<StubStore>> {
    engine_with_config(vec![], vec![], EngineConfig::default())
}

pub(crate) fn state_object(id: &str, declared_type: &str) -> ObjectMeta {
    ObjectMeta::new(id, ObjectKind::State).with_common("type", declared_type)
}

pub(crate) fn subscribable_component(instance: &str) -> ObjectMeta {
    ObjectMeta::new(format!("system.component.{instance}"), ObjectKind::Other)
        .with_common("subscribable", true)
}

/// A small object graph: two devices with switch/sensor channels, a
/// foreign lamp, and room enums.
pub(crate) fn fixture_graph() -> Vec<ObjectMeta> {
    vec![
        ObjectMeta::new("hm.0.kitchen", ObjectKind::Device).with_native("serial", "K123"),
        ObjectMeta::new("hm.0.living", ObjectKind::Device).with_native("serial", "L456"),
        ObjectMeta::new("hm.0.kitchen.sw1", ObjectKind::Channel).with_common("role", "switch"),
        ObjectMeta::new("hm.0.kitchen.temp", ObjectKind::Channel).with_common("role", "sensor"),
        ObjectMeta::new("hm.0.living.sw2", ObjectKind::Channel).with_common("role", "switch"),
        ObjectMeta::new("hue.0.lamp", ObjectKind::Channel).with_common("role", "light"),
        state_object("hm.0.kitchen.sw1.STATE", "boolean"),
        state_object("hm.0.kitchen.sw1.WORKING", "boolean"),
        state_object("hm.0.kitchen.temp.VALUE", "number"),
        state_object("hm.0.living.sw2.STATE", "boolean"),
        state_object("hue.0.lamp.on", "boolean"),
        ObjectMeta::new("enum.rooms.kitchen", ObjectKind::Other)
            .with_common("members", json!(["hm.0.kitchen.sw1"])),
        ObjectMeta::new("enum.rooms.living", ObjectKind::Other)
            .with_common("members", json!(["hm.0.living.sw2"])),
    ]
}

// ── Callback probes ────────────────────────────────────────────────

pub(crate) fn counter() -> (
    impl Fn() -> usize,
    impl Fn(&EventObj) -> Result<(), RuleHubError> + Send + Sync + 'static,
) {
    let count = Arc::new(AtomicUsize::new(0));
    let reader = {
        let count = count.clone();
        move || count.load(Ordering::SeqCst)
    };
    let callback = move |_: &EventObj| {
        count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    };
    (reader, callback)
}

pub(crate) fn counter_fn() -> (impl Fn() -> usize, impl Fn() + Send + Sync + 'static) {
    let count = Arc::new(AtomicUsize::new(0));
    let reader = {
        let count = count.clone();
        move || count.load(Ordering::SeqCst)
    };
    let bump = move || {
        count.fetch_add(1, Ordering::SeqCst);
    };
    (reader, bump)
}

pub(crate) fn capture_old_values() -> (
    impl Fn() -> Vec<Option<Value>>,
    impl Fn(&EventObj) -> Result<(), RuleHubError> + Send + Sync + 'static,
) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let reader = {
        let seen = seen.clone();
        move || seen.lock().unwrap().clone()
    };
    let callback = move |event: &EventObj| {
        seen.lock()
            .unwrap()
            .push(event.old_state.as_ref().map(|state| state.val.clone()));
        Ok(())
    };
    (reader, callback)
}
