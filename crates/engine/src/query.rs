//! Selector resolution — from parsed selectors to live id sets with
//! bulk operations.

use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use rulehub_domain::error::{RuleHubError, SelectorError};
use rulehub_domain::event::EventObj;
use rulehub_domain::id::{RuleId, StateId, SubscriptionId};
use rulehub_domain::object::{ObjectKind, ObjectMeta};
use rulehub_domain::pattern::PatternSpec;
use rulehub_domain::selector::{AttrFilter, Selector, ValueMatcher};
use rulehub_domain::state::StateValue;
use rulehub_domain::wildcard;

use crate::engine::{DerivedMaps, Engine, lock};
use crate::ports::StateStore;

/// Which attribute table of an object a filter group reads.
#[derive(Clone, Copy)]
enum AttrTable {
    Common,
    Native,
}

impl<S: StateStore> Engine<S> {
    /// Resolve a selector string into a [`Query`].
    ///
    /// Parse failures are reported here and produce an inert, empty
    /// query whose operations are all no-ops — callers chain without
    /// special-casing.
    pub fn select(&self, selector: &str) -> Query<'_, S> {
        match Selector::parse(selector) {
            Ok(parsed) => Query {
                engine: self,
                ids: self.resolve_selector(&parsed),
                error: None,
            },
            Err(error) => {
                warn!(selector, %error, "invalid selector");
                Query {
                    engine: self,
                    ids: Vec::new(),
                    error: Some(error),
                }
            }
        }
    }

    fn resolve_selector(&self, selector: &Selector) -> Vec<StateId> {
        match selector.name.as_str() {
            "channel" => self.resolve_parents(selector, true),
            "device" => self.resolve_parents(selector, false),
            name => self.resolve_states(selector, name),
        }
    }

    /// `channel`/`device` mode: filter parent objects, then append all
    /// of their member states in discovery order.
    fn resolve_parents(&self, selector: &Selector, channels: bool) -> Vec<StateId> {
        let candidates = self.parent_candidates(channels);
        let mut result = Vec::new();
        for (parent, members) in candidates {
            let meta = lock(&self.objects).get(&parent).cloned();
            let Some(meta) = meta else { continue };
            if !passes_filters(&meta, &selector.common, AttrTable::Common) {
                continue;
            }
            if !passes_filters(&meta, &selector.native, AttrTable::Native) {
                continue;
            }
            if !self.passes_enum_filters(&parent, &selector.enums) {
                continue;
            }
            for member in members {
                if selector
                    .state_ids
                    .iter()
                    .all(|filter| filter.matches_str(member.as_str()))
                {
                    result.push(member);
                }
            }
        }
        result
    }

    /// State mode: scan the sorted live-id index, with the name (when
    /// present and not `state`) acting as an anchored id wildcard.
    fn resolve_states(&self, selector: &Selector, name: &str) -> Vec<StateId> {
        let name_filter = match name {
            "" | "state" => None,
            other => wildcard::compile(other).ok(),
        };
        let ids: Vec<StateId> = lock(&self.index).iter().cloned().collect();
        let mut result = Vec::new();
        for id in ids {
            if let Some(re) = &name_filter
                && !re.is_match(id.as_str())
            {
                continue;
            }
            let meta = lock(&self.objects).get(&id).cloned();
            if !selector.common.is_empty() || !selector.native.is_empty() {
                let Some(meta) = &meta else { continue };
                if !passes_filters(meta, &selector.common, AttrTable::Common) {
                    continue;
                }
                if !passes_filters(meta, &selector.native, AttrTable::Native) {
                    continue;
                }
            }
            if !selector
                .state_ids
                .iter()
                .all(|filter| filter.matches_str(id.as_str()))
            {
                continue;
            }
            if !self.passes_enum_filters(&id, &selector.enums) {
                continue;
            }
            result.push(id);
        }
        result
    }

    /// Every requested enum membership must be present.
    fn passes_enum_filters(&self, id: &StateId, filters: &[ValueMatcher]) -> bool {
        if filters.is_empty() {
            return true;
        }
        let memberships = self.enum_memberships(id);
        filters
            .iter()
            .all(|filter| memberships.iter().any(|m| filter.matches_str(m)))
    }

    /// Enum memberships of an id: every `enum.*` object listing the id
    /// itself, its channel, or its device among its members. Cached
    /// until any enum object changes.
    pub(crate) fn enum_memberships(&self, id: &StateId) -> Arc<Vec<String>> {
        if let Some(hit) = lock(&self.enum_cache).get(id) {
            return hit.clone();
        }
        let channel = id.channel_id();
        let device = id.device_id();
        let memberships: Vec<String> = {
            let objects = lock(&self.objects);
            objects
                .values()
                .filter(|meta| meta.is_enum())
                .filter(|meta| {
                    meta.enum_members().any(|member| {
                        member == id.as_str()
                            || channel.as_ref().is_some_and(|c| member == c.as_str())
                            || device.as_ref().is_some_and(|d| member == d.as_str())
                    })
                })
                .map(|meta| meta.id.as_str().to_string())
                .collect()
        };
        let memberships = Arc::new(memberships);
        lock(&self.enum_cache).insert(id.clone(), memberships.clone());
        memberships
    }

    /// Snapshot of the parent → member-states map, building it from
    /// the object graph on first use after an object change.
    fn parent_candidates(&self, channels: bool) -> Vec<(StateId, Vec<StateId>)> {
        let mut derived = lock(&self.derived);
        let maps = derived.get_or_insert_with(|| {
            let objects = lock(&self.objects);
            let mut built = DerivedMaps::default();
            for (id, meta) in objects.iter() {
                if meta.kind != ObjectKind::State {
                    continue;
                }
                if let Some(channel) = id.channel_id() {
                    built.channels.entry(channel).or_default().push(id.clone());
                }
                if let Some(device) = id.device_id() {
                    built.devices.entry(device).or_default().push(id.clone());
                }
            }
            built
        });
        let source = if channels { &maps.channels } else { &maps.devices };
        source
            .iter()
            .map(|(parent, members)| (parent.clone(), members.clone()))
            .collect()
    }
}

/// Apply one filter group. Filters short-circuit: the first failing
/// one rejects the candidate.
fn passes_filters(meta: &ObjectMeta, filters: &[AttrFilter], table: AttrTable) -> bool {
    filters.iter().all(|filter| {
        // `id` filters match the candidate's id instead of an
        // attribute.
        if filter.attr == "id" {
            return filter
                .value
                .as_ref()
                .is_none_or(|matcher| matcher.matches_str(meta.id.as_str()));
        }
        let attr_value = match table {
            AttrTable::Common => meta.common_value(&filter.attr),
            AttrTable::Native => meta.native_value(&filter.attr),
        };
        match (&filter.value, attr_value) {
            // Bare attribute filter: presence is enough.
            (None, present) => present.is_some(),
            (Some(matcher), Some(value)) => matcher.matches_value(value),
            (Some(_), None) => false,
        }
    })
}

/// An ordered, deduplicated-by-construction set of state ids with bulk
/// operations attached.
///
/// Parse failures produce a query whose operations are all no-ops; use
/// [`Query::error`] to inspect the cause.
pub struct Query<'a, S> {
    engine: &'a Engine<S>,
    ids: Vec<StateId>,
    error: Option<SelectorError>,
}

impl<S: StateStore> Query<'_, S> {
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Member at `index`, in resolution order.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&StateId> {
        self.ids.get(index)
    }

    #[must_use]
    pub fn ids(&self) -> &[StateId] {
        &self.ids
    }

    /// The parse error, when the selector was malformed.
    #[must_use]
    pub fn error(&self) -> Option<&SelectorError> {
        self.error.as_ref()
    }

    /// Visit every member in order; returning `false` stops the walk.
    pub fn each<F>(&self, mut visit: F) -> &Self
    where
        F: FnMut(&StateId, usize) -> bool,
    {
        for (index, id) in self.ids.iter().enumerate() {
            if !visit(id, index) {
                break;
            }
        }
        self
    }

    /// Cached value of the first member.
    ///
    /// # Errors
    ///
    /// [`rulehub_domain::error::ConfigError::NotCached`] outside the
    /// all-cached store mode — use [`Query::fetch_state`] there.
    pub fn state(&self) -> Result<Option<StateValue>, RuleHubError> {
        match self.ids.first() {
            Some(id) => self.engine.get_state(id),
            None => Ok(None),
        }
    }

    /// Store-read value of the first member.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn fetch_state(&self) -> Result<Option<StateValue>, RuleHubError> {
        match self.ids.first() {
            Some(id) => self.engine.fetch_state(id).await,
            None => Ok(None),
        }
    }

    /// Write the same value to every member; resolves once all writes
    /// completed. Returns the number of attempted writes. Individual
    /// write failures are reported and do not stop the fan-out.
    pub async fn set_state(&self, value: Value, ack: Option<bool>) -> usize {
        let mut written = 0;
        for id in &self.ids {
            written += 1;
            if let Err(error) = self.engine.set_state(id, value.clone(), ack).await {
                warn!(id = %id, %error, "set_state failed for selector member");
            }
        }
        written
    }

    /// Subscribe a callback on every member (with the bare-target
    /// `change: ne` normalization).
    ///
    /// # Errors
    ///
    /// Propagates the first subscription failure.
    pub async fn on<F>(
        &self,
        owner: &RuleId,
        callback: F,
    ) -> Result<Vec<SubscriptionId>, RuleHubError>
    where
        F: Fn(&EventObj) -> Result<(), RuleHubError> + Send + Sync + 'static,
    {
        let callback: crate::engine::SubscriptionCallback = Arc::new(callback);
        let mut handles = Vec::with_capacity(self.ids.len());
        for id in &self.ids {
            let callback = callback.clone();
            let handle = self
                .engine
                .subscribe(
                    PatternSpec::for_id(id.as_str()),
                    owner,
                    move |event: &EventObj| callback(event),
                )
                .await?;
            handles.push(handle);
        }
        Ok(handles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{engine_with, fixture_graph, state_object};
    use rulehub_domain::error::GroupKind;
    use serde_json::json;

    #[tokio::test]
    async fn should_resolve_channel_selector_in_discovery_order() {
        let engine = engine_with(fixture_graph(), vec![]);
        let query = engine.select("channel[role=switch]");
        let ids: Vec<&str> = query.ids().iter().map(StateId::as_str).collect();
        // Only states beneath switch-role channels, ordered by the
        // graph's iteration order, no duplicates.
        assert_eq!(
            ids,
            vec!["hm.0.kitchen.sw1.STATE", "hm.0.kitchen.sw1.WORKING", "hm.0.living.sw2.STATE"]
        );
    }

    #[tokio::test]
    async fn should_apply_state_id_filter_at_the_leaf_level() {
        let engine = engine_with(fixture_graph(), vec![]);
        let query = engine.select("channel[role=switch][state.id=*.STATE]");
        let ids: Vec<&str> = query.ids().iter().map(StateId::as_str).collect();
        assert_eq!(ids, vec!["hm.0.kitchen.sw1.STATE", "hm.0.living.sw2.STATE"]);
    }

    #[tokio::test]
    async fn should_resolve_device_selector_through_native_filters() {
        let engine = engine_with(fixture_graph(), vec![]);
        let query = engine.select("device{serial=K123}");
        let ids: Vec<&str> = query.ids().iter().map(StateId::as_str).collect();
        assert_eq!(
            ids,
            vec!["hm.0.kitchen.sw1.STATE", "hm.0.kitchen.sw1.WORKING", "hm.0.kitchen.temp.VALUE"]
        );
    }

    #[tokio::test]
    async fn should_scan_id_index_for_bare_name_selectors() {
        let engine = engine_with(fixture_graph(), vec![]);
        for (id, value) in [
            ("hm.0.kitchen.sw1.STATE", json!(false)),
            ("hm.0.living.sw2.STATE", json!(true)),
            ("hue.0.lamp.on", json!(true)),
        ] {
            engine
                .handle_state_change(&id.into(), Some(StateValue::new(value)))
                .await;
        }
        let query = engine.select("hm.0.*.STATE");
        let ids: Vec<&str> = query.ids().iter().map(StateId::as_str).collect();
        assert_eq!(ids, vec!["hm.0.kitchen.sw1.STATE", "hm.0.living.sw2.STATE"]);
    }

    #[tokio::test]
    async fn should_filter_states_by_enum_membership() {
        let engine = engine_with(fixture_graph(), vec![]);
        for id in ["hm.0.kitchen.sw1.STATE", "hm.0.living.sw2.STATE"] {
            engine
                .handle_state_change(&id.into(), Some(StateValue::new(true)))
                .await;
        }
        let query = engine.select("state(rooms=kitchen)");
        let ids: Vec<&str> = query.ids().iter().map(StateId::as_str).collect();
        assert_eq!(ids, vec!["hm.0.kitchen.sw1.STATE"]);
    }

    #[tokio::test]
    async fn should_return_inert_query_for_invalid_selector() {
        let engine = engine_with(fixture_graph(), vec![]);
        let query = engine.select("channel[role=switch");
        assert_eq!(
            query.error(),
            Some(&SelectorError::UnterminatedGroup(GroupKind::Common))
        );
        assert!(query.is_empty());
        // Chainable operations are no-ops.
        let mut visited = 0;
        query.each(|_, _| {
            visited += 1;
            true
        });
        assert_eq!(visited, 0);
        assert!(query.state().unwrap().is_none());
        assert_eq!(query.set_state(json!(1), None).await, 0);
    }

    #[tokio::test]
    async fn should_stop_each_walk_when_visitor_returns_false() {
        let engine = engine_with(fixture_graph(), vec![]);
        let query = engine.select("channel[role=switch]");
        let mut visited = 0;
        query.each(|_, _| {
            visited += 1;
            false
        });
        assert_eq!(visited, 1);
    }

    #[tokio::test]
    async fn should_fan_out_set_state_to_every_member() {
        let engine = engine_with(fixture_graph(), vec![]);
        let query = engine.select("channel[role=switch][state.id=*.STATE]");
        let written = query.set_state(json!(false), Some(false)).await;
        assert_eq!(written, 2);
        let writes = engine.store.writes();
        assert_eq!(writes.len(), 2);
        assert!(writes.iter().all(|(_, state)| state.val == json!(false)));
    }

    #[tokio::test]
    async fn should_subscribe_every_member_with_on() {
        let engine = engine_with(fixture_graph(), vec![]);
        let query = engine.select("channel[role=switch][state.id=*.STATE]");
        let (count, calls) = crate::testing::counter();
        let handles = query.on(&"rule.test".into(), calls).await.unwrap();
        assert_eq!(handles.len(), 2);

        engine
            .handle_state_change(&"hm.0.kitchen.sw1.STATE".into(), Some(StateValue::new(true)))
            .await;
        assert_eq!(count(), 1);
    }

    #[tokio::test]
    async fn should_require_attribute_presence_for_bare_filters() {
        let engine = engine_with(
            vec![
                state_object("hm.0.a", "boolean").with_common("role", "switch"),
                state_object("hm.0.b", "boolean"),
            ],
            vec![],
        );
        for id in ["hm.0.a", "hm.0.b"] {
            engine
                .handle_state_change(&id.into(), Some(StateValue::new(true)))
                .await;
        }
        let query = engine.select("state[role]");
        let ids: Vec<&str> = query.ids().iter().map(StateId::as_str).collect();
        assert_eq!(ids, vec!["hm.0.a"]);
    }

    #[tokio::test]
    async fn should_rebuild_parent_maps_after_object_changes() {
        let engine = engine_with(fixture_graph(), vec![]);
        assert_eq!(engine.select("channel[role=switch]").len(), 3);

        engine.handle_object_change(
            &"hm.0.garage.sw9".into(),
            Some(
                ObjectMeta::new("hm.0.garage.sw9", ObjectKind::Channel).with_common("role", "switch"),
            ),
        );
        engine.handle_object_change(
            &"hm.0.garage.sw9.STATE".into(),
            Some(state_object("hm.0.garage.sw9.STATE", "boolean")),
        );
        assert_eq!(engine.select("channel[role=switch]").len(), 4);
    }
}
