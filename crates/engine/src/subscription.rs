//! Subscription registry — pattern-to-callback bindings and the
//! ref-counted store-level subscriptions behind them.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::{debug, error};

use rulehub_domain::error::{RuleHubError, ValidationError};
use rulehub_domain::event::EventObj;
use rulehub_domain::id::{RuleId, StateId, SubscriptionId};
use rulehub_domain::pattern::{CompiledPattern, IdSpec, PatternSpec};
use rulehub_domain::wildcard;

use crate::engine::{COMPONENT_PREFIX, Engine, SubscriptionCallback, lock};
use crate::ports::StateStore;

/// One registered subscription.
pub(crate) struct SubEntry {
    pub id: SubscriptionId,
    pub owner: RuleId,
    pub spec: PatternSpec,
    /// Raw id patterns backing this subscription at the store level.
    pub raw_patterns: Vec<String>,
    pub compiled: CompiledPattern,
    pub callback: SubscriptionCallback,
}

/// All subscription bookkeeping, behind one lock.
#[derive(Default)]
pub(crate) struct Registry {
    /// Registration order is dispatch order.
    pub entries: Vec<SubEntry>,
    /// Store-level subscriptions per raw pattern. The upstream
    /// subscription is released exactly when the count reaches zero.
    pub pattern_refs: HashMap<String, usize>,
    /// Patterns requested from subscribable component instances, keyed
    /// by the instance's `.alive` state id. Replayed when the instance
    /// comes back online.
    pub instance_subs: HashMap<StateId, Vec<String>>,
}

/// Introspection view of one subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionInfo {
    pub id: SubscriptionId,
    pub owner: RuleId,
    pub pattern: PatternSpec,
}

impl<S: StateStore> Engine<S> {
    /// Register a subscription for a rule.
    ///
    /// Bare targets are normalized to `{id, change: ne}` before this is
    /// called (see [`PatternSpec::for_id`]); dot-free ids are qualified
    /// with the engine namespace.
    ///
    /// # Errors
    ///
    /// [`ValidationError::EmptyPatternId`] for an explicitly empty id —
    /// an easy way to subscribe to every state by accident — and
    /// [`ValidationError::BadIdExpression`] for unusable id regexes.
    pub async fn subscribe<F>(
        &self,
        spec: impl Into<PatternSpec>,
        owner: &RuleId,
        callback: F,
    ) -> Result<SubscriptionId, RuleHubError>
    where
        F: Fn(&EventObj) -> Result<(), RuleHubError> + Send + Sync + 'static,
    {
        let mut spec = spec.into();
        match &mut spec.id {
            Some(IdSpec::Text(text)) if text.is_empty() => {
                error!("subscription with empty id would match every state");
                return Err(ValidationError::EmptyPatternId.into());
            }
            Some(IdSpec::Text(text)) => {
                if !text.contains('.') {
                    *text = format!("{}.{text}", self.config.namespace);
                }
            }
            Some(IdSpec::List(ids)) => {
                for id in ids {
                    if !id.contains('.') {
                        *id = format!("{}.{id}", self.config.namespace);
                    }
                }
            }
            _ => {}
        }

        let compiled = spec.compile().map_err(RuleHubError::from)?;
        let raw_patterns: Vec<String> = match &spec.id {
            Some(IdSpec::Text(text)) => vec![text.clone()],
            Some(IdSpec::List(ids)) => ids.clone(),
            _ => Vec::new(),
        };

        for pattern in &raw_patterns {
            self.acquire_pattern(pattern).await?;
            self.track_instance_subscription(pattern).await?;
        }

        let id = SubscriptionId::new();
        debug!(subscription = %id, owner = %owner, "subscribe");
        lock(&self.registry).entries.push(SubEntry {
            id,
            owner: owner.clone(),
            spec,
            raw_patterns,
            compiled,
            callback: Arc::new(callback),
        });
        Ok(id)
    }

    /// Remove one subscription by its handle. Returns whether it was
    /// found.
    pub async fn unsubscribe(&self, handle: SubscriptionId) -> bool {
        let removed = {
            let mut registry = lock(&self.registry);
            let pos = registry.entries.iter().position(|entry| entry.id == handle);
            pos.map(|pos| registry.entries.remove(pos))
        };
        match removed {
            Some(entry) => {
                for pattern in &entry.raw_patterns {
                    self.release_pattern(pattern).await;
                }
                debug!(subscription = %handle, "unsubscribe");
                true
            }
            None => false,
        }
    }

    /// Remove every subscription of `owner` whose raw id equals `id`.
    /// Returns whether any was removed.
    pub async fn unsubscribe_matching(&self, owner: &RuleId, id: &str) -> bool {
        let removed: Vec<SubEntry> = {
            let mut registry = lock(&self.registry);
            let mut kept = Vec::with_capacity(registry.entries.len());
            let mut removed = Vec::new();
            for entry in registry.entries.drain(..) {
                if entry.owner == *owner && entry.spec.id_text() == Some(id) {
                    removed.push(entry);
                } else {
                    kept.push(entry);
                }
            }
            registry.entries = kept;
            removed
        };
        let found = !removed.is_empty();
        for entry in removed {
            for pattern in &entry.raw_patterns {
                self.release_pattern(pattern).await;
            }
        }
        found
    }

    /// All active subscriptions, grouped by their raw target id.
    /// Patterns without a single textual id group under `"*"`.
    #[must_use]
    pub fn subscriptions(&self) -> BTreeMap<String, Vec<SubscriptionInfo>> {
        let registry = lock(&self.registry);
        let mut grouped: BTreeMap<String, Vec<SubscriptionInfo>> = BTreeMap::new();
        for entry in &registry.entries {
            let key = entry.spec.id_text().unwrap_or("*").to_string();
            grouped.entry(key).or_default().push(SubscriptionInfo {
                id: entry.id,
                owner: entry.owner.clone(),
                pattern: entry.spec.clone(),
            });
        }
        grouped
    }

    /// First local subscription on a raw pattern issues the store-level
    /// subscription and prefetches current values so the first change
    /// already carries an old state. Skipped entirely in all-cached
    /// mode, where the store pushes everything anyway.
    async fn acquire_pattern(&self, pattern: &str) -> Result<(), RuleHubError> {
        if self.config.cache_all {
            return Ok(());
        }
        let first = {
            let mut registry = lock(&self.registry);
            let count = registry.pattern_refs.entry(pattern.to_string()).or_insert(0);
            *count += 1;
            *count == 1
        };
        if !first {
            return Ok(());
        }
        self.store.subscribe_states(pattern).await?;
        if wildcard::is_wildcard(pattern) {
            let snapshot = self.store.get_states(pattern).await?;
            let mut states = lock(&self.states);
            let mut index = lock(&self.index);
            for (id, value) in snapshot {
                index.insert(id.clone());
                states.insert(id, value);
            }
        } else {
            let id = StateId::new(pattern);
            if let Some(value) = self.store.get_state(&id).await? {
                lock(&self.index).insert(id.clone());
                lock(&self.states).insert(id, value);
            }
        }
        Ok(())
    }

    /// Drop one reference to a raw pattern; the store subscription goes
    /// away with the last one.
    async fn release_pattern(&self, pattern: &str) {
        if self.config.cache_all {
            return;
        }
        let last = {
            let mut registry = lock(&self.registry);
            match registry.pattern_refs.get_mut(pattern) {
                Some(count) => {
                    *count -= 1;
                    if *count == 0 {
                        registry.pattern_refs.remove(pattern);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };
        if last {
            if let Err(err) = self.store.unsubscribe_states(pattern).await {
                tracing::warn!(pattern, error = %err, "unsubscribe failed");
            }
            if !wildcard::is_wildcard(pattern) {
                lock(&self.states).remove(pattern);
            }
        }
    }

    /// When a pattern targets a component instance that declares itself
    /// subscribable, ask that instance to forward the pattern — once
    /// per distinct pattern — and remember it for replay after the
    /// instance restarts.
    async fn track_instance_subscription(&self, pattern: &str) -> Result<(), RuleHubError> {
        let Some(instance) = StateId::new(pattern).component_namespace().map(str::to_string)
        else {
            return Ok(());
        };
        let component: StateId = format!("{COMPONENT_PREFIX}{instance}").into();
        let subscribable = lock(&self.objects)
            .get(&component)
            .is_some_and(rulehub_domain::object::ObjectMeta::subscribable);
        if !subscribable {
            return Ok(());
        }
        let alive: StateId = format!("{COMPONENT_PREFIX}{instance}.alive").into();
        let new_pattern = {
            let mut registry = lock(&self.registry);
            let tracked = registry.instance_subs.entry(alive).or_default();
            if tracked.iter().any(|existing| existing == pattern) {
                false
            } else {
                tracked.push(pattern.to_string());
                true
            }
        };
        if new_pattern {
            self.store.request_instance_subscribe(&instance, pattern).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineConfig;
    use crate::testing::{counter, engine_with, engine_with_config, state_object, subscribable_component};
    use rulehub_domain::state::StateValue;
    use serde_json::json;

    #[tokio::test]
    async fn should_invoke_callback_exactly_once_per_matching_change() {
        let engine = engine_with(vec![state_object("hm.0.light", "boolean")], vec![]);
        let (count, calls) = counter();
        engine
            .subscribe("hm.0.light", &"rule.test".into(), calls)
            .await
            .unwrap();

        engine
            .handle_state_change(&"hm.0.light".into(), Some(StateValue::new(true)))
            .await;
        assert_eq!(count(), 1);

        engine
            .handle_state_change(&"hm.0.light".into(), Some(StateValue::new(false)))
            .await;
        assert_eq!(count(), 2);
    }

    #[tokio::test]
    async fn should_not_invoke_callback_when_value_is_unchanged() {
        let engine = engine_with(vec![state_object("hm.0.light", "boolean")], vec![]);
        let (count, calls) = counter();
        engine
            .subscribe("hm.0.light", &"rule.test".into(), calls)
            .await
            .unwrap();

        engine
            .handle_state_change(&"hm.0.light".into(), Some(StateValue::new(true)))
            .await;
        engine
            .handle_state_change(&"hm.0.light".into(), Some(StateValue::new(true)))
            .await;
        // Bare subscriptions normalize to `change: ne`.
        assert_eq!(count(), 1);
    }

    #[tokio::test]
    async fn should_stop_invoking_after_unsubscribe_by_handle() {
        let engine = engine_with(vec![], vec![]);
        let (count, calls) = counter();
        let handle = engine
            .subscribe("hm.0.light", &"rule.test".into(), calls)
            .await
            .unwrap();

        assert!(engine.unsubscribe(handle).await);
        assert!(!engine.unsubscribe(handle).await);

        engine
            .handle_state_change(&"hm.0.light".into(), Some(StateValue::new(true)))
            .await;
        assert_eq!(count(), 0);
    }

    #[tokio::test]
    async fn should_stop_invoking_after_unsubscribe_by_owner_and_id() {
        let engine = engine_with(vec![], vec![]);
        let owner: RuleId = "rule.test".into();
        let (count, calls) = counter();
        engine.subscribe("hm.0.light", &owner, calls).await.unwrap();

        assert!(engine.unsubscribe_matching(&owner, "hm.0.light").await);
        assert!(!engine.unsubscribe_matching(&owner, "hm.0.light").await);

        engine
            .handle_state_change(&"hm.0.light".into(), Some(StateValue::new(true)))
            .await;
        assert_eq!(count(), 0);
    }

    #[tokio::test]
    async fn should_reject_empty_pattern_id() {
        let engine = engine_with(vec![], vec![]);
        let result = engine
            .subscribe(PatternSpec::for_id(""), &"rule.test".into(), |_| Ok(()))
            .await;
        assert!(matches!(
            result,
            Err(RuleHubError::Validation(ValidationError::EmptyPatternId))
        ));
    }

    #[tokio::test]
    async fn should_qualify_dot_free_ids_with_the_namespace() {
        let engine = engine_with(vec![], vec![]);
        let (count, calls) = counter();
        engine.subscribe("answer", &"rule.test".into(), calls).await.unwrap();

        engine
            .handle_state_change(&"rules.0.answer".into(), Some(StateValue::new(42)))
            .await;
        assert_eq!(count(), 1);

        let grouped = engine.subscriptions();
        assert!(grouped.contains_key("rules.0.answer"));
    }

    #[tokio::test]
    async fn should_continue_dispatch_after_a_failing_callback() {
        let engine = engine_with(vec![], vec![]);
        engine
            .subscribe("hm.0.light", &"rule.bad".into(), |_| {
                Err(ValidationError::EmptyPatternId.into())
            })
            .await
            .unwrap();
        let (count, calls) = counter();
        engine.subscribe("hm.0.light", &"rule.good".into(), calls).await.unwrap();

        engine
            .handle_state_change(&"hm.0.light".into(), Some(StateValue::new(true)))
            .await;
        assert_eq!(count(), 1);
    }

    #[tokio::test]
    async fn should_ref_count_store_subscriptions_per_pattern() {
        let config = EngineConfig {
            cache_all: false,
            ..EngineConfig::default()
        };
        let engine = engine_with_config(vec![], vec![], config);
        let owner: RuleId = "rule.test".into();

        let first = engine.subscribe("hm.0.light", &owner, |_| Ok(())).await.unwrap();
        let second = engine.subscribe("hm.0.light", &owner, |_| Ok(())).await.unwrap();
        // One upstream subscription for two local ones.
        assert_eq!(engine.store.subscribed(), vec!["hm.0.light".to_string()]);

        engine.unsubscribe(first).await;
        assert!(engine.store.unsubscribed().is_empty());

        engine.unsubscribe(second).await;
        assert_eq!(engine.store.unsubscribed(), vec!["hm.0.light".to_string()]);
    }

    #[tokio::test]
    async fn should_prefetch_current_values_when_subscribing() {
        let config = EngineConfig {
            cache_all: false,
            ..EngineConfig::default()
        };
        let engine = engine_with_config(vec![], vec![("hm.0.temp", json!(19.0))], config);
        engine
            .subscribe("hm.0.temp", &"rule.test".into(), |_| Ok(()))
            .await
            .unwrap();
        // The cached value serves as old state on the first change.
        let (seen_old, calls) = crate::testing::capture_old_values();
        engine.subscribe("hm.0.temp", &"rule.test".into(), calls).await.unwrap();
        engine
            .handle_state_change(&"hm.0.temp".into(), Some(StateValue::new(21.0)))
            .await;
        assert_eq!(seen_old(), vec![Some(json!(19.0))]);
    }

    #[tokio::test]
    async fn should_request_instance_subscription_once_per_pattern() {
        let engine = engine_with(
            vec![
                subscribable_component("mqtt.0"),
                state_object("mqtt.0.topic.value", "string"),
            ],
            vec![],
        );
        let owner: RuleId = "rule.test".into();
        engine
            .subscribe("mqtt.0.topic.value", &owner, |_| Ok(()))
            .await
            .unwrap();
        engine
            .subscribe("mqtt.0.topic.value", &owner, |_| Ok(()))
            .await
            .unwrap();
        assert_eq!(
            engine.store.instance_requests(),
            vec![("mqtt.0".to_string(), "mqtt.0.topic.value".to_string())]
        );
    }

    #[tokio::test]
    async fn should_not_request_instance_subscription_for_plain_components() {
        let engine = engine_with(vec![state_object("hue.0.lamp.on", "boolean")], vec![]);
        engine
            .subscribe("hue.0.lamp.on", &"rule.test".into(), |_| Ok(()))
            .await
            .unwrap();
        assert!(engine.store.instance_requests().is_empty());
    }

    #[tokio::test]
    async fn should_group_subscriptions_by_target_id() {
        let engine = engine_with(vec![], vec![]);
        let owner: RuleId = "rule.a".into();
        engine.subscribe("hm.0.light", &owner, |_| Ok(())).await.unwrap();
        engine.subscribe("hm.0.light", &"rule.b".into(), |_| Ok(())).await.unwrap();
        engine.subscribe("hm.0.blind", &owner, |_| Ok(())).await.unwrap();

        let grouped = engine.subscriptions();
        assert_eq!(grouped.get("hm.0.light").map(Vec::len), Some(2));
        assert_eq!(grouped.get("hm.0.blind").map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn should_dispatch_wildcard_subscriptions() {
        let engine = engine_with(vec![], vec![]);
        let (count, calls) = counter();
        engine
            .subscribe("hm-rpc.0.*", &"rule.test".into(), calls)
            .await
            .unwrap();

        engine
            .handle_state_change(&"hm-rpc.0.ABC.STATE".into(), Some(StateValue::new(1)))
            .await;
        engine
            .handle_state_change(&"hue.0.lamp".into(), Some(StateValue::new(1)))
            .await;
        assert_eq!(count(), 1);
    }
}
