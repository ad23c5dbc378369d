//! Identifier types: dotted state ids, rule names, and UUID-backed handles.

use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Dotted hierarchical key addressing one state
/// (`namespace.device.channel.state`).
///
/// Immutable once assigned; used as map key everywhere. The enclosing
/// channel and device are not stored anywhere — they are derived
/// structurally by stripping trailing segments.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateId(String);

impl StateId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the id already carries a namespace (contains a dot).
    #[must_use]
    pub fn is_qualified(&self) -> bool {
        self.0.contains('.')
    }

    /// Prefix the id with `namespace`.
    #[must_use]
    pub fn qualify(&self, namespace: &str) -> Self {
        Self(format!("{namespace}.{}", self.0))
    }

    /// Parent channel id — the id with its last segment stripped.
    /// `None` when there is nothing left to strip.
    #[must_use]
    pub fn channel_id(&self) -> Option<Self> {
        let (parent, _) = self.0.rsplit_once('.')?;
        if parent.is_empty() {
            return None;
        }
        Some(Self(parent.to_string()))
    }

    /// Parent device id — the id with its last two segments stripped.
    #[must_use]
    pub fn device_id(&self) -> Option<Self> {
        self.channel_id()?.channel_id()
    }

    /// Component namespace — the first two segments (`adapter.instance`
    /// style). `None` when the id has fewer than three segments.
    #[must_use]
    pub fn component_namespace(&self) -> Option<&str> {
        let first = self.0.find('.')?;
        let second = self.0[first + 1..].find('.')? + first + 1;
        Some(&self.0[..second])
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StateId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for StateId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl AsRef<str> for StateId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for StateId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Host-assigned name of the rule that owns a subscription or schedule.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleId(String);

impl RuleId {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RuleId {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

macro_rules! define_handle {
    ($(#[doc = $doc:expr])* $name:ident) => {
        $(#[doc = $doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(uuid::Uuid);

        impl Default for $name {
            fn default() -> Self {
                Self(uuid::Uuid::new_v4())
            }
        }

        impl $name {
            /// Generate a new random handle.
            #[must_use]
            pub fn new() -> Self {
                Self::default()
            }

            /// Access the inner UUID.
            #[must_use]
            pub fn as_uuid(self) -> uuid::Uuid {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                uuid::Uuid::parse_str(s).map(Self)
            }
        }
    };
}

define_handle!(
    /// Handle identifying one live subscription.
    SubscriptionId
);

define_handle!(
    /// Handle identifying one live cron or astro schedule.
    ScheduleId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_strip_segments_for_channel_and_device() {
        let id = StateId::new("hm-rpc.0.ABC123.1.STATE");
        assert_eq!(id.channel_id().unwrap().as_str(), "hm-rpc.0.ABC123.1");
        assert_eq!(id.device_id().unwrap().as_str(), "hm-rpc.0.ABC123");
    }

    #[test]
    fn should_return_none_when_nothing_left_to_strip() {
        let id = StateId::new("alone");
        assert!(id.channel_id().is_none());
        assert!(id.device_id().is_none());
    }

    #[test]
    fn should_extract_component_namespace() {
        let id = StateId::new("hm-rpc.0.ABC123.1.STATE");
        assert_eq!(id.component_namespace(), Some("hm-rpc.0"));
        assert_eq!(StateId::new("a.b").component_namespace(), None);
    }

    #[test]
    fn should_qualify_bare_ids() {
        let id = StateId::new("myVar");
        assert!(!id.is_qualified());
        assert_eq!(id.qualify("rules.0").as_str(), "rules.0.myVar");
    }

    #[test]
    fn should_order_ids_lexicographically() {
        let mut ids = vec![StateId::new("b.1"), StateId::new("a.2"), StateId::new("a.1")];
        ids.sort();
        let ordered: Vec<&str> = ids.iter().map(StateId::as_str).collect();
        assert_eq!(ordered, vec!["a.1", "a.2", "b.1"]);
    }

    #[test]
    fn should_generate_unique_handles() {
        assert_ne!(SubscriptionId::new(), SubscriptionId::new());
        assert_ne!(ScheduleId::new(), ScheduleId::new());
    }

    #[test]
    fn should_roundtrip_state_id_through_serde_json() {
        let id = StateId::new("hm.0.light");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"hm.0.light\"");
        let parsed: StateId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }
}
