//! Object metadata — the structural description of one id.
//!
//! Objects place an id in the state/channel/device hierarchy and carry
//! its declared attributes. They are read-mostly: the engine caches
//! them and derives channel/device relationships by stripping trailing
//! id segments.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::id::StateId;

/// Namespace prefix of enumeration objects (rooms, functions, …).
pub const ENUM_PREFIX: &str = "enum.";

/// What kind of node an object describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    State,
    Channel,
    Device,
    #[default]
    Other,
}

/// Structural metadata for one id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub id: StateId,
    pub kind: ObjectKind,
    /// Declared common attributes (`role`, `type`, `min`, `max`, …).
    #[serde(default)]
    pub common: Map<String, Value>,
    /// Backend-specific attributes.
    #[serde(default)]
    pub native: Map<String, Value>,
}

impl ObjectMeta {
    #[must_use]
    pub fn new(id: impl Into<StateId>, kind: ObjectKind) -> Self {
        Self {
            id: id.into(),
            kind,
            common: Map::new(),
            native: Map::new(),
        }
    }

    #[must_use]
    pub fn with_common(mut self, attr: impl Into<String>, value: impl Into<Value>) -> Self {
        self.common.insert(attr.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_native(mut self, attr: impl Into<String>, value: impl Into<Value>) -> Self {
        self.native.insert(attr.into(), value.into());
        self
    }

    #[must_use]
    pub fn common_value(&self, attr: &str) -> Option<&Value> {
        self.common.get(attr)
    }

    #[must_use]
    pub fn native_value(&self, attr: &str) -> Option<&Value> {
        self.native.get(attr)
    }

    /// Declared value type of a state object (`common.type`).
    #[must_use]
    pub fn declared_type(&self) -> Option<&str> {
        self.common.get("type").and_then(Value::as_str)
    }

    /// Declared lower bound for numeric values.
    #[must_use]
    pub fn min(&self) -> Option<f64> {
        self.common.get("min").and_then(Value::as_f64)
    }

    /// Declared upper bound for numeric values.
    #[must_use]
    pub fn max(&self) -> Option<f64> {
        self.common.get("max").and_then(Value::as_f64)
    }

    /// Whether this object is an enumeration (id under `enum.`).
    #[must_use]
    pub fn is_enum(&self) -> bool {
        self.id.as_str().starts_with(ENUM_PREFIX)
    }

    /// Member ids of an enumeration object (`common.members`).
    pub fn enum_members(&self) -> impl Iterator<Item = &str> {
        self.common
            .get("members")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(Value::as_str)
    }

    /// Whether a component object declares itself subscribable
    /// (`common.subscribable`), i.e. it only forwards state changes
    /// that were explicitly requested.
    #[must_use]
    pub fn subscribable(&self) -> bool {
        self.common
            .get("subscribable")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}
