//! Pattern compilation — subscription conditions over change events.
//!
//! A [`PatternSpec`] mirrors the structured condition consumed from
//! rule scripts. Compilation maps every recognized field to exactly one
//! [`Condition`]; unrecognized fields are dropped by serde so older
//! engines accept newer rule sets. The compiled form is derived once at
//! subscription time and never changes afterwards.

use std::cmp::Ordering;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use crate::error::ValidationError;
use crate::event::EventObj;
use crate::time::Timestamp;
use crate::wildcard;

/// Relation tested by value and change conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cmp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl Cmp {
    fn holds(self, ordering: Option<Ordering>) -> bool {
        match self {
            Self::Eq => ordering == Some(Ordering::Equal),
            Self::Ne => ordering.is_none_or(|o| o != Ordering::Equal),
            Self::Gt => ordering == Some(Ordering::Greater),
            Self::Ge => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
            Self::Lt => ordering == Some(Ordering::Less),
            Self::Le => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
        }
    }
}

/// Relation between the new and the old value of a change event.
///
/// `Any` matches every event and therefore compiles to no condition at
/// all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Any,
}

impl ChangeKind {
    fn as_cmp(self) -> Option<Cmp> {
        match self {
            Self::Eq => Some(Cmp::Eq),
            Self::Ne => Some(Cmp::Ne),
            Self::Gt => Some(Cmp::Gt),
            Self::Ge => Some(Cmp::Ge),
            Self::Lt => Some(Cmp::Lt),
            Self::Le => Some(Cmp::Le),
            Self::Any => None,
        }
    }
}

/// How the conditions of one pattern combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Logic {
    #[default]
    And,
    Or,
}

/// The `id` field of a pattern.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum IdSpec {
    /// Exact id, or a `*` wildcard over ids.
    Text(String),
    /// Explicit list of ids, each matched exactly.
    List(Vec<String>),
    /// Regular expression over the full id.
    Regex {
        /// The expression source.
        regex: String,
    },
}

/// Structured subscription specification.
///
/// All fields are optional; an empty specification matches every event
/// under `and` logic and none under `or` logic.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PatternSpec {
    pub id: Option<IdSpec>,
    pub change: Option<ChangeKind>,
    pub logic: Logic,
    pub val: Option<Value>,
    pub val_ne: Option<Value>,
    pub val_gt: Option<Value>,
    pub val_ge: Option<Value>,
    pub val_lt: Option<Value>,
    pub val_le: Option<Value>,
    pub old_val: Option<Value>,
    pub old_val_ne: Option<Value>,
    pub old_val_gt: Option<Value>,
    pub old_val_ge: Option<Value>,
    pub old_val_lt: Option<Value>,
    pub old_val_le: Option<Value>,
    pub ack: Option<bool>,
    pub old_ack: Option<bool>,
    pub from: Option<String>,
    pub from_ne: Option<String>,
    pub ts_gt: Option<Timestamp>,
    pub ts_lt: Option<Timestamp>,
    pub lc_gt: Option<Timestamp>,
    pub lc_lt: Option<Timestamp>,
}

impl PatternSpec {
    /// Normalization of a bare target: the id with `change: ne`.
    #[must_use]
    pub fn for_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(IdSpec::Text(id.into())),
            change: Some(ChangeKind::Ne),
            ..Self::default()
        }
    }

    /// Normalization of a bare regular-expression target.
    #[must_use]
    pub fn for_regex(regex: impl Into<String>) -> Self {
        Self {
            id: Some(IdSpec::Regex {
                regex: regex.into(),
            }),
            change: Some(ChangeKind::Ne),
            ..Self::default()
        }
    }

    /// Normalization of a bare id-list target.
    #[must_use]
    pub fn for_ids(ids: Vec<String>) -> Self {
        Self {
            id: Some(IdSpec::List(ids)),
            change: Some(ChangeKind::Ne),
            ..Self::default()
        }
    }

    /// The raw textual id of this pattern, if it has a single one.
    /// Used as the store-level subscription pattern and as the grouping
    /// key for introspection.
    #[must_use]
    pub fn id_text(&self) -> Option<&str> {
        match &self.id {
            Some(IdSpec::Text(text)) => Some(text),
            _ => None,
        }
    }

    /// Compile the specification into its immutable matcher form.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::BadIdExpression`] when an id regex or
    /// wildcard fails to compile.
    pub fn compile(&self) -> Result<CompiledPattern, ValidationError> {
        let mut conditions = Vec::new();
        if let Some(id) = &self.id {
            conditions.push(Condition::Id(IdMatcher::compile(id)?));
        }
        if let Some(cmp) = self.change.and_then(ChangeKind::as_cmp) {
            conditions.push(Condition::Change(cmp));
        }
        let vals = [
            (Cmp::Eq, &self.val),
            (Cmp::Ne, &self.val_ne),
            (Cmp::Gt, &self.val_gt),
            (Cmp::Ge, &self.val_ge),
            (Cmp::Lt, &self.val_lt),
            (Cmp::Le, &self.val_le),
        ];
        for (cmp, value) in vals {
            if let Some(value) = value {
                conditions.push(Condition::Val(cmp, value.clone()));
            }
        }
        let old_vals = [
            (Cmp::Eq, &self.old_val),
            (Cmp::Ne, &self.old_val_ne),
            (Cmp::Gt, &self.old_val_gt),
            (Cmp::Ge, &self.old_val_ge),
            (Cmp::Lt, &self.old_val_lt),
            (Cmp::Le, &self.old_val_le),
        ];
        for (cmp, value) in old_vals {
            if let Some(value) = value {
                conditions.push(Condition::OldVal(cmp, value.clone()));
            }
        }
        if let Some(ack) = self.ack {
            conditions.push(Condition::Ack(ack));
        }
        if let Some(ack) = self.old_ack {
            conditions.push(Condition::OldAck(ack));
        }
        if let Some(from) = &self.from {
            conditions.push(Condition::From(from.clone()));
        }
        if let Some(from) = &self.from_ne {
            conditions.push(Condition::FromNot(from.clone()));
        }
        if let Some(t) = self.ts_gt {
            conditions.push(Condition::TsAfter(t));
        }
        if let Some(t) = self.ts_lt {
            conditions.push(Condition::TsBefore(t));
        }
        if let Some(t) = self.lc_gt {
            conditions.push(Condition::LcAfter(t));
        }
        if let Some(t) = self.lc_lt {
            conditions.push(Condition::LcBefore(t));
        }
        Ok(CompiledPattern {
            logic: self.logic,
            conditions,
        })
    }
}

impl From<&str> for PatternSpec {
    fn from(id: &str) -> Self {
        Self::for_id(id)
    }
}

/// Compiled matcher for the `id` field.
#[derive(Debug, Clone)]
pub enum IdMatcher {
    Exact(String),
    Wild(Regex),
    Regex(Regex),
    List(Vec<String>),
}

impl IdMatcher {
    fn compile(spec: &IdSpec) -> Result<Self, ValidationError> {
        match spec {
            IdSpec::Text(text) if wildcard::is_wildcard(text) => {
                Ok(Self::Wild(wildcard::compile(text)?))
            }
            IdSpec::Text(text) => Ok(Self::Exact(text.clone())),
            IdSpec::List(ids) => Ok(Self::List(ids.clone())),
            IdSpec::Regex { regex } => Ok(Self::Regex(Regex::new(regex)?)),
        }
    }

    #[must_use]
    pub fn matches(&self, id: &str) -> bool {
        match self {
            Self::Exact(text) => text == id,
            Self::Wild(re) | Self::Regex(re) => re.is_match(id),
            Self::List(ids) => ids.iter().any(|candidate| candidate == id),
        }
    }
}

/// One compiled test over an [`EventObj`].
///
/// A fixed variant set dispatched by `match` — the engine never looks
/// conditions up by field name at runtime.
#[derive(Debug, Clone)]
pub enum Condition {
    Id(IdMatcher),
    Change(Cmp),
    Val(Cmp, Value),
    OldVal(Cmp, Value),
    Ack(bool),
    OldAck(bool),
    From(String),
    FromNot(String),
    TsAfter(Timestamp),
    TsBefore(Timestamp),
    LcAfter(Timestamp),
    LcBefore(Timestamp),
}

impl Condition {
    fn eval(&self, event: &EventObj) -> bool {
        let old = event.old_state.as_ref();
        match self {
            Self::Id(matcher) => matcher.matches(event.id.as_str()),
            Self::Change(cmp) => match old {
                // A value appearing out of nothing counts as changed.
                None => *cmp == Cmp::Ne,
                Some(old) => cmp.holds(loose_cmp(&event.new_state.val, &old.val)),
            },
            Self::Val(cmp, rhs) => cmp.holds(loose_cmp(&event.new_state.val, rhs)),
            Self::OldVal(cmp, rhs) => match old {
                None => *cmp == Cmp::Ne,
                Some(old) => cmp.holds(loose_cmp(&old.val, rhs)),
            },
            Self::Ack(expected) => event.new_state.ack == *expected,
            Self::OldAck(expected) => old.is_some_and(|o| o.ack == *expected),
            Self::From(from) => event.new_state.from == *from,
            Self::FromNot(from) => event.new_state.from != *from,
            Self::TsAfter(t) => event.new_state.ts > *t,
            Self::TsBefore(t) => event.new_state.ts < *t,
            Self::LcAfter(t) => event.new_state.lc > *t,
            Self::LcBefore(t) => event.new_state.lc < *t,
        }
    }
}

/// An immutable, ordered condition list with its combinator.
#[derive(Debug, Clone)]
pub struct CompiledPattern {
    logic: Logic,
    conditions: Vec<Condition>,
}

impl CompiledPattern {
    /// Evaluate the pattern against one event.
    ///
    /// `And` short-circuits to false on the first failing condition and
    /// matches everything when empty; `Or` short-circuits to true on
    /// the first passing condition and matches nothing when empty.
    #[must_use]
    pub fn matches(&self, event: &EventObj) -> bool {
        match self.logic {
            Logic::And => self.conditions.iter().all(|c| c.eval(event)),
            Logic::Or => self.conditions.iter().any(|c| c.eval(event)),
        }
    }

    /// Number of compiled conditions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.conditions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }
}

/// Loose ordering over JSON values: numbers, booleans, and numeric
/// strings compare by coerced number; otherwise both sides compare as
/// strings. `None` when the values are not comparable at all.
fn loose_cmp(a: &Value, b: &Value) -> Option<Ordering> {
    if a == b {
        return Some(Ordering::Equal);
    }
    if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
        return x.partial_cmp(&y);
    }
    match (a, b) {
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
