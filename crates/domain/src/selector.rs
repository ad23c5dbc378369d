//! Selector grammar — parsing of `name{native=value}[common=value](enum=value)`.
//!
//! Parsing is a single left-to-right pass without backtracking. The
//! three bracket kinds may each appear any number of times, but a group
//! must be closed before another one opens. Resolution against the
//! object graph happens in the engine crate; this module only produces
//! the filter structure.

use serde_json::Value;

use crate::error::{GroupKind, SelectorError};
use crate::wildcard;

/// A filter value: exact text, or a wildcard compiled once at parse
/// time and reused for every candidate.
#[derive(Debug, Clone)]
pub enum ValueMatcher {
    Exact(String),
    Wild(regex::Regex),
}

impl ValueMatcher {
    /// Compile a raw filter value. Wildcards become anchored regexes;
    /// anything else matches exactly.
    #[must_use]
    pub fn compile(raw: &str) -> Self {
        if wildcard::is_wildcard(raw)
            && let Ok(re) = wildcard::compile(raw)
        {
            return Self::Wild(re);
        }
        Self::Exact(raw.to_string())
    }

    /// Match against plain text (ids, enum memberships).
    #[must_use]
    pub fn matches_str(&self, candidate: &str) -> bool {
        match self {
            Self::Exact(text) => text == candidate,
            Self::Wild(re) => re.is_match(candidate),
        }
    }

    /// Match against a JSON attribute value. Exact matchers compare
    /// loosely (string, number, and boolean renderings all count);
    /// wildcards match the rendered text.
    #[must_use]
    pub fn matches_value(&self, candidate: &Value) -> bool {
        match self {
            Self::Exact(text) => match candidate {
                Value::String(s) => s == text,
                Value::Number(n) => match (n.as_f64(), text.trim().parse::<f64>()) {
                    (Some(a), Ok(b)) => (a - b).abs() < f64::EPSILON,
                    _ => false,
                },
                Value::Bool(b) => text == if *b { "true" } else { "false" },
                _ => false,
            },
            Self::Wild(re) => re.is_match(&render(candidate)),
        }
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// One `attr=value` filter from a common or native group. A missing
/// value (`[role]`) only requires the attribute to be present.
#[derive(Debug, Clone)]
pub struct AttrFilter {
    pub attr: String,
    pub value: Option<ValueMatcher>,
}

/// The parsed form of a selector string.
#[derive(Debug, Clone, Default)]
pub struct Selector {
    /// Free text before the first group: a resolution mode (`channel`,
    /// `device`, `state`), an id wildcard, or empty.
    pub name: String,
    /// `[common=value]` filters.
    pub common: Vec<AttrFilter>,
    /// `{native=value}` filters.
    pub native: Vec<AttrFilter>,
    /// `(enum=value)` filters, normalized to matchers over
    /// `enum.<attr>.<value>` membership ids.
    pub enums: Vec<ValueMatcher>,
    /// `state.id` filters extracted from any group; applied uniformly
    /// at the leaf level.
    pub state_ids: Vec<ValueMatcher>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Group {
    None,
    Native,
    Common,
    Enum,
}

impl Group {
    fn kind(self) -> Option<GroupKind> {
        match self {
            Self::None => None,
            Self::Native => Some(GroupKind::Native),
            Self::Common => Some(GroupKind::Common),
            Self::Enum => Some(GroupKind::Enum),
        }
    }
}

impl Selector {
    /// Parse a selector string.
    ///
    /// # Errors
    ///
    /// [`SelectorError::NestedGroup`] when a bracket opens while
    /// another group is still open, [`SelectorError::UnterminatedGroup`]
    /// when the input ends inside a group.
    pub fn parse(input: &str) -> Result<Self, SelectorError> {
        let mut selector = Self::default();
        let mut group = Group::None;
        let mut buffer = String::new();

        for ch in input.chars() {
            let open = match ch {
                '{' => Some((Group::Native, GroupKind::Native)),
                '[' => Some((Group::Common, GroupKind::Common)),
                '(' => Some((Group::Enum, GroupKind::Enum)),
                _ => None,
            };
            if let Some((next, kind)) = open {
                if group != Group::None {
                    return Err(SelectorError::NestedGroup(kind));
                }
                group = next;
                buffer.clear();
                continue;
            }
            let closes = matches!(
                (ch, group),
                ('}', Group::Native) | (']', Group::Common) | (')', Group::Enum)
            );
            if closes {
                selector.push_filter(group, &buffer);
                group = Group::None;
                buffer.clear();
                continue;
            }
            match group {
                Group::None => selector.name.push(ch),
                _ => buffer.push(ch),
            }
        }

        if let Some(kind) = group.kind() {
            return Err(SelectorError::UnterminatedGroup(kind));
        }
        selector.name = selector.name.trim().to_string();
        Ok(selector)
    }

    fn push_filter(&mut self, group: Group, raw: &str) {
        let (attr, value) = split_filter(raw);
        // `state.id` filters leave their group and join the shared
        // leaf-level list.
        if attr == "state.id" {
            if let Some(value) = value {
                self.state_ids.push(ValueMatcher::compile(&value));
            }
            return;
        }
        match group {
            Group::Common => self.common.push(AttrFilter {
                attr,
                value: value.as_deref().map(ValueMatcher::compile),
            }),
            Group::Native => self.native.push(AttrFilter {
                attr,
                value: value.as_deref().map(ValueMatcher::compile),
            }),
            Group::Enum => {
                let membership = format!("enum.{attr}.{}", value.unwrap_or_default());
                self.enums.push(ValueMatcher::compile(&membership));
            }
            Group::None => {}
        }
    }
}

/// Split `attr=value` on the first `=`. The attribute is trimmed; the
/// value is trimmed and stripped of one matching pair of single or
/// double quotes.
fn split_filter(raw: &str) -> (String, Option<String>) {
    match raw.split_once('=') {
        None => (raw.trim().to_string(), None),
        Some((attr, value)) => (
            attr.trim().to_string(),
            Some(strip_quotes(value.trim()).to_string()),
        ),
    }
}

fn strip_quotes(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}
