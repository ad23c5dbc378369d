//! Anchored wildcard compilation shared by patterns and selectors.

use regex::Regex;

/// Whether a filter value needs wildcard matching at all.
#[must_use]
pub fn is_wildcard(value: &str) -> bool {
    value.contains('*')
}

/// Compile a `*` wildcard into an anchored regular expression: every
/// literal character is escaped, `*` becomes `.*`, and the whole
/// expression is pinned with `^…$`.
pub fn compile(value: &str) -> Result<Regex, regex::Error> {
    let body = value
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&format!("^{body}$"))
}
