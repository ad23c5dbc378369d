//! Common error types used across the workspace.
//!
//! Each concern defines its own typed error and converts into the
//! top-level [`RuleHubError`] via `#[from]`. Adapters wrap backend
//! failures in [`StorageError`] instead of inventing their own enums.

use std::fmt;

/// Top-level error for every fallible engine operation.
#[derive(Debug, thiserror::Error)]
pub enum RuleHubError {
    /// Malformed selector string.
    #[error("invalid selector")]
    Selector(#[from] SelectorError),

    /// Invalid subscription or state operation input.
    #[error("validation error")]
    Validation(#[from] ValidationError),

    /// Missing or unusable engine configuration.
    #[error("configuration error")]
    Config(#[from] ConfigError),

    /// Unknown state, object, or rule id.
    #[error("not found")]
    NotFound(#[from] NotFoundError),

    /// Unusable cron expression or astro request.
    #[error("schedule error")]
    Schedule(#[from] ScheduleError),

    /// Backing store failure.
    #[error("storage error")]
    Storage(#[from] StorageError),
}

/// Which bracket group of a selector an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupKind {
    /// `{native=value}`
    Native,
    /// `[common=value]`
    Common,
    /// `(enum=value)`
    Enum,
}

impl fmt::Display for GroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Native => f.write_str("native"),
            Self::Common => f.write_str("common"),
            Self::Enum => f.write_str("enum"),
        }
    }
}

/// Malformed selector strings.
///
/// Never propagated out of resolution — the resolver returns an inert,
/// empty result carrying the error instead, so call chains need no
/// special-casing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SelectorError {
    /// A bracket group was opened but never closed.
    #[error("{0} close bracket cannot be found")]
    UnterminatedGroup(GroupKind),

    /// A bracket group was opened while another was still open.
    #[error("{0} group opened before the previous group was closed")]
    NestedGroup(GroupKind),
}

/// Invalid subscription or state-write input.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    /// An explicitly empty pattern id would match every state.
    #[error("empty pattern id would match every state")]
    EmptyPatternId,

    /// A pattern id regex failed to compile.
    #[error("invalid id expression")]
    BadIdExpression(#[from] regex::Error),

    /// The write target exists but is not a state object.
    #[error("cannot set value of non-state object \"{0}\"")]
    NotAState(String),
}

/// Missing or unusable engine configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Astro operations need geographic coordinates.
    #[error("latitude or longitude is not configured, cannot use astro")]
    MissingCoordinates,

    /// Synchronous reads need the all-cached store mode.
    #[error("synchronous state access needs the all-cached store mode, use the async form")]
    NotCached,
}

/// An id that does not resolve to anything known.
#[derive(Debug, thiserror::Error)]
#[error("{entity} \"{id}\" not found")]
pub struct NotFoundError {
    /// What kind of thing was looked up (`"State"`, `"Object"`, …).
    pub entity: &'static str,
    /// The id that failed to resolve.
    pub id: String,
}

/// Unusable cron expression or astro request.
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    /// The cron expression failed to parse.
    #[error("invalid cron expression")]
    InvalidCron(#[from] croner::errors::CronError),

    /// The astro event name is outside the fixed vocabulary.
    #[error("unknown astro event \"{0}\"")]
    UnknownAstroEvent(String),

    /// The sun never crosses the event's altitude on that date.
    #[error("astro event \"{0}\" does not occur on this date")]
    NoOccurrence(crate::astro::AstroEvent),
}

/// Backing store failure, as reported by the adapter in use.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The store rejected or failed the operation.
    #[error("store rejected the operation: {0}")]
    Backend(String),

    /// The change stream dropped events under load.
    #[error("change stream lagged, {missed} events dropped")]
    Lagged {
        /// Number of events lost.
        missed: u64,
    },
}
