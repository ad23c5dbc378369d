//! Timestamp conventions.
//!
//! All persisted times are UTC; the scheduler converts to the local
//! zone only for day-boundary arithmetic.

use chrono::{DateTime, Utc};

/// UTC timestamp used for `ts`, `lc`, event times, etc.
pub type Timestamp = DateTime<Utc>;

/// Return the current UTC time.
#[must_use]
pub fn now() -> Timestamp {
    Utc::now()
}

/// The zero timestamp, used for the empty value of a deletion event.
#[must_use]
pub fn epoch() -> Timestamp {
    DateTime::UNIX_EPOCH
}
