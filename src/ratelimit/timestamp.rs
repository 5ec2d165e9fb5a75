//! Request timestamps.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A point in time, in whole seconds since the Unix epoch.
///
/// Timestamps are always supplied by the caller; nothing in this crate reads
/// the system clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Placeholder for "no prior request". Orders before every other timestamp.
    pub const BEGINNING_OF_TIME: Timestamp = Timestamp(i64::MIN);

    /// Create a timestamp from seconds since the epoch.
    ///
    /// `i64::MIN` is the sentinel and is not a usable request time.
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs)
    }

    /// Seconds since the epoch.
    pub const fn as_secs(&self) -> i64 {
        self.0
    }

    /// Whether this is the sentinel rather than a real request time.
    pub fn is_sentinel(&self) -> bool {
        *self == Self::BEGINNING_OF_TIME
    }

    /// Start of the window of length `window` that ends at this timestamp.
    ///
    /// Only whole seconds of `window` are applied; the limiter rejects windows
    /// with a fractional part at construction. Saturates at the sentinel
    /// instead of overflowing.
    pub fn window_start(&self, window: Duration) -> Timestamp {
        let secs = i64::try_from(window.as_secs()).unwrap_or(i64::MAX);
        Timestamp(self.0.saturating_sub(secs))
    }
}

impl From<i64> for Timestamp {
    fn from(secs: i64) -> Self {
        Self(secs)
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Self(dt.timestamp())
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_sentinel() {
            write!(f, "-inf")
        } else {
            write!(f, "{}", self.0)
        }
    }
}
