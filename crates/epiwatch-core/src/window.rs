//! Fixed-length observation windows aligned to the Unix epoch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Ordinal of an observation window since the epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WindowIndex(pub i64);

/// Window length, in whole seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSpec {
    secs: i64,
}

impl WindowSpec {
    /// `secs` must be positive; [`EngineConfig::validate`](crate::EngineConfig::validate)
    /// guarantees this for configured windows.
    pub fn new(secs: u64) -> Self {
        Self {
            secs: (secs as i64).max(1),
        }
    }

    pub fn secs(&self) -> i64 {
        self.secs
    }

    pub fn index_of(&self, ts: DateTime<Utc>) -> WindowIndex {
        WindowIndex(ts.timestamp().div_euclid(self.secs))
    }

    /// Instant at which the window closes (exclusive end).
    pub fn end_of(&self, index: WindowIndex) -> DateTime<Utc> {
        index
            .0
            .checked_add(1)
            .and_then(|n| n.checked_mul(self.secs))
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}
