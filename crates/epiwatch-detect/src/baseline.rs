//! Rolling per-bucket baselines of observation-window counts.
//!
//! Each bucket keeps an exponentially-forgetting Welford accumulator over
//! closed window counts plus the running count of its open window, so memory
//! is O(1) per bucket no matter how long the horizon is. With a horizon of
//! `H` windows every closed sample's weight is multiplied by `1 - 1/H` when
//! the next one arrives; history older than the horizon fades out instead of
//! being stored and expired.

use std::collections::HashMap;

use epiwatch_core::{BucketId, ErrorCode, WindowIndex};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BaselineError {
    #[error("insufficient baseline for {bucket}: {have} of {need} samples")]
    InsufficientBaseline {
        bucket: BucketId,
        have: u64,
        need: u64,
    },
}

impl BaselineError {
    pub fn code(&self) -> ErrorCode {
        ErrorCode::InsufficientBaseline
    }
}

/// Rolling statistics for one (disease, geo-bucket) pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BaselineWindow {
    pub mean: f64,
    pub variance: f64,
    /// Samples inside the horizon (capped at the horizon length).
    pub sample_count: u64,
}

/// A window that has just closed, with its final count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClosedWindow {
    pub index: WindowIndex,
    pub count: u64,
}

#[derive(Debug, Clone, Default)]
struct RollingStats {
    weight: f64,
    mean: f64,
    m2: f64,
    sample_count: u64,
}

impl RollingStats {
    fn push(&mut self, x: f64, retain: f64, cap: u64) {
        self.weight = self.weight * retain + 1.0;
        let delta = x - self.mean;
        self.mean += delta / self.weight;
        self.m2 = self.m2 * retain + delta * (x - self.mean);
        self.sample_count = (self.sample_count + 1).min(cap);
    }

    fn window(&self) -> BaselineWindow {
        let variance = if self.weight > 0.0 {
            (self.m2 / self.weight).max(0.0)
        } else {
            0.0
        };
        BaselineWindow {
            mean: self.mean,
            variance,
            sample_count: self.sample_count,
        }
    }
}

#[derive(Debug, Clone)]
struct BucketBaseline {
    stats: RollingStats,
    current: WindowIndex,
    count: u64,
}

/// Owns the baselines for a set of buckets. Not internally synchronized:
/// exactly one pipeline shard writes to a given store.
pub struct BaselineStore {
    buckets: HashMap<BucketId, BucketBaseline>,
    horizon: u64,
    min_samples: u64,
}

impl BaselineStore {
    pub fn new(horizon_windows: u64, min_samples: u64) -> Self {
        Self {
            buckets: HashMap::new(),
            horizon: horizon_windows.max(1),
            min_samples,
        }
    }

    fn retain(&self) -> f64 {
        1.0 - 1.0 / self.horizon as f64
    }

    /// Close every window of `bucket` before `now`.
    ///
    /// Returns the closed windows oldest first: the previously open window
    /// followed by one zero-count window per elapsed empty window, at most a
    /// horizon's worth. A gap longer than the horizon discards the old
    /// statistics, since none of that history is inside the horizon any more.
    /// Closed windows are not folded into the baseline here; the caller
    /// decides per window via [`fold`](Self::fold).
    pub fn advance(&mut self, bucket: &BucketId, now: WindowIndex) -> Vec<ClosedWindow> {
        let horizon = self.horizon as i64;
        let Some(b) = self.buckets.get_mut(bucket) else {
            return Vec::new();
        };
        if b.current >= now {
            return Vec::new();
        }

        let mut closed = Vec::new();
        let elapsed = now.0 - b.current.0;
        if elapsed > horizon {
            debug!(%bucket, elapsed, "baseline gap beyond horizon, resetting");
            b.stats = RollingStats::default();
        } else {
            closed.push(ClosedWindow {
                index: b.current,
                count: b.count,
            });
        }
        let first_empty = (b.current.0 + 1).max(now.0 - horizon);
        closed.extend((first_empty..now.0).map(|i| ClosedWindow {
            index: WindowIndex(i),
            count: 0,
        }));

        b.current = now;
        b.count = 0;
        closed
    }

    /// Count one background signal into the open window of `bucket`.
    ///
    /// Creates the bucket on first use. Late signals (for a window that has
    /// already closed) are attributed to the open window. Returns the open
    /// window's running count.
    pub fn record_background(&mut self, bucket: &BucketId, at: WindowIndex) -> u64 {
        let b = self
            .buckets
            .entry(bucket.clone())
            .or_insert_with(|| BucketBaseline {
                stats: RollingStats::default(),
                current: at,
                count: 0,
            });
        b.count += 1;
        b.count
    }

    /// Fold a closed window's count into the rolling statistics.
    pub fn fold(&mut self, bucket: &BucketId, count: u64) {
        let retain = self.retain();
        let cap = self.horizon;
        if let Some(b) = self.buckets.get_mut(bucket) {
            b.stats.push(count as f64, retain, cap);
        }
    }

    /// Load historical window counts (oldest first) from a backfill source.
    ///
    /// `open` becomes the bucket's open window; the counts are treated as
    /// the windows immediately before it.
    pub fn seed(&mut self, bucket: &BucketId, counts: &[u64], open: WindowIndex) {
        let retain = self.retain();
        let cap = self.horizon;
        let b = self
            .buckets
            .entry(bucket.clone())
            .or_insert_with(|| BucketBaseline {
                stats: RollingStats::default(),
                current: open,
                count: 0,
            });
        for &c in counts {
            b.stats.push(c as f64, retain, cap);
        }
        b.current = b.current.max(open);
    }

    /// Current statistics, or `INSUFFICIENT_BASELINE` below the minimum
    /// sample count. Callers must read that as "cannot assess", not "no risk".
    pub fn get_baseline(&self, bucket: &BucketId) -> Result<BaselineWindow, BaselineError> {
        let window = self
            .buckets
            .get(bucket)
            .map(|b| b.stats.window())
            .unwrap_or(BaselineWindow {
                mean: 0.0,
                variance: 0.0,
                sample_count: 0,
            });
        if window.sample_count < self.min_samples {
            return Err(BaselineError::InsufficientBaseline {
                bucket: bucket.clone(),
                have: window.sample_count,
                need: self.min_samples,
            });
        }
        Ok(window)
    }

    /// Running count of the open window.
    pub fn open_count(&self, bucket: &BucketId) -> u64 {
        self.buckets.get(bucket).map(|b| b.count).unwrap_or(0)
    }

    pub fn open_window(&self, bucket: &BucketId) -> Option<WindowIndex> {
        self.buckets.get(bucket).map(|b| b.current)
    }

    pub fn buckets(&self) -> impl Iterator<Item = &BucketId> {
        self.buckets.keys()
    }

    /// Drop buckets whose open window is more than a horizon behind `now`.
    /// Their statistics would be reset on next use anyway.
    pub fn evict_idle(&mut self, now: WindowIndex) -> usize {
        let horizon = self.horizon as i64;
        let before = self.buckets.len();
        self.buckets.retain(|_, b| now.0 - b.current.0 <= horizon);
        before - self.buckets.len()
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket() -> BucketId {
        "r-6c147:cholera".parse().unwrap()
    }

    #[test]
    fn insufficient_until_minimum() {
        let mut store = BaselineStore::new(90, 30);
        let b = bucket();
        assert!(matches!(
            store.get_baseline(&b),
            Err(BaselineError::InsufficientBaseline { have: 0, need: 30, .. })
        ));

        store.seed(&b, &[3; 29], WindowIndex(100));
        let err = store.get_baseline(&b).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InsufficientBaseline);

        store.seed(&b, &[3], WindowIndex(100));
        let w = store.get_baseline(&b).unwrap();
        assert_eq!(w.sample_count, 30);
        assert!((w.mean - 3.0).abs() < 1e-9);
        assert!(w.variance.abs() < 1e-9);
    }

    #[test]
    fn alternating_counts_give_expected_moments() {
        let mut store = BaselineStore::new(90, 30);
        let b = bucket();
        let counts: Vec<u64> = (0..30).map(|i| if i % 2 == 0 { 8 } else { 12 }).collect();
        store.seed(&b, &counts, WindowIndex(30));
        let w = store.get_baseline(&b).unwrap();
        assert!((w.mean - 10.0).abs() < 0.1, "mean {}", w.mean);
        assert!((w.variance - 4.0).abs() < 0.2, "variance {}", w.variance);
    }

    #[test]
    fn no_forgetting_matches_plain_welford() {
        let mut stats = RollingStats::default();
        for x in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            stats.push(x, 1.0, 100);
        }
        let w = stats.window();
        assert!((w.mean - 5.0).abs() < 1e-12);
        assert!((w.variance - 4.0).abs() < 1e-12);
        assert_eq!(w.sample_count, 8);
    }

    #[test]
    fn sample_count_capped_at_horizon() {
        let mut store = BaselineStore::new(10, 5);
        let b = bucket();
        store.seed(&b, &[1; 50], WindowIndex(50));
        assert_eq!(store.get_baseline(&b).unwrap().sample_count, 10);
    }

    #[test]
    fn recent_history_dominates() {
        let mut store = BaselineStore::new(10, 5);
        let b = bucket();
        let mut counts = vec![100; 40];
        counts.extend(vec![2; 60]);
        store.seed(&b, &counts, WindowIndex(100));
        let w = store.get_baseline(&b).unwrap();
        assert!(w.mean < 3.0, "old history should have faded, mean {}", w.mean);
    }

    #[test]
    fn record_and_advance_emits_closed_and_empty_windows() {
        let mut store = BaselineStore::new(90, 30);
        let b = bucket();
        assert_eq!(store.record_background(&b, WindowIndex(10)), 1);
        assert_eq!(store.record_background(&b, WindowIndex(10)), 2);
        assert!(store.advance(&b, WindowIndex(10)).is_empty());

        let closed = store.advance(&b, WindowIndex(13));
        assert_eq!(
            closed,
            vec![
                ClosedWindow { index: WindowIndex(10), count: 2 },
                ClosedWindow { index: WindowIndex(11), count: 0 },
                ClosedWindow { index: WindowIndex(12), count: 0 },
            ]
        );
        assert_eq!(store.open_count(&b), 0);
        assert_eq!(store.open_window(&b), Some(WindowIndex(13)));
    }

    #[test]
    fn gap_beyond_horizon_resets_and_caps_empties() {
        let mut store = BaselineStore::new(5, 3);
        let b = bucket();
        store.seed(&b, &[50; 5], WindowIndex(0));
        store.record_background(&b, WindowIndex(0));

        let closed = store.advance(&b, WindowIndex(100));
        assert_eq!(closed.len(), 5);
        assert!(closed.iter().all(|w| w.count == 0));
        assert_eq!(closed[0].index, WindowIndex(95));
        assert!(store.get_baseline(&b).is_err(), "stats reset by the gap");

        for w in &closed {
            store.fold(&b, w.count);
        }
        let window = store.get_baseline(&b).unwrap();
        assert_eq!(window.mean, 0.0);
    }

    #[test]
    fn late_signal_counts_into_open_window() {
        let mut store = BaselineStore::new(90, 30);
        let b = bucket();
        store.record_background(&b, WindowIndex(5));
        store.advance(&b, WindowIndex(6));
        assert_eq!(store.record_background(&b, WindowIndex(4)), 1);
        assert_eq!(store.open_window(&b), Some(WindowIndex(6)));
    }

    #[test]
    fn evicts_only_stale_buckets() {
        let mut store = BaselineStore::new(10, 5);
        let stale = bucket();
        let fresh: BucketId = "r0c0:measles".parse().unwrap();
        store.record_background(&stale, WindowIndex(0));
        store.record_background(&fresh, WindowIndex(15));
        assert_eq!(store.evict_idle(WindowIndex(20)), 1);
        assert_eq!(store.buckets().collect::<Vec<_>>(), vec![&fresh]);
    }
}
