//! Lazily-created trigger states, one per bucket.
//!
//! The map itself is behind a read-mostly `RwLock`; each state has its own
//! mutex, so evaluating one bucket never blocks queries on another.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use epiwatch_core::config::TriggerConfig;
use epiwatch_core::{BucketId, WindowIndex};
use epiwatch_detect::{BundleSnapshot, ZScoreResult};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info};

use crate::machine::{Transition, TransitionError, TriggerMachine};
use crate::state::TriggerState;

type Slot = Arc<Mutex<TriggerState>>;

pub struct TriggerRegistry {
    machine: TriggerMachine,
    states: RwLock<HashMap<BucketId, Slot>>,
}

impl TriggerRegistry {
    pub fn new(config: TriggerConfig) -> Self {
        Self {
            machine: TriggerMachine::new(config),
            states: RwLock::new(HashMap::new()),
        }
    }

    pub fn machine(&self) -> &TriggerMachine {
        &self.machine
    }

    fn slot(&self, bucket: &BucketId, at: DateTime<Utc>) -> Slot {
        if let Some(slot) = self.states.read().get(bucket) {
            return Arc::clone(slot);
        }
        let mut states = self.states.write();
        Arc::clone(states.entry(bucket.clone()).or_insert_with(|| {
            debug!(%bucket, "trigger state created");
            Arc::new(Mutex::new(TriggerState::new(bucket.clone(), at)))
        }))
    }

    fn existing(&self, bucket: &BucketId) -> Option<Slot> {
        self.states.read().get(bucket).cloned()
    }

    pub fn on_signal(
        &self,
        bucket: &BucketId,
        score: Option<&ZScoreResult>,
        bundle: &BundleSnapshot,
        at: DateTime<Utc>,
    ) -> Result<Option<Transition>, TransitionError> {
        let slot = self.slot(bucket, at);
        let mut state = slot.lock();
        let result = self.machine.evaluate_signal(&mut state, score, bundle, at);
        log_outcome(&result);
        result
    }

    /// Window closes for buckets that have never been evaluated are no-ops.
    pub fn on_window_closed(
        &self,
        bucket: &BucketId,
        window: WindowIndex,
        score: Option<&ZScoreResult>,
        at: DateTime<Utc>,
    ) -> Result<Option<Transition>, TransitionError> {
        let Some(slot) = self.existing(bucket) else {
            return Ok(None);
        };
        let mut state = slot.lock();
        let result = self.machine.evaluate_window_close(&mut state, window, score, at);
        log_outcome(&result);
        result
    }

    /// Read-only snapshot of one bucket.
    pub fn current_state(&self, bucket: &BucketId) -> Option<TriggerState> {
        self.existing(bucket).map(|slot| slot.lock().clone())
    }

    /// Snapshots of every bucket, ordered by bucket id.
    pub fn states(&self) -> Vec<TriggerState> {
        let slots: Vec<Slot> = self.states.read().values().cloned().collect();
        let mut out: Vec<TriggerState> = slots.iter().map(|s| s.lock().clone()).collect();
        out.sort_by(|a, b| a.bucket.cmp(&b.bucket));
        out
    }

    /// Drop GREEN/LOCKED states with no activity for `idle`. Anything with
    /// an armed or released bond, or a raised level, is kept regardless.
    ///
    /// Must not race with evaluations of the same bucket; the runtime calls
    /// it from the task that drives evaluations.
    pub fn evict_idle(&self, now: DateTime<Utc>, idle: TimeDelta) -> usize {
        let mut states = self.states.write();
        let before = states.len();
        states.retain(|_, slot| {
            let s = slot.lock();
            !(s.is_dormant() && s.last_activity + idle <= now)
        });
        let evicted = before - states.len();
        if evicted > 0 {
            debug!(evicted, "evicted idle trigger states");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.states.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.read().is_empty()
    }
}

fn log_outcome(result: &Result<Option<Transition>, TransitionError>) {
    match result {
        Ok(Some(t)) => info!(
            bucket = %t.bucket(),
            cause = ?t.cause,
            from = %t.previous_level,
            to = %t.state.alert_level,
            bond = %t.state.bond_status,
            episode = t.state.episode,
            "trigger transition"
        ),
        Ok(None) => {}
        Err(e) => error!(code = %e.code(), error = %e, "trigger transition rejected"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{AlertLevel, BondStatus};
    use epiwatch_core::config::TrustWeights;
    use epiwatch_core::{DiseaseSignature, GeoPoint, SourceClass, Thresholds};
    use epiwatch_detect::{BundleId, Significance, bundle_confidence};

    fn t0() -> DateTime<Utc> {
        "2026-03-01T08:00:00Z".parse().unwrap()
    }

    fn bucket(s: &str) -> BucketId {
        s.parse().unwrap()
    }

    fn bundle(classes: &[SourceClass]) -> BundleSnapshot {
        BundleSnapshot {
            id: BundleId(7),
            disease: DiseaseSignature::new("cholera").unwrap(),
            source_classes: classes.iter().copied().collect(),
            source_diversity: classes.len(),
            confidence: bundle_confidence(classes, &TrustWeights::default()),
            signal_count: classes.len() as u64,
            centroid: GeoPoint::new(-1.29, 36.82),
            opened_at: t0(),
            last_seen_at: t0(),
            finalized: false,
        }
    }

    fn score(z: f64) -> ZScoreResult {
        ZScoreResult {
            disease: DiseaseSignature::new("cholera").unwrap(),
            z_score: z,
            observed: 9,
            mean: 3.0,
            stddev: 2.0,
            sample_size: 45,
            confidence: 0.7,
            significance: Significance::classify(z, Thresholds::default()),
        }
    }

    #[test]
    fn states_created_lazily() {
        let registry = TriggerRegistry::new(TriggerConfig::default());
        let b = bucket("r-6c147:cholera");
        assert!(registry.current_state(&b).is_none());

        let closed = registry
            .on_window_closed(&b, WindowIndex(1), None, t0())
            .unwrap();
        assert!(closed.is_none());
        assert!(registry.is_empty());

        registry
            .on_signal(&b, None, &bundle(&[SourceClass::Cbs]), t0())
            .unwrap();
        let state = registry.current_state(&b).unwrap();
        assert_eq!(state.alert_level, AlertLevel::Green);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn snapshots_are_independent_copies() {
        let registry = TriggerRegistry::new(TriggerConfig::default());
        let b = bucket("r-6c147:cholera");
        registry
            .on_signal(&b, Some(&score(2.0)), &bundle(&[SourceClass::Cbs, SourceClass::Emr]), t0())
            .unwrap();
        let before = registry.current_state(&b).unwrap();
        registry
            .on_signal(
                &b,
                Some(&score(3.0)),
                &bundle(&[SourceClass::Cbs, SourceClass::Emr]),
                t0() + TimeDelta::hours(1),
            )
            .unwrap();
        assert_eq!(before.alert_level, AlertLevel::Alert);
        assert_eq!(registry.current_state(&b).unwrap().alert_level, AlertLevel::Red);
    }

    #[test]
    fn states_sorted_by_bucket() {
        let registry = TriggerRegistry::new(TriggerConfig::default());
        for id in ["r2c2:measles", "r1c1:cholera", "r1c1:anthrax"] {
            registry
                .on_signal(&bucket(id), None, &bundle(&[SourceClass::Voice]), t0())
                .unwrap();
        }
        let ids: Vec<String> = registry.states().iter().map(|s| s.bucket.to_string()).collect();
        assert_eq!(ids, vec!["r1c1:anthrax", "r1c1:cholera", "r2c2:measles"]);
    }

    #[test]
    fn eviction_spares_raised_and_armed_states() {
        let registry = TriggerRegistry::new(TriggerConfig::default());
        let quiet = bucket("r0c0:measles");
        let hot = bucket("r-6c147:cholera");
        registry
            .on_signal(&quiet, None, &bundle(&[SourceClass::Voice]), t0())
            .unwrap();
        registry
            .on_signal(&hot, Some(&score(2.0)), &bundle(&[SourceClass::Cbs, SourceClass::Emr]), t0())
            .unwrap();

        let idle = TimeDelta::days(30);
        assert_eq!(registry.evict_idle(t0() + TimeDelta::days(29), idle), 0);
        assert_eq!(registry.evict_idle(t0() + TimeDelta::days(30), idle), 1);
        assert!(registry.current_state(&quiet).is_none());
        let kept = registry.current_state(&hot).unwrap();
        assert_eq!(kept.bond_status, BondStatus::Armed);
    }

    #[test]
    fn concurrent_queries_during_evaluation() {
        let registry = Arc::new(TriggerRegistry::new(TriggerConfig::default()));
        let writer = {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || {
                for i in 0..200 {
                    let b = bucket(&format!("r{i}c0:cholera"));
                    registry
                        .on_signal(&b, Some(&score(2.5)), &bundle(&[SourceClass::Cbs, SourceClass::Emr]), t0())
                        .unwrap();
                }
            })
        };
        let reader = {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || {
                let mut seen = 0;
                for _ in 0..200 {
                    seen = seen.max(registry.states().len());
                }
                seen
            })
        };
        writer.join().unwrap();
        assert!(reader.join().unwrap() <= 200);
        assert_eq!(registry.len(), 200);
        assert!(
            registry
                .states()
                .iter()
                .all(|s| s.alert_level == AlertLevel::Alert)
        );
    }
}
