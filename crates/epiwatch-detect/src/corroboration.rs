//! Golden Thread: binds reports from independent source classes into
//! evidence bundles.
//!
//! A bundle collects signals for one disease whose locations sit within the
//! match radius of the bundle centroid and that arrive within the match
//! window of the bundle opening. After the window a bundle is finalized with
//! whatever sources it gathered; after the retention window it is evicted.
//!
//! Bundle confidence is `1 - Π(1 - w_c)` over the *distinct* source classes
//! present, where `w_c` is the trust weight of class `c`. It depends only on
//! which classes are present, never on how many reports a class sent, and it
//! saturates below 1. A flood of reports from one channel therefore cannot
//! look like independent corroboration.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use epiwatch_core::config::{CorroborationConfig, TrustWeights};
use epiwatch_core::{DiseaseSignature, GeoPoint, NormalizedSignal, SourceClass};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BundleId(pub u64);

impl fmt::Display for BundleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bundle-{}", self.0)
    }
}

/// Confidence contributed by a set of distinct source classes.
pub fn bundle_confidence<'a>(
    classes: impl IntoIterator<Item = &'a SourceClass>,
    trust: &TrustWeights,
) -> f64 {
    let distinct: BTreeSet<&SourceClass> = classes.into_iter().collect();
    1.0 - distinct
        .into_iter()
        .map(|c| 1.0 - trust.weight(*c))
        .product::<f64>()
}

/// Lightweight view of a bundle, carried by trigger states and alerts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleSnapshot {
    pub id: BundleId,
    pub disease: DiseaseSignature,
    pub source_classes: BTreeSet<SourceClass>,
    pub source_diversity: usize,
    pub confidence: f64,
    pub signal_count: u64,
    pub centroid: GeoPoint,
    pub opened_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub finalized: bool,
}

/// Full bundle contents for a gated export.
#[derive(Debug, Clone, Serialize)]
pub struct BundleExport {
    pub snapshot: BundleSnapshot,
    pub signals: Vec<NormalizedSignal>,
}

/// Signals judged to describe the same candidate event.
#[derive(Debug, Clone)]
pub struct CorroborationBundle {
    id: BundleId,
    disease: DiseaseSignature,
    /// Retained signals, capped at `max_signals_per_bundle`.
    signals: Vec<Arc<NormalizedSignal>>,
    class_counts: BTreeMap<SourceClass, u64>,
    signal_count: u64,
    lat_sum: f64,
    lng_sum: f64,
    opened_at: DateTime<Utc>,
    last_seen_at: DateTime<Utc>,
}

impl CorroborationBundle {
    fn open(id: BundleId, disease: DiseaseSignature, at: DateTime<Utc>) -> Self {
        Self {
            id,
            disease,
            signals: Vec::new(),
            class_counts: BTreeMap::new(),
            signal_count: 0,
            lat_sum: 0.0,
            lng_sum: 0.0,
            opened_at: at,
            last_seen_at: at,
        }
    }

    fn add(&mut self, signal: &Arc<NormalizedSignal>, cap: usize) {
        let loc = signal.location();
        self.lat_sum += loc.lat;
        self.lng_sum += loc.lng;
        self.signal_count += 1;
        *self.class_counts.entry(signal.source_class()).or_default() += 1;
        if self.signals.len() < cap {
            self.signals.push(Arc::clone(signal));
        }
        self.opened_at = self.opened_at.min(signal.timestamp());
        self.last_seen_at = self.last_seen_at.max(signal.timestamp());
    }

    fn absorb(&mut self, other: CorroborationBundle, cap: usize) {
        self.lat_sum += other.lat_sum;
        self.lng_sum += other.lng_sum;
        self.signal_count += other.signal_count;
        for (class, n) in other.class_counts {
            *self.class_counts.entry(class).or_default() += n;
        }
        let room = cap.saturating_sub(self.signals.len());
        self.signals.extend(other.signals.into_iter().take(room));
        self.opened_at = self.opened_at.min(other.opened_at);
        self.last_seen_at = self.last_seen_at.max(other.last_seen_at);
    }

    pub fn id(&self) -> BundleId {
        self.id
    }

    pub fn disease(&self) -> &DiseaseSignature {
        &self.disease
    }

    pub fn signals(&self) -> &[Arc<NormalizedSignal>] {
        &self.signals
    }

    pub fn signal_count(&self) -> u64 {
        self.signal_count
    }

    pub fn source_diversity(&self) -> usize {
        self.class_counts.len()
    }

    pub fn centroid(&self) -> GeoPoint {
        if self.signal_count == 0 {
            return GeoPoint::new(0.0, 0.0);
        }
        let n = self.signal_count as f64;
        GeoPoint::new(self.lat_sum / n, self.lng_sum / n)
    }

    pub fn confidence(&self, trust: &TrustWeights) -> f64 {
        bundle_confidence(self.class_counts.keys(), trust)
    }

    /// Still accepting signals stamped `at`? Late reports up to one window
    /// before the opening are accepted too.
    fn accepts(&self, at: DateTime<Utc>, window: chrono::TimeDelta) -> bool {
        at < self.opened_at + window && at >= self.opened_at - window
    }

    pub fn snapshot(
        &self,
        trust: &TrustWeights,
        window: chrono::TimeDelta,
        at: DateTime<Utc>,
    ) -> BundleSnapshot {
        BundleSnapshot {
            id: self.id,
            disease: self.disease.clone(),
            source_classes: self.class_counts.keys().copied().collect(),
            source_diversity: self.source_diversity(),
            confidence: self.confidence(trust),
            signal_count: self.signal_count,
            centroid: self.centroid(),
            opened_at: self.opened_at,
            last_seen_at: self.last_seen_at,
            finalized: at >= self.opened_at + window,
        }
    }
}

/// Short-lived, disease-indexed buffer of open and recently finalized bundles.
///
/// Owned by a single pipeline stage; not internally synchronized.
pub struct CorroborationEngine {
    config: CorroborationConfig,
    bundles: HashMap<BundleId, CorroborationBundle>,
    by_disease: HashMap<DiseaseSignature, Vec<BundleId>>,
    /// Absorbed bundle ids, pointing straight at the bundle that took them in.
    merged_into: HashMap<BundleId, BundleId>,
    next_id: u64,
}

impl CorroborationEngine {
    pub fn new(config: CorroborationConfig) -> Self {
        Self {
            config,
            bundles: HashMap::new(),
            by_disease: HashMap::new(),
            merged_into: HashMap::new(),
            next_id: 0,
        }
    }

    /// Place `signal` (as evidence for `disease`) into a bundle and return
    /// that bundle's snapshot.
    ///
    /// Every open bundle for the disease within radius and window matches.
    /// No match opens a new bundle; several matches are merged into the
    /// oldest one, since the new report links them to the same event.
    pub fn bundle_for(
        &mut self,
        signal: &Arc<NormalizedSignal>,
        disease: &DiseaseSignature,
    ) -> BundleSnapshot {
        let at = signal.timestamp();
        let location = signal.location();
        let window = self.config.match_window();
        let radius = self.config.radius_km;

        let ids = self.by_disease.entry(disease.clone()).or_default();
        let mut matches: Vec<BundleId> = ids
            .iter()
            .copied()
            .filter(|id| {
                self.bundles.get(id).is_some_and(|b| {
                    b.accepts(at, window) && b.centroid().distance_km(&location) <= radius
                })
            })
            .collect();
        matches.sort();

        let target = match matches.first() {
            Some(&first) => first,
            None => {
                self.next_id += 1;
                let id = BundleId(self.next_id);
                self.bundles
                    .insert(id, CorroborationBundle::open(id, disease.clone(), at));
                ids.push(id);
                debug!(bundle = %id, %disease, "opened corroboration bundle");
                id
            }
        };

        let cap = self.config.max_signals_per_bundle;
        for &other in matches.iter().skip(1) {
            if let Some(absorbed) = self.bundles.remove(&other) {
                debug!(into = %target, from = %other, %disease, "merging corroboration bundles");
                if let Some(bundle) = self.bundles.get_mut(&target) {
                    bundle.absorb(absorbed, cap);
                }
                for into in self.merged_into.values_mut() {
                    if *into == other {
                        *into = target;
                    }
                }
                self.merged_into.insert(other, target);
            }
        }
        if matches.len() > 1 {
            ids.retain(|id| !matches[1..].contains(id));
        }

        let trust = self.config.trust;
        let bundle = self
            .bundles
            .entry(target)
            .or_insert_with(|| CorroborationBundle::open(target, disease.clone(), at));
        bundle.add(signal, cap);
        bundle.snapshot(&trust, window, at)
    }

    /// The live id for `id`, following a merge if `id` was absorbed.
    pub fn resolve(&self, id: BundleId) -> BundleId {
        self.merged_into.get(&id).copied().unwrap_or(id)
    }

    pub fn get(&self, id: BundleId) -> Option<&CorroborationBundle> {
        self.bundles.get(&id)
    }

    /// Snapshot of `id`, or of the bundle it was merged into.
    pub fn snapshot(&self, id: BundleId, at: DateTime<Utc>) -> Option<BundleSnapshot> {
        self.bundles
            .get(&self.resolve(id))
            .map(|b| b.snapshot(&self.config.trust, self.config.match_window(), at))
    }

    /// Full contents of a bundle, for a transfer the policy gate authorized.
    /// An absorbed id exports the bundle that absorbed it.
    pub fn export(&self, id: BundleId, at: DateTime<Utc>) -> Option<BundleExport> {
        let bundle = self.bundles.get(&self.resolve(id))?;
        Some(BundleExport {
            snapshot: bundle.snapshot(&self.config.trust, self.config.match_window(), at),
            signals: bundle.signals.iter().map(|s| (**s).clone()).collect(),
        })
    }

    /// Evict bundles opened more than the retention window before `now`.
    pub fn evict_expired(&mut self, now: DateTime<Utc>) -> usize {
        let retention = self.config.retention();
        let before = self.bundles.len();
        self.bundles.retain(|_, b| b.opened_at + retention > now);
        let bundles = &self.bundles;
        self.by_disease.retain(|_, ids| {
            ids.retain(|id| bundles.contains_key(id));
            !ids.is_empty()
        });
        self.merged_into.retain(|_, into| bundles.contains_key(into));
        let evicted = before - self.bundles.len();
        if evicted > 0 {
            debug!(evicted, "evicted expired corroboration bundles");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.bundles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bundles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use epiwatch_core::{DiseaseCandidate, IngestRecord, Normalizer};

    fn signal(
        n: &Normalizer,
        class: SourceClass,
        lat: f64,
        lng: f64,
        at: &str,
    ) -> Arc<NormalizedSignal> {
        let record = IngestRecord {
            source_class: class,
            disease_candidates: vec![DiseaseCandidate {
                name: "cholera".into(),
                confidence: 0.9,
            }],
            symptoms: vec!["diarrhoea".into()],
            severity: 3,
            lat: Some(lat),
            lng: Some(lng),
            timestamp: at.parse().unwrap(),
        };
        Arc::new(n.normalize_record(record).unwrap())
    }

    fn cholera() -> DiseaseSignature {
        DiseaseSignature::new("cholera").unwrap()
    }

    fn engine() -> CorroborationEngine {
        CorroborationEngine::new(CorroborationConfig::default())
    }

    #[test]
    fn cbs_and_emr_merge_with_diversity_two() {
        let n = Normalizer::new();
        let mut engine = engine();
        let trust = TrustWeights::default();

        let cbs = engine.bundle_for(
            &signal(&n, SourceClass::Cbs, -1.29, 36.82, "2026-03-01T08:00:00Z"),
            &cholera(),
        );
        let emr = engine.bundle_for(
            &signal(&n, SourceClass::Emr, -1.30, 36.83, "2026-03-01T12:00:00Z"),
            &cholera(),
        );

        assert_eq!(cbs.id, emr.id);
        assert_eq!(emr.source_diversity, 2);
        assert_eq!(emr.signal_count, 2);
        let cbs_alone = bundle_confidence(&[SourceClass::Cbs], &trust);
        let emr_alone = bundle_confidence(&[SourceClass::Emr], &trust);
        assert!(emr.confidence > cbs_alone);
        assert!(emr.confidence > emr_alone);
        assert!((emr.confidence - 0.9).abs() < 1e-12);
    }

    #[test]
    fn single_source_flood_does_not_raise_confidence() {
        let n = Normalizer::new();
        let mut engine = engine();
        let mut last = None;
        for i in 0..50 {
            let at = format!("2026-03-01T08:{:02}:00Z", i);
            last = Some(engine.bundle_for(
                &signal(&n, SourceClass::Voice, -1.29, 36.82, &at),
                &cholera(),
            ));
        }
        let snap = last.unwrap();
        assert_eq!(snap.signal_count, 50);
        assert_eq!(snap.source_diversity, 1);
        assert!((snap.confidence - 0.30).abs() < 1e-12);
    }

    #[test]
    fn confidence_monotonic_and_saturating() {
        let trust = TrustWeights::default();
        let one = bundle_confidence(&[SourceClass::Voice], &trust);
        let two = bundle_confidence(&[SourceClass::Voice, SourceClass::Cbs], &trust);
        let three = bundle_confidence(&SourceClass::ALL, &trust);
        assert!(one < two && two < three);
        assert!(three < 1.0);
        let repeated = bundle_confidence(&[SourceClass::Voice, SourceClass::Voice], &trust);
        assert_eq!(repeated, one);
        assert_eq!(bundle_confidence(&[] as &[SourceClass], &trust), 0.0);
    }

    #[test]
    fn far_apart_signals_open_separate_bundles() {
        let n = Normalizer::new();
        let mut engine = engine();
        let nairobi = engine.bundle_for(
            &signal(&n, SourceClass::Cbs, -1.29, 36.82, "2026-03-01T08:00:00Z"),
            &cholera(),
        );
        let mombasa = engine.bundle_for(
            &signal(&n, SourceClass::Emr, -4.04, 39.67, "2026-03-01T09:00:00Z"),
            &cholera(),
        );
        assert_ne!(nairobi.id, mombasa.id);
        assert_eq!(mombasa.source_diversity, 1);
        assert_eq!(engine.len(), 2);
    }

    #[test]
    fn other_diseases_never_match() {
        let n = Normalizer::new();
        let mut engine = engine();
        let s = signal(&n, SourceClass::Cbs, -1.29, 36.82, "2026-03-01T08:00:00Z");
        let a = engine.bundle_for(&s, &cholera());
        let b = engine.bundle_for(&s, &DiseaseSignature::new("typhoid").unwrap());
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn window_expiry_finalizes_partial_bundle() {
        let n = Normalizer::new();
        let mut engine = engine();
        let first = engine.bundle_for(
            &signal(&n, SourceClass::Cbs, -1.29, 36.82, "2026-03-01T08:00:00Z"),
            &cholera(),
        );
        // 72h later: the first bundle is closed, so this opens a new one.
        let late = engine.bundle_for(
            &signal(&n, SourceClass::Emr, -1.29, 36.82, "2026-03-04T08:00:00Z"),
            &cholera(),
        );
        assert_ne!(first.id, late.id);
        assert_eq!(late.source_diversity, 1);

        let closed = engine
            .snapshot(first.id, "2026-03-04T08:00:00Z".parse().unwrap())
            .unwrap();
        assert!(closed.finalized);
        assert_eq!(closed.source_diversity, 1);
    }

    #[test]
    fn bridging_signal_merges_two_bundles() {
        let n = Normalizer::new();
        let config = CorroborationConfig {
            radius_km: 10.0,
            ..CorroborationConfig::default()
        };
        let mut engine = CorroborationEngine::new(config);
        // ~17 km apart: separate bundles.
        let west = engine.bundle_for(
            &signal(&n, SourceClass::Cbs, 0.0, 36.80, "2026-03-01T08:00:00Z"),
            &cholera(),
        );
        let east = engine.bundle_for(
            &signal(&n, SourceClass::Emr, 0.0, 36.95, "2026-03-01T09:00:00Z"),
            &cholera(),
        );
        assert_ne!(west.id, east.id);

        // Midway report is within 10 km of both centroids.
        let merged = engine.bundle_for(
            &signal(&n, SourceClass::Voice, 0.0, 36.875, "2026-03-01T10:00:00Z"),
            &cholera(),
        );
        assert_eq!(merged.id, west.id);
        assert_eq!(merged.source_diversity, 3);
        assert_eq!(merged.signal_count, 3);
        assert_eq!(engine.len(), 1);
        assert!(engine.get(east.id).is_none());

        // States that cited the absorbed bundle still reach its evidence.
        let at = "2026-03-01T10:00:00Z".parse().unwrap();
        assert_eq!(engine.resolve(east.id), west.id);
        let export = engine.export(east.id, at).unwrap();
        assert_eq!(export.snapshot.id, west.id);
        assert_eq!(export.signals.len(), 3);
        assert_eq!(engine.snapshot(east.id, at).unwrap().source_diversity, 3);
    }

    #[test]
    fn merge_redirects_follow_later_merges_and_expire() {
        let n = Normalizer::new();
        let config = CorroborationConfig {
            radius_km: 15.0,
            ..CorroborationConfig::default()
        };
        let mut engine = CorroborationEngine::new(config);
        let a = engine.bundle_for(
            &signal(&n, SourceClass::Cbs, 0.0, 36.80, "2026-03-01T08:00:00Z"),
            &cholera(),
        );
        let b = engine.bundle_for(
            &signal(&n, SourceClass::Emr, 0.0, 36.95, "2026-03-01T08:30:00Z"),
            &cholera(),
        );
        let c = engine.bundle_for(
            &signal(&n, SourceClass::Emr, 0.0, 37.10, "2026-03-01T09:00:00Z"),
            &cholera(),
        );
        assert_eq!(engine.len(), 3);

        // ~17 km spacing. b and c merge first; the a+b bridge then carries
        // c along with b.
        engine.bundle_for(
            &signal(&n, SourceClass::Voice, 0.0, 37.025, "2026-03-01T09:30:00Z"),
            &cholera(),
        );
        assert_eq!(engine.resolve(c.id), b.id);
        engine.bundle_for(
            &signal(&n, SourceClass::Voice, 0.0, 36.9125, "2026-03-01T10:00:00Z"),
            &cholera(),
        );
        assert_eq!(engine.len(), 1);
        assert_eq!(engine.resolve(b.id), a.id);
        assert_eq!(engine.resolve(c.id), a.id);

        engine.evict_expired(a.opened_at + TimeDelta::days(14));
        assert!(engine.is_empty());
        assert_eq!(engine.resolve(c.id), c.id);
        assert!(engine.export(c.id, a.opened_at).is_none());
    }

    #[test]
    fn stored_signals_capped_but_counted() {
        let n = Normalizer::new();
        let config = CorroborationConfig {
            max_signals_per_bundle: 3,
            ..CorroborationConfig::default()
        };
        let mut engine = CorroborationEngine::new(config);
        let mut snap = None;
        for i in 0..10 {
            let at = format!("2026-03-01T08:{:02}:00Z", i);
            snap = Some(engine.bundle_for(
                &signal(&n, SourceClass::Cbs, -1.29, 36.82, &at),
                &cholera(),
            ));
        }
        let snap = snap.unwrap();
        assert_eq!(snap.signal_count, 10);
        assert_eq!(engine.get(snap.id).unwrap().signals().len(), 3);
        let export = engine.export(snap.id, snap.last_seen_at).unwrap();
        assert_eq!(export.signals.len(), 3);
    }

    #[test]
    fn eviction_after_retention() {
        let n = Normalizer::new();
        let mut engine = engine();
        let snap = engine.bundle_for(
            &signal(&n, SourceClass::Cbs, -1.29, 36.82, "2026-03-01T08:00:00Z"),
            &cholera(),
        );
        let opened = snap.opened_at;
        assert_eq!(engine.evict_expired(opened + TimeDelta::days(13)), 0);
        assert_eq!(engine.evict_expired(opened + TimeDelta::days(14)), 1);
        assert!(engine.is_empty());

        // A fresh report after eviction starts over.
        let again = engine.bundle_for(
            &signal(&n, SourceClass::Cbs, -1.29, 36.82, "2026-03-20T08:00:00Z"),
            &cholera(),
        );
        assert_ne!(again.id, snap.id);
    }
}
