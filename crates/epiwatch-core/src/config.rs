//! Engine configuration.
//!
//! Loaded from a JSON file; every field has a default so a partial file (or
//! none at all) yields a working engine. Thresholds live here rather than in
//! the algorithms so jurisdictions and diseases can tune sensitivity.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::geo::{DiseaseSignature, GeoGrid, JurisdictionMap, JurisdictionRegion};
use crate::signal::SourceClass;
use crate::window::WindowSpec;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("config JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub geo: GeoConfig,
    pub detection: DetectionConfig,
    pub corroboration: CorroborationConfig,
    pub trigger: TriggerConfig,
    pub pipeline: PipelineConfig,
    pub buckets: BucketConfig,
}

impl EngineConfig {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would break the pipeline's invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if !(self.geo.cell_deg.is_finite() && self.geo.cell_deg > 0.0 && self.geo.cell_deg <= 10.0) {
            return invalid(format!("geo.cell_deg must be in (0, 10], got {}", self.geo.cell_deg));
        }

        let d = &self.detection;
        if d.observation_window_secs == 0 || d.observation_window_secs > MAX_DURATION_SECS {
            return invalid("detection.observation_window_secs must be 1s..=1y".into());
        }
        if d.horizon_windows < 2 {
            return invalid("detection.horizon_windows must be at least 2".into());
        }
        if d.min_baseline_samples < 2 || d.min_baseline_samples > d.horizon_windows {
            return invalid(format!(
                "detection.min_baseline_samples must be in 2..={}",
                d.horizon_windows
            ));
        }
        if !(d.variance_floor.is_finite() && d.variance_floor > 0.0) {
            return invalid("detection.variance_floor must be positive".into());
        }
        Thresholds::new(d.notable_z, d.trigger_z).check("detection")?;
        for (disease, o) in &d.overrides {
            d.thresholds_with(o).check(&format!("detection.overrides.{disease}"))?;
        }
        if !(0.0..=1.0).contains(&d.min_candidate_confidence) {
            return invalid("detection.min_candidate_confidence must be in 0..=1".into());
        }

        let c = &self.corroboration;
        if !(c.radius_km.is_finite() && c.radius_km > 0.0) {
            return invalid("corroboration.radius_km must be positive".into());
        }
        if c.match_window_secs == 0 || c.match_window_secs > MAX_DURATION_SECS {
            return invalid("corroboration.match_window_secs must be 1s..=1y".into());
        }
        if c.retention_secs < c.match_window_secs || c.retention_secs > MAX_DURATION_SECS {
            return invalid("corroboration.retention_secs must cover the match window".into());
        }
        for class in SourceClass::ALL {
            let w = c.trust.weight(class);
            if !(w > 0.0 && w < 1.0) {
                return invalid(format!("corroboration.trust.{class} must be in (0, 1), got {w}"));
            }
        }
        if c.max_signals_per_bundle == 0 {
            return invalid("corroboration.max_signals_per_bundle must be positive".into());
        }

        let t = &self.trigger;
        if t.min_sources < 2 {
            return invalid("trigger.min_sources must be at least 2".into());
        }
        if !(0.0..1.0).contains(&t.alert_confidence) || !(0.0..1.0).contains(&t.release_confidence) {
            return invalid("trigger confidences must be in [0, 1)".into());
        }
        if t.release_confidence < t.alert_confidence {
            return invalid("trigger.release_confidence must be >= alert_confidence".into());
        }
        if t.reset_after_green_windows == 0 {
            return invalid("trigger.reset_after_green_windows must be positive".into());
        }

        let p = &self.pipeline;
        if p.queue_capacity == 0 || p.detect_shards == 0 || p.delivery_escalate_after == 0 {
            return invalid("pipeline capacities, shard count and attempts must be positive".into());
        }

        if let Some(idle) = self.buckets.idle_eviction_secs
            && (idle == 0 || idle > MAX_DURATION_SECS)
        {
            return invalid("buckets.idle_eviction_secs must be 1s..=1y".into());
        }
        Ok(())
    }
}

const MAX_DURATION_SECS: u64 = 366 * 86_400;

fn secs(n: u64) -> TimeDelta {
    TimeDelta::seconds(n as i64)
}

// ── Geo ──

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeoConfig {
    /// Grid cell size in degrees.
    pub cell_deg: f64,
    pub default_jurisdiction: String,
    pub jurisdictions: Vec<JurisdictionRegion>,
}

impl Default for GeoConfig {
    fn default() -> Self {
        Self {
            cell_deg: 0.25,
            default_jurisdiction: "default".into(),
            jurisdictions: Vec::new(),
        }
    }
}

impl GeoConfig {
    pub fn grid(&self) -> GeoGrid {
        GeoGrid::new(self.cell_deg)
    }

    pub fn jurisdiction_map(&self) -> JurisdictionMap {
        JurisdictionMap::new(self.jurisdictions.clone(), self.default_jurisdiction.clone())
    }
}

// ── Detection ──

/// The pair of z-score cut-offs applied to one disease.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    /// Statistically notable (default 1.96, ~95% one-tailed).
    pub notable_z: f64,
    /// High-confidence, trigger-eligible (default 2.576, ~99%).
    pub trigger_z: f64,
}

impl Thresholds {
    pub fn new(notable_z: f64, trigger_z: f64) -> Self {
        Self { notable_z, trigger_z }
    }

    fn check(&self, at: &str) -> Result<(), ConfigError> {
        if !(self.notable_z.is_finite() && self.trigger_z.is_finite() && self.notable_z > 0.0) {
            return Err(ConfigError::Invalid(format!("{at}: z thresholds must be positive")));
        }
        if self.trigger_z < self.notable_z {
            return Err(ConfigError::Invalid(format!(
                "{at}: trigger_z {} below notable_z {}",
                self.trigger_z, self.notable_z
            )));
        }
        Ok(())
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self::new(1.96, 2.576)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThresholdOverride {
    pub notable_z: Option<f64>,
    pub trigger_z: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub observation_window_secs: u64,
    /// Rolling horizon, in observation windows.
    pub horizon_windows: u64,
    pub min_baseline_samples: u64,
    pub variance_floor: f64,
    pub notable_z: f64,
    pub trigger_z: f64,
    /// Candidates below this confidence do not feed a bucket.
    pub min_candidate_confidence: f64,
    /// Per-disease threshold overrides, keyed by disease name.
    pub overrides: BTreeMap<String, ThresholdOverride>,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        let t = Thresholds::default();
        Self {
            observation_window_secs: 86_400,
            horizon_windows: 90,
            min_baseline_samples: 30,
            variance_floor: 1.0,
            notable_z: t.notable_z,
            trigger_z: t.trigger_z,
            min_candidate_confidence: 0.5,
            overrides: BTreeMap::new(),
        }
    }
}

impl DetectionConfig {
    pub fn window(&self) -> WindowSpec {
        WindowSpec::new(self.observation_window_secs)
    }

    pub fn thresholds_for(&self, disease: &DiseaseSignature) -> Thresholds {
        self.overrides
            .iter()
            .find(|(name, _)| DiseaseSignature::new(name).as_ref() == Some(disease))
            .map(|(_, o)| self.thresholds_with(o))
            .unwrap_or(Thresholds::new(self.notable_z, self.trigger_z))
    }

    fn thresholds_with(&self, o: &ThresholdOverride) -> Thresholds {
        Thresholds::new(
            o.notable_z.unwrap_or(self.notable_z),
            o.trigger_z.unwrap_or(self.trigger_z),
        )
    }
}

// ── Corroboration ──

/// Per-source-class trust weights used by the bundle confidence formula.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustWeights {
    pub voice: f64,
    pub cbs: f64,
    pub emr: f64,
}

impl Default for TrustWeights {
    fn default() -> Self {
        Self {
            voice: 0.30,
            cbs: 0.50,
            emr: 0.80,
        }
    }
}

impl TrustWeights {
    pub fn weight(&self, class: SourceClass) -> f64 {
        match class {
            SourceClass::Voice => self.voice,
            SourceClass::Cbs => self.cbs,
            SourceClass::Emr => self.emr,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorroborationConfig {
    pub radius_km: f64,
    /// How long a bundle stays open for merging (W).
    pub match_window_secs: u64,
    /// How long finalized bundles are kept before eviction.
    pub retention_secs: u64,
    pub trust: TrustWeights,
    pub max_signals_per_bundle: usize,
}

impl Default for CorroborationConfig {
    fn default() -> Self {
        Self {
            radius_km: 25.0,
            match_window_secs: 72 * 3600,
            retention_secs: 14 * 86_400,
            trust: TrustWeights::default(),
            max_signals_per_bundle: 256,
        }
    }
}

impl CorroborationConfig {
    pub fn match_window(&self) -> TimeDelta {
        secs(self.match_window_secs)
    }

    pub fn retention(&self) -> TimeDelta {
        secs(self.retention_secs)
    }
}

// ── Trigger ──

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    /// Distinct source classes required to call a bundle corroborated.
    pub min_sources: usize,
    /// Bundle confidence required for ALERT and RED.
    pub alert_confidence: f64,
    /// Bundle confidence required to release the bond.
    pub release_confidence: f64,
    /// Consecutive GREEN windows that end an episode.
    pub reset_after_green_windows: u32,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            min_sources: 2,
            alert_confidence: 0.6,
            release_confidence: 0.85,
            reset_after_green_windows: 7,
        }
    }
}

// ── Pipeline ──

/// What a bounded stage does when its queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Drop the item, count and log an `OVERLOAD` event.
    #[default]
    Drop,
    /// Wait for capacity (backpressure onto the producer).
    Block,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub queue_capacity: usize,
    pub overflow: OverflowPolicy,
    pub detect_shards: usize,
    /// Failed attempts after which a delivery that is still being retried
    /// is logged as an error. Also sizes the retry window an outbox gets at
    /// shutdown.
    #[serde(alias = "delivery_max_attempts")]
    pub delivery_escalate_after: u32,
    pub delivery_backoff_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            overflow: OverflowPolicy::Drop,
            detect_shards: 4,
            delivery_escalate_after: 8,
            delivery_backoff_ms: 200,
        }
    }
}

// ── Buckets ──

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BucketConfig {
    /// Evict GREEN/LOCKED trigger states idle this long. Unset keeps every
    /// bucket for the lifetime of the process.
    pub idle_eviction_secs: Option<u64>,
}

impl BucketConfig {
    pub fn idle_eviction(&self) -> Option<TimeDelta> {
        self.idle_eviction_secs.map(secs)
    }
}
