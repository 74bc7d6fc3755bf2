//! Z-score anomaly detection against a rolling baseline.
//!
//! The detector is pure: it never touches the baseline store. Thresholds come
//! from configuration so sensitivity can be tuned per disease.

use epiwatch_core::{BucketId, DiseaseSignature, Thresholds};
use serde::{Deserialize, Serialize};

use crate::baseline::{BaselineError, BaselineWindow};

/// How a z-score compares to the configured thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Significance {
    Background,
    /// z ≥ notable threshold (default 1.96).
    Notable,
    /// z ≥ trigger threshold (default 2.576).
    TriggerEligible,
}

impl Significance {
    pub fn classify(z: f64, thresholds: Thresholds) -> Self {
        if z >= thresholds.trigger_z {
            Self::TriggerEligible
        } else if z >= thresholds.notable_z {
            Self::Notable
        } else {
            Self::Background
        }
    }

    pub fn is_notable(&self) -> bool {
        *self >= Self::Notable
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZScoreResult {
    pub disease: DiseaseSignature,
    pub z_score: f64,
    pub observed: u64,
    pub mean: f64,
    /// Standard deviation actually used (after the variance floor).
    pub stddev: f64,
    pub sample_size: u64,
    /// 0–1; grows with both baseline size and z magnitude.
    pub confidence: f64,
    pub significance: Significance,
}

#[derive(Debug, Clone, Copy)]
pub struct AnomalyDetector {
    variance_floor: f64,
    min_samples: u64,
}

impl AnomalyDetector {
    pub fn new(variance_floor: f64, min_samples: u64) -> Self {
        Self {
            variance_floor,
            min_samples,
        }
    }

    /// Score an observed window count against its baseline.
    ///
    /// Near-zero variance is replaced by the configured floor so a flat
    /// history cannot turn a single report into an infinite z-score.
    pub fn score(
        &self,
        bucket: &BucketId,
        observed: u64,
        baseline: &BaselineWindow,
        thresholds: Thresholds,
    ) -> Result<ZScoreResult, BaselineError> {
        if baseline.sample_count < self.min_samples {
            return Err(BaselineError::InsufficientBaseline {
                bucket: bucket.clone(),
                have: baseline.sample_count,
                need: self.min_samples,
            });
        }

        let stddev = baseline.variance.max(self.variance_floor).sqrt();
        let z = (observed as f64 - baseline.mean) / stddev;
        let adequacy = 1.0 - 1.0 / (baseline.sample_count as f64).sqrt();
        let confidence = (adequacy * standard_normal_cdf(z)).clamp(0.0, 1.0);

        Ok(ZScoreResult {
            disease: bucket.disease.clone(),
            z_score: z,
            observed,
            mean: baseline.mean,
            stddev,
            sample_size: baseline.sample_count,
            confidence,
            significance: Significance::classify(z, thresholds),
        })
    }
}

/// Φ(x) via the Abramowitz–Stegun 7.1.26 erf approximation (|ε| < 1.5e-7).
fn standard_normal_cdf(x: f64) -> f64 {
    0.5 * (1.0 + erf(x / std::f64::consts::SQRT_2))
}

fn erf(x: f64) -> f64 {
    const A1: f64 = 0.254829592;
    const A2: f64 = -0.284496736;
    const A3: f64 = 1.421413741;
    const A4: f64 = -1.453152027;
    const A5: f64 = 1.061405429;
    const P: f64 = 0.3275911;

    let sign = x.signum();
    let x = x.abs();
    let t = 1.0 / (1.0 + P * x);
    let poly = ((((A5 * t + A4) * t + A3) * t + A2) * t + A1) * t;
    sign * (1.0 - poly * (-x * x).exp())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket() -> BucketId {
        "r-6c147:cholera".parse().unwrap()
    }

    fn baseline(mean: f64, variance: f64, n: u64) -> BaselineWindow {
        BaselineWindow {
            mean,
            variance,
            sample_count: n,
        }
    }

    #[test]
    fn three_sigma_is_trigger_eligible() {
        let detector = AnomalyDetector::new(1.0, 30);
        let result = detector
            .score(&bucket(), 16, &baseline(10.0, 4.0, 30), Thresholds::default())
            .unwrap();
        assert!((result.z_score - 3.0).abs() < 1e-12);
        assert_eq!(result.significance, Significance::TriggerEligible);
        assert_eq!(result.stddev, 2.0);
        assert_eq!(result.disease.as_str(), "cholera");
    }

    #[test]
    fn threshold_boundaries() {
        let t = Thresholds::default();
        assert_eq!(Significance::classify(1.95, t), Significance::Background);
        assert_eq!(Significance::classify(1.96, t), Significance::Notable);
        assert_eq!(Significance::classify(2.575, t), Significance::Notable);
        assert_eq!(Significance::classify(2.576, t), Significance::TriggerEligible);
        assert!(!Significance::Background.is_notable());
        assert!(Significance::TriggerEligible.is_notable());
    }

    #[test]
    fn thresholds_are_configuration() {
        let detector = AnomalyDetector::new(1.0, 30);
        let strict = Thresholds::new(3.5, 4.0);
        let result = detector
            .score(&bucket(), 16, &baseline(10.0, 4.0, 30), strict)
            .unwrap();
        assert_eq!(result.significance, Significance::Background);
    }

    #[test]
    fn zero_variance_uses_floor() {
        let detector = AnomalyDetector::new(1.0, 30);
        let result = detector
            .score(&bucket(), 5, &baseline(2.0, 0.0, 40), Thresholds::default())
            .unwrap();
        assert!(result.z_score.is_finite());
        assert!((result.z_score - 3.0).abs() < 1e-12);
    }

    #[test]
    fn small_baseline_is_insufficient() {
        let detector = AnomalyDetector::new(1.0, 30);
        let err = detector
            .score(&bucket(), 16, &baseline(10.0, 4.0, 29), Thresholds::default())
            .unwrap_err();
        assert!(matches!(
            err,
            BaselineError::InsufficientBaseline { have: 29, need: 30, .. }
        ));
    }

    #[test]
    fn confidence_grows_with_z_and_samples() {
        let detector = AnomalyDetector::new(1.0, 2);
        let t = Thresholds::default();
        let low = detector.score(&bucket(), 12, &baseline(10.0, 4.0, 30), t).unwrap();
        let high = detector.score(&bucket(), 18, &baseline(10.0, 4.0, 30), t).unwrap();
        let more = detector.score(&bucket(), 18, &baseline(10.0, 4.0, 90), t).unwrap();
        assert!(low.confidence < high.confidence);
        assert!(high.confidence < more.confidence);
        assert!(more.confidence <= 1.0);
    }

    #[test]
    fn cdf_reference_points() {
        assert!((standard_normal_cdf(0.0) - 0.5).abs() < 1e-7);
        assert!((standard_normal_cdf(1.96) - 0.975).abs() < 1e-4);
        assert!((standard_normal_cdf(-1.96) - 0.025).abs() < 1e-4);
    }
}
