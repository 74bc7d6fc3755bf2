//! Alerts: a trigger transition plus the legal citations and response
//! recommendations attached at dispatch time.

use chrono::{DateTime, SecondsFormat, Utc};
use epiwatch_core::BucketId;
use epiwatch_policy::Citation;
use epiwatch_trigger::{AlertLevel, BondStatus, Transition, TransitionCause};
use serde::{Deserialize, Serialize};

/// `{bucket_id}@{timestamp}`, with the timestamp in RFC 3339 at nanosecond
/// precision. Unique per transition because transition stamps strictly
/// increase per bucket.
pub fn idempotency_key(bucket: &BucketId, at: DateTime<Utc>) -> String {
    format!("{bucket}@{}", at.to_rfc3339_opts(SecondsFormat::Nanos, true))
}

/// Hex SHA-256 of the idempotency key.
pub fn alert_id(key: &str) -> String {
    crate::sha256_hex(key.as_bytes())
}

/// Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub alert_id: String,
    pub idempotency_key: String,
    pub bucket_id: BucketId,
    pub disease: String,
    pub alert_level: AlertLevel,
    pub previous_level: AlertLevel,
    pub bond_status: BondStatus,
    pub previous_bond: BondStatus,
    pub cause: TransitionCause,
    pub z_score: Option<f64>,
    pub bundle_confidence: Option<f64>,
    pub source_diversity: usize,
    pub citations: Vec<Citation>,
    pub recommendations: Vec<String>,
    pub jurisdiction: String,
    pub episode: u32,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    pub fn from_transition(
        transition: &Transition,
        jurisdiction: impl Into<String>,
        citations: Vec<Citation>,
    ) -> Self {
        let state = &transition.state;
        let at = transition.at();
        let key = idempotency_key(&state.bucket, at);
        let bundle = state.justifying_bundle.as_ref();
        Self {
            alert_id: alert_id(&key),
            idempotency_key: key,
            bucket_id: state.bucket.clone(),
            disease: state.bucket.disease.to_string(),
            alert_level: state.alert_level,
            previous_level: transition.previous_level,
            bond_status: state.bond_status,
            previous_bond: transition.previous_bond,
            cause: transition.cause,
            z_score: transition.z_score,
            bundle_confidence: bundle.map(|b| b.confidence),
            source_diversity: bundle.map_or(0, |b| b.source_diversity),
            citations,
            recommendations: recommendations(transition),
            jurisdiction: jurisdiction.into(),
            episode: state.episode,
            timestamp: at,
        }
    }
}

fn recommendations(transition: &Transition) -> Vec<String> {
    let state = &transition.state;
    let disease = &state.bucket.disease;
    let mut out: Vec<String> = Vec::new();

    if transition.cause == TransitionCause::EpisodeReset {
        out.push("Episode closed after sustained quiet; bond re-locked.".into());
        return out;
    }

    match state.alert_level {
        AlertLevel::Green => {
            out.push("Stand down enhanced surveillance; resume routine reporting.".into());
        }
        AlertLevel::Watch => {
            out.push(format!("Increase active case finding for {disease} in the affected area."));
            out.push("Request confirming reports from an independent source class.".into());
        }
        AlertLevel::Alert => {
            out.push(format!("Deploy a rapid response team to investigate {disease}."));
            out.push("Collect specimens for laboratory confirmation.".into());
        }
        AlertLevel::Red => {
            out.push(format!("Activate the {disease} outbreak response plan."));
            out.push("Notify the national IHR focal point.".into());
        }
    }
    if transition.payout_released() {
        out.push("Response bond released: mobilize funded response resources.".into());
    } else if transition.previous_bond == BondStatus::Locked
        && state.bond_status == BondStatus::Armed
    {
        out.push("Response bond armed: prepare payout documentation.".into());
    }
    out
}
