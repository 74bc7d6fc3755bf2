//! Field signal records: raw input, the ingestion boundary shape, and the
//! canonical normalized form every downstream stage consumes.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::geo::{DiseaseSignature, GeoPoint};

/// Where a signal came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SourceClass {
    /// Voice-derived transcription.
    #[serde(rename = "voice", alias = "VOICE", alias = "Voice")]
    Voice,
    /// Community-based surveillance report.
    #[serde(rename = "CBS", alias = "cbs")]
    Cbs,
    /// Electronic medical record.
    #[serde(rename = "EMR", alias = "emr")]
    Emr,
}

impl SourceClass {
    pub const ALL: [SourceClass; 3] = [Self::Voice, Self::Cbs, Self::Emr];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Voice => "voice",
            Self::Cbs => "CBS",
            Self::Emr => "EMR",
        }
    }
}

impl fmt::Display for SourceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A candidate diagnosis with the extractor's confidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiseaseCandidate {
    pub name: String,
    pub confidence: f64,
}

/// Ordinal severity, 1 (mild) to 5 (critical).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Severity(u8);

impl Severity {
    pub fn new(value: i64) -> Option<Self> {
        (1..=5).contains(&value).then_some(Self(value as u8))
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

/// Process-unique signal identifier assigned at normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignalId(pub u64);

/// A signal as handed over by a field collector, before normalization.
///
/// `payload` is whatever the extraction collaborator produced; it must
/// deserialize as `{symptoms[], severity, disease_candidates[]}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawSignal {
    pub source_class: SourceClass,
    pub timestamp: DateTime<Utc>,
    pub location: Option<GeoPoint>,
    pub payload: serde_json::Value,
}

/// The ingestion boundary record.
///
/// Severity and coordinates are kept loose here so range violations surface
/// as `MALFORMED_INPUT` with a reason rather than a parse failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestRecord {
    pub source_class: SourceClass,
    pub disease_candidates: Vec<DiseaseCandidate>,
    #[serde(default)]
    pub symptoms: Vec<String>,
    pub severity: i64,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

/// Canonical, immutable signal.
///
/// Only the [`Normalizer`](crate::Normalizer) constructs these; stages share
/// them behind `Arc`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedSignal {
    id: SignalId,
    source_class: SourceClass,
    symptoms: BTreeSet<String>,
    severity: Severity,
    location: GeoPoint,
    /// Deduplicated by signature, sorted by confidence descending.
    disease_candidates: Vec<DiseaseCandidate>,
    timestamp: DateTime<Utc>,
}

impl NormalizedSignal {
    pub(crate) fn new(
        id: SignalId,
        source_class: SourceClass,
        symptoms: BTreeSet<String>,
        severity: Severity,
        location: GeoPoint,
        disease_candidates: Vec<DiseaseCandidate>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            source_class,
            symptoms,
            severity,
            location,
            disease_candidates,
            timestamp,
        }
    }

    pub fn id(&self) -> SignalId {
        self.id
    }

    pub fn source_class(&self) -> SourceClass {
        self.source_class
    }

    pub fn symptoms(&self) -> &BTreeSet<String> {
        &self.symptoms
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn location(&self) -> GeoPoint {
        self.location
    }

    pub fn disease_candidates(&self) -> &[DiseaseCandidate] {
        &self.disease_candidates
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Candidates with their normalized signatures.
    pub fn signatures(&self) -> impl Iterator<Item = (DiseaseSignature, f64)> + '_ {
        self.disease_candidates
            .iter()
            .filter_map(|c| DiseaseSignature::new(&c.name).map(|sig| (sig, c.confidence)))
    }

    /// Confidence for one disease, if this signal names it.
    pub fn confidence_for(&self, disease: &DiseaseSignature) -> Option<f64> {
        self.signatures()
            .find(|(sig, _)| sig == disease)
            .map(|(_, conf)| conf)
    }
}
