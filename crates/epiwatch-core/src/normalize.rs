//! Signal normalizer: turns raw field input into [`NormalizedSignal`]s or a
//! `MALFORMED_INPUT` rejection with a reason.
//!
//! Transcription and symptom extraction happen upstream; the normalizer only
//! validates and canonicalizes already-structured data and never touches the
//! network.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::MalformedInput;
use crate::geo::{DiseaseSignature, GeoPoint};
use crate::signal::{
    DiseaseCandidate, IngestRecord, NormalizedSignal, RawSignal, Severity, SignalId, SourceClass,
};

/// Shape the extraction collaborator writes into [`RawSignal::payload`].
#[derive(Deserialize)]
struct ExtractedPayload {
    #[serde(default)]
    symptoms: Vec<String>,
    severity: i64,
    disease_candidates: Vec<DiseaseCandidate>,
}

/// Stateless apart from the signal id counter; share it behind `Arc`.
#[derive(Debug, Default)]
pub struct Normalizer {
    next_id: AtomicU64,
}

impl Normalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalize a raw collector signal whose payload holds extracted fields.
    pub fn normalize_raw(&self, raw: RawSignal) -> Result<NormalizedSignal, MalformedInput> {
        let location = raw.location.ok_or(MalformedInput::MissingLocation)?;
        let payload: ExtractedPayload = serde_json::from_value(raw.payload)
            .map_err(|e| MalformedInput::UnparseablePayload(e.to_string()))?;
        self.build(
            raw.source_class,
            raw.timestamp,
            location,
            payload.symptoms,
            payload.severity,
            payload.disease_candidates,
        )
    }

    /// Normalize a record from the ingestion boundary.
    pub fn normalize_record(&self, record: IngestRecord) -> Result<NormalizedSignal, MalformedInput> {
        let location = match (record.lat, record.lng) {
            (Some(lat), Some(lng)) => GeoPoint::new(lat, lng),
            _ => return Err(MalformedInput::MissingLocation),
        };
        self.build(
            record.source_class,
            record.timestamp,
            location,
            record.symptoms,
            record.severity,
            record.disease_candidates,
        )
    }

    fn build(
        &self,
        source_class: SourceClass,
        timestamp: DateTime<Utc>,
        location: GeoPoint,
        symptoms: Vec<String>,
        severity: i64,
        candidates: Vec<DiseaseCandidate>,
    ) -> Result<NormalizedSignal, MalformedInput> {
        if !location.is_valid() {
            return Err(MalformedInput::InvalidCoordinates {
                lat: location.lat,
                lng: location.lng,
            });
        }
        let severity = Severity::new(severity).ok_or(MalformedInput::SeverityOutOfRange(severity))?;
        let candidates = canonical_candidates(candidates)?;

        let symptoms: BTreeSet<String> = symptoms
            .iter()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();

        let id = SignalId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        Ok(NormalizedSignal::new(
            id,
            source_class,
            symptoms,
            severity,
            location,
            candidates,
            timestamp,
        ))
    }
}

/// Validate candidates, collapse duplicates by signature (keeping the highest
/// confidence), and order by confidence descending.
fn canonical_candidates(
    candidates: Vec<DiseaseCandidate>,
) -> Result<Vec<DiseaseCandidate>, MalformedInput> {
    if candidates.is_empty() {
        return Err(MalformedInput::NoDiseaseCandidates);
    }

    let mut best: HashMap<DiseaseSignature, DiseaseCandidate> = HashMap::new();
    for candidate in candidates {
        let signature =
            DiseaseSignature::new(&candidate.name).ok_or(MalformedInput::BlankCandidate)?;
        if !candidate.confidence.is_finite() || !(0.0..=1.0).contains(&candidate.confidence) {
            return Err(MalformedInput::ConfidenceOutOfRange {
                name: candidate.name,
                confidence: candidate.confidence,
            });
        }
        let confidence = candidate.confidence;
        let keep = DiseaseCandidate {
            name: signature.as_str().to_string(),
            confidence,
        };
        best.entry(signature)
            .and_modify(|existing| {
                if confidence > existing.confidence {
                    existing.confidence = confidence;
                }
            })
            .or_insert(keep);
    }

    let mut out: Vec<DiseaseCandidate> = best.into_values().collect();
    out.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.name.cmp(&b.name))
    });
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> IngestRecord {
        IngestRecord {
            source_class: SourceClass::Cbs,
            disease_candidates: vec![DiseaseCandidate {
                name: "Cholera".into(),
                confidence: 0.8,
            }],
            symptoms: vec![" Vomiting ".into(), "diarrhoea".into(), "".into()],
            severity: 3,
            lat: Some(-1.29),
            lng: Some(36.82),
            timestamp: "2026-03-01T08:00:00Z".parse().unwrap(),
        }
    }

    #[test]
    fn normalizes_boundary_record() {
        let n = Normalizer::new();
        let sig = n.normalize_record(record()).unwrap();
        assert_eq!(sig.severity().get(), 3);
        assert_eq!(
            sig.symptoms().iter().collect::<Vec<_>>(),
            vec!["diarrhoea", "vomiting"]
        );
        assert_eq!(sig.disease_candidates()[0].name, "cholera");
        assert_eq!(sig.source_class(), SourceClass::Cbs);
    }

    #[test]
    fn ids_are_unique() {
        let n = Normalizer::new();
        let a = n.normalize_record(record()).unwrap();
        let b = n.normalize_record(record()).unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn missing_location_rejected() {
        let mut r = record();
        r.lng = None;
        let err = Normalizer::new().normalize_record(r).unwrap_err();
        assert_eq!(err, MalformedInput::MissingLocation);
    }

    #[test]
    fn severity_out_of_range_rejected() {
        for bad in [0, 6, -1] {
            let mut r = record();
            r.severity = bad;
            let err = Normalizer::new().normalize_record(r).unwrap_err();
            assert_eq!(err, MalformedInput::SeverityOutOfRange(bad));
        }
    }

    #[test]
    fn invalid_coordinates_rejected() {
        let mut r = record();
        r.lat = Some(123.0);
        assert!(matches!(
            Normalizer::new().normalize_record(r),
            Err(MalformedInput::InvalidCoordinates { .. })
        ));
    }

    #[test]
    fn candidate_checks() {
        let mut r = record();
        r.disease_candidates.clear();
        assert_eq!(
            Normalizer::new().normalize_record(r).unwrap_err(),
            MalformedInput::NoDiseaseCandidates
        );

        let mut r = record();
        r.disease_candidates[0].confidence = 1.5;
        assert!(matches!(
            Normalizer::new().normalize_record(r),
            Err(MalformedInput::ConfidenceOutOfRange { .. })
        ));

        let mut r = record();
        r.disease_candidates[0].name = "  ".into();
        assert_eq!(
            Normalizer::new().normalize_record(r).unwrap_err(),
            MalformedInput::BlankCandidate
        );
    }

    #[test]
    fn duplicate_candidates_keep_highest_confidence() {
        let mut r = record();
        r.disease_candidates = vec![
            DiseaseCandidate { name: "cholera".into(), confidence: 0.4 },
            DiseaseCandidate { name: "Typhoid".into(), confidence: 0.6 },
            DiseaseCandidate { name: "CHOLERA".into(), confidence: 0.7 },
        ];
        let sig = Normalizer::new().normalize_record(r).unwrap();
        let names: Vec<_> = sig.disease_candidates().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["cholera", "typhoid"]);
        assert_eq!(sig.disease_candidates()[0].confidence, 0.7);
    }

    #[test]
    fn raw_signal_payload_parsed() {
        let raw = RawSignal {
            source_class: SourceClass::Voice,
            timestamp: "2026-03-01T08:00:00Z".parse().unwrap(),
            location: Some(GeoPoint::new(-1.29, 36.82)),
            payload: json!({
                "symptoms": ["fever"],
                "severity": 2,
                "disease_candidates": [{"name": "malaria", "confidence": 0.5}]
            }),
        };
        let sig = Normalizer::new().normalize_raw(raw).unwrap();
        assert_eq!(sig.source_class(), SourceClass::Voice);
        let disease = DiseaseSignature::new("malaria").unwrap();
        assert_eq!(sig.confidence_for(&disease), Some(0.5));
    }

    #[test]
    fn raw_signal_unparseable_payload() {
        let raw = RawSignal {
            source_class: SourceClass::Voice,
            timestamp: "2026-03-01T08:00:00Z".parse().unwrap(),
            location: Some(GeoPoint::new(-1.29, 36.82)),
            payload: json!("he said his child has a fever"),
        };
        assert!(matches!(
            Normalizer::new().normalize_raw(raw),
            Err(MalformedInput::UnparseablePayload(_))
        ));
    }

    #[test]
    fn raw_signal_without_location() {
        let raw = RawSignal {
            source_class: SourceClass::Emr,
            timestamp: "2026-03-01T08:00:00Z".parse().unwrap(),
            location: None,
            payload: json!({}),
        };
        assert_eq!(
            Normalizer::new().normalize_raw(raw).unwrap_err(),
            MalformedInput::MissingLocation
        );
    }
}
