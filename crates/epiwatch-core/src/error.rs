//! Failure taxonomy shared across pipeline stages.
//!
//! Every stage-specific error maps onto one of the five [`ErrorCode`]s so the
//! audit trail, logs, and counters speak the same vocabulary.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable codes for the pipeline's failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Rejected at the normalizer. Logged, never retried.
    MalformedInput,
    /// Baseline too thin to score. Treated as "cannot escalate".
    InsufficientBaseline,
    /// A bounded stage was full.
    Overload,
    /// The policy gate denied an externally visible action.
    SovereigntyViolation,
    /// A trigger-state change broke the transition rules.
    InvalidTransition,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MalformedInput => "MALFORMED_INPUT",
            Self::InsufficientBaseline => "INSUFFICIENT_BASELINE",
            Self::Overload => "OVERLOAD",
            Self::SovereigntyViolation => "SOVEREIGNTY_VIOLATION",
            Self::InvalidTransition => "INVALID_TRANSITION",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the normalizer refused a record.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MalformedInput {
    #[error("missing location")]
    MissingLocation,

    #[error("coordinates out of range: lat={lat}, lng={lng}")]
    InvalidCoordinates { lat: f64, lng: f64 },

    #[error("unparseable payload: {0}")]
    UnparseablePayload(String),

    #[error("severity {0} outside 1-5")]
    SeverityOutOfRange(i64),

    #[error("no disease candidates")]
    NoDiseaseCandidates,

    #[error("blank disease candidate name")]
    BlankCandidate,

    #[error("candidate '{name}' confidence {confidence} outside 0-1")]
    ConfidenceOutOfRange { name: String, confidence: f64 },
}

impl MalformedInput {
    pub fn code(&self) -> ErrorCode {
        ErrorCode::MalformedInput
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_serialize_as_screaming_snake() {
        let json = serde_json::to_string(&ErrorCode::SovereigntyViolation).unwrap();
        assert_eq!(json, "\"SOVEREIGNTY_VIOLATION\"");
        assert_eq!(ErrorCode::Overload.to_string(), "OVERLOAD");
    }

    #[test]
    fn malformed_input_maps_to_its_code() {
        let err = MalformedInput::SeverityOutOfRange(9);
        assert_eq!(err.code(), ErrorCode::MalformedInput);
        assert_eq!(err.to_string(), "severity 9 outside 1-5");
    }
}
