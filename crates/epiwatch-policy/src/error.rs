use std::path::PathBuf;

use epiwatch_core::ErrorCode;
use thiserror::Error;

use crate::rule::Citation;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("reading rule set {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("rule set JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid rule set: {0}")]
    InvalidRuleSet(String),

    #[error("{action} denied in {jurisdiction} ({})", cited_ids(.citations))]
    SovereigntyViolation {
        action: String,
        jurisdiction: String,
        citations: Vec<Citation>,
    },
}

impl PolicyError {
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::SovereigntyViolation { .. } => Some(ErrorCode::SovereigntyViolation),
            _ => None,
        }
    }

    pub fn citations(&self) -> &[Citation] {
        match self {
            Self::SovereigntyViolation { citations, .. } => citations,
            _ => &[],
        }
    }
}

fn cited_ids(citations: &[Citation]) -> String {
    citations
        .iter()
        .map(|c| c.rule_id.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}
