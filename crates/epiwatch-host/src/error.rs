use epiwatch_core::{BucketId, ConfigError, ErrorCode, MalformedInput};
use epiwatch_dispatch::AuditError;
use epiwatch_policy::PolicyError;
use serde::Serialize;
use thiserror::Error;

use crate::queue::QueueError;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("malformed input: {0}")]
    Malformed(#[from] MalformedInput),

    #[error("{stage} queue full")]
    Overload { stage: String },

    #[error("{stage} stage has stopped")]
    StageClosed { stage: String },

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error("unknown bucket {0}")]
    UnknownBucket(BucketId),

    #[error("bucket {0} has no justifying bundle")]
    NoBundle(BucketId),

    #[error("bundle for {0} has expired from the corroboration buffer")]
    BundleExpired(BucketId),

    #[error("audit trail: {0}")]
    Audit(#[from] AuditError),

    #[error("config: {0}")]
    Config(#[from] ConfigError),
}

impl From<QueueError> for HostError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::Overload(stage) => Self::Overload {
                stage: stage.to_string(),
            },
            QueueError::Closed(stage) => Self::StageClosed {
                stage: stage.to_string(),
            },
        }
    }
}

impl HostError {
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Malformed(_) => Some(ErrorCode::MalformedInput),
            Self::Overload { .. } => Some(ErrorCode::Overload),
            Self::Policy(e) => e.code(),
            _ => None,
        }
    }

    /// Structured form returned to ingestion clients.
    pub fn rejection(&self) -> Rejection {
        Rejection {
            code: self.code(),
            reason: self.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejection {
    pub code: Option<ErrorCode>,
    pub reason: String,
}
