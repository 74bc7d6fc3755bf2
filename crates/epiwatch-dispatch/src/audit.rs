//! Append-only, hash-chained audit trail.
//!
//! Each record carries the hash of its predecessor and its own SHA-256 over
//! the canonical JSON of its contents plus that predecessor hash. Editing,
//! dropping or reordering any record breaks every hash after it, which
//! [`verify_chain`] reports. Records optionally go to a JSON-lines file that
//! is re-verified and continued on open.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("audit JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("audit chain broken at record {seq}: {reason}")]
    ChainBroken { seq: u64, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEvent {
    Transition,
    TransitionRejected,
    AlertDispatched,
    PolicyDenied,
    TransferAuthorized,
    RulesReloaded,
    Overload,
    /// An alert left unacknowledged at shutdown; `detail.alert` holds it in
    /// full for redelivery.
    DeliveryPending,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub seq: u64,
    pub event: AuditEvent,
    /// Bucket id, subscriber name, or rule file the event concerns.
    pub resource: String,
    pub detail: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub prev_hash: String,
    pub hash: String,
}

#[derive(Serialize)]
struct HashedFields<'a> {
    seq: u64,
    event: AuditEvent,
    resource: &'a str,
    detail: &'a serde_json::Value,
    timestamp: DateTime<Utc>,
    prev_hash: &'a str,
}

impl AuditRecord {
    fn compute_hash(&self) -> Result<String, serde_json::Error> {
        let bytes = serde_json::to_vec(&HashedFields {
            seq: self.seq,
            event: self.event,
            resource: &self.resource,
            detail: &self.detail,
            timestamp: self.timestamp,
            prev_hash: &self.prev_hash,
        })?;
        Ok(crate::sha256_hex(&bytes))
    }
}

/// Check sequence numbers, back-links, and hashes from genesis.
pub fn verify_chain(records: &[AuditRecord]) -> Result<(), AuditError> {
    let mut prev = GENESIS_HASH.to_string();
    for (i, record) in records.iter().enumerate() {
        let broken = |reason: &str| AuditError::ChainBroken {
            seq: record.seq,
            reason: reason.to_string(),
        };
        if record.seq != i as u64 {
            return Err(broken("sequence gap"));
        }
        if record.prev_hash != prev {
            return Err(broken("previous-hash mismatch"));
        }
        if record.compute_hash()? != record.hash {
            return Err(broken("content hash mismatch"));
        }
        prev = record.hash.clone();
    }
    Ok(())
}

struct Chain {
    records: Vec<AuditRecord>,
    last_hash: String,
    file: Option<(PathBuf, File)>,
}

pub struct AuditTrail {
    chain: Mutex<Chain>,
}

impl AuditTrail {
    pub fn in_memory() -> Self {
        Self {
            chain: Mutex::new(Chain {
                records: Vec::new(),
                last_hash: GENESIS_HASH.to_string(),
                file: None,
            }),
        }
    }

    /// Open (or create) a JSON-lines audit file. Existing records are
    /// verified and the chain continues from the last one.
    pub fn open(path: &Path) -> Result<Self, AuditError> {
        let io = |source: std::io::Error| AuditError::Io {
            path: path.to_path_buf(),
            source,
        };
        let records = if path.exists() {
            let reader = BufReader::new(File::open(path).map_err(io)?);
            let mut records = Vec::new();
            for line in reader.lines() {
                let line = line.map_err(io)?;
                if line.trim().is_empty() {
                    continue;
                }
                records.push(serde_json::from_str::<AuditRecord>(&line)?);
            }
            verify_chain(&records)?;
            records
        } else {
            Vec::new()
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(io)?;
        let last_hash = records
            .last()
            .map(|r| r.hash.clone())
            .unwrap_or_else(|| GENESIS_HASH.to_string());
        info!(path = %path.display(), records = records.len(), "audit trail opened");
        Ok(Self {
            chain: Mutex::new(Chain {
                records,
                last_hash,
                file: Some((path.to_path_buf(), file)),
            }),
        })
    }

    /// Append one record.
    pub fn record(
        &self,
        event: AuditEvent,
        resource: impl Into<String>,
        detail: serde_json::Value,
    ) -> Result<AuditRecord, AuditError> {
        let mut chain = self.chain.lock();
        let mut record = AuditRecord {
            seq: chain.records.len() as u64,
            event,
            resource: resource.into(),
            detail,
            timestamp: Utc::now(),
            prev_hash: chain.last_hash.clone(),
            hash: String::new(),
        };
        record.hash = record.compute_hash()?;

        if let Some((path, file)) = chain.file.as_mut() {
            let mut line = serde_json::to_vec(&record)?;
            line.push(b'\n');
            file.write_all(&line)
                .and_then(|()| file.flush())
                .map_err(|source| AuditError::Io {
                    path: path.clone(),
                    source,
                })?;
        }

        debug!(seq = record.seq, event = ?record.event, resource = %record.resource, "audit record appended");
        chain.last_hash = record.hash.clone();
        chain.records.push(record.clone());
        Ok(record)
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.chain.lock().records.clone()
    }

    pub fn len(&self) -> usize {
        self.chain.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.lock().records.is_empty()
    }

    pub fn verify(&self) -> Result<(), AuditError> {
        verify_chain(&self.chain.lock().records)
    }
}

impl Default for AuditTrail {
    fn default() -> Self {
        Self::in_memory()
    }
}
