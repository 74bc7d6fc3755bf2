//! Outbound side of the pipeline: alerts built from trigger transitions,
//! per-subscriber delivery, and the append-only audit trail.

pub mod alert;
pub mod audit;
pub mod dispatcher;
pub mod sink;

pub use alert::{Alert, alert_id, idempotency_key};
pub use audit::{AuditError, AuditEvent, AuditRecord, AuditTrail};
pub use dispatcher::{AlertDispatcher, DeliveryReport, DispatchError, Subscription};
pub use sink::{AlertSink, ChannelSink, DedupSink, DeliveryError, JsonlSink, LogSink};

#[cfg(feature = "http")]
pub use sink::WebhookSink;

/// Lower-case hex of a SHA-256 digest.
pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    let digest = ring::digest::digest(&ring::digest::SHA256, bytes);
    hex::encode(digest.as_ref())
}

