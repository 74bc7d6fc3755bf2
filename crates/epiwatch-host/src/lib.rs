//! Pipeline runtime: normalizes ingested signals, fans them out to
//! single-writer detect shards, corroborates and evaluates triggers on one
//! task, and publishes policy-gated alerts.

pub mod engine;
pub mod error;
pub mod metrics;
pub mod publish;
pub mod queue;
mod stages;

pub use engine::{Engine, ShutdownReport};
pub use error::{HostError, Rejection};
pub use metrics::{MetricsSnapshot, PipelineMetrics};
pub use queue::{BoundedQueue, QueueError};
