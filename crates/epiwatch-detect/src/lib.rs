//! Detection layer: rolling baselines, anomaly scoring, and the corroboration
//! engine that binds independent reports into evidence bundles.

pub mod anomaly;
pub mod baseline;
pub mod corroboration;

pub use anomaly::{AnomalyDetector, Significance, ZScoreResult};
pub use baseline::{BaselineError, BaselineStore, BaselineWindow, ClosedWindow};
pub use corroboration::{
    BundleExport, BundleId, BundleSnapshot, CorroborationBundle, CorroborationEngine,
    bundle_confidence,
};
