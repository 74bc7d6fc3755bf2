pub mod config;
pub mod error;
pub mod geo;
pub mod normalize;
pub mod signal;
pub mod window;

pub use config::{ConfigError, EngineConfig, OverflowPolicy, Thresholds};
pub use error::{ErrorCode, MalformedInput};
pub use geo::{BucketId, DiseaseSignature, GeoCell, GeoGrid, GeoPoint, JurisdictionMap};
pub use normalize::Normalizer;
pub use signal::{
    DiseaseCandidate, IngestRecord, NormalizedSignal, RawSignal, Severity, SignalId, SourceClass,
};
pub use window::{WindowIndex, WindowSpec};
