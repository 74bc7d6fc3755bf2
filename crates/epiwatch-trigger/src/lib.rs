//! Parametric trigger: alert levels and bond status per bucket.
//!
//! The machine only moves on validated evidence. Escalation needs a z-score
//! and, past WATCH, a corroborated bundle; bond release additionally needs a
//! prior ARMED state and release-grade confidence.

pub mod machine;
pub mod registry;
pub mod state;

pub use machine::{Transition, TransitionCause, TransitionError, TriggerMachine, validate_transition};
pub use registry::TriggerRegistry;
pub use state::{AlertLevel, BondStatus, TriggerState};
