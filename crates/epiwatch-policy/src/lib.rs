//! Guardrail: evaluates externally visible actions against jurisdiction-scoped
//! rules and answers allow, or deny with the legal citations behind it.

pub mod error;
pub mod gate;
pub mod rule;

pub use error::PolicyError;
pub use gate::{ActionRequest, Decision, DenyReason, PolicyGate};
pub use rule::{
    ActionPattern, ActionPayload, ActionType, Citation, PolicyRule, Predicate, RuleSet, Verdict,
};
