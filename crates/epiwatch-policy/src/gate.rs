//! The policy gate.
//!
//! The active [`RuleSet`] sits behind an `Arc` that is swapped whole on
//! reload. A `parking_lot` read lock is held only for the pointer clone;
//! rules are matched after it is released. Readers share that lock, and a
//! reload parses and validates before taking the write lock for a single
//! pointer store, so the only wait is that store. A reload that fails
//! validation leaves the previous set in force.

use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::PolicyError;
use crate::rule::{ActionPayload, ActionType, Citation, RuleSet, Verdict};

/// An externally observable action awaiting authorization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub action_type: ActionType,
    pub payload: ActionPayload,
    pub jurisdiction: String,
}

impl ActionRequest {
    pub fn new(action_type: ActionType, payload: ActionPayload, jurisdiction: impl Into<String>) -> Self {
        Self {
            action_type,
            payload,
            jurisdiction: jurisdiction.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    /// At least one deny rule matched.
    Rule,
    /// Regulated data with no rule authorizing it.
    FailClosed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Decision {
    Allow {
        citations: Vec<Citation>,
    },
    Deny {
        reason: DenyReason,
        /// Deciding rule first.
        citations: Vec<Citation>,
    },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow { .. })
    }

    pub fn citations(&self) -> &[Citation] {
        match self {
            Self::Allow { citations } | Self::Deny { citations, .. } => citations,
        }
    }
}

/// Rule id cited when regulated data is denied for lack of an allow rule.
pub const FAIL_CLOSED_RULE_ID: &str = "default-deny";

pub struct PolicyGate {
    rules: RwLock<Arc<RuleSet>>,
}

impl PolicyGate {
    pub fn new(rules: RuleSet) -> Self {
        Self {
            rules: RwLock::new(Arc::new(rules)),
        }
    }

    pub fn from_path(path: &Path) -> Result<Self, PolicyError> {
        let rules = RuleSet::from_path(path)?;
        info!(version = %rules.version(), rules = rules.len(), "policy rules loaded");
        Ok(Self::new(rules))
    }

    /// The rule set in force right now.
    pub fn current(&self) -> Arc<RuleSet> {
        Arc::clone(&self.rules.read())
    }

    /// Replace the active rule set, returning the previous one.
    pub fn swap(&self, rules: RuleSet) -> Arc<RuleSet> {
        let next = Arc::new(rules);
        std::mem::replace(&mut *self.rules.write(), next)
    }

    /// Load, validate, and install a rule file. On any error the current set
    /// stays active.
    pub fn reload_from_path(&self, path: &Path) -> Result<Arc<RuleSet>, PolicyError> {
        match RuleSet::from_path(path) {
            Ok(rules) => {
                info!(
                    path = %path.display(),
                    version = %rules.version(),
                    rules = rules.len(),
                    "policy rules reloaded"
                );
                self.swap(rules);
                Ok(self.current())
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "policy reload rejected, keeping previous rules");
                Err(e)
            }
        }
    }

    pub fn evaluate(&self, request: &ActionRequest) -> Decision {
        let rules = self.current();
        let decision = decide(&rules, request);
        if let Decision::Deny { reason, citations } = &decision {
            warn!(
                code = "SOVEREIGNTY_VIOLATION",
                action = %request.action_type,
                jurisdiction = %request.jurisdiction,
                data_type = request.payload.data_type().unwrap_or("-"),
                destination = request.payload.destination().unwrap_or("-"),
                ?reason,
                rule = citations.first().map(|c| c.rule_id.as_str()).unwrap_or("-"),
                "policy gate denied action"
            );
        }
        decision
    }

    /// [`evaluate`](Self::evaluate) as a `Result`: allow yields its
    /// citations, deny becomes `SOVEREIGNTY_VIOLATION`.
    pub fn authorize(&self, request: &ActionRequest) -> Result<Vec<Citation>, PolicyError> {
        match self.evaluate(request) {
            Decision::Allow { citations } => Ok(citations),
            Decision::Deny { citations, .. } => Err(PolicyError::SovereigntyViolation {
                action: request.action_type.to_string(),
                jurisdiction: request.jurisdiction.clone(),
                citations,
            }),
        }
    }
}

impl Default for PolicyGate {
    fn default() -> Self {
        Self::new(RuleSet::empty())
    }
}

fn decide(rules: &RuleSet, request: &ActionRequest) -> Decision {
    let mut denies = Vec::new();
    let mut first_allow = None;
    for rule in rules.matching(&request.action_type, &request.payload, &request.jurisdiction) {
        match rule.verdict {
            Verdict::Deny => denies.push(rule.citation()),
            Verdict::Allow if first_allow.is_none() => first_allow = Some(rule.citation()),
            Verdict::Allow => {}
        }
    }

    if !denies.is_empty() {
        return Decision::Deny {
            reason: DenyReason::Rule,
            citations: denies,
        };
    }
    if let Some(allow) = first_allow {
        return Decision::Allow {
            citations: vec![allow],
        };
    }
    match request.payload.data_type() {
        Some(data_type) if rules.is_regulated(data_type) => Decision::Deny {
            reason: DenyReason::FailClosed,
            citations: vec![Citation {
                rule_id: FAIL_CLOSED_RULE_ID.into(),
                reference: format!(
                    "no rule authorizes {} of {} data in {}",
                    request.action_type, data_type, request.jurisdiction
                ),
            }],
        },
        _ => Decision::Allow {
            citations: Vec::new(),
        },
    }
}
