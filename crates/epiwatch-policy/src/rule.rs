//! Rule model and rule-set loading.
//!
//! A rule set is a JSON document:
//!
//! ```json
//! {
//!   "version": "2026-03",
//!   "regulated_data_types": ["PHI", "PII", "GENOMIC"],
//!   "rules": [{
//!     "id": "ke-dpa-local",
//!     "jurisdiction": "KE",
//!     "action_type": "DATA_TRANSFER",
//!     "payload_predicate": {"data_type": ["PHI"], "destination": {"not": ["local"]}},
//!     "verdict": "deny",
//!     "citation": "Data Protection Act 2019 s.50 (requires_local_processing)"
//!   }]
//! }
//! ```
//!
//! Rules are validated and sorted by specificity when the set is built, so
//! evaluation is a single pass over an immutable vector.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::PolicyError;

// ── Actions ──

/// Upper-case action name, e.g. `DATA_TRANSFER`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionType(String);

impl ActionType {
    pub const DATA_TRANSFER: &'static str = "DATA_TRANSFER";
    pub const ALERT_PUBLISH: &'static str = "ALERT_PUBLISH";

    pub fn new(name: &str) -> Self {
        Self(name.trim().to_uppercase())
    }

    pub fn data_transfer() -> Self {
        Self(Self::DATA_TRANSFER.into())
    }

    pub fn alert_publish() -> Self {
        Self(Self::ALERT_PUBLISH.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Attribute map describing what an action would do.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionPayload(BTreeMap<String, String>);

impl ActionPayload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn data_type(&self) -> Option<&str> {
        self.get("data_type")
    }

    pub fn destination(&self) -> Option<&str> {
        self.get("destination")
    }
}

// ── Rules ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    #[serde(alias = "ALLOW")]
    Allow,
    #[serde(alias = "DENY")]
    Deny,
}

/// Legal basis attached to a decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub rule_id: String,
    pub reference: String,
}

/// Which action types a rule applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionPattern {
    Exact(String),
    /// `DATA_*`
    Prefix(String),
    /// `*`
    Any,
}

impl ActionPattern {
    fn parse(raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        if raw == "*" {
            return Ok(Self::Any);
        }
        let (stem, prefix) = match raw.strip_suffix('*') {
            Some(stem) => (stem, true),
            None => (raw, false),
        };
        let valid = !stem.is_empty()
            && stem
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_');
        if !valid {
            return Err(format!("action_type '{raw}' must be UPPER_SNAKE, PREFIX_* or *"));
        }
        Ok(if prefix {
            Self::Prefix(stem.to_string())
        } else {
            Self::Exact(stem.to_string())
        })
    }

    fn matches(&self, action: &ActionType) -> bool {
        match self {
            Self::Exact(name) => name == action.as_str(),
            Self::Prefix(stem) => action.as_str().starts_with(stem.as_str()),
            Self::Any => true,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Exact(_) => 2,
            Self::Prefix(_) => 1,
            Self::Any => 0,
        }
    }
}

/// Condition on one payload field. A missing field never matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Predicate {
    /// `["A", "B"]`: value is one of these.
    AnyOf(Vec<String>),
    /// `{"not": ["A"]}`: value is present and none of these.
    NoneOf { not: Vec<String> },
    /// `"*"`: any present value.
    Present(String),
}

impl Predicate {
    fn matches(&self, value: Option<&str>) -> bool {
        let Some(value) = value else {
            return false;
        };
        match self {
            Self::AnyOf(options) => options.iter().any(|o| o == value),
            Self::NoneOf { not } => !not.iter().any(|o| o == value),
            Self::Present(_) => true,
        }
    }

    fn check(&self) -> Result<(), String> {
        match self {
            Self::Present(s) if s != "*" => Err(format!("predicate string must be \"*\", got '{s}'")),
            Self::AnyOf(v) if v.is_empty() => Err("empty any-of predicate never matches".into()),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub id: String,
    /// Jurisdiction id, or `*` for every jurisdiction.
    pub jurisdiction: String,
    pub action_type: String,
    #[serde(default)]
    pub payload_predicate: BTreeMap<String, Predicate>,
    pub verdict: Verdict,
    pub citation: String,
}

impl PolicyRule {
    pub fn citation(&self) -> Citation {
        Citation {
            rule_id: self.id.clone(),
            reference: self.citation.clone(),
        }
    }

    pub(crate) fn matches(
        &self,
        pattern: &ActionPattern,
        action: &ActionType,
        payload: &ActionPayload,
        jurisdiction: &str,
    ) -> bool {
        (self.jurisdiction == "*" || self.jurisdiction == jurisdiction)
            && pattern.matches(action)
            && self
                .payload_predicate
                .iter()
                .all(|(field, p)| p.matches(payload.get(field)))
    }

    fn specificity(&self, pattern: &ActionPattern) -> (u8, u8, usize) {
        (
            u8::from(self.jurisdiction != "*"),
            pattern.rank(),
            self.payload_predicate.len(),
        )
    }
}

// ── Rule sets ──

#[derive(Deserialize)]
struct RuleSetFile {
    #[serde(default)]
    version: String,
    #[serde(default = "default_regulated")]
    regulated_data_types: Vec<String>,
    rules: Vec<PolicyRule>,
}

fn default_regulated() -> Vec<String> {
    vec!["PHI".into(), "PII".into(), "GENOMIC".into()]
}

/// Validated, specificity-ordered rules. Immutable once built.
#[derive(Debug, Clone)]
pub struct RuleSet {
    version: String,
    regulated: BTreeSet<String>,
    rules: Vec<(ActionPattern, PolicyRule)>,
}

impl RuleSet {
    /// No rules: regulated data is denied, everything else allowed.
    pub fn empty() -> Self {
        Self {
            version: String::new(),
            regulated: default_regulated().into_iter().collect(),
            rules: Vec::new(),
        }
    }

    pub fn new(
        version: impl Into<String>,
        regulated_data_types: Vec<String>,
        rules: Vec<PolicyRule>,
    ) -> Result<Self, PolicyError> {
        let invalid = |msg: String| PolicyError::InvalidRuleSet(msg);

        let mut seen = HashSet::new();
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            if rule.id.trim().is_empty() {
                return Err(invalid("rule with empty id".into()));
            }
            if !seen.insert(rule.id.clone()) {
                return Err(invalid(format!("duplicate rule id '{}'", rule.id)));
            }
            if rule.citation.trim().is_empty() {
                return Err(invalid(format!("rule '{}' has no citation", rule.id)));
            }
            if rule.jurisdiction.trim().is_empty() {
                return Err(invalid(format!("rule '{}' has no jurisdiction", rule.id)));
            }
            let pattern = ActionPattern::parse(&rule.action_type)
                .map_err(|e| invalid(format!("rule '{}': {e}", rule.id)))?;
            for (field, p) in &rule.payload_predicate {
                p.check()
                    .map_err(|e| invalid(format!("rule '{}' field '{field}': {e}", rule.id)))?;
            }
            compiled.push((pattern, rule));
        }
        // Stable: equal specificity keeps file order.
        compiled.sort_by_key(|(pattern, rule)| Reverse(rule.specificity(pattern)));

        Ok(Self {
            version: version.into(),
            regulated: regulated_data_types
                .iter()
                .map(|t| t.trim().to_uppercase())
                .collect(),
            rules: compiled,
        })
    }

    pub fn from_json_str(text: &str) -> Result<Self, PolicyError> {
        let file: RuleSetFile = serde_json::from_str(text)?;
        Self::new(file.version, file.regulated_data_types, file.rules)
    }

    pub fn from_path(path: &Path) -> Result<Self, PolicyError> {
        let text = std::fs::read_to_string(path).map_err(|source| PolicyError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rules in evaluation order.
    pub fn rules(&self) -> impl Iterator<Item = &PolicyRule> {
        self.rules.iter().map(|(_, r)| r)
    }

    pub fn is_regulated(&self, data_type: &str) -> bool {
        self.regulated.contains(&data_type.trim().to_uppercase())
    }

    pub fn regulated_data_types(&self) -> impl Iterator<Item = &str> {
        self.regulated.iter().map(String::as_str)
    }

    /// Matching rules in specificity order.
    pub(crate) fn matching<'a>(
        &'a self,
        action: &'a ActionType,
        payload: &'a ActionPayload,
        jurisdiction: &'a str,
    ) -> impl Iterator<Item = &'a PolicyRule> + 'a {
        self.rules
            .iter()
            .filter(move |(pattern, rule)| rule.matches(pattern, action, payload, jurisdiction))
            .map(|(_, rule)| rule)
    }
}

impl Default for RuleSet {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(id: &str, jurisdiction: &str, action: &str, verdict: Verdict) -> PolicyRule {
        PolicyRule {
            id: id.into(),
            jurisdiction: jurisdiction.into(),
            action_type: action.into(),
            payload_predicate: BTreeMap::new(),
            verdict,
            citation: format!("cite {id}"),
        }
    }

    #[test]
    fn action_patterns() {
        assert_eq!(ActionPattern::parse("*").unwrap(), ActionPattern::Any);
        assert_eq!(
            ActionPattern::parse("DATA_*").unwrap(),
            ActionPattern::Prefix("DATA_".into())
        );
        let prefix = ActionPattern::parse("DATA_*").unwrap();
        assert!(prefix.matches(&ActionType::new("data_export")));
        assert!(!prefix.matches(&ActionType::alert_publish()));
        assert!(ActionPattern::parse("data_transfer").is_err());
        assert!(ActionPattern::parse("").is_err());
    }

    #[test]
    fn predicates_parse_from_json() {
        let p: BTreeMap<String, Predicate> = serde_json::from_str(
            r#"{"data_type": ["PHI", "PII"], "destination": {"not": ["local"]}, "purpose": "*"}"#,
        )
        .unwrap();
        assert_eq!(p["data_type"], Predicate::AnyOf(vec!["PHI".into(), "PII".into()]));
        assert_eq!(p["destination"], Predicate::NoneOf { not: vec!["local".into()] });
        assert!(p["destination"].matches(Some("foreign_cloud")));
        assert!(!p["destination"].matches(Some("local")));
        assert!(!p["destination"].matches(None));
        assert!(p["purpose"].matches(Some("research")));
        assert!(!p["purpose"].matches(None));
    }

    #[test]
    fn specificity_ordering() {
        let set = RuleSet::new(
            "v1",
            default_regulated(),
            vec![
                rule("any", "*", "*", Verdict::Allow),
                rule("prefix", "*", "DATA_*", Verdict::Allow),
                rule("exact-action", "*", "DATA_TRANSFER", Verdict::Allow),
                rule("exact-juris", "KE", "*", Verdict::Allow),
            ],
        )
        .unwrap();
        let order: Vec<_> = set.rules().map(|r| r.id.as_str()).collect();
        assert_eq!(order, vec!["exact-juris", "exact-action", "prefix", "any"]);
    }

    #[test]
    fn predicate_count_breaks_ties_then_file_order() {
        let mut narrow = rule("narrow", "KE", "DATA_TRANSFER", Verdict::Deny);
        narrow
            .payload_predicate
            .insert("data_type".into(), Predicate::AnyOf(vec!["PHI".into()]));
        let set = RuleSet::new(
            "",
            vec![],
            vec![
                rule("first", "KE", "DATA_TRANSFER", Verdict::Allow),
                rule("second", "KE", "DATA_TRANSFER", Verdict::Allow),
                narrow,
            ],
        )
        .unwrap();
        let order: Vec<_> = set.rules().map(|r| r.id.as_str()).collect();
        assert_eq!(order, vec!["narrow", "first", "second"]);
    }

    #[test]
    fn validation_failures() {
        let dup = RuleSet::new(
            "",
            vec![],
            vec![
                rule("a", "KE", "*", Verdict::Allow),
                rule("a", "UG", "*", Verdict::Deny),
            ],
        );
        assert!(matches!(dup, Err(PolicyError::InvalidRuleSet(m)) if m.contains("duplicate")));

        let mut uncited = rule("b", "KE", "*", Verdict::Deny);
        uncited.citation = "  ".into();
        assert!(RuleSet::new("", vec![], vec![uncited]).is_err());

        let mut bad_pred = rule("c", "KE", "*", Verdict::Deny);
        bad_pred
            .payload_predicate
            .insert("destination".into(), Predicate::Present("local".into()));
        assert!(RuleSet::new("", vec![], vec![bad_pred]).is_err());
    }

    #[test]
    fn regulated_types_case_insensitive() {
        let set = RuleSet::from_json_str(r#"{"regulated_data_types": ["phi"], "rules": []}"#).unwrap();
        assert!(set.is_regulated("PHI"));
        assert!(!set.is_regulated("GENOMIC"));
        assert!(RuleSet::empty().is_regulated("genomic"));
    }
}
