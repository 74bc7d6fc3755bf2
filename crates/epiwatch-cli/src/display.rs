//! Human-readable summaries for the terminal.

use epiwatch_host::{Rejection, ShutdownReport};
use epiwatch_policy::{ActionRequest, Decision, RuleSet};
use epiwatch_trigger::{AlertLevel, BondStatus, TriggerState};

const MAX_REJECTIONS: usize = 20;

// ── Run summary ──

/// Print every non-dormant bucket, highest level first.
pub fn print_states(states: &[TriggerState]) {
    let mut active: Vec<&TriggerState> = states.iter().filter(|s| !s.is_dormant()).collect();
    active.sort_by(|a, b| b.alert_level.cmp(&a.alert_level).then(a.bucket.cmp(&b.bucket)));

    println!("=== Buckets ({} tracked, {} active) ===", states.len(), active.len());
    if active.is_empty() {
        println!("  all quiet");
        println!();
        return;
    }
    println!(
        "  {:<28} {:<6} {:<16} {:>7} {:>6} {:>4}  {}",
        "bucket", "level", "bond", "z", "conf", "src", "episode"
    );
    for s in active {
        let z = s.last_z.map_or("-".to_string(), |z| format!("{z:.2}"));
        let (conf, sources) = s
            .justifying_bundle
            .as_ref()
            .map_or(("-".to_string(), "-".to_string()), |b| {
                (format!("{:.2}", b.confidence), b.source_diversity.to_string())
            });
        println!(
            "  {:<28} {:<6} {:<16} {:>7} {:>6} {:>4}  {}",
            s.bucket.to_string(),
            s.alert_level.as_str(),
            s.bond_status.as_str(),
            z,
            conf,
            sources,
            s.episode
        );
    }
    println!();
}

pub fn print_rejections(rejections: &[(usize, Rejection)]) {
    if rejections.is_empty() {
        return;
    }
    println!("=== Rejected lines ({}) ===", rejections.len());
    for (line, r) in rejections.iter().take(MAX_REJECTIONS) {
        let code = r.code.map_or("-", |c| c.as_str());
        println!("  line {:<6} {:<24} {}", line, code, r.reason);
    }
    if rejections.len() > MAX_REJECTIONS {
        println!("  ... and {} more", rejections.len() - MAX_REJECTIONS);
    }
    println!();
}

pub fn print_report(report: &ShutdownReport) {
    let m = &report.metrics;
    println!("=== Pipeline ===");
    println!("  {:<26} {}", "ingested", m.ingested);
    println!("  {:<26} {}", "malformed", m.malformed);
    println!("  {:<26} {}", "observations", m.observations);
    println!("  {:<26} {}", "insufficient baseline", m.insufficient_baseline);
    println!("  {:<26} {}", "windows closed", m.windows_closed);
    println!("  {:<26} {}", "transitions", m.transitions);
    if m.invalid_transitions > 0 {
        println!("  {:<26} {}", "invalid transitions", m.invalid_transitions);
    }
    println!("  {:<26} {}", "alerts published", m.alerts_published);
    println!("  {:<26} {}", "sovereignty denials", m.sovereignty_denials);
    if m.overload > 0 {
        println!("  {:<26} {}", "overload drops", m.overload);
    }
    println!();

    println!("=== Delivery ===");
    for s in &report.delivery.subscribers {
        println!(
            "  {:<16} delivered {:<5} retries {:<5} failed {:<5} dropped {}",
            s.name, s.delivered, s.retries, s.failed, s.dropped
        );
    }
    println!();
}

// ── Policy ──

pub fn print_decision(request: &ActionRequest, decision: &Decision) {
    println!("{} in {}", request.action_type, request.jurisdiction);
    match decision {
        Decision::Allow { .. } => println!("  verdict: ALLOW"),
        Decision::Deny { reason, .. } => println!("  verdict: DENY ({reason:?})"),
    }
    for c in decision.citations() {
        println!("  {:<20} {}", c.rule_id, c.reference);
    }
}

/// Print a rule set in evaluation order.
pub fn print_rules(rules: &RuleSet) {
    println!("=== Rules {} ({}) ===", rules.version(), rules.len());
    let regulated: Vec<&str> = rules.regulated_data_types().collect();
    println!("  regulated data types: {}", regulated.join(", "));
    println!();
    for rule in rules.rules() {
        let predicate = if rule.payload_predicate.is_empty() {
            "*".to_string()
        } else {
            serde_json::to_string(&rule.payload_predicate).unwrap_or_else(|_| "?".into())
        };
        println!(
            "  {:<5} {:<24} {:<6} {:<14} {}",
            format!("{:?}", rule.verdict).to_uppercase(),
            rule.id,
            rule.jurisdiction,
            rule.action_type,
            predicate
        );
        println!("        {}", rule.citation);
    }
}

/// One-line banner for the highest level reached in a run.
pub fn headline(states: &[TriggerState]) -> String {
    let top = states
        .iter()
        .map(|s| s.alert_level)
        .max()
        .unwrap_or(AlertLevel::Green);
    let released = states
        .iter()
        .filter(|s| s.bond_status == BondStatus::PayoutReleased)
        .count();
    match released {
        0 => format!("highest level {top}"),
        n => format!("highest level {top}, {n} bond release(s)"),
    }
}
