mod display;
mod signals;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use epiwatch_core::{EngineConfig, ErrorCode, OverflowPolicy};
use epiwatch_dispatch::{
    AlertSink, AuditTrail, DedupSink, JsonlSink, LogSink, Subscription, WebhookSink,
};
use epiwatch_host::{Engine, Rejection};
use epiwatch_policy::{ActionPayload, ActionRequest, ActionType, PolicyGate, RuleSet};
use serde_json::json;
use tracing::{info, warn};

use crate::signals::SignalLine;

#[derive(Parser)]
#[command(name = "epiwatch", version, about = "Outbreak signal detection with policy-gated alerting")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a JSON-lines signal file through the pipeline
    Run(RunArgs),
    /// Evaluate one proposed action against a rule file
    Evaluate {
        #[arg(long, env = "EPIWATCH_RULES")]
        rules: PathBuf,
        /// Action type, e.g. DATA_TRANSFER or ALERT_PUBLISH
        #[arg(long)]
        action: String,
        #[arg(long)]
        jurisdiction: String,
        /// Payload field as key=value; repeatable
        #[arg(long = "field", value_parser = parse_field)]
        fields: Vec<(String, String)>,
        #[arg(long)]
        json: bool,
    },
    /// Validate a rule file and list its rules in evaluation order
    CheckRules {
        #[arg(env = "EPIWATCH_RULES")]
        rules: PathBuf,
    },
    /// Verify the hash chain of an audit file
    VerifyAudit { path: PathBuf },
}

#[derive(Args)]
struct RunArgs {
    /// Signal file, one JSON object per line
    signals: PathBuf,
    #[arg(long, env = "EPIWATCH_CONFIG")]
    config: Option<PathBuf>,
    #[arg(long, env = "EPIWATCH_RULES")]
    rules: Option<PathBuf>,
    /// Append the audit trail to this JSON-lines file
    #[arg(long)]
    audit: Option<PathBuf>,
    /// Lines are raw adapter payloads rather than structured records
    #[arg(long)]
    raw: bool,
    /// Wait for queue room instead of dropping under load
    #[arg(long)]
    block: bool,
    /// Append alerts to this JSON-lines file
    #[arg(long)]
    alerts: Option<PathBuf>,
    /// POST alerts to this URL
    #[arg(long)]
    webhook: Option<String>,
    /// Destination class of the webhook receiver, as matched by policy rules
    #[arg(long, default_value = "local")]
    webhook_destination: String,
    /// Close every window ending before this instant once the file is read
    #[arg(long)]
    sweep_until: Option<DateTime<Utc>>,
    /// Print the summary as JSON
    #[arg(long)]
    json: bool,
}

fn parse_field(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("'{s}' is not key=value"))?;
    if key.trim().is_empty() {
        return Err(format!("'{s}' has an empty key"));
    }
    Ok((key.trim().to_string(), value.trim().to_string()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run(args).await,
        Command::Evaluate {
            rules,
            action,
            jurisdiction,
            fields,
            json,
        } => evaluate(&rules, &action, &jurisdiction, fields, json),
        Command::CheckRules { rules } => check_rules(&rules),
        Command::VerifyAudit { path } => verify_audit(&path),
    }
}

// ── run ──

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::from_path(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if args.block {
        config.pipeline.overflow = OverflowPolicy::Block;
    }
    let gate = match &args.rules {
        Some(path) => PolicyGate::from_path(path)
            .with_context(|| format!("loading rules {}", path.display()))?,
        None => {
            warn!("no rule file given; regulated data types fail closed");
            PolicyGate::default()
        }
    };
    let audit = match &args.audit {
        Some(path) => AuditTrail::open(path)?,
        None => AuditTrail::in_memory(),
    };

    let engine = Engine::start(config, Arc::new(gate), Arc::new(audit), subscribers(&args))?;
    info!(version = env!("CARGO_PKG_VERSION"), signals = %args.signals.display(), "epiwatch run");

    let mut rejections: Vec<(usize, Rejection)> = Vec::new();
    for (line, parsed) in signals::read(&args.signals, args.raw)? {
        let outcome = match parsed {
            Ok(SignalLine::Record(record)) => engine.ingest(record).await.map(|_| ()),
            Ok(SignalLine::Raw(raw)) => engine.ingest_raw(raw).await.map(|_| ()),
            Err(reason) => {
                warn!(code = %ErrorCode::MalformedInput, line, "{reason}");
                rejections.push((
                    line,
                    Rejection {
                        code: Some(ErrorCode::MalformedInput),
                        reason,
                    },
                ));
                continue;
            }
        };
        if let Err(e) = outcome {
            rejections.push((line, e.rejection()));
        }
    }

    engine.flush().await?;
    if let Some(until) = args.sweep_until {
        engine.sweep(until).await?;
    }
    let states = engine.states();
    let chain = engine.audit().verify();
    let report = engine.shutdown().await;
    if report.delivery.failed() > 0 {
        warn!(
            undelivered = report.delivery.failed(),
            "alerts left unacknowledged, kept in the audit trail as delivery_pending"
        );
    }

    if args.json {
        let summary = json!({
            "states": states,
            "metrics": report.metrics,
            "delivery": report.delivery,
            "rejections": rejections
                .iter()
                .map(|(line, r)| json!({"line": line, "code": r.code, "reason": r.reason}))
                .collect::<Vec<_>>(),
            "audit_chain_intact": chain.is_ok(),
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("{}", display::headline(&states));
        println!();
        display::print_states(&states);
        display::print_rejections(&rejections);
        display::print_report(&report);
    }
    chain.context("audit chain failed verification")?;
    Ok(())
}

fn subscribers(args: &RunArgs) -> Vec<(Subscription, Arc<dyn AlertSink>)> {
    let mut subs: Vec<(Subscription, Arc<dyn AlertSink>)> = Vec::new();
    if let Some(path) = &args.alerts {
        let sink: Arc<dyn AlertSink> = Arc::new(DedupSink::new(JsonlSink::new(path)));
        subs.push((Subscription::new("file", "local"), sink));
    }
    if let Some(url) = &args.webhook {
        let sink: Arc<dyn AlertSink> = Arc::new(DedupSink::new(WebhookSink::new(url.clone())));
        subs.push((
            Subscription::new("webhook", args.webhook_destination.clone()),
            sink,
        ));
    }
    if subs.is_empty() {
        let sink: Arc<dyn AlertSink> = Arc::new(LogSink);
        subs.push((Subscription::new("log", "local"), sink));
    }
    subs
}

// ── policy ──

fn evaluate(
    rules: &Path,
    action: &str,
    jurisdiction: &str,
    fields: Vec<(String, String)>,
    json: bool,
) -> anyhow::Result<()> {
    let gate = PolicyGate::from_path(rules)
        .with_context(|| format!("loading rules {}", rules.display()))?;
    let payload = fields
        .into_iter()
        .fold(ActionPayload::new(), |payload, (k, v)| payload.with(k, v));
    let request = ActionRequest::new(ActionType::new(action), payload, jurisdiction);
    let decision = gate.evaluate(&request);
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({"request": request, "decision": decision}))?
        );
    } else {
        display::print_decision(&request, &decision);
    }
    Ok(())
}

fn check_rules(path: &Path) -> anyhow::Result<()> {
    let rules =
        RuleSet::from_path(path).with_context(|| format!("loading rules {}", path.display()))?;
    display::print_rules(&rules);
    Ok(())
}

fn verify_audit(path: &Path) -> anyhow::Result<()> {
    if !path.exists() {
        bail!("audit file {} does not exist", path.display());
    }
    let trail = AuditTrail::open(path)?;
    println!("{}: {} records, chain intact", path.display(), trail.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_parsing() {
        assert_eq!(
            parse_field("data_type=PHI").unwrap(),
            ("data_type".to_string(), "PHI".to_string())
        );
        assert_eq!(
            parse_field(" destination = foreign_cloud ").unwrap(),
            ("destination".to_string(), "foreign_cloud".to_string())
        );
        assert!(parse_field("no-equals").is_err());
        assert!(parse_field("=value").is_err());
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn demo_files_load() {
        let demos = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../demos");
        EngineConfig::from_path(&demos.join("config.json")).unwrap();
        let rules = RuleSet::from_path(&demos.join("rules.json")).unwrap();
        assert_eq!(rules.len(), 4);
        let lines = signals::read(&demos.join("signals.jsonl"), false).unwrap();
        assert_eq!(lines.iter().filter(|(_, l)| l.is_err()).count(), 1);
    }

    #[test]
    fn run_args_parse() {
        let cli = Cli::try_parse_from([
            "epiwatch",
            "run",
            "signals.jsonl",
            "--block",
            "--sweep-until",
            "2026-03-10T00:00:00Z",
        ])
        .unwrap();
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert!(args.block);
        assert_eq!(args.sweep_until, Some("2026-03-10T00:00:00Z".parse().unwrap()));
    }
}
