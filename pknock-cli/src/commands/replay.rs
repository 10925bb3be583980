//! `pknock replay` command handler
//!
//! Feeds a recorded knock trace through a fresh engine built from the
//! configuration. Time is driven by the trace's `at_ms` offsets through a
//! manual clock, so a replay is deterministic and finishes immediately.

use std::io::Write;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use pknock_core::config::PknockConfig;
use pknock_core::error::PknockError;
use pknock_core::types::{KnockPacket, Protocol};
use pknock_engine::{
    KnockService, ManualClock, RuleKind, RuleName, RuleSnapshot, SourcePhase,
};

use crate::cli::ReplayArgs;
use crate::error::CliError;
use crate::output::{OutputWriter, Render};

/// One recorded packet.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TraceRecord {
    /// Milliseconds since the start of the trace.
    pub at_ms: u64,
    /// Rule name the packet is evaluated against.
    pub rule: String,
    /// Evaluate against the check_ip rule of that name instead of the knock rule.
    #[serde(default)]
    pub check: bool,
    pub src: IpAddr,
    pub port: u16,
    pub protocol: Protocol,
    #[serde(default)]
    pub token: Option<String>,
}

/// Execute the `replay` command.
pub async fn execute(
    args: ReplayArgs,
    loaded: Result<PknockConfig, PknockError>,
    writer: &OutputWriter,
) -> Result<(), CliError> {
    let config = loaded?;
    let records = read_trace(&args.trace).await?;
    info!(path = %args.trace.display(), records = records.len(), "replaying trace");

    let mut report = replay(&config, &records)?;
    report.trace = args.trace.display().to_string();
    if args.matched_only {
        report.decisions.retain(|d| d.matched);
    }

    writer.render(&report)
}

/// Read and parse a JSON trace file.
pub async fn read_trace(path: &Path) -> Result<Vec<TraceRecord>, CliError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| CliError::Trace(format!("{}: {}", path.display(), e)))?;
    parse_trace(&content)
}

/// Parse a JSON trace (an array of records).
pub fn parse_trace(content: &str) -> Result<Vec<TraceRecord>, CliError> {
    serde_json::from_str(content).map_err(|e| CliError::Trace(e.to_string()))
}

/// Replay records in order and collect every decision.
///
/// # Errors
///
/// - `CliError::Core`: the configuration's rules could not be installed
/// - `CliError::Trace`: a record goes back in time or names an invalid rule
pub fn replay(config: &PknockConfig, records: &[TraceRecord]) -> Result<ReplayReport, CliError> {
    let clock = Arc::new(ManualClock::new());
    let service = KnockService::builder()
        .settings(config.engine.clone())
        .rules(config.rules.iter().cloned())
        .clock(clock.clone())
        .build()?;
    let registry = service.registry();

    let mut decisions = Vec::with_capacity(records.len());
    let mut last_at = 0;

    for (index, record) in records.iter().enumerate() {
        if record.at_ms < last_at {
            return Err(CliError::Trace(format!(
                "record #{}: at_ms {} is earlier than the previous record ({})",
                index, record.at_ms, last_at
            )));
        }
        last_at = record.at_ms;
        clock.advance_to(Duration::from_millis(record.at_ms));

        let name = RuleName::new(record.rule.clone())
            .map_err(|e| CliError::Trace(format!("record #{}: {}", index, e)))?;
        let kind = if record.check {
            RuleKind::Check
        } else {
            RuleKind::Knock
        };

        let mut packet = KnockPacket::new(record.src, record.port, record.protocol);
        if let Some(token) = &record.token {
            packet = packet.with_token(token.as_bytes());
        }

        // Unknown rules never match, same as a live lookup miss.
        let matched = match registry.lookup(name.as_str(), kind) {
            Some(id) => registry.evaluate(&id, &packet),
            None => {
                warn!(
                    index,
                    rule = %name,
                    kind = kind.as_str(),
                    "trace names a rule that is not installed"
                );
                false
            }
        };
        let phase = registry
            .source_state(&record.rule, record.src)
            .map(|view| view.phase);
        debug!(
            index,
            rule = %name,
            src = %record.src,
            port = record.port,
            matched,
            "replayed packet"
        );

        decisions.push(ReplayDecision {
            index,
            at_ms: record.at_ms,
            rule: record.rule.clone(),
            kind: kind.as_str(),
            src: record.src,
            port: record.port,
            protocol: record.protocol,
            has_token: record.token.is_some(),
            matched,
            phase,
        });
    }

    Ok(ReplayReport {
        trace: String::new(),
        packets: records.len(),
        matched: decisions.iter().filter(|d| d.matched).count(),
        decisions,
        rules: registry.snapshots(),
    })
}

#[derive(Debug, Serialize)]
pub struct ReplayReport {
    pub trace: String,
    pub packets: usize,
    pub matched: usize,
    pub decisions: Vec<ReplayDecision>,
    pub rules: Vec<RuleSnapshot>,
}

#[derive(Debug, Serialize)]
pub struct ReplayDecision {
    pub index: usize,
    pub at_ms: u64,
    pub rule: String,
    pub kind: &'static str,
    pub src: IpAddr,
    pub port: u16,
    pub protocol: Protocol,
    pub has_token: bool,
    pub matched: bool,
    /// Source phase after this packet (`None` if the source is not tracked).
    pub phase: Option<SourcePhase>,
}

fn phase_label(phase: Option<SourcePhase>) -> &'static str {
    match phase {
        None => "-",
        Some(SourcePhase::Unauthorized) => "unauthorized",
        Some(SourcePhase::Knocking) => "knocking",
        Some(SourcePhase::Authorized) => "authorized",
    }
}

impl Render for ReplayReport {
    fn render_text(&self, w: &mut dyn Write) -> std::io::Result<()> {
        use colored::Colorize;

        writeln!(
            w,
            "Replay: {} ({} packets, {} matched)",
            self.trace.bold(),
            self.packets,
            self.matched
        )?;
        writeln!(w)?;
        writeln!(
            w,
            "{:<6} {:<10} {:<16} {:<6} {:<40} {:<11} {:<7} Phase",
            "#", "At(ms)", "Rule", "Kind", "Source", "Port", "Result"
        )?;
        writeln!(w, "{}", "-".repeat(110))?;

        for d in &self.decisions {
            let result = if d.matched {
                "MATCH".green()
            } else {
                "-".normal()
            };
            writeln!(
                w,
                "{:<6} {:<10} {:<16} {:<6} {:<40} {:<11} {:<7} {}",
                d.index,
                d.at_ms,
                d.rule,
                d.kind,
                d.src,
                format!("{}/{}", d.port, d.protocol),
                result,
                phase_label(d.phase)
            )?;
        }

        writeln!(w)?;
        writeln!(w, "Rules:")?;
        for r in &self.rules {
            let c = &r.counters;
            writeln!(
                w,
                "  {:<16} sources={} authorized={} packets={} accepted={} resets={} timeouts={} opens={} closes={} secret_failures={} rejected={}",
                r.name,
                r.active_sources,
                r.authorized_sources,
                c.packets,
                c.knocks_accepted,
                c.sequence_resets,
                c.timeouts,
                c.authorizations,
                c.closes,
                c.secret_failures,
                c.sources_rejected
            )?;
        }

        Ok(())
    }
}
