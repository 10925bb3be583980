//! `pknock rules` command handler

use std::io::Write;

use serde::Serialize;
use tracing::info;

use pknock_core::config::PknockConfig;
use pknock_core::error::PknockError;
use pknock_engine::{KnockService, RuleSnapshot, SnapshotKind};

use crate::cli::RulesArgs;
use crate::error::CliError;
use crate::output::{OutputWriter, Render};

/// Execute the `rules` command.
pub fn execute(
    args: RulesArgs,
    loaded: Result<PknockConfig, PknockError>,
    writer: &OutputWriter,
) -> Result<(), CliError> {
    let config = loaded?;
    let report = list_rules(&config, args.name.as_deref())?;
    info!(total = report.total, "listing rules");
    writer.render(&report)
}

/// Build the rule listing from the engine's own view of the configuration.
pub fn list_rules(config: &PknockConfig, name: Option<&str>) -> Result<RuleListReport, CliError> {
    let service = KnockService::from_config(config)?;
    let mut rules = service.registry().snapshots();

    if let Some(name) = name {
        rules.retain(|r| r.name == name);
        if rules.is_empty() {
            return Err(CliError::Command(format!("rule not found: {}", name)));
        }
    }

    Ok(RuleListReport {
        total: rules.len(),
        rules,
    })
}

#[derive(Debug, Serialize)]
pub struct RuleListReport {
    pub total: usize,
    pub rules: Vec<RuleSnapshot>,
}

impl Render for RuleListReport {
    fn render_text(&self, w: &mut dyn Write) -> std::io::Result<()> {
        use colored::Colorize;

        writeln!(w, "Knock Rules ({} total)", self.total.to_string().bold())?;
        writeln!(w)?;
        writeln!(
            w,
            "{:<20} {:<6} {:<6} {:<30} {:<6} {:<7} {:<8} {:<10} Checks",
            "Name", "Kind", "Proto", "Ports", "Time", "Strict", "Secrets", "Autoclose"
        )?;
        writeln!(w, "{}", "-".repeat(105))?;

        for r in &self.rules {
            let kind = match r.kind {
                SnapshotKind::Knock => "knock".green(),
                SnapshotKind::CheckOnly => "check".yellow(),
            };
            let ports = r
                .ports
                .iter()
                .map(u16::to_string)
                .collect::<Vec<_>>()
                .join(",");
            writeln!(
                w,
                "{:<20} {:<6} {:<6} {:<30} {:<6} {:<7} {:<8} {:<10} {}",
                r.name,
                kind,
                r.protocol.map(|p| p.as_str()).unwrap_or("-"),
                if ports.is_empty() { "-".to_owned() } else { ports },
                r.max_interval_secs
                    .map(|s| format!("{}s", s))
                    .unwrap_or_else(|| "-".to_owned()),
                if r.strict { "yes" } else { "no" },
                if r.has_secrets { "yes" } else { "no" },
                r.autoclose_secs
                    .map(|s| format!("{}s", s))
                    .unwrap_or_else(|| "-".to_owned()),
                r.check_refs
            )?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pknock_core::config::RuleConfig;
    use pknock_core::types::Protocol;

    fn config() -> PknockConfig {
        PknockConfig {
            rules: vec![
                RuleConfig {
                    name: "ssh".to_owned(),
                    ports: vec![1000, 2000, 3000],
                    protocol: Some(Protocol::Udp),
                    time: Some(10),
                    strict: true,
                    open_secret: Some("hunter2".to_owned()),
                    close_secret: Some("hunter3".to_owned()),
                    ..Default::default()
                },
                RuleConfig {
                    name: "ssh".to_owned(),
                    check_ip: true,
                    ..Default::default()
                },
                RuleConfig {
                    name: "db".to_owned(),
                    check_ip: true,
                    ..Default::default()
                },
            ],
            ..Default::default()
        }
    }

    #[test]
    fn test_list_all_rules_sorted() {
        let report = list_rules(&config(), None).unwrap();
        assert_eq!(report.total, 2);
        assert_eq!(report.rules[0].name, "db");
        assert_eq!(report.rules[0].kind, SnapshotKind::CheckOnly);
        assert_eq!(report.rules[1].check_refs, 1);
    }

    #[test]
    fn test_filter_by_name() {
        let report = list_rules(&config(), Some("ssh")).unwrap();
        assert_eq!(report.total, 1);
        assert!(matches!(
            list_rules(&config(), Some("nope")),
            Err(CliError::Command(_))
        ));
    }

    #[test]
    fn test_output_never_contains_secrets() {
        let report = list_rules(&config(), None).unwrap();

        let json = serde_json::to_string(&report).unwrap();
        assert!(!json.contains("hunter"));

        let mut out = Vec::new();
        report.render_text(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(!text.contains("hunter"));
        assert!(text.contains("1000,2000,3000"));
    }
}
