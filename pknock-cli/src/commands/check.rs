//! `pknock check` command handler

use std::io::Write;
use std::path::Path;

use serde::Serialize;
use tracing::info;

use pknock_core::config::PknockConfig;
use pknock_core::error::PknockError;
use pknock_engine::RuleRegistry;

use crate::error::CliError;
use crate::output::{OutputWriter, Render};

/// Execute the `check` command.
///
/// Reports every problem found instead of stopping at the first one.
///
/// # Errors
///
/// Returns `CliError::Config` if the file failed to load or any rule is invalid.
pub fn execute(
    config_path: &Path,
    loaded: Result<PknockConfig, PknockError>,
    writer: &OutputWriter,
) -> Result<(), CliError> {
    info!(path = %config_path.display(), "checking configuration");

    let source = config_path.display().to_string();
    let report = match loaded {
        Ok(config) => check_config(source, &config),
        Err(e) => CheckReport::load_failed(source, e.to_string()),
    };

    writer.render(&report)?;

    if !report.valid {
        return Err(CliError::Config(format!(
            "{} problem(s) found",
            report.error_count()
        )));
    }
    Ok(())
}

/// Validate every rule of an already loaded configuration.
///
/// Rules are installed into a scratch registry in file order so that
/// duplicate knock rules are reported the same way the engine would.
pub fn check_config(source: String, config: &PknockConfig) -> CheckReport {
    let registry = RuleRegistry::new();
    let rules: Vec<RuleCheck> = config
        .rules
        .iter()
        .enumerate()
        .map(|(index, rule)| {
            let error = registry.install_config(rule).err().map(|e| e.to_string());
            RuleCheck {
                index,
                name: rule.name.clone(),
                kind: if rule.check_ip { "check" } else { "knock" },
                ok: error.is_none(),
                error,
            }
        })
        .collect();

    CheckReport {
        source,
        valid: rules.iter().all(|r| r.ok),
        load_error: None,
        log_level: Some(config.general.log_level.clone()),
        log_format: Some(config.general.log_format.clone()),
        sweep_interval_secs: Some(config.engine.sweep_interval_secs),
        max_sources_per_rule: Some(config.engine.max_sources_per_rule),
        rules,
    }
}

#[derive(Debug, Serialize)]
pub struct CheckReport {
    pub source: String,
    pub valid: bool,
    pub load_error: Option<String>,
    pub log_level: Option<String>,
    pub log_format: Option<String>,
    pub sweep_interval_secs: Option<u64>,
    pub max_sources_per_rule: Option<usize>,
    pub rules: Vec<RuleCheck>,
}

#[derive(Debug, Serialize)]
pub struct RuleCheck {
    pub index: usize,
    pub name: String,
    pub kind: &'static str,
    pub ok: bool,
    pub error: Option<String>,
}

impl CheckReport {
    fn load_failed(source: String, error: String) -> Self {
        Self {
            source,
            valid: false,
            load_error: Some(error),
            log_level: None,
            log_format: None,
            sweep_interval_secs: None,
            max_sources_per_rule: None,
            rules: Vec::new(),
        }
    }

    fn error_count(&self) -> usize {
        usize::from(self.load_error.is_some()) + self.rules.iter().filter(|r| !r.ok).count()
    }
}

impl Render for CheckReport {
    fn render_text(&self, w: &mut dyn Write) -> std::io::Result<()> {
        use colored::Colorize;

        writeln!(w, "Configuration: {}", self.source.bold())?;

        if let Some(e) = &self.load_error {
            writeln!(w, "  {} {}", "failed to load:".red(), e)?;
            return Ok(());
        }

        if let (Some(level), Some(format)) = (&self.log_level, &self.log_format) {
            writeln!(w, "  general: log_level={} log_format={}", level, format)?;
        }
        if let (Some(sweep), Some(max)) = (self.sweep_interval_secs, self.max_sources_per_rule) {
            let sweep = if sweep == 0 {
                "disabled".to_owned()
            } else {
                format!("{}s", sweep)
            };
            writeln!(w, "  engine:  sweep_interval={} max_sources_per_rule={}", sweep, max)?;
        }

        writeln!(w)?;
        writeln!(w, "Rules ({}):", self.rules.len())?;
        for r in &self.rules {
            let name = if r.name.is_empty() { "<unnamed>" } else { &r.name };
            match &r.error {
                None => writeln!(w, "  {} #{} {} ({})", "ok".green(), r.index, name, r.kind)?,
                Some(e) => writeln!(
                    w,
                    "  {} #{} {} ({}): {}",
                    "error".red(),
                    r.index,
                    name,
                    r.kind,
                    e
                )?,
            }
        }

        writeln!(w)?;
        if self.valid {
            writeln!(w, "{}", "configuration is valid".green())?;
        } else {
            writeln!(w, "{}", format!("{} problem(s) found", self.error_count()).red())?;
        }
        Ok(())
    }
}
