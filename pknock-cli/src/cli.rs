//! CLI argument parsing using clap derive API
//!
//! Purely declarative; no side effects or I/O.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

/// pknock -- port-knocking rule checker and trace replayer.
///
/// Use `pknock <COMMAND> --help` for subcommand details.
#[derive(Parser, Debug)]
#[command(name = "pknock", version, about, long_about = None)]
pub struct Cli {
    /// Path to the pknock.toml configuration file.
    #[arg(short, long, global = true, default_value = "pknock.toml")]
    pub config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Output format.
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

/// Supported output formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table / text output.
    Text,
    /// Machine-readable JSON.
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Load the configuration and validate every rule.
    Check,

    /// List configured rules (secrets are never shown).
    Rules(RulesArgs),

    /// Replay a recorded knock trace through a fresh engine.
    Replay(ReplayArgs),
}

// ---- rules ----

/// List configured rules.
#[derive(Args, Debug)]
pub struct RulesArgs {
    /// Show only the rule with this name.
    #[arg(long)]
    pub name: Option<String>,
}

// ---- replay ----

/// Replay a JSON knock trace.
///
/// The trace is a JSON array of records:
/// `{ "at_ms": 0, "rule": "ssh", "check": false, "src": "10.0.0.1",
///    "port": 1000, "protocol": "udp", "token": "..." }`.
#[derive(Args, Debug)]
pub struct ReplayArgs {
    /// Path to the trace file.
    pub trace: PathBuf,

    /// Print only packets that matched.
    #[arg(long)]
    pub matched_only: bool,
}
