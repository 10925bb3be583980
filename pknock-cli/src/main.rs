//! pknock -- port-knocking rule checker and trace replayer.

mod cli;
mod commands;
mod error;
mod logging;
mod output;

use std::process::ExitCode;

use clap::Parser;

use pknock_core::config::PknockConfig;

use crate::cli::{Cli, Commands};
use crate::output::OutputWriter;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Loaded once; `check` reports a load failure, the other commands abort on it.
    let loaded = PknockConfig::load(&cli.config).await;

    let mut general = loaded
        .as_ref()
        .map(|config| config.general.clone())
        .unwrap_or_default();
    if let Some(level) = &cli.log_level {
        general.log_level = level.clone();
    }
    if let Err(e) = logging::init_tracing(&general) {
        eprintln!("error: {e:#}");
        return ExitCode::from(1);
    }

    pknock_core::metrics::describe_all();
    tracing::debug!(config = %cli.config.display(), "pknock starting");

    let writer = OutputWriter::new(cli.output);
    let result = match cli.command {
        Commands::Check => commands::check::execute(&cli.config, loaded, &writer),
        Commands::Rules(args) => commands::rules::execute(args, loaded, &writer),
        Commands::Replay(args) => commands::replay::execute(args, loaded, &writer).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(u8::try_from(e.exit_code()).unwrap_or(1))
        }
    }
}
