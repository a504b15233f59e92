//! Retryflow CLI entry point.

use anyhow::Result;
use clap::Parser;
use std::process::ExitCode;

use retryflow::observability::init_logging;
use retryflow_cli::{commands, Cli, Commands};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match dispatch(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: Cli) -> Result<bool> {
    let config = cli.recovery_config()?;
    init_logging(config.log_format);

    match &cli.command {
        Commands::Run(args) => commands::run(args, config).await,
        Commands::Scan(args) => commands::scan(args, config).await,
        Commands::Stages => commands::stages(),
    }
}
