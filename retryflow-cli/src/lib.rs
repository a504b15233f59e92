//! # retryflow-cli
//!
//! Command-line front end for the recovery console.
//!
//! ## Commands
//!
//! - `retryflow run` - Answer a retry request read from a file or stdin
//! - `retryflow scan` - Report failures without retrying
//! - `retryflow stages` - List the pipeline stages in dependency order
//!
//! ## Configuration
//!
//! Settings come from `--config <file>`, then the `RETRYFLOW_*` environment
//! variables, then the global flags below.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
// Responses are written to stdout
#![allow(clippy::print_stdout)]

pub mod commands;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use retryflow::config::RecoveryConfig;
use retryflow::executor::HttpExecutorConfig;
use retryflow::observability::LogFormat;

/// Retryflow - failure recovery for the persona pipeline.
#[derive(Debug, Parser)]
#[command(name = "retryflow")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// JSON configuration file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Ledger file. Overrides the configuration.
    #[arg(long, global = true)]
    pub ledger: Option<PathBuf>,

    /// Log as JSON lines.
    #[arg(long, global = true)]
    pub json_logs: bool,

    /// Entities retried at once within a stage.
    #[arg(long, global = true)]
    pub concurrency: Option<usize>,

    /// Backend that executes stages. Without it only scans are possible.
    #[arg(long, global = true)]
    pub backend_url: Option<String>,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Resolves the effective configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file or an environment
    /// override is invalid.
    pub fn recovery_config(&self) -> Result<RecoveryConfig> {
        self.recovery_config_with_env(|key| std::env::var(key).ok())
    }

    /// Resolves the configuration with environment lookups through `lookup`.
    ///
    /// # Errors
    ///
    /// See [`recovery_config`](Self::recovery_config).
    pub fn recovery_config_with_env<F>(&self, lookup: F) -> Result<RecoveryConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let base = match &self.config {
            Some(path) => RecoveryConfig::from_json_file(path)
                .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
            None => RecoveryConfig::default(),
        };
        let mut config = base
            .with_env_overrides(lookup)
            .context("Invalid RETRYFLOW_* environment override")?;

        if let Some(ledger) = &self.ledger {
            config = config.with_ledger_path(ledger);
        }
        if let Some(concurrency) = self.concurrency {
            config = config.with_concurrency(concurrency);
        }
        if self.json_logs {
            config = config.with_log_format(LogFormat::Json);
        }
        if let Some(url) = &self.backend_url {
            config = config.with_executor(HttpExecutorConfig::new(url.as_str()));
        }
        Ok(config)
    }
}

/// CLI subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Answer a retry request.
    Run(commands::RunArgs),
    /// Report failures without retrying.
    Scan(commands::ScanArgs),
    /// List the pipeline stages.
    Stages,
}
