//! Subcommand implementations.
//!
//! Each command prints JSON to stdout and returns whether it succeeded,
//! which becomes the process exit code.

use anyhow::{Context, Result};
use clap::Args;
use serde_json::json;
use std::io::Read;
use std::sync::Arc;
use tracing::{info, warn};

use retryflow::api::{RecoveryService, RetryRequest, RetryResponse};
use retryflow::cancellation::CancellationToken;
use retryflow::config::RecoveryConfig;
use retryflow::events::LoggingEventSink;
use retryflow::executor::HttpStageExecutor;
use retryflow::registry::StageRegistry;

/// Arguments for the run command.
#[derive(Debug, Args)]
pub struct RunArgs {
    /// Request JSON file, or `-` for stdin.
    #[arg(long, default_value = "-")]
    pub request: String,
}

/// Arguments for the scan command.
#[derive(Debug, Args)]
pub struct ScanArgs {
    /// Company whose entities are scanned. Empty scans every entity.
    #[arg(long, default_value = "")]
    pub company: String,

    /// Stage code, or `ALL`.
    #[arg(long, default_value = "ALL")]
    pub script: String,

    /// Attempt budget used to tell retriable from exhausted records.
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Classify as a forced run would.
    #[arg(long)]
    pub force: bool,
}

/// Builds the service over the persona pipeline.
///
/// # Errors
///
/// Returns an error if the ledger cannot be opened or the HTTP client
/// cannot be built.
pub async fn build_service(config: RecoveryConfig) -> Result<RecoveryService> {
    let registry = Arc::new(StageRegistry::persona_pipeline());
    let executor = config
        .executor
        .as_ref()
        .map(HttpStageExecutor::new)
        .transpose()
        .context("Failed to build the stage executor")?;

    let mut service = RecoveryService::from_config(registry, config)
        .await
        .context("Failed to open the execution ledger")?
        .with_event_sink(Arc::new(LoggingEventSink::debug()));
    if let Some(executor) = executor {
        service = service.with_executor(Arc::new(executor));
    }
    Ok(service)
}

/// Parses a request from `source`, a path or `-` for stdin.
///
/// # Errors
///
/// Returns an error if the source cannot be read or is not a valid request.
pub fn read_request(source: &str) -> Result<RetryRequest> {
    let text = if source == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read request from stdin")?;
        buf
    } else {
        std::fs::read_to_string(source).with_context(|| format!("Failed to read {source}"))?
    };
    serde_json::from_str(&text).context("Invalid retry request")
}

/// Execute the run command. Ctrl-C cancels the run cooperatively.
///
/// # Errors
///
/// Returns an error only if the response cannot be written.
pub async fn run(args: &RunArgs, config: RecoveryConfig) -> Result<bool> {
    let response = match prepare_run(args, config).await {
        Ok((service, request)) => {
            let token = Arc::new(CancellationToken::new());
            let watcher = {
                let token = token.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        warn!("Interrupted, finishing in-flight attempts");
                        token.cancel("interrupted");
                    }
                })
            };
            let response = service.handle_with_cancel(&request, token).await;
            watcher.abort();
            response
        }
        Err(e) => failure(&e),
    };
    print_response(&response)
}

async fn prepare_run(args: &RunArgs, config: RecoveryConfig) -> Result<(RecoveryService, RetryRequest)> {
    let request = read_request(&args.request)?;
    let service = build_service(config).await?;
    Ok((service, request))
}

/// Execute the scan command.
///
/// # Errors
///
/// Returns an error only if the response cannot be written.
pub async fn scan(args: &ScanArgs, config: RecoveryConfig) -> Result<bool> {
    let mut request = RetryRequest::new(args.company.as_str(), args.script.as_str())
        .report_only()
        .with_force(args.force);
    request.max_retries = args.max_retries;

    let response = match build_service(config).await {
        Ok(service) => service.handle(&request).await,
        Err(e) => failure(&e),
    };
    print_response(&response)
}

/// Execute the stages command.
///
/// # Errors
///
/// Returns an error only if the listing cannot be written.
pub fn stages() -> Result<bool> {
    let registry = StageRegistry::persona_pipeline();
    println!("{}", serde_json::to_string_pretty(&stage_listing(&registry))?);
    Ok(true)
}

fn stage_listing(registry: &StageRegistry) -> serde_json::Value {
    json!(registry.all())
}

fn failure(error: &anyhow::Error) -> RetryResponse {
    RetryResponse {
        success: false,
        data: None,
        error: Some(format!("{error:#}")),
    }
}

fn print_response(response: &RetryResponse) -> Result<bool> {
    match &response.data {
        Some(report) => info!(success = response.success, %report, "Request finished"),
        None => info!(success = response.success, "Request finished"),
    }
    println!("{}", serde_json::to_string_pretty(response)?);
    Ok(response.success)
}
