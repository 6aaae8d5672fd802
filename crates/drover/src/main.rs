//! drover - drive an HTTP API from ClickHouse rows
//!
//! # Usage
//!
//! ```bash
//! # Run the pipeline (default)
//! drover -c drover.yaml
//!
//! # Override the run label stored on every record
//! drover -c drover.yaml run --tag backfill-2024-06
//!
//! # Validate configuration
//! drover -c drover.yaml validate
//! ```
//!
//! Exit codes: `0` when the run completes (or stops cleanly after a signal),
//! `1` on startup or pipeline failure, `2` when the grace period runs out,
//! `130` on a second signal.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use drover::config::DroverConfig;
use drover::http::HttpExecutor;
use drover::logging;
use drover::pipeline::Runner;
use drover::store::ClickHouseStore;
use drover::subjects::{JsonParams, JsonRecord, JsonSubject};
use drover::traits::{SharedCircuitBreaker, Sink};

#[derive(Parser)]
#[command(name = "drover")]
#[command(version, about = "Drive an HTTP API from ClickHouse rows and store every attempt")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "drover.yaml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline (default)
    Run {
        /// Run label; overrides writer.save_tag
        #[arg(long)]
        tag: Option<String>,
    },
    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let config = DroverConfig::from_file(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;
    logging::init(&config.log, cli.verbose).context("Failed to initialise logging")?;

    match cli.command.unwrap_or(Commands::Run { tag: None }) {
        Commands::Run { tag } => run(config, tag).await,
        Commands::Validate => validate_config(config),
    }
}

fn validate_config(config: DroverConfig) -> Result<ExitCode> {
    config.target().context("Invalid api section")?;
    config
        .query_builder::<JsonParams>()
        .context("Invalid select template")?;
    config.body_mutator().context("Invalid body template")?;

    println!("✓ Configuration is valid");
    println!("  mode:   {}", config.mode);
    println!(
        "  api:    {} {}",
        config.api.method,
        config.target()?.base_url()
    );
    println!(
        "  source: {}/{}",
        config.provider.source.endpoint.url(),
        config.provider.source.select_table
    );
    for sink in &config.writer.sinks {
        println!("  sink:   {}/{}", sink.endpoint.url(), sink.insert_table);
    }
    Ok(ExitCode::SUCCESS)
}

async fn build_runner(config: &DroverConfig, tag: Option<&str>) -> Result<Runner<JsonSubject>> {
    let source_cfg = &config.provider.source;
    let source = ClickHouseStore::connect(
        &source_cfg.endpoint,
        &source_cfg.select_table,
        &config.source_credentials(),
    )
    .await
    .context("Failed to connect to source")?;

    let mut sinks: Vec<Arc<dyn Sink<JsonRecord>>> = Vec::with_capacity(config.writer.sinks.len());
    for (index, sink_cfg) in config.writer.sinks.iter().enumerate() {
        let sink = ClickHouseStore::connect(
            &sink_cfg.endpoint,
            &sink_cfg.insert_table,
            &config.sink_credentials(index),
        )
        .await
        .with_context(|| format!("Failed to connect to sink {}", index))?;
        sinks.push(Arc::new(sink));
    }

    let breaker = config.breaker_config().map(SharedCircuitBreaker::with_config);
    let executor = HttpExecutor::new(config.executor_config(), breaker)
        .context("Failed to build HTTP client")?;

    let runner = Runner::new(
        Arc::new(source),
        sinks,
        config.query_builder()?,
        Arc::new(config.target()?),
        Arc::new(executor),
        config.pipeline_settings(tag),
    )
    .with_body_mutator(config.body_mutator()?);
    Ok(runner)
}

async fn run(config: DroverConfig, tag: Option<String>) -> Result<ExitCode> {
    info!(mode = %config.mode, "Starting drover");

    let runner = build_runner(&config, tag.as_deref()).await?;
    let cancel = CancellationToken::new();
    let mut pipeline = tokio::spawn(runner.run(cancel.clone()));

    let finished = tokio::select! {
        res = &mut pipeline => Some(res),
        signal = wait_for_shutdown_signal() => {
            info!(signal, "Shutdown requested, stopping stages");
            cancel.cancel();
            None
        }
    };

    let outcome = match finished {
        Some(res) => res,
        None => {
            let grace = config.grace_period();
            tokio::select! {
                res = &mut pipeline => res,
                _ = tokio::time::sleep(grace) => {
                    error!(grace_secs = grace.as_secs(), "Grace period elapsed, exiting");
                    return Ok(ExitCode::from(2));
                }
                signal = wait_for_shutdown_signal() => {
                    warn!(signal, "Second signal, exiting immediately");
                    return Ok(ExitCode::from(130));
                }
            }
        }
    };

    match outcome.context("Pipeline task panicked")? {
        Ok(report) => {
            info!(
                requests = report.provider.requests,
                records = report.fetcher.records,
                written = report.writer.write.records_written,
                failed = report.writer.write.records_failed,
                "Goodbye!"
            );
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            error!("Pipeline failed: {}", e);
            Ok(ExitCode::FAILURE)
        }
    }
}

/// Wait for Ctrl+C or SIGTERM and name the one received
async fn wait_for_shutdown_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "SIGINT",
        _ = terminate => "SIGTERM",
    }
}
