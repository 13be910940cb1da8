//! gitbridge daemon entry point.
//!
//! Loads configuration (`.env`, optional TOML file, environment), sets up
//! logging, builds the sync engine and runs it either as a long-lived polling
//! daemon or for a single cycle.

mod scheduler;
mod signals;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use gitbridge_core::config::{BridgeConfig, LoggingConfig};
use gitbridge_core::credentials::CredentialProvider;
use gitbridge_core::models::CycleReport;
use gitbridge_core::scanner::{ScanEntry, Scanner};
use gitbridge_core::sync_engine::SyncEngine;
use gitbridge_core::synchronizer::RepositorySynchronizer;

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// gitbridge: mirror compiled document projects into their linked Git repositories.
#[derive(Parser, Debug)]
#[command(name = "gitbridge", version, about)]
struct Cli {
    /// Path to a TOML configuration file. Environment variables override it.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the sync daemon until SIGTERM / Ctrl+C (default).
    Run,

    /// Run a single sync cycle, print a summary and exit.
    Once {
        /// Print the cycle report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List the linked projects under the compiles root without syncing.
    Scan,

    /// Validate the configuration and print it with secrets redacted.
    CheckConfig,

    /// Print a default configuration file.
    Init,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let dotenv = dotenvy::dotenv().ok();
    let mut config =
        BridgeConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(level) = &cli.log_level {
        config.logging.log_level = level.clone();
    }

    let _log_guard = init_tracing(&config.logging)?;
    if let Some(path) = dotenv {
        debug!(path = %path.display(), "loaded environment file");
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => cmd_run(&config).await,
        Commands::Once { json } => cmd_once(&config, json).await,
        Commands::Scan => cmd_scan(&config),
        Commands::CheckConfig => cmd_check_config(&config),
        Commands::Init => {
            print!("{}", BridgeConfig::default_template());
            Ok(())
        }
    }
}

/// Install the stdout subscriber, plus a daily-rolling file layer when a log
/// directory is configured. `RUST_LOG` wins over the configured level.
fn init_tracing(logging: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout_layer = fmt::layer().with_target(true).with_thread_ids(false);

    match &logging.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log directory: {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "gitbridge.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stdout_layer)
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stdout_layer)
                .init();
            Ok(None)
        }
    }
}

/// Validate, check the filesystem and assemble the engine. Every error here
/// is fatal and happens before the first cycle.
fn build_engine(config: &BridgeConfig) -> Result<SyncEngine> {
    config
        .validate(true)
        .context("configuration validation failed")?;

    let credentials = CredentialProvider::new(config.git.token.clone().unwrap_or_default())
        .with_context(|| format!("invalid access token in ${}", config.git.token_env))?;
    let synchronizer = RepositorySynchronizer::new(config, credentials)
        .context("failed to prepare repository synchronizer")?;

    std::fs::create_dir_all(&config.paths.clones_dir).with_context(|| {
        format!(
            "failed to create clones directory: {}",
            config.paths.clones_dir.display()
        )
    })?;

    let engine = SyncEngine::new(config, synchronizer);
    engine
        .scanner()
        .scan()
        .context("compiles root is not readable")?;
    Ok(engine)
}

fn log_banner(config: &BridgeConfig) {
    info!("========================================");
    info!("  gitbridge v{}", env!("CARGO_PKG_VERSION"));
    info!("========================================");
    for (key, value) in config.summary() {
        info!("{:<16}: {}", key, value);
    }
    info!("========================================");
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn cmd_run(config: &BridgeConfig) -> Result<()> {
    log_banner(config);
    let engine = build_engine(config)?;
    let shutdown = signals::setup_signal_handlers();

    let cycles = scheduler::run_polling_loop(&engine, config.poll_interval(), shutdown).await;

    info!(cycles, "waiting for running sync attempts");
    if !engine.wait_idle(config.shutdown_grace()).await {
        warn!("exiting with sync attempts still running");
    }
    info!("gitbridge stopped.");
    Ok(())
}

async fn cmd_once(config: &BridgeConfig, json: bool) -> Result<()> {
    let engine = build_engine(config)?;
    let report = engine
        .run_cycle(|| false)
        .await
        .context("sync cycle failed")?;
    let idle = engine.wait_idle(config.shutdown_grace()).await;

    if json {
        let text = serde_json::to_string_pretty(&report).context("failed to encode report")?;
        println!("{text}");
    } else {
        print_report(&report);
    }

    if !idle {
        anyhow::bail!(
            "{} abandoned sync attempt(s) still running after {}s; their pushes may or may not land",
            engine.locks().held(),
            config.shutdown_grace().as_secs()
        );
    }
    Ok(())
}

fn print_report(report: &CycleReport) {
    for project in &report.projects {
        println!("{:<32} {}", project.folder_name, project.outcome);
    }
    let elapsed = match (report.started_at, report.completed_at) {
        (Some(start), Some(end)) => {
            format!(" in {:.1}s", (end - start).num_milliseconds() as f64 / 1000.0)
        }
        _ => String::new(),
    };
    println!(
        "{} pushed, {} unchanged, {} skipped, {} failed, {} stale, {} malformed{}",
        report.pushed(),
        report.no_ops(),
        report.skipped(),
        report.failures(),
        report.stale,
        report.malformed,
        elapsed
    );
}

fn cmd_scan(config: &BridgeConfig) -> Result<()> {
    config
        .validate(false)
        .context("configuration validation failed")?;
    let scanner = Scanner::from_config(config);
    let entries = scanner.scan().context("compiles root is not readable")?;

    let mut count = 0;
    for entry in entries {
        count += 1;
        match entry {
            ScanEntry::Ready(p) => {
                println!("ready      {:<32} {}", p.folder_name, p.descriptor.repo_url)
            }
            ScanEntry::Stale(p) => {
                println!("stale      {:<32} {}", p.folder_name, p.descriptor.repo_url)
            }
            ScanEntry::Malformed { path, reason } => {
                println!("malformed  {:<32} {}", path.display(), reason)
            }
        }
    }
    println!(
        "{count} linked project(s) under {}",
        config.paths.compiles_dir.display()
    );
    Ok(())
}

fn cmd_check_config(config: &BridgeConfig) -> Result<()> {
    for (key, value) in config.summary() {
        println!("{:<16}: {}", key, value);
    }
    config
        .validate(true)
        .context("configuration validation failed")?;
    RepositorySynchronizer::new(
        config,
        CredentialProvider::new(config.git.token.clone().unwrap_or_default())
            .context("invalid access token")?,
    )
    .context("invalid ignore template")?;
    println!("configuration OK");
    Ok(())
}
