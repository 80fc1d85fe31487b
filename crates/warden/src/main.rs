use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use warden::{SupervisorConfig, Warden};

/// Supervise one long-running worker process
#[derive(Parser, Debug)]
#[command(name = "warden", version, about)]
struct Cli {
    /// Application root; the worker's working directory
    #[arg(long, env = "WARDEN_ROOT", default_value = ".")]
    root: PathBuf,

    /// Directory for per-lifetime log files (default: <root>/logs)
    #[arg(long, env = "WARDEN_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Log file name prefix
    #[arg(long, default_value = "app")]
    log_prefix: String,

    /// Guardian poll interval in milliseconds
    #[arg(long, default_value_t = 10_000)]
    poll_interval_ms: u64,

    /// Enable auto-restart at boot
    #[arg(long)]
    auto_restart: bool,

    /// Start the worker at boot
    #[arg(long)]
    start: bool,

    /// Persist the run and auto-restart flags across supervisor restarts
    #[arg(long, env = "WARDEN_STATE_FILE")]
    state_file: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,

    /// Worker command and arguments
    #[arg(last = true, required = true, num_args = 1..)]
    command: Vec<String>,
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn build_config(cli: Cli) -> Result<SupervisorConfig> {
    let mut command = cli.command.into_iter();
    let program = command.next().context("worker command is missing")?;
    let log_dir = cli.log_dir.unwrap_or_else(|| cli.root.join("logs"));

    let mut builder = SupervisorConfig::builder();
    builder
        .command(program)
        .args(command)
        .working_directory(cli.root)
        .log_directory(log_dir)
        .log_prefix(cli.log_prefix)
        .poll_interval_ms(cli.poll_interval_ms);
    if let Some(state_file) = cli.state_file {
        builder.state_file(state_file);
    }

    builder.build().context("Failed to build supervisor configuration")
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
                return;
            }
            Err(e) => warn!(error = %e, "Cannot listen for SIGTERM; Ctrl-C only"),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Cannot listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.json);

    let auto_restart = cli.auto_restart;
    let start = cli.start;
    let warden = Warden::boot(build_config(cli)?).await?;

    if auto_restart && !warden.status().await.auto_restart_enabled {
        warden.toggle_auto_restart().await;
    }
    if start {
        match warden.start().await {
            Ok(started) => info!(pid = started.pid, log_file = %started.log_file, "Worker running"),
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => warn!(error = %e, "Worker not started"),
        }
    }

    shutdown_signal().await;
    info!("Shutdown requested");
    warden.shutdown().await?;
    Ok(())
}
