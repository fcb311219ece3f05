//! hostlink: headless endpoint agent for remote support.
//!
//! The agent keeps a persistent WebSocket session with the console, streams
//! JPEG screen frames upward and applies the console's mouse and keyboard
//! events locally. When it runs in the desktop-less service session, the
//! same executable is re-spawned into the logged-on user's session as a
//! capture helper (`--capture-helper`).

mod bridge;
mod capture;
mod config;
#[cfg(windows)]
mod helper;
mod input;
mod metrics;
#[cfg(windows)]
mod overlay;
mod platform;
mod protocol;
mod supervisor;
mod transport;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hostlink")]
#[command(version)]
#[command(about = "Headless endpoint agent for remote support", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Run as the in-session capture helper (spawned by the service, not
    /// for interactive use).
    #[arg(
        long = "capture-helper",
        num_args = 2,
        value_names = ["CAPTURE_PIPE", "INPUT_PIPE"],
        hide = true
    )]
    capture_helper: Option<Vec<String>>,

    /// Read configuration from this file only, skipping the standard
    /// locations.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the effective configuration and exit.
    Status,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Some(pipes) = &cli.capture_helper {
        return run_helper(pipes);
    }

    let config = match &cli.config {
        Some(path) => config::load_from(std::slice::from_ref(path)),
        None => config::load(),
    };
    let _log_guard = init_tracing(&config);

    match cli.command {
        Some(Commands::Status) => {
            print_status(&config);
            ExitCode::SUCCESS
        }
        None => run_agent(config).await,
    }
}

fn run_helper(pipes: &[String]) -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new("hostlink=info").unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    #[cfg(windows)]
    {
        match helper::run(&pipes[0], &pipes[1]) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                tracing::error!("capture helper failed: {e}");
                ExitCode::FAILURE
            }
        }
    }
    #[cfg(not(windows))]
    {
        let _ = pipes;
        eprintln!("the capture helper only runs on Windows");
        ExitCode::FAILURE
    }
}

/// Install the tracing subscriber: configured level filter, daily-rolling
/// file sink when LogPath is set, stderr otherwise. The returned guard must
/// live as long as the process so buffered log lines are flushed.
fn init_tracing(
    config: &config::AgentConfig,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter =
        EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    match &config.log_path {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "hostlink.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .init();
            None
        }
    }
}

fn print_status(config: &config::AgentConfig) {
    let mut shown = config.clone();
    if !shown.agent_token.is_empty() {
        shown.agent_token = "<set>".to_string();
    }
    match serde_json::to_string_pretty(&shown) {
        Ok(json) => println!("{json}"),
        Err(e) => eprintln!("failed to render configuration: {e}"),
    }
}

async fn run_agent(config: config::AgentConfig) -> ExitCode {
    tracing::info!(
        agent_id = %config.agent_id,
        console = %config.console_url,
        "hostlink agent starting"
    );

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    let ctrl_c_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested (Ctrl+C)");
            let _ = ctrl_c_tx.send(());
        }
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
            let term_tx = shutdown_tx.clone();
            tokio::spawn(async move {
                if sigterm.recv().await.is_some() {
                    tracing::info!("shutdown requested (SIGTERM)");
                    let _ = term_tx.send(());
                }
            });
        }
    }

    supervisor::run(config, shutdown_rx).await;
    ExitCode::SUCCESS
}
