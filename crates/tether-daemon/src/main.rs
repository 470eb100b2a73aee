use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tether_daemon::daemon;

#[derive(Parser)]
#[command(name = "tetherd", about = "Relay daemon bridging a local coding agent to chat platforms")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Daemon lifecycle management
    Daemon {
        #[command(subcommand)]
        action: DaemonAction,
    },
}

#[derive(Subcommand)]
enum DaemonAction {
    /// Spawn the daemon as a detached background process
    Start,
    /// Stop the running daemon
    Stop,
    /// Stop then start the daemon
    Restart,
    /// Report whether the daemon is running
    Status,
    /// Run the daemon loop in the foreground (used internally by `start`)
    #[command(hide = true)]
    Run,
}

fn state_root() -> anyhow::Result<PathBuf> {
    Ok(tether_core::config::state_dir()?)
}

fn init_foreground_logging() {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}

fn init_daemon_logging(state_root: &std::path::Path) -> anyhow::Result<tracing_appender::non_blocking::WorkerGuard> {
    std::fs::create_dir_all(state_root)?;
    let log_path = tether_core::config::log_path(state_root);
    let file = std::fs::OpenOptions::new().create(true).append(true).open(log_path)?;
    let (writer, guard) = tracing_appender::non_blocking(file);
    tracing_subscriber::fmt()
        .with_writer(writer)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    Ok(guard)
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon { action: DaemonAction::Run } => {
            let root = state_root()?;
            let _guard = init_daemon_logging(&root)?;
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(daemon::run(root, Arc::new(daemon::LoggingOutputPort)))?;
        }
        Commands::Daemon { action } => {
            init_foreground_logging();
            let root = state_root()?;
            match action {
                DaemonAction::Start => {
                    let pid = daemon::start_detached(&root)?;
                    println!("daemon started (pid {pid})");
                }
                DaemonAction::Stop => {
                    daemon::stop(&root)?;
                    println!("daemon stopped");
                }
                DaemonAction::Restart => {
                    if daemon::is_running(&root) {
                        daemon::stop(&root)?;
                    }
                    let pid = daemon::start_detached(&root)?;
                    println!("daemon restarted (pid {pid})");
                }
                DaemonAction::Status => {
                    if daemon::is_running(&root) {
                        let pid = daemon::read_pid(&root).unwrap_or(0);
                        println!("daemon running (pid {pid})");
                    } else {
                        println!("daemon not running");
                    }
                }
                DaemonAction::Run => unreachable!(),
            }
        }
    }

    Ok(())
}
