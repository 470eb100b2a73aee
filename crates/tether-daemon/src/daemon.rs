//! Daemon lifecycle: pidfile management, detached spawn/stop, and the
//! bootstrap that wires the five components together for `daemon run`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tether_core::port::{PermissionRequest, StructuredQuestion, ToolCall, ToolResult};
use tether_core::OutputPort;
use tether_types::{PermissionDecision, SessionStatus};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::registry::Registry;
use crate::router::Router;
use crate::rpc_hub::RpcHub;
use crate::supervisor::Supervisor;

pub fn is_running(state_root: &Path) -> bool {
    let pid_path = tether_core::config::pid_path(state_root);
    match std::fs::read_to_string(&pid_path) {
        Ok(contents) => contents
            .trim()
            .parse::<u32>()
            .map(crate::supervisor::is_alive)
            .unwrap_or(false),
        Err(_) => false,
    }
}

pub fn read_pid(state_root: &Path) -> Option<u32> {
    let pid_path = tether_core::config::pid_path(state_root);
    std::fs::read_to_string(pid_path).ok()?.trim().parse().ok()
}

/// Spawns `tetherd daemon run` as a detached background process and
/// records its pid.
pub fn start_detached(state_root: &Path) -> Result<u32> {
    if is_running(state_root) {
        anyhow::bail!("daemon is already running");
    }
    let exe = std::env::current_exe().context("could not determine current executable")?;
    let mut command = std::process::Command::new(exe);
    command
        .arg("daemon")
        .arg("run")
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        unsafe {
            command.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }
    }
    let child = command.spawn().context("failed to spawn daemon process")?;
    let pid = child.id();
    std::fs::create_dir_all(state_root)?;
    std::fs::write(tether_core::config::pid_path(state_root), pid.to_string())?;
    Ok(pid)
}

pub fn stop(state_root: &Path) -> Result<()> {
    let pid = read_pid(state_root).context("no pid file; is the daemon running?")?;
    #[cfg(unix)]
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
    #[cfg(windows)]
    crate::supervisor::force_kill(pid);
    let _ = std::fs::remove_file(tether_core::config::pid_path(state_root));
    Ok(())
}

/// Logs every upward event and defaults permission requests to deny.
/// Stands in for the out-of-scope concrete chat-platform adapter so
/// `daemon run` is a fully runnable program on its own; a real
/// deployment replaces this with a Discord/Slack/Telegram binding.
pub struct LoggingOutputPort;

#[async_trait]
impl OutputPort for LoggingOutputPort {
    async fn session_start(&self, session_id: &str) {
        info!(session = session_id, "session-start");
    }
    async fn session_end(&self, session_id: &str) {
        info!(session = session_id, "session-end");
    }
    async fn name_update(&self, session_id: &str, name: &str) {
        info!(session = session_id, name, "name-update");
    }
    async fn status_change(&self, session_id: &str, status: SessionStatus) {
        info!(session = session_id, ?status, "status-change");
    }
    async fn title_change(&self, session_id: &str, title: &str) {
        info!(session = session_id, title, "title-change");
    }
    async fn message(&self, session_id: &str, role: &str, text: &str) {
        info!(session = session_id, role, text, "message");
    }
    async fn todos(&self, session_id: &str, todos: &serde_json::Value) {
        info!(session = session_id, %todos, "todos");
    }
    async fn tool_call(&self, session_id: &str, call: ToolCall) {
        info!(session = session_id, name = %call.name, "tool-call");
    }
    async fn tool_result(&self, session_id: &str, result: ToolResult) {
        info!(session = session_id, is_error = result.is_error, "tool-result");
    }
    async fn plan_mode_change(&self, session_id: &str, active: bool) {
        info!(session = session_id, active, "plan-mode-change");
    }
    async fn permission_request(&self, request: PermissionRequest) -> PermissionDecision {
        warn!(session = %request.session_id, tool = %request.tool_name, "no chat adapter attached, denying permission request");
        PermissionDecision::deny("no chat adapter attached")
    }
    async fn structured_question(&self, question: StructuredQuestion) {
        warn!(session = %question.session_id, "no chat adapter attached to answer structured question");
    }
    async fn current_thread(&self, _session_id: &str) -> Option<String> {
        None
    }
    async fn revive_thread(&self, _thread_id: &str) -> bool {
        false
    }
    async fn notify_session_lost(&self, thread_id: &str) {
        info!(thread = thread_id, "session lost (no chat adapter attached)");
    }
}

/// Constructs the Registry, Supervisor, RPC Hub, and Router, runs
/// startup reconciliation, and blocks until a shutdown signal arrives.
pub async fn run(state_root: PathBuf, output: Arc<dyn OutputPort>) -> Result<()> {
    let settings = tether_core::config::load_settings(&state_root)?;

    let registry = Arc::new(Registry::new(&state_root));
    registry.load().await?;

    let supervisor = Arc::new(Supervisor::new(registry.clone(), settings.auto_cleanup_orphans));
    supervisor.reconcile_on_startup(output.as_ref()).await;

    let (hub_tx, hub_rx) = mpsc::unbounded_channel();
    let socket_path = tether_core::config::socket_path(&state_root);
    let hub = Arc::new(RpcHub::new(socket_path, hub_tx));

    let router = Router::new(registry.clone(), hub.clone(), supervisor.clone(), output, state_root.clone());

    let hub_serve = hub.clone();
    let hub_task = tokio::spawn(async move {
        if let Err(e) = hub_serve.bind_and_serve().await {
            tracing::error!(error = %e, "rpc hub exited");
        }
    });

    let health_supervisor = supervisor.clone();
    let health_task = tokio::spawn(async move {
        health_supervisor.run_health_loop().await;
    });

    let router_task = tokio::spawn(router.run(hub_rx));

    shutdown_signal().await;
    info!("shutdown signal received, stopping daemon");
    hub_task.abort();
    health_task.abort();
    router_task.abort();
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(windows)]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn is_running_false_without_pidfile() {
        let dir = tempdir().unwrap();
        assert!(!is_running(dir.path()));
    }

    #[test]
    fn is_running_false_for_stale_pid() {
        let dir = tempdir().unwrap();
        std::fs::write(tether_core::config::pid_path(dir.path()), "999999999").unwrap();
        assert!(!is_running(dir.path()));
    }
}
