//! Launches runner children, probes liveness, drives status
//! transitions, and runs the periodic health loop and orphan reaping.
//!
//! Liveness is probed with a signal-0 `kill` and a dead runner is
//! reclaimed with a staged SIGINT -> SIGTERM -> SIGKILL escalation,
//! since this daemon only launches or reattaches to an external runner
//! process rather than owning a PTY directly.

use std::time::Duration;

use tether_core::error::{RelayError, Result};
use tether_core::OutputPort;
use tether_types::{LaunchStrategy, SessionStatus};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::registry::{Registry, StatusFilter};

pub const HEALTH_INTERVAL: Duration = Duration::from_secs(60);
const STARTING_GRACE: chrono::Duration = chrono::Duration::seconds(30);
const TERMINAL_RETENTION: chrono::Duration = chrono::Duration::hours(24);
const INTERRUPT_WAIT: Duration = Duration::from_secs(5);
const TERMINATE_WAIT: Duration = Duration::from_secs(3);

#[cfg(unix)]
pub fn is_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(windows)]
pub fn is_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let mut system = sysinfo::System::new();
    system.refresh_processes(sysinfo::ProcessesToUpdate::All, true);
    system.process(sysinfo::Pid::from_u32(pid)).is_some()
}

#[cfg(unix)]
fn send_signal(pid: u32, sig: libc::c_int) {
    unsafe {
        libc::kill(pid as libc::pid_t, sig);
    }
}

#[cfg(windows)]
fn send_signal(pid: u32, _sig: i32) {
    let mut system = sysinfo::System::new();
    system.refresh_processes(sysinfo::ProcessesToUpdate::All, true);
    if let Some(process) = system.process(sysinfo::Pid::from_u32(pid)) {
        process.kill();
    }
}

/// Interrupt, wait up to 5s; terminate, wait up to 3s; kill. Returns
/// once the pid is no longer alive.
pub async fn graceful_kill(pid: u32) {
    if !is_alive(pid) {
        return;
    }
    #[cfg(unix)]
    send_signal(pid, libc::SIGINT);
    #[cfg(windows)]
    send_signal(pid, 0);
    if wait_for_death(pid, INTERRUPT_WAIT).await {
        return;
    }

    #[cfg(unix)]
    send_signal(pid, libc::SIGTERM);
    #[cfg(windows)]
    send_signal(pid, 0);
    if wait_for_death(pid, TERMINATE_WAIT).await {
        return;
    }

    force_kill(pid);
}

/// Skips straight to the kill signal.
pub fn force_kill(pid: u32) {
    #[cfg(unix)]
    send_signal(pid, libc::SIGKILL);
    #[cfg(windows)]
    send_signal(pid, 0);
}

async fn wait_for_death(pid: u32, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if !is_alive(pid) {
            return true;
        }
        sleep(Duration::from_millis(100)).await;
    }
    !is_alive(pid)
}

pub struct Supervisor {
    registry: std::sync::Arc<Registry>,
    auto_cleanup_orphans: bool,
}

impl Supervisor {
    pub fn new(registry: std::sync::Arc<Registry>, auto_cleanup_orphans: bool) -> Self {
        Self {
            registry,
            auto_cleanup_orphans,
        }
    }

    /// Launches a runner. `background` fully detaches with suppressed
    /// stdio; `terminal_attached` shells out to the host terminal
    /// emulator and the resulting pid is unknown (0), since the child
    /// is not a direct descendant.
    pub fn launch(&self, strategy: LaunchStrategy, command: &[String]) -> Result<u32> {
        match strategy {
            LaunchStrategy::Background => {
                let mut iter = command.iter();
                let program = iter
                    .next()
                    .ok_or_else(|| RelayError::Other("empty command".into()))?;
                let child = std::process::Command::new(program)
                    .args(iter)
                    .stdin(std::process::Stdio::null())
                    .stdout(std::process::Stdio::null())
                    .stderr(std::process::Stdio::null())
                    .spawn()?;
                Ok(child.id())
            }
            LaunchStrategy::TerminalAttached => {
                #[cfg(target_os = "macos")]
                {
                    let joined = command.join(" ");
                    let script = format!(
                        "tell application \"Terminal\" to do script \"{}\"",
                        joined.replace('"', "\\\"")
                    );
                    std::process::Command::new("osascript")
                        .arg("-e")
                        .arg(script)
                        .spawn()?;
                    Ok(0)
                }
                #[cfg(not(target_os = "macos"))]
                {
                    Err(RelayError::Other("terminal-attached launch is macOS-only; use background".into()))
                }
            }
        }
    }

    /// Stops a session on request: marks it `Stopping`, runs the
    /// interrupt -> terminate -> kill escalation, then marks it
    /// `Stopped` once the runner process is confirmed dead.
    pub async fn stop_session(&self, session_id: &str) -> Result<()> {
        let record = self
            .registry
            .get(session_id)
            .await
            .ok_or_else(|| RelayError::NotFound(format!("session {session_id} not found")))?;
        self.registry.set_status(session_id, SessionStatus::Stopping).await?;
        graceful_kill(record.pid).await;
        self.registry.set_status(session_id, SessionStatus::Stopped).await?;
        Ok(())
    }

    /// Every 60s: drive status transitions for every non-terminal
    /// record and reap orphans.
    pub async fn health_tick(&self) {
        let records = self.registry.list(StatusFilter::NonTerminal).await;
        for record in records {
            let alive = is_alive(record.pid);
            let next = match record.status {
                SessionStatus::Starting => {
                    if !alive {
                        Some(SessionStatus::Stopped)
                    } else if chrono::Utc::now() - record.started_at > STARTING_GRACE {
                        Some(SessionStatus::Orphaned)
                    } else {
                        None
                    }
                }
                SessionStatus::Running | SessionStatus::Idle => {
                    if !alive {
                        Some(SessionStatus::Orphaned)
                    } else {
                        None
                    }
                }
                SessionStatus::Stopping => {
                    if !alive {
                        Some(SessionStatus::Stopped)
                    } else {
                        None
                    }
                }
                SessionStatus::Stopped | SessionStatus::Orphaned => None,
            };
            if let Some(next) = next {
                if let Err(e) = self.registry.set_status(&record.id, next).await {
                    warn!(session = %record.id, error = %e, "failed to apply health transition");
                }
            }
        }

        if self.auto_cleanup_orphans {
            let orphaned = self.registry.list(StatusFilter::Status(SessionStatus::Orphaned)).await;
            for record in orphaned {
                if is_alive(record.pid) {
                    force_kill(record.pid);
                    let _ = self.registry.set_status(&record.id, SessionStatus::Stopped).await;
                }
            }
        }

        self.registry.prune_terminal_older_than(TERMINAL_RETENTION).await;
    }

    pub async fn run_health_loop(&self) {
        loop {
            sleep(HEALTH_INTERVAL).await;
            self.health_tick().await;
        }
    }

    /// At daemon start: every persisted record that is stopped or
    /// orphaned and carries a chat-thread binding gets a "session
    /// lost" notice, its thread archived, and the record removed.
    /// Session ids are held in the reconciling fence during this pass.
    pub async fn reconcile_on_startup(&self, output: &dyn OutputPort) {
        let stale = self.registry.list(StatusFilter::All).await;
        for record in stale {
            if !record.status.is_terminal() {
                continue;
            }
            let Some(thread_id) = record.thread_id.clone() else {
                continue;
            };
            self.registry.mark_reconciling(&record.id).await;
            info!(session = %record.id, thread = %thread_id, "reconciling stale session at startup");
            output.notify_session_lost(&thread_id).await;
            self.registry.remove(&record.id).await;
            self.registry.unmark_reconciling(&record.id).await;
        }
    }
}
