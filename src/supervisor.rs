//! Multi-worker supervision.
//!
//! The supervisor re-executes this binary N times with worker environment
//! markers, fans SIGHUP/SIGUSR1 out to the children, and treats the first
//! unexpected child exit as fatal. Workers poll the parent pid and shut
//! down when it changes.

use std::collections::HashMap;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::time::Duration;

use tokio::process::Command;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{ProxyError, Result};

pub const ENV_SUPERVISED_WORKER: &str = "MTPROXY_GO_SUPERVISED_WORKER";
pub const ENV_WORKER_ID: &str = "MTPROXY_GO_WORKER_ID";
pub const ENV_SUPERVISOR_PID: &str = "MTPROXY_GO_SUPERVISOR_PID";

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const PARENT_POLL_INTERVAL: Duration = Duration::from_millis(500);

pub fn is_supervised_worker() -> bool {
    std::env::var(ENV_SUPERVISED_WORKER).as_deref() == Ok("1")
}

pub fn current_worker_id() -> Option<u32> {
    std::env::var(ENV_WORKER_ID).ok()?.parse().ok()
}

struct WorkerExit {
    id: u32,
    status: std::io::Result<ExitStatus>,
}

struct WorkerSet {
    pids: HashMap<u32, i32>,
}

impl WorkerSet {
    fn forward(&self, sig: i32) {
        for (&id, &pid) in &self.pids {
            // SAFETY: plain kill(2) on a pid we spawned.
            let rc = unsafe { libc::kill(pid, sig) };
            if rc != 0 {
                warn!(
                    worker = id,
                    pid,
                    signal = sig,
                    error = %std::io::Error::last_os_error(),
                    "failed to forward signal to worker"
                );
            }
        }
    }

    fn kill_all(&self) {
        for &pid in self.pids.values() {
            unsafe {
                libc::kill(pid, libc::SIGKILL);
            }
        }
    }
}

/// Spawn `workers` children and supervise them until shutdown or the first
/// unexpected exit.
pub async fn run_supervised_workers(workers: u32, reopen_log: Option<Box<dyn Fn() -> std::io::Result<()> + Send>>) -> Result<()> {
    if workers == 0 {
        return Err(ProxyError::ConfigParse(format!("invalid workers count: {workers}")));
    }

    let (exit_tx, mut exit_rx) = mpsc::channel::<WorkerExit>(workers as usize * 2);
    let mut set = WorkerSet { pids: HashMap::new() };

    for id in 0..workers {
        match start_worker(id, exit_tx.clone()) {
            Ok(pid) => {
                info!(worker = id, pid, "supervisor started worker");
                set.pids.insert(id, pid);
            }
            Err(e) => {
                let _ = shutdown_workers(&mut set, &mut exit_rx, libc::SIGTERM).await;
                return Err(e);
            }
        }
    }

    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigusr1 = signal(SignalKind::user_defined1())?;

    enum Event {
        Hup,
        Usr1,
        Shutdown(i32),
        Exit(WorkerExit),
    }

    loop {
        let event = tokio::select! {
            _ = sighup.recv() => Event::Hup,
            _ = sigusr1.recv() => Event::Usr1,
            _ = sigterm.recv() => Event::Shutdown(libc::SIGTERM),
            _ = sigint.recv() => Event::Shutdown(libc::SIGINT),
            Some(exit) = exit_rx.recv() => Event::Exit(exit),
        };

        match event {
            Event::Hup => set.forward(libc::SIGHUP),
            Event::Usr1 => {
                match reopen_log.as_ref() {
                    None => info!("supervisor SIGUSR1: no log file configured, skipping reopen."),
                    Some(f) => match f() {
                        Ok(()) => info!("supervisor SIGUSR1: log file reopened."),
                        Err(e) => error!(error = %e, "supervisor SIGUSR1: log reopen failed"),
                    },
                }
                set.forward(libc::SIGUSR1);
            }
            Event::Shutdown(sig) => {
                info!(signal = sig, "supervisor shutting down workers");
                return shutdown_workers(&mut set, &mut exit_rx, sig).await;
            }
            Event::Exit(exit) => {
                let Some(pid) = set.pids.remove(&exit.id) else { continue };
                match &exit.status {
                    Ok(status) => error!(worker = exit.id, pid, %status, "worker exited unexpectedly"),
                    Err(e) => error!(worker = exit.id, pid, error = %e, "worker exited unexpectedly"),
                }
                let _ = shutdown_workers(&mut set, &mut exit_rx, libc::SIGTERM).await;
                return Err(ProxyError::WorkerExited(exit.id));
            }
        }
    }
}

fn start_worker(id: u32, exit_tx: mpsc::Sender<WorkerExit>) -> Result<i32> {
    let exe = std::env::current_exe()?;
    let mut child = Command::new(exe)
        .args(std::env::args().skip(1))
        .env(ENV_SUPERVISED_WORKER, "1")
        .env(ENV_WORKER_ID, id.to_string())
        .env(ENV_SUPERVISOR_PID, std::process::id().to_string())
        .spawn()?;

    let pid = child
        .id()
        .ok_or_else(|| ProxyError::Io(std::io::Error::other("spawned worker has no pid")))? as i32;

    tokio::spawn(async move {
        let status = child.wait().await;
        let _ = exit_tx.send(WorkerExit { id, status }).await;
    });
    Ok(pid)
}

async fn shutdown_workers(
    set: &mut WorkerSet,
    exit_rx: &mut mpsc::Receiver<WorkerExit>,
    shutdown_signal: i32,
) -> Result<()> {
    if set.pids.is_empty() {
        return Ok(());
    }

    set.forward(shutdown_signal);
    let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;

    let mut first_err: Option<ProxyError> = None;
    while !set.pids.is_empty() {
        let exit = tokio::select! {
            exit = exit_rx.recv() => exit,
            _ = tokio::time::sleep_until(deadline) => {
                warn!(remaining = set.pids.len(), "timeout waiting for workers, killing");
                set.kill_all();
                return Err(ProxyError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "timeout waiting for workers to stop",
                )));
            }
        };
        let Some(exit) = exit else { break };
        let Some(pid) = set.pids.remove(&exit.id) else { continue };

        match exit.status {
            Ok(status) if is_expected_shutdown_exit(&status, shutdown_signal) => {
                info!(worker = exit.id, pid, "worker stopped");
            }
            Ok(status) => {
                warn!(worker = exit.id, pid, %status, "worker exited with error");
                if first_err.is_none() {
                    first_err = Some(ProxyError::WorkerExited(exit.id));
                }
            }
            Err(e) => {
                warn!(worker = exit.id, pid, error = %e, "worker wait failed");
                if first_err.is_none() {
                    first_err = Some(ProxyError::WorkerExited(exit.id));
                }
            }
        }
    }

    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Exit via the shutdown signal itself, or a clean exit code 0, counts as an
/// orderly stop.
fn is_expected_shutdown_exit(status: &ExitStatus, shutdown_signal: i32) -> bool {
    if status.success() {
        return true;
    }
    status.signal() == Some(shutdown_signal)
}

/// In a supervised worker, watch the parent pid at 2 Hz; when it no longer
/// matches the recorded supervisor pid, cancel the runtime.
pub fn spawn_parent_watch(shutdown: CancellationToken) {
    let raw = std::env::var(ENV_SUPERVISOR_PID).unwrap_or_default();
    let supervisor_pid: u32 = match raw.parse() {
        Ok(pid) if pid > 0 => pid,
        _ => {
            error!(value = %raw, "supervised worker startup error: invalid supervisor pid");
            shutdown.cancel();
            return;
        }
    };

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PARENT_POLL_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {
                    let parent = std::os::unix::process::parent_id();
                    if parent != supervisor_pid {
                        warn!(
                            expected = supervisor_pid,
                            got = parent,
                            "supervised worker parent changed, shutting down"
                        );
                        shutdown.cancel();
                        return;
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_from_raw(raw: i32) -> ExitStatus {
        ExitStatus::from_raw(raw)
    }

    #[test]
    fn clean_exit_is_expected() {
        assert!(is_expected_shutdown_exit(&status_from_raw(0), libc::SIGTERM));
    }

    #[test]
    fn exit_by_shutdown_signal_is_expected() {
        // Raw wait status for "killed by signal": the signal number itself.
        assert!(is_expected_shutdown_exit(&status_from_raw(libc::SIGTERM), libc::SIGTERM));
        assert!(!is_expected_shutdown_exit(&status_from_raw(libc::SIGKILL), libc::SIGTERM));
    }

    #[test]
    fn nonzero_exit_code_is_unexpected() {
        // Exit code 1 → raw status 1 << 8.
        assert!(!is_expected_shutdown_exit(&status_from_raw(1 << 8), libc::SIGTERM));
    }

    #[test]
    fn worker_env_detection() {
        assert!(!is_supervised_worker());
        assert_eq!(current_worker_id(), None);
    }
}
