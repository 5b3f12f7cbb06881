//! Master mode: one poller child process per group, restarted when it dies.
//!
//! Process handling sits behind [`ProcessManager`] so the restart policy can
//! be exercised without spawning real processes. [`TokioProcessManager`] is
//! the real implementation on top of `tokio::process` and `nix` signals.

use async_trait::async_trait;
use beam_core::error::{AppResult, BeamError};
use beam_core::limits::DEVICE_RETRY_DELAY;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::OsString;
use std::fmt;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};

/// Why a child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Regular exit with a status code.
    Code(i32),
    /// Killed by a signal.
    Signal(i32),
    /// Status could not be determined.
    Unknown,
}

impl From<ExitStatus> for ExitReason {
    fn from(status: ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        match (status.code(), status.signal()) {
            (Some(code), _) => ExitReason::Code(code),
            (None, Some(signal)) => ExitReason::Signal(signal),
            (None, None) => ExitReason::Unknown,
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Code(code) => write!(f, "exit code {}", code),
            ExitReason::Signal(signal) => write!(f, "signal {}", signal),
            ExitReason::Unknown => write!(f, "unknown reason"),
        }
    }
}

/// A reaped child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildExit {
    /// Process id.
    pub pid: u32,
    /// Exit reason.
    pub reason: ExitReason,
}

/// Spawning, signalling and reaping of poller child processes.
#[async_trait]
pub trait ProcessManager: Send + Sync {
    /// Start the child polling `group`; returns its pid.
    async fn spawn(&self, group: &str) -> AppResult<u32>;

    /// Ask a child to terminate. A child that is already gone is not an
    /// error.
    fn terminate(&self, pid: u32) -> AppResult<()>;

    /// Wait for the next child exit; `None` once no children are left.
    async fn wait_any(&self) -> Option<ChildExit>;
}

/// [`ProcessManager`] running `<program> <args...> <group>` per child.
pub struct TokioProcessManager {
    program: PathBuf,
    args: Vec<OsString>,
    alive: Arc<AtomicUsize>,
    exits_tx: mpsc::UnboundedSender<ChildExit>,
    exits_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ChildExit>>,
}

impl TokioProcessManager {
    /// Children run `program` with `args` followed by the group name.
    pub fn new<I, S>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let (exits_tx, exits_rx) = mpsc::unbounded_channel();
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            alive: Arc::new(AtomicUsize::new(0)),
            exits_tx,
            exits_rx: tokio::sync::Mutex::new(exits_rx),
        }
    }
}

#[async_trait]
impl ProcessManager for TokioProcessManager {
    async fn spawn(&self, group: &str) -> AppResult<u32> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(group)
            .spawn()?;
        let pid = child.id().ok_or_else(|| {
            BeamError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "child exited before its pid was known",
            ))
        })?;

        self.alive.fetch_add(1, Ordering::SeqCst);
        let exits = self.exits_tx.clone();
        tokio::spawn(async move {
            let reason = match child.wait().await {
                Ok(status) => ExitReason::from(status),
                Err(e) => {
                    warn!(pid, error = %e, "cannot reap child");
                    ExitReason::Unknown
                }
            };
            let _ = exits.send(ChildExit { pid, reason });
        });
        Ok(pid)
    }

    fn terminate(&self, pid: u32) -> AppResult<()> {
        let raw = i32::try_from(pid).map_err(|_| {
            BeamError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("pid {} out of range", pid),
            ))
        })?;
        match kill(Pid::from_raw(raw), Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(errno) => Err(BeamError::Io(std::io::Error::from(errno))),
        }
    }

    async fn wait_any(&self) -> Option<ChildExit> {
        if self.alive.load(Ordering::SeqCst) == 0 {
            return None;
        }
        let exit = self.exits_rx.lock().await.recv().await?;
        self.alive.fetch_sub(1, Ordering::SeqCst);
        Some(exit)
    }
}

/// Keeps one poller child per group alive.
pub struct Supervisor<P: ProcessManager> {
    manager: Arc<P>,
    groups: Vec<String>,
    children: Mutex<HashMap<u32, String>>,
    stopping: AtomicBool,
    stop_notify: Notify,
    retry_delay: Duration,
}

impl<P: ProcessManager> Supervisor<P> {
    /// Supervisor for `groups`; nothing is spawned until [`Supervisor::start`].
    pub fn new(manager: Arc<P>, groups: impl IntoIterator<Item = String>) -> Self {
        Self {
            manager,
            groups: groups.into_iter().collect(),
            children: Mutex::new(HashMap::new()),
            stopping: AtomicBool::new(false),
            stop_notify: Notify::new(),
            retry_delay: DEVICE_RETRY_DELAY,
        }
    }

    /// Delay between attempts to restart a group whose spawn failed.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Spawn one child per group.
    pub async fn start(&self) -> AppResult<()> {
        for group in &self.groups {
            self.start_child(group).await?;
        }
        Ok(())
    }

    async fn start_child(&self, group: &str) -> AppResult<u32> {
        let pid = self.manager.spawn(group).await?;
        self.children.lock().insert(pid, group.to_string());
        info!(group, pid, "started poller");
        Ok(pid)
    }

    /// Reap children until none are left, restarting those that exit while
    /// the supervisor is not stopping.
    pub async fn run(&self) {
        while let Some(exit) = self.manager.wait_any().await {
            let Some(group) = self.children.lock().remove(&exit.pid) else {
                debug!(pid = exit.pid, "reaped unknown child");
                continue;
            };
            if self.is_stopping() {
                info!(group = %group, reason = %exit.reason, "poller terminated");
                continue;
            }
            warn!(
                group = %group,
                pid = exit.pid,
                reason = %exit.reason,
                "poller terminated, restarting"
            );
            self.restart(&group).await;
        }
        info!("all pollers terminated");
    }

    /// Spawn a replacement for `group`, retrying until it runs or the
    /// supervisor is stopping.
    async fn restart(&self, group: &str) {
        while !self.is_stopping() {
            match self.start_child(group).await {
                Ok(pid) => {
                    // quit() may have run between the check and the spawn
                    if self.is_stopping() {
                        if let Err(e) = self.manager.terminate(pid) {
                            warn!(group, pid, error = %e, "cannot terminate poller");
                        }
                    }
                    return;
                }
                Err(e) => error!(
                    group,
                    error = %e,
                    "cannot restart poller, trying again in {} s",
                    self.retry_delay.as_secs()
                ),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.retry_delay) => {}
                _ = self.stop_notify.notified() => {}
            }
        }
    }

    /// Stop restarting and send every child a termination request.
    pub fn quit(&self) -> AppResult<()> {
        self.stopping.store(true, Ordering::SeqCst);
        self.stop_notify.notify_one();
        let pids: Vec<u32> = self.children.lock().keys().copied().collect();
        for pid in pids {
            self.manager.terminate(pid)?;
        }
        Ok(())
    }

    /// Whether [`Supervisor::quit`] was called.
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Current children as (pid, group).
    pub fn children(&self) -> Vec<(u32, String)> {
        let mut children: Vec<_> = self
            .children
            .lock()
            .iter()
            .map(|(pid, group)| (*pid, group.clone()))
            .collect();
        children.sort();
        children
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_reason_display() {
        assert_eq!(ExitReason::Code(1).to_string(), "exit code 1");
        assert_eq!(ExitReason::Signal(15).to_string(), "signal 15");
    }

    #[test]
    fn test_terminate_missing_process_is_ok() {
        let manager = TokioProcessManager::new("true", Vec::<String>::new());
        // pid beyond any pid_max
        assert!(manager.terminate(2_147_483_647).is_ok());
    }

    #[tokio::test]
    async fn test_real_child_is_reaped() {
        let manager = TokioProcessManager::new("sh", ["-c", "exit 3", "sh"]);
        let pid = manager.spawn("motors").await.unwrap();
        let exit = manager.wait_any().await.unwrap();
        assert_eq!(exit.pid, pid);
        assert_eq!(exit.reason, ExitReason::Code(3));
        assert!(manager.wait_any().await.is_none());
    }
}
