//! ProcessManager (spec §4.5).
//!
//! Grounded on the teacher's `process.rs` (`CommandExt`, `ExitStatusExt`,
//! the stdout/stderr draining-loop spawned per child) generalized from a
//! "stream this command to the CLI's own output" helper into a managed-
//! process registry with abort wiring and timeout-armed graceful shutdown.

use crate::cancel::{CancelReason, CancelToken};
use crate::error::ProcessError;
use dashmap::DashMap;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex as AsyncMutex;

pub struct SpawnOptions {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub abort: Option<CancelToken>,
    pub timeout_ms: Option<u64>,
    pub process_group: bool,
}

/// Handle to a live child process. Owned by the `ProcessManager`'s live
/// set; removed when `exitPromise` resolves (spec §4.5).
pub struct ManagedProcess {
    pub pid: u32,
    pub stdout: AsyncMutex<Option<Box<dyn AsyncRead + Send + Unpin>>>,
    pub stderr: AsyncMutex<Option<Box<dyn AsyncRead + Send + Unpin>>>,
    exit_code: Arc<AsyncMutex<Option<i32>>>,
    exit_notify: Arc<tokio::sync::Notify>,
    child: Arc<AsyncMutex<Option<Child>>>,
}

impl ManagedProcess {
    /// Resolves to the exit code, or a negative sentinel if the process
    /// was terminated by a signal before an exit code was observed.
    pub async fn wait_exit_code(&self) -> i32 {
        loop {
            if let Some(code) = *self.exit_code.lock().await {
                return code;
            }
            self.exit_notify.notified().await;
        }
    }
}

pub struct ProcessManager {
    live: DashMap<u32, Arc<ManagedProcess>>,
    next_synthetic_pid: AtomicU32,
    active_count: AtomicI64,
}

impl ProcessManager {
    pub fn new() -> Self {
        Self {
            live: DashMap::new(),
            next_synthetic_pid: AtomicU32::new(1),
            active_count: AtomicI64::new(0),
        }
    }

    pub fn get_active_count(&self) -> i64 {
        self.active_count.load(Ordering::SeqCst)
    }

    pub async fn spawn(
        self: &Arc<Self>,
        opts: SpawnOptions,
    ) -> Result<Arc<ManagedProcess>, ProcessError> {
        let mut command = Command::new(&opts.command);
        command.args(&opts.args);
        if let Some(cwd) = &opts.cwd {
            command.current_dir(cwd);
        }
        // `env` is merged over the ambient environment, not replaced
        // wholesale, so PATH/HOME survive (spec §4.5).
        for (key, value) in &opts.env {
            command.env(key, value);
        }
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.stdin(Stdio::null());

        #[cfg(unix)]
        if opts.process_group {
            use std::os::unix::process::CommandExt as _;
            unsafe {
                command.pre_exec(|| {
                    libc::setsid();
                    Ok(())
                });
            }
        }

        let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
            command: opts.command.clone(),
            source,
        })?;

        let pid = child
            .id()
            .unwrap_or_else(|| self.next_synthetic_pid.fetch_add(1, Ordering::SeqCst));

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProcessError::MissingStdio(opts.command.clone()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ProcessError::MissingStdio(opts.command.clone()))?;

        let exit_code: Arc<AsyncMutex<Option<i32>>> = Arc::new(AsyncMutex::new(None));
        let exit_notify = Arc::new(tokio::sync::Notify::new());
        let child_handle = Arc::new(AsyncMutex::new(None));

        let managed = Arc::new(ManagedProcess {
            pid,
            stdout: AsyncMutex::new(Some(Box::new(stdout))),
            stderr: AsyncMutex::new(Some(Box::new(stderr))),
            exit_code: exit_code.clone(),
            exit_notify: exit_notify.clone(),
            child: child_handle.clone(),
        });

        self.live.insert(pid, managed.clone());
        self.active_count.fetch_add(1, Ordering::SeqCst);

        *child_handle.lock().await = Some(child);

        // Wait for exit in the background; remove from the live set when done.
        let manager = self.clone();
        tokio::spawn(async move {
            let code = {
                let mut guard = child_handle.lock().await;
                if let Some(child) = guard.as_mut() {
                    match child.wait().await {
                        Ok(status) => status.code().unwrap_or(-1),
                        Err(_) => -1,
                    }
                } else {
                    -1
                }
            };
            *exit_code.lock().await = Some(code);
            exit_notify.notify_waiters();
            manager.live.remove(&pid);
            manager.active_count.fetch_sub(1, Ordering::SeqCst);
        });

        if let Some(abort) = opts.abort.clone() {
            let manager = self.clone();
            tokio::spawn(async move {
                abort.cancelled().await;
                manager.kill(pid, Signal::Term).await;
            });
        }

        if let Some(timeout_ms) = opts.timeout_ms {
            let manager = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(timeout_ms)).await;
                manager.graceful_shutdown(pid, 5_000).await;
            });
        }

        Ok(managed)
    }

    /// Best-effort signal delivery; no error if the pid already exited.
    pub async fn kill(&self, pid: u32, signal: Signal) {
        if let Some(managed) = self.live.get(&pid) {
            let mut guard = managed.child.lock().await;
            if let Some(child) = guard.as_mut() {
                match signal {
                    Signal::Kill => {
                        let _ = child.start_kill();
                    }
                    Signal::Term => {
                        send_sigterm(child);
                    }
                }
            }
        }
    }

    /// SIGTERM, wait up to `grace_ms`, then SIGKILL. Returns only after the
    /// process is confirmed exited or the kill call was issued.
    pub async fn graceful_shutdown(&self, pid: u32, grace_ms: u64) {
        let Some(managed) = self.live.get(&pid).map(|e| e.clone()) else {
            return;
        };
        self.kill(pid, Signal::Term).await;

        let waited = tokio::time::timeout(
            std::time::Duration::from_millis(grace_ms),
            managed.wait_exit_code(),
        )
        .await;

        if waited.is_err() {
            self.kill(pid, Signal::Kill).await;
            let _ = managed.wait_exit_code().await;
        }
    }

    /// gracefulShutdown on every live child; awaits all.
    pub async fn kill_all(&self) {
        let pids: Vec<u32> = self.live.iter().map(|e| *e.key()).collect();
        let futures = pids.into_iter().map(|pid| self.graceful_shutdown(pid, 5_000));
        futures::future::join_all(futures).await;
    }
}

impl Default for ProcessManager {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Signal {
    Term,
    Kill,
}

fn send_sigterm(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }
}
