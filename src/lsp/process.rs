//! Supervised language server process
//!
//! A monitor task owns the child and publishes its exit through a watch
//! channel, so the session can observe crashes while `stop()` can still ask
//! for the process to be killed.

use crate::types::describe_exit;
use serde::Serialize;
use std::fmt;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

/// How a server process ended
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl From<ExitStatus> for ExitInfo {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&describe_exit(&self.code, &self.signal))
    }
}

/// Owning handle to a spawned server. Dropping it kills the process.
pub struct ProcessHandle {
    pid: Option<u32>,
    program: String,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
    kill_tx: Option<oneshot::Sender<()>>,
}

impl ProcessHandle {
    /// Take ownership of `child` and start watching it.
    pub fn supervise(mut child: Child, program: String) -> Self {
        let pid = child.id();

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(stderr, program.clone()));
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let monitored = program.clone();

        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                // Fires on an explicit kill and when the handle is dropped
                _ = kill_rx => {
                    debug!("Killing language server {}", monitored);
                    if let Err(e) = child.start_kill() {
                        warn!("Failed to kill {}: {}", monitored, e);
                    }
                    child.wait().await
                }
            };

            let info = match status {
                Ok(status) => ExitInfo::from(status),
                Err(e) => {
                    warn!("Failed to reap {}: {}", monitored, e);
                    ExitInfo::default()
                }
            };
            info!("Language server {} exited: {}", monitored, info);
            let _ = exit_tx.send(Some(info));
        });

        Self {
            pid,
            program,
            exit_rx,
            kill_tx: Some(kill_tx),
        }
    }

    pub fn id(&self) -> Option<u32> {
        self.pid
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Exit information, if the process has already ended
    pub fn try_exit(&self) -> Option<ExitInfo> {
        *self.exit_rx.borrow()
    }

    /// A receiver that observes the exit without holding the handle
    pub fn exit_watcher(&self) -> watch::Receiver<Option<ExitInfo>> {
        self.exit_rx.clone()
    }

    pub async fn wait(&self) -> ExitInfo {
        wait_for_exit(self.exit_rx.clone()).await
    }

    pub async fn wait_timeout(&self, limit: Duration) -> Option<ExitInfo> {
        tokio::time::timeout(limit, self.wait()).await.ok()
    }

    pub async fn kill(&mut self) -> ExitInfo {
        if let Some(kill_tx) = self.kill_tx.take() {
            let _ = kill_tx.send(());
        }
        self.wait().await
    }
}

/// Resolve once the watched process has exited.
pub async fn wait_for_exit(mut exit_rx: watch::Receiver<Option<ExitInfo>>) -> ExitInfo {
    match exit_rx.wait_for(Option::is_some).await {
        Ok(info) => (*info).unwrap_or_default(),
        // Monitor task vanished without reporting; treat as an unknown exit
        Err(_) => ExitInfo::default(),
    }
}

async fn forward_stderr(stderr: ChildStderr, program: String) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => debug!("[{}] {}", program, line),
            Ok(None) => break,
            Err(e) => {
                debug!("Stopped reading stderr of {}: {}", program, e);
                break;
            }
        }
    }
}
