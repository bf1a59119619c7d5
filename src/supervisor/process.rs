//! One spawned tool-server process.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};

use crate::bridge::ProtocolBridge;
use crate::config::ServerConfig;
use crate::error::GatewayError;

/// Lines of stderr retained per process.
const STDERR_TAIL_LINES: usize = 20;

/// Lifecycle state of a supervised server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    /// Being spawned.
    Starting,
    /// Spawned and passing health checks.
    Running,
    /// Failing health checks.
    Unhealthy,
    /// Being replaced.
    Restarting,
    /// Not running.
    Stopped,
    /// Restart ceiling reached; needs an operator reset.
    Failed,
}

/// A running process and the bridge that owns its pipes.
pub struct ProcessHandle {
    server: String,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    config: ServerConfig,
    child: tokio::sync::Mutex<Child>,
    bridge: Arc<ProtocolBridge>,
    stderr_tail: Arc<parking_lot::Mutex<VecDeque<String>>>,
}

impl ProcessHandle {
    /// Spawns `config.command` with piped stdio.
    ///
    /// The process inherits the gateway's environment, overridden by
    /// `config.env`. It is killed if the handle is dropped.
    ///
    /// # Errors
    ///
    /// Returns `SpawnError` if the OS refuses to start the process.
    pub fn spawn(server: &str, config: &ServerConfig) -> Result<Self, GatewayError> {
        let spawn_error = |reason: String| GatewayError::SpawnError {
            server: server.to_string(),
            reason,
        };

        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &config.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| spawn_error(e.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_error("failed to capture stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_error("failed to capture stdout".to_string()))?;

        let stderr_tail = Arc::new(parking_lot::Mutex::new(VecDeque::with_capacity(
            STDERR_TAIL_LINES,
        )));
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(capture_stderr(
                server.to_string(),
                stderr,
                Arc::clone(&stderr_tail),
            ));
        }

        let pid = child.id();
        tracing::info!(server, pid, command = %config.command, "Spawned process");

        Ok(Self {
            server: server.to_string(),
            pid,
            started_at: Utc::now(),
            config: config.clone(),
            child: tokio::sync::Mutex::new(child),
            bridge: Arc::new(ProtocolBridge::new(server, stdout, stdin)),
            stderr_tail,
        })
    }

    /// Logical server name.
    #[must_use]
    pub fn server(&self) -> &str {
        &self.server
    }

    /// OS process id, if known.
    #[must_use]
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Launch time.
    #[must_use]
    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// The configuration snapshot this process was launched with.
    #[must_use]
    pub const fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The bridge over this process's stdio.
    #[must_use]
    pub const fn bridge(&self) -> &Arc<ProtocolBridge> {
        &self.bridge
    }

    /// The most recent stderr lines, oldest first.
    #[must_use]
    pub fn stderr_tail(&self) -> Vec<String> {
        self.stderr_tail.lock().iter().cloned().collect()
    }

    /// True while the OS process has not exited. A process being
    /// terminated counts as not alive.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        let Ok(mut child) = self.child.try_lock() else {
            return false;
        };
        matches!(child.try_wait(), Ok(None))
    }

    /// Stops the process: closes stdin, waits up to `grace` for it to exit,
    /// then kills it.
    pub async fn terminate(&self, grace: Duration) {
        self.bridge.teardown().await;

        let mut child = self.child.lock().await;
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(server = %self.server, %status, "Process exited");
            }
            Ok(Err(e)) => {
                tracing::warn!(server = %self.server, error = %e, "Failed to wait for process");
            }
            Err(_) => {
                tracing::warn!(server = %self.server, grace_ms = grace.as_millis(), "Process ignored stdin close; killing");
                if let Err(e) = child.kill().await {
                    tracing::warn!(server = %self.server, error = %e, "Failed to kill process");
                }
            }
        }
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("server", &self.server)
            .field("pid", &self.pid)
            .field("started_at", &self.started_at)
            .finish_non_exhaustive()
    }
}

/// Logs stderr lines and keeps the last few for diagnostics.
async fn capture_stderr(
    server: String,
    stderr: ChildStderr,
    tail: Arc<parking_lot::Mutex<VecDeque<String>>>,
) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                tracing::debug!(server = %server, stderr = %line, "Process stderr");
                let mut tail = tail.lock();
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(server = %server, error = %e, "Stopped reading stderr");
                break;
            }
        }
    }
}
