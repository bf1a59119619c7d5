//! Process supervision.
//!
//! The supervisor keeps at most one process per logical server. Sessions ask
//! for a handle through [`Supervisor::ensure_running`] on every request, so a
//! restarted process is picked up without any rebinding step.
//!
//! Each supervised server gets a monitor task that health-checks it on a
//! fixed interval and restarts it once the failure streak reaches the
//! configured threshold. Restarts back off exponentially from the previous
//! attempt and stop at a ceiling, after which the server is marked
//! [`ProcessState::Failed`] until an operator calls [`Supervisor::reset`].

mod health;
mod process;

pub use health::HealthRecord;
pub use process::{ProcessHandle, ProcessState};

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::{ServerConfig, SupervisorConfig};
use crate::error::GatewayError;

/// Observability snapshot of one supervised server.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    /// Logical server name.
    pub name: String,
    /// Lifecycle state.
    pub state: ProcessState,
    /// OS process id of the current process.
    pub pid: Option<u32>,
    /// When the current process was launched.
    pub started_at: Option<DateTime<Utc>>,
    /// Health bookkeeping.
    pub health: HealthRecord,
    /// Recent stderr output of the current process.
    pub stderr_tail: Vec<String>,
}

/// Everything the supervisor tracks for one logical server.
struct SupervisedServer {
    name: String,
    config: Mutex<ServerConfig>,
    handle: RwLock<Option<Arc<ProcessHandle>>>,
    state: Mutex<ProcessState>,
    health: Mutex<HealthRecord>,
    /// Serialises launch, restart and stop for this server.
    lifecycle: tokio::sync::Mutex<()>,
    monitor_started: std::sync::atomic::AtomicBool,
}

impl SupervisedServer {
    fn current(&self) -> Option<Arc<ProcessHandle>> {
        self.handle.read().clone()
    }

    fn live(&self) -> Option<Arc<ProcessHandle>> {
        self.current()
            .filter(|h| !h.bridge().is_gone() && h.is_alive())
    }

    fn state(&self) -> ProcessState {
        *self.state.lock()
    }

    fn set_state(&self, state: ProcessState) {
        let mut current = self.state.lock();
        if *current != state {
            tracing::debug!(server = %self.name, from = ?*current, to = ?state, "State change");
            *current = state;
        }
    }
}

/// Starts, health-checks and restarts tool-server processes.
pub struct Supervisor {
    settings: SupervisorConfig,
    servers: RwLock<HashMap<String, Arc<SupervisedServer>>>,
    shutdown: CancellationToken,
}

impl Supervisor {
    /// Creates a supervisor. Nothing is spawned until first use.
    #[must_use]
    pub fn new(settings: SupervisorConfig) -> Arc<Self> {
        Arc::new(Self {
            settings,
            servers: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Supervisor settings.
    #[must_use]
    pub const fn settings(&self) -> &SupervisorConfig {
        &self.settings
    }

    /// Returns a live handle for `server`, launching it if needed.
    ///
    /// Idempotent: while the current process is alive the same handle is
    /// returned. A process that has died is replaced through the restart
    /// path and counts against the restart ceiling. So does every later
    /// attempt after a relaunch failed to spawn.
    ///
    /// # Errors
    ///
    /// - `ServerDisabled` if `config.enabled` is false
    /// - `RestartLimitExceeded` if the server is marked failed
    /// - `SpawnError` if the process cannot be started; a first launch is
    ///   not retried
    pub async fn ensure_running(
        self: &Arc<Self>,
        server: &str,
        config: &ServerConfig,
    ) -> Result<Arc<ProcessHandle>, GatewayError> {
        if !config.enabled {
            return Err(GatewayError::ServerDisabled {
                server: server.to_string(),
            });
        }

        let entry = self.entry(server, config);
        if entry.state() != ProcessState::Failed {
            if let Some(handle) = entry.live() {
                return Ok(handle);
            }
        }

        let _lifecycle = entry.lifecycle.lock().await;

        if entry.state() == ProcessState::Failed {
            return Err(Self::limit_error(&entry));
        }
        if let Some(handle) = entry.live() {
            return Ok(handle);
        }

        let relaunch = entry.current().is_some() || entry.health.lock().restart_count > 0;
        let handle = if relaunch {
            self.restart_locked(&entry, "process exited").await?
        } else {
            *entry.config.lock() = config.clone();
            self.launch(&entry)?
        };

        self.start_monitor(&entry);
        Ok(handle)
    }

    /// Current handle for `server`, if one has been launched.
    #[must_use]
    pub fn handle(&self, server: &str) -> Option<Arc<ProcessHandle>> {
        self.servers.read().get(server).and_then(|e| e.current())
    }

    /// Lifecycle state of `server`, if it is supervised.
    #[must_use]
    pub fn state(&self, server: &str) -> Option<ProcessState> {
        self.servers.read().get(server).map(|e| e.state())
    }

    /// Health record of `server`, if it is supervised.
    #[must_use]
    pub fn health(&self, server: &str) -> Option<HealthRecord> {
        self.servers
            .read()
            .get(server)
            .map(|e| e.health.lock().clone())
    }

    /// Checks liveness and, when enabled, answers to `ping`.
    ///
    /// A failure extends the failure streak; a success resets it. Returns
    /// false for servers with no running process. A server whose relaunch
    /// failed counts that as a failure, so the monitor keeps retrying it
    /// until the restart ceiling.
    pub async fn health_check(&self, server: &str) -> bool {
        let Some(entry) = self.get(server) else {
            return false;
        };
        let Some(handle) = entry.current() else {
            if entry.state() == ProcessState::Unhealthy {
                let streak = entry.health.lock().record_failure("process not running");
                tracing::warn!(server, streak, "Health check failed: process not running");
            }
            return false;
        };

        let failure = if !handle.is_alive() {
            Some("process exited".to_string())
        } else if handle.bridge().is_unhealthy() {
            Some("bridge flagged unhealthy".to_string())
        } else if self.settings.ping_on_health_check && handle.bridge().is_initialized() {
            handle
                .bridge()
                .ping(self.settings.ping_timeout())
                .await
                .err()
                .map(|e| e.to_string())
        } else {
            None
        };

        match failure {
            None => {
                entry.health.lock().record_success();
                if entry.state() == ProcessState::Unhealthy {
                    entry.set_state(ProcessState::Running);
                }
                true
            }
            Some(reason) => {
                let streak = entry.health.lock().record_failure(&reason);
                tracing::warn!(server, streak, reason = %reason, "Health check failed");
                if entry.state() == ProcessState::Running {
                    entry.set_state(ProcessState::Unhealthy);
                }
                false
            }
        }
    }

    /// Replaces the process for `server`.
    ///
    /// # Errors
    ///
    /// Returns `RestartLimitExceeded` once the ceiling is reached or auto
    /// restart is disabled; the server is then marked failed.
    pub async fn restart(&self, server: &str) -> Result<Arc<ProcessHandle>, GatewayError> {
        let entry = self.get(server).ok_or_else(|| GatewayError::UnknownServer {
            server: server.to_string(),
        })?;
        let _lifecycle = entry.lifecycle.lock().await;
        if entry.state() == ProcessState::Failed {
            return Err(Self::limit_error(&entry));
        }
        self.restart_locked(&entry, "restart requested").await
    }

    /// Clears the failed mark and all counters for `server`.
    ///
    /// # Errors
    ///
    /// Returns `UnknownServer` if the server has never been launched.
    pub async fn reset(&self, server: &str) -> Result<(), GatewayError> {
        let entry = self.get(server).ok_or_else(|| GatewayError::UnknownServer {
            server: server.to_string(),
        })?;
        let _lifecycle = entry.lifecycle.lock().await;
        entry.health.lock().reset();
        if entry.state() == ProcessState::Failed {
            entry.set_state(ProcessState::Stopped);
        }
        tracing::info!(server, "Supervisor state reset");
        Ok(())
    }

    /// Snapshot of every supervised server.
    #[must_use]
    pub fn status(&self) -> Vec<ServerStatus> {
        let mut statuses: Vec<_> = self
            .servers
            .read()
            .values()
            .map(|entry| {
                let handle = entry.current();
                ServerStatus {
                    name: entry.name.clone(),
                    state: entry.state(),
                    pid: handle.as_ref().and_then(|h| h.pid()),
                    started_at: handle.as_ref().map(|h| h.started_at()),
                    health: entry.health.lock().clone(),
                    stderr_tail: handle.map(|h| h.stderr_tail()).unwrap_or_default(),
                }
            })
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Stops every monitor and terminates every process.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let entries: Vec<_> = self.servers.read().values().cloned().collect();
        for entry in entries {
            let _lifecycle = entry.lifecycle.lock().await;
            let handle = entry.handle.write().take();
            if let Some(handle) = handle {
                handle.terminate(self.settings.shutdown_grace()).await;
            }
            entry.set_state(ProcessState::Stopped);
        }
        tracing::info!("Supervisor stopped");
    }

    fn get(&self, server: &str) -> Option<Arc<SupervisedServer>> {
        self.servers.read().get(server).cloned()
    }

    fn entry(&self, server: &str, config: &ServerConfig) -> Arc<SupervisedServer> {
        if let Some(entry) = self.get(server) {
            return entry;
        }
        let mut servers = self.servers.write();
        Arc::clone(servers.entry(server.to_string()).or_insert_with(|| {
            Arc::new(SupervisedServer {
                name: server.to_string(),
                config: Mutex::new(config.clone()),
                handle: RwLock::new(None),
                state: Mutex::new(ProcessState::Stopped),
                health: Mutex::new(HealthRecord::new(self.settings.auto_restart)),
                lifecycle: tokio::sync::Mutex::new(()),
                monitor_started: std::sync::atomic::AtomicBool::new(false),
            })
        }))
    }

    /// Spawns a process from the entry's configuration snapshot. Caller
    /// holds the lifecycle lock.
    fn launch(&self, entry: &SupervisedServer) -> Result<Arc<ProcessHandle>, GatewayError> {
        entry.set_state(ProcessState::Starting);
        let config = entry.config.lock().clone();
        match ProcessHandle::spawn(&entry.name, &config) {
            Ok(handle) => {
                let handle = Arc::new(handle);
                *entry.handle.write() = Some(Arc::clone(&handle));
                entry.set_state(ProcessState::Running);
                Ok(handle)
            }
            Err(e) => {
                tracing::error!(server = %entry.name, error = %e, "Failed to launch");
                entry.health.lock().last_failure_reason = Some(e.to_string());
                entry.set_state(ProcessState::Stopped);
                Err(e)
            }
        }
    }

    /// Restart path. Caller holds the lifecycle lock.
    async fn restart_locked(
        &self,
        entry: &SupervisedServer,
        reason: &str,
    ) -> Result<Arc<ProcessHandle>, GatewayError> {
        let (allowed, backoff_wait) = {
            let health = entry.health.lock();
            let backoff = self.settings.restart_backoff(health.restart_count);
            (
                health.may_restart(self.settings.max_restarts),
                health.backoff_remaining(backoff, Instant::now()),
            )
        };

        if !allowed {
            let error = Self::limit_error(entry);
            tracing::error!(server = %entry.name, error = %error, "Giving up on server");
            entry.set_state(ProcessState::Failed);
            let handle = entry.handle.write().take();
            if let Some(handle) = handle {
                handle.terminate(self.settings.shutdown_grace()).await;
            }
            return Err(error);
        }

        entry.set_state(ProcessState::Restarting);
        tracing::warn!(server = %entry.name, reason, backoff_ms = backoff_wait.as_millis(), "Restarting server");

        if !backoff_wait.is_zero() {
            tokio::select! {
                () = self.shutdown.cancelled() => {
                    entry.set_state(ProcessState::Stopped);
                    return Err(GatewayError::ProcessGone { server: entry.name.clone() });
                }
                () = tokio::time::sleep(backoff_wait) => {}
            }
        }

        let old = entry.handle.write().take();
        if let Some(old) = old {
            old.terminate(self.settings.shutdown_grace()).await;
        }

        entry.health.lock().mark_restart_attempt(Instant::now());
        let launched = self.launch(entry);
        if launched.is_err() {
            // Still supervised: the next health check or request retries.
            entry.set_state(ProcessState::Unhealthy);
        }
        launched
    }

    fn limit_error(entry: &SupervisedServer) -> GatewayError {
        GatewayError::RestartLimitExceeded {
            server: entry.name.clone(),
            attempts: entry.health.lock().restart_count,
        }
    }

    fn start_monitor(self: &Arc<Self>, entry: &SupervisedServer) {
        use std::sync::atomic::Ordering;

        if entry.monitor_started.swap(true, Ordering::AcqRel) {
            return;
        }
        let supervisor = Arc::downgrade(self);
        let server = entry.name.clone();
        let cancel = self.shutdown.child_token();
        let interval = self.settings.health_check_interval();
        tokio::spawn(monitor(supervisor, server, cancel, interval));
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("servers", &self.servers.read().len())
            .finish_non_exhaustive()
    }
}

/// Health loop for one server. Exits when the supervisor is dropped or shut
/// down.
async fn monitor(
    supervisor: Weak<Supervisor>,
    server: String,
    cancel: CancellationToken,
    interval: std::time::Duration,
) {
    tracing::debug!(server = %server, interval_ms = interval.as_millis(), "Health monitor started");
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(interval) => {}
        }

        let Some(supervisor) = supervisor.upgrade() else {
            break;
        };
        if matches!(
            supervisor.state(&server),
            Some(ProcessState::Failed | ProcessState::Stopped | ProcessState::Restarting)
        ) {
            continue;
        }

        if supervisor.health_check(&server).await {
            continue;
        }

        let due = supervisor
            .health(&server)
            .is_some_and(|h| h.should_restart(supervisor.settings.failure_threshold));
        if due {
            if let Err(e) = supervisor.restart(&server).await {
                tracing::error!(server = %server, error = %e, "Automatic restart failed");
            }
        }
    }
    tracing::debug!(server = %server, "Health monitor stopped");
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    fn settings() -> SupervisorConfig {
        SupervisorConfig {
            health_check_interval_ms: 60_000,
            restart_backoff_base_ms: 1,
            restart_backoff_max_ms: 5,
            shutdown_grace_ms: 200,
            max_restarts: 2,
            ..SupervisorConfig::default()
        }
    }

    fn cat() -> ServerConfig {
        ServerConfig::new("cat", vec![])
    }

    async fn wait_dead(handle: &ProcessHandle) {
        for _ in 0..200 {
            if !handle.is_alive() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("process did not exit");
    }

    #[tokio::test]
    async fn ensure_running_is_idempotent() {
        let supervisor = Supervisor::new(settings());
        let first = supervisor.ensure_running("cat", &cat()).await.unwrap();
        let second = supervisor.ensure_running("cat", &cat()).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.pid(), second.pid());
        assert_eq!(supervisor.state("cat"), Some(ProcessState::Running));
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn disabled_server_is_refused() {
        let supervisor = Supervisor::new(settings());
        let mut config = cat();
        config.enabled = false;
        let err = supervisor.ensure_running("off", &config).await.unwrap_err();
        assert!(matches!(err, GatewayError::ServerDisabled { .. }));
        assert!(supervisor.handle("off").is_none());
    }

    #[tokio::test]
    async fn spawn_error_is_not_retried() {
        let supervisor = Supervisor::new(settings());
        let config = ServerConfig::new("/nonexistent/mcp-gateway-test-binary", vec![]);
        let err = supervisor.ensure_running("ghost", &config).await.unwrap_err();
        assert!(matches!(err, GatewayError::SpawnError { .. }));
        assert_eq!(supervisor.health("ghost").unwrap().restart_count, 0);
        assert_eq!(supervisor.state("ghost"), Some(ProcessState::Stopped));
    }

    #[tokio::test]
    async fn dead_process_is_replaced_until_ceiling() {
        let supervisor = Supervisor::new(settings());
        let config = ServerConfig::new("true", vec![]);

        let mut handle = supervisor.ensure_running("flaky", &config).await.unwrap();
        for expected in 1..=2 {
            wait_dead(&handle).await;
            handle = supervisor.ensure_running("flaky", &config).await.unwrap();
            assert_eq!(supervisor.health("flaky").unwrap().restart_count, expected);
        }

        wait_dead(&handle).await;
        let err = supervisor.ensure_running("flaky", &config).await.unwrap_err();
        assert!(matches!(err, GatewayError::RestartLimitExceeded { attempts: 2, .. }));
        assert_eq!(supervisor.state("flaky"), Some(ProcessState::Failed));

        let again = supervisor.ensure_running("flaky", &config).await.unwrap_err();
        assert!(matches!(again, GatewayError::RestartLimitExceeded { .. }));

        supervisor.reset("flaky").await.unwrap();
        assert!(supervisor.ensure_running("flaky", &config).await.is_ok());
        supervisor.shutdown().await;
    }

    /// A `true` binary reachable through a link that the test can remove.
    fn removable_true(dir: &tempfile::TempDir) -> (std::path::PathBuf, ServerConfig) {
        let target = ["/bin/true", "/usr/bin/true"]
            .into_iter()
            .find(|p| std::path::Path::new(p).exists())
            .unwrap();
        let link = dir.path().join("true");
        std::os::unix::fs::symlink(target, &link).unwrap();
        let config = ServerConfig::new(link.to_string_lossy(), vec![]);
        (link, config)
    }

    #[tokio::test]
    async fn failed_relaunch_still_counts_toward_ceiling() {
        let dir = tempfile::tempdir().unwrap();
        let (link, config) = removable_true(&dir);
        let supervisor = Supervisor::new(settings());

        let handle = supervisor.ensure_running("vanishing", &config).await.unwrap();
        wait_dead(&handle).await;
        std::fs::remove_file(&link).unwrap();

        for expected in 1..=2 {
            let err = supervisor.ensure_running("vanishing", &config).await.unwrap_err();
            assert!(matches!(err, GatewayError::SpawnError { .. }));
            assert_eq!(supervisor.health("vanishing").unwrap().restart_count, expected);
            assert_eq!(supervisor.state("vanishing"), Some(ProcessState::Unhealthy));
        }

        let err = supervisor.ensure_running("vanishing", &config).await.unwrap_err();
        assert!(matches!(err, GatewayError::RestartLimitExceeded { attempts: 2, .. }));
        assert_eq!(supervisor.state("vanishing"), Some(ProcessState::Failed));
    }

    #[tokio::test]
    async fn monitor_gives_up_when_relaunch_keeps_failing() {
        let dir = tempfile::tempdir().unwrap();
        let (link, config) = removable_true(&dir);
        let supervisor = Supervisor::new(SupervisorConfig {
            health_check_interval_ms: 20,
            failure_threshold: 1,
            ..settings()
        });

        let handle = supervisor.ensure_running("vanishing", &config).await.unwrap();
        std::fs::remove_file(&link).unwrap();
        wait_dead(&handle).await;

        let mut failed = false;
        for _ in 0..300 {
            if supervisor.state("vanishing") == Some(ProcessState::Failed) {
                failed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(failed, "monitor should mark the server failed");
        assert_eq!(supervisor.health("vanishing").unwrap().restart_count, 2);
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn auto_restart_disabled_fails_immediately() {
        let supervisor = Supervisor::new(SupervisorConfig {
            auto_restart: false,
            ..settings()
        });
        let config = ServerConfig::new("true", vec![]);
        let handle = supervisor.ensure_running("once", &config).await.unwrap();
        wait_dead(&handle).await;
        let err = supervisor.ensure_running("once", &config).await.unwrap_err();
        assert!(matches!(err, GatewayError::RestartLimitExceeded { attempts: 0, .. }));
    }

    #[tokio::test]
    async fn health_check_tracks_failures() {
        let supervisor = Supervisor::new(settings());
        let config = ServerConfig::new("true", vec![]);
        let handle = supervisor.ensure_running("short", &config).await.unwrap();
        wait_dead(&handle).await;

        assert!(!supervisor.health_check("short").await);
        assert!(!supervisor.health_check("short").await);
        let health = supervisor.health("short").unwrap();
        assert_eq!(health.consecutive_failures, 2);
        assert_eq!(health.last_failure_reason.as_deref(), Some("process exited"));
        assert_eq!(supervisor.state("short"), Some(ProcessState::Unhealthy));
    }

    #[tokio::test]
    async fn health_check_passes_for_live_process() {
        let supervisor = Supervisor::new(settings());
        supervisor.ensure_running("cat", &cat()).await.unwrap();
        assert!(supervisor.health_check("cat").await);
        assert!(!supervisor.health_check("unknown").await);
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn monitor_restarts_after_threshold() {
        let supervisor = Supervisor::new(SupervisorConfig {
            health_check_interval_ms: 20,
            failure_threshold: 2,
            max_restarts: 1,
            ..settings()
        });
        let config = ServerConfig::new("true", vec![]);
        supervisor.ensure_running("watched", &config).await.unwrap();

        let mut restarted = false;
        for _ in 0..200 {
            if supervisor.health("watched").unwrap().restart_count >= 1 {
                restarted = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(restarted, "monitor should have restarted the process");
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn status_reports_every_server() {
        let supervisor = Supervisor::new(settings());
        supervisor.ensure_running("b", &cat()).await.unwrap();
        supervisor.ensure_running("a", &cat()).await.unwrap();
        let status = supervisor.status();
        let names: Vec<_> = status.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["a", "b"]);
        assert!(status.iter().all(|s| s.pid.is_some()));

        supervisor.shutdown().await;
        assert!(supervisor
            .status()
            .iter()
            .all(|s| s.state == ProcessState::Stopped));
    }
}
