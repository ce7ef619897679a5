//! Dev-server lifecycle management.
//!
//! The supervisor owns the authoritative registry of managed servers. It
//! spawns children detached (own process group, output to files) so they
//! survive daemon restarts, watches their liveness by polling the process
//! table, and reconciles whatever a previous daemon instance left behind.

use crate::defaults::{
    DEFAULT_ARGS, DEFAULT_COMMAND, KILL_GRACE, LIVENESS_POLL_INTERVAL, LOG_BUFFER_LINES,
    SWEEP_PROCESS_NAMES,
};
use crate::hosts::{HostAllocator, HostError};
use crate::logs::LogStore;
use crate::paths;
use crate::proctree;
use crate::proxy::RouteManager;
use crate::readiness::{ReadinessConfig, ReadinessOutcome, wait_ready};
use crate::state_store::{PersistedServer, SqliteStateStore, StateStoreError};
use crate::tailer::{TailFrom, replay_tail, spawn_tailer};
use canopy_core::{LogSource, ProxyInfo, ServerInfo, ServerStatus, server_id};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("invalid target: {0}")]
    InvalidTarget(String),

    #[error("failed to spawn dev server: {0}")]
    SpawnFailed(String),

    #[error(transparent)]
    HostPool(#[from] HostError),

    #[error(transparent)]
    Store(#[from] StateStoreError),
}

/// How to launch a server, as resolved from the start request.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub command: String,
    pub args: Vec<String>,
    pub ready_sentinel: Option<String>,
}

impl LaunchSpec {
    pub fn resolve(command: Option<String>, args: Vec<String>, sentinel: Option<String>) -> Self {
        match command {
            Some(command) => Self {
                command,
                args,
                ready_sentinel: sentinel,
            },
            None => Self {
                command: DEFAULT_COMMAND.to_string(),
                args: DEFAULT_ARGS.iter().map(|a| a.to_string()).collect(),
                ready_sentinel: sentinel,
            },
        }
    }
}

/// One managed server and its background machinery.
pub struct ManagedServer {
    pub path: PathBuf,
    pub id: String,
    pub pid: u32,
    pub command: String,
    pub args: Vec<String>,
    pub host: Option<Ipv4Addr>,
    pub start_time: u64,
    pub stdout_log: PathBuf,
    pub stderr_log: PathBuf,
    pub logs: Arc<LogStore>,

    status: RwLock<ServerStatus>,
    last_error: RwLock<Option<String>>,
    // Present only for children spawned by this daemon instance; re-attached
    // orphans are not our OS children and are polled via the process table.
    child: Mutex<Option<std::process::Child>>,
    tailers: Mutex<Vec<JoinHandle<()>>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl ManagedServer {
    pub fn status(&self) -> ServerStatus {
        *self.status.read()
    }

    fn set_status(&self, status: ServerStatus) {
        *self.status.write() = status;
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    fn set_last_error(&self, message: impl Into<String>) {
        *self.last_error.write() = Some(message.into());
    }

    /// Liveness check. Children we spawned are asked directly (which also
    /// reaps them on exit); everything else goes through the process table.
    pub fn is_alive(&self) -> bool {
        let mut child = self.child.lock();
        if let Some(child) = child.as_mut() {
            return match child.try_wait() {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(_) => false,
            };
        }
        proctree::pid_alive(self.pid)
    }

    /// Reap the child if it was ours and has exited. Best-effort.
    fn reap(&self) {
        if let Some(child) = self.child.lock().as_mut() {
            let _ = child.try_wait();
        }
    }

    fn add_tailer(&self, handle: JoinHandle<()>) {
        self.tailers.lock().push(handle);
    }

    fn set_watcher(&self, handle: JoinHandle<()>) {
        *self.watcher.lock() = Some(handle);
    }

    fn abort_tailers(&self) {
        for handle in self.tailers.lock().drain(..) {
            handle.abort();
        }
    }

    fn abort_watcher(&self) {
        if let Some(handle) = self.watcher.lock().take() {
            handle.abort();
        }
    }

    pub fn info(&self, proxy: Option<ProxyInfo>) -> ServerInfo {
        ServerInfo {
            id: self.id.clone(),
            path: self.path.to_string_lossy().to_string(),
            pid: Some(self.pid),
            command: self.command.clone(),
            args: self.args.clone(),
            host: self.host.map(|h| h.to_string()),
            status: self.status(),
            start_time: self.start_time,
            proxy,
            last_error: self.last_error(),
        }
    }

    fn persisted(&self) -> PersistedServer {
        PersistedServer {
            path: self.path.clone(),
            pid: self.pid,
            command: self.command.clone(),
            args: self.args.clone(),
            host: self.host,
            status: self.status(),
            start_time: self.start_time,
            stdout_log: self.stdout_log.clone(),
            stderr_log: self.stderr_log.clone(),
        }
    }
}

struct Inner {
    data_dir: PathBuf,
    store: Arc<SqliteStateStore>,
    hosts: Arc<HostAllocator>,
    proxy: Arc<RouteManager>,
    registry: DashMap<PathBuf, Arc<ManagedServer>>,
    // Serializes start/stop/prune per path; start-while-stopping is the race
    // this exists to kill.
    locks: DashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>,
    readiness: ReadinessConfig,
}

#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(
        data_dir: PathBuf,
        store: Arc<SqliteStateStore>,
        hosts: Arc<HostAllocator>,
        proxy: Arc<RouteManager>,
        readiness: ReadinessConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                data_dir,
                store,
                hosts,
                proxy,
                registry: DashMap::new(),
                locks: DashMap::new(),
                readiness,
            }),
        }
    }

    pub fn get(&self, path: &Path) -> Option<Arc<ManagedServer>> {
        self.inner.registry.get(path).map(|e| e.value().clone())
    }

    pub fn list(&self) -> Vec<Arc<ManagedServer>> {
        let mut servers: Vec<_> = self
            .inner
            .registry
            .iter()
            .map(|e| e.value().clone())
            .collect();
        servers.sort_by(|a, b| a.path.cmp(&b.path));
        servers
    }

    pub fn count(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn proxy(&self) -> &Arc<RouteManager> {
        &self.inner.proxy
    }

    fn path_lock(&self, path: &Path) -> Arc<tokio::sync::Mutex<()>> {
        self.inner
            .locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Start a dev server for `path`, replacing any existing record for the
    /// same path first. Returns with status `starting`; the readiness task
    /// transitions the record in the background.
    pub async fn start(
        &self,
        path: &Path,
        spec: LaunchSpec,
    ) -> Result<ServerInfo, SupervisorError> {
        let lock = self.path_lock(path);
        let _guard = lock.lock().await;

        validate_target(path, &spec)?;

        if self.inner.registry.contains_key(path) {
            self.stop_locked(path).await;
        }

        let host = self.inner.hosts.allocate(path)?;
        let id = server_id(path);
        let stdout_log = paths::stdout_log_path(&self.inner.data_dir, &id);
        let stderr_log = paths::stderr_log_path(&self.inner.data_dir, &id);

        let child = match spawn_detached(path, &spec, host, &stdout_log, &stderr_log) {
            Ok(child) => child,
            Err(e) => {
                let _ = self.inner.hosts.release(path);
                return Err(SupervisorError::SpawnFailed(e.to_string()));
            }
        };
        let pid = child.id();

        let managed = Arc::new(ManagedServer {
            path: path.to_path_buf(),
            id,
            pid,
            command: spec.command.clone(),
            args: spec.args.clone(),
            host: Some(host),
            start_time: unix_now(),
            stdout_log: stdout_log.clone(),
            stderr_log: stderr_log.clone(),
            logs: Arc::new(LogStore::new()),
            status: RwLock::new(ServerStatus::Starting),
            last_error: RwLock::new(None),
            child: Mutex::new(Some(child)),
            tailers: Mutex::new(Vec::new()),
            watcher: Mutex::new(None),
        });

        if let Err(e) = self.inner.store.upsert_server(&managed.persisted()) {
            proctree::kill_tree(pid, KILL_GRACE).await;
            managed.reap();
            let _ = self.inner.hosts.release(path);
            return Err(e.into());
        }
        self.inner.registry.insert(path.to_path_buf(), managed.clone());

        tracing::info!(
            path = %path.display(),
            pid,
            host = %host,
            command = %spec.command,
            "dev server starting"
        );

        // Subscribe before the tailers start so no early banner is missed.
        let ready_rx = managed.logs.subscribe();
        self.attach_streams(&managed, TailFrom::Start);
        self.spawn_watcher(&managed);
        self.spawn_readiness(&managed, spec.ready_sentinel, ready_rx);

        Ok(managed.info(None))
    }

    /// Stop the server for `path`. Best-effort and idempotent: stopping an
    /// unknown path is a no-op, and nothing here fails once the record has
    /// left the registry.
    pub async fn stop(&self, path: &Path) {
        let lock = self.path_lock(path);
        let _guard = lock.lock().await;
        self.stop_locked(path).await;
    }

    async fn stop_locked(&self, path: &Path) {
        let Some((_, managed)) = self.inner.registry.remove(path) else {
            return;
        };

        managed.abort_watcher();
        managed.abort_tailers();

        // Routes first so nothing forwards traffic at a dying server.
        if let Err(e) = self.inner.proxy.disable(path).await {
            tracing::warn!(path = %path.display(), error = %e, "proxy disable during stop failed");
        }

        // Signal only processes we can still observe; a pid that already
        // died must not be signaled again (it may have been reused).
        if managed.is_alive() {
            proctree::kill_tree(managed.pid, KILL_GRACE).await;
            managed.reap();
            let swept = proctree::sweep_workdir(path, SWEEP_PROCESS_NAMES);
            if swept > 0 {
                tracing::debug!(path = %path.display(), swept, "swept leftover dev-tool processes");
            }
        }

        if let Err(e) = self.inner.hosts.release(path) {
            tracing::warn!(path = %path.display(), error = %e, "host release during stop failed");
        }
        if let Err(e) = self.inner.store.remove_server(path) {
            tracing::warn!(path = %path.display(), error = %e, "registry cleanup during stop failed");
        }
        managed.set_status(ServerStatus::Stopped);
        tracing::info!(path = %path.display(), pid = managed.pid, "dev server stopped");
    }

    /// Called by the liveness watcher when a child died outside our control.
    async fn prune_dead(&self, path: &Path) {
        let lock = self.path_lock(path);
        let _guard = lock.lock().await;

        let Some((_, managed)) = self.inner.registry.remove(path) else {
            return;
        };
        managed.abort_tailers();
        managed.reap();

        if let Err(e) = self.inner.proxy.disable(path).await {
            tracing::warn!(path = %path.display(), error = %e, "proxy disable during prune failed");
        }
        if let Err(e) = self.inner.hosts.release(path) {
            tracing::warn!(path = %path.display(), error = %e, "host release during prune failed");
        }
        if let Err(e) = self.inner.store.remove_server(path) {
            tracing::warn!(path = %path.display(), error = %e, "registry cleanup during prune failed");
        }
        managed.set_status(ServerStatus::Stopped);
        tracing::info!(path = %path.display(), pid = managed.pid, "dev server exited; record pruned");
    }

    /// Rebuild the registry from persisted state after a daemon restart:
    /// drop records whose directory or process is gone, re-attach to the
    /// rest without spawning anything.
    pub async fn reconcile_orphans(&self) -> Result<(), SupervisorError> {
        for persisted in self.inner.store.load_servers()? {
            let path = persisted.path.clone();

            if !path.is_dir() {
                tracing::info!(path = %path.display(), "dropping orphan: directory is gone");
                self.drop_orphan(&path).await;
                continue;
            }
            if !persisted.status.is_active() || !proctree::pid_alive(persisted.pid) {
                tracing::info!(
                    path = %path.display(),
                    pid = persisted.pid,
                    "dropping orphan: process is gone"
                );
                self.drop_orphan(&path).await;
                continue;
            }

            let managed = Arc::new(ManagedServer {
                path: path.clone(),
                id: server_id(&path),
                pid: persisted.pid,
                command: persisted.command.clone(),
                args: persisted.args.clone(),
                host: persisted.host,
                start_time: persisted.start_time,
                stdout_log: persisted.stdout_log.clone(),
                stderr_log: persisted.stderr_log.clone(),
                logs: Arc::new(LogStore::new()),
                status: RwLock::new(persisted.status),
                last_error: RwLock::new(None),
                child: Mutex::new(None),
                tailers: Mutex::new(Vec::new()),
                watcher: Mutex::new(None),
            });

            // Rebuild the in-memory buffers from the capture files, then
            // resume tailing new output.
            let replay = LOG_BUFFER_LINES / 2;
            if let Err(e) =
                replay_tail(&managed.stdout_log, LogSource::Stdout, &managed.logs, replay).await
            {
                tracing::debug!(path = %path.display(), error = %e, "stdout replay skipped");
            }
            if let Err(e) =
                replay_tail(&managed.stderr_log, LogSource::Stderr, &managed.logs, replay).await
            {
                tracing::debug!(path = %path.display(), error = %e, "stderr replay skipped");
            }

            self.inner.registry.insert(path.clone(), managed.clone());
            self.attach_streams(&managed, TailFrom::End);
            self.spawn_watcher(&managed);
            tracing::info!(path = %path.display(), pid = managed.pid, "re-attached to running dev server");
        }

        let active: HashSet<PathBuf> = self
            .inner
            .registry
            .iter()
            .map(|e| e.key().clone())
            .collect();
        self.inner.hosts.reconcile(&active)?;
        Ok(())
    }

    async fn drop_orphan(&self, path: &Path) {
        if let Err(e) = self.inner.store.remove_server(path) {
            tracing::warn!(path = %path.display(), error = %e, "orphan registry cleanup failed");
        }
        if let Err(e) = self.inner.hosts.release(path) {
            tracing::warn!(path = %path.display(), error = %e, "orphan host release failed");
        }
        if let Err(e) = self.inner.proxy.disable(path).await {
            tracing::warn!(path = %path.display(), error = %e, "orphan proxy cleanup failed");
        }
    }

    fn attach_streams(&self, managed: &Arc<ManagedServer>, from: TailFrom) {
        managed.add_tailer(spawn_tailer(
            managed.stdout_log.clone(),
            LogSource::Stdout,
            managed.logs.clone(),
            from,
        ));
        managed.add_tailer(spawn_tailer(
            managed.stderr_log.clone(),
            LogSource::Stderr,
            managed.logs.clone(),
            from,
        ));
    }

    fn spawn_watcher(&self, managed: &Arc<ManagedServer>) {
        let supervisor = self.clone();
        let managed = managed.clone();
        let watched = managed.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(LIVENESS_POLL_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !watched.is_alive() {
                    supervisor.prune_dead(&watched.path).await;
                    break;
                }
            }
        });
        managed.set_watcher(handle);
    }

    fn spawn_readiness(
        &self,
        managed: &Arc<ManagedServer>,
        sentinel: Option<String>,
        mut rx: tokio::sync::broadcast::Receiver<canopy_core::LogLine>,
    ) {
        let config = self.inner.readiness.clone().with_sentinel(sentinel);
        let store = self.inner.store.clone();
        let managed = managed.clone();
        let tracked = managed.clone();
        let handle = tokio::spawn(async move {
            let outcome = wait_ready(&config, &mut rx).await;
            if tracked.status() != ServerStatus::Starting {
                return;
            }
            match outcome {
                ReadinessOutcome::Ready => {
                    tracked.set_status(ServerStatus::Running);
                    if let Err(e) = store.set_server_status(&tracked.path, ServerStatus::Running) {
                        tracing::warn!(error = %e, "persisting running status failed");
                    }
                    tracing::info!(path = %tracked.path.display(), "dev server ready");
                }
                ReadinessOutcome::Failed { line } => {
                    tracked.set_status(ServerStatus::Error);
                    tracked.set_last_error(format!("startup failure: {line}"));
                    if let Err(e) = store.set_server_status(&tracked.path, ServerStatus::Error) {
                        tracing::warn!(error = %e, "persisting error status failed");
                    }
                    tracing::warn!(path = %tracked.path.display(), line = %line, "dev server failed to start");
                }
                ReadinessOutcome::TimedOut { elapsed } => {
                    tracked.set_status(ServerStatus::Error);
                    tracked
                        .set_last_error(format!("readiness timeout after {}s", elapsed.as_secs()));
                    if let Err(e) = store.set_server_status(&tracked.path, ServerStatus::Error) {
                        tracing::warn!(error = %e, "persisting error status failed");
                    }
                    tracing::warn!(
                        path = %tracked.path.display(),
                        elapsed_secs = elapsed.as_secs(),
                        "readiness not confirmed in time"
                    );
                }
            }
        });
        // Track with the tailers so stop/prune tears it down too.
        managed.add_tailer(handle);
    }
}

fn validate_target(path: &Path, spec: &LaunchSpec) -> Result<(), SupervisorError> {
    if !path.is_absolute() {
        return Err(SupervisorError::InvalidTarget(format!(
            "path must be absolute: {}",
            path.display()
        )));
    }
    if !path.is_dir() {
        return Err(SupervisorError::InvalidTarget(format!(
            "working directory does not exist: {}",
            path.display()
        )));
    }

    let launcher = Path::new(&spec.command)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    if matches!(launcher.as_str(), "npm" | "pnpm" | "yarn" | "bun")
        && !path.join("package.json").is_file()
    {
        return Err(SupervisorError::InvalidTarget(format!(
            "{} launch requires a package.json in {}",
            launcher,
            path.display()
        )));
    }
    Ok(())
}

/// Inherited PATH plus the places package managers actually install tools,
/// so children launched outside an interactive shell still find them.
fn augmented_path(workdir: &Path) -> String {
    let mut parts: Vec<PathBuf> = vec![workdir.join("node_modules").join(".bin")];

    if let Some(inherited) = std::env::var_os("PATH") {
        parts.extend(std::env::split_paths(&inherited));
    }

    if let Some(home) = dirs::home_dir() {
        parts.push(home.join(".local").join("bin"));
        parts.push(home.join(".bun").join("bin"));
        parts.push(home.join(".volta").join("bin"));
    }
    parts.push(PathBuf::from("/usr/local/bin"));
    parts.push(PathBuf::from("/opt/homebrew/bin"));

    let mut seen = HashSet::new();
    let deduped: Vec<PathBuf> = parts.into_iter().filter(|p| seen.insert(p.clone())).collect();
    std::env::join_paths(deduped)
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_else(|_| std::env::var("PATH").unwrap_or_default())
}

fn spawn_detached(
    workdir: &Path,
    spec: &LaunchSpec,
    host: Ipv4Addr,
    stdout_log: &Path,
    stderr_log: &Path,
) -> std::io::Result<std::process::Child> {
    if let Some(parent) = stdout_log.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let stdout = std::fs::File::create(stdout_log)?;
    let stderr = std::fs::File::create(stderr_log)?;

    let mut cmd = std::process::Command::new(&spec.command);
    cmd.args(&spec.args)
        .current_dir(workdir)
        .env("PATH", augmented_path(workdir))
        .env("HOST", host.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr));

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // Own process group and session-like isolation: the child must not
        // die with the daemon.
        cmd.process_group(0);
    }

    cmd.spawn()
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
