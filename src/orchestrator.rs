//! Ties the session registry to live processes.
//!
//! The registry owns metadata and lifecycle; the orchestrator owns the
//! [`ProcessHandle`]s and makes sure every session the registry closes also
//! has its process terminated.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::audit::{AuditRecord, LoggingSink};
use crate::bridge::{scan_cwd, BridgeError, OpenRequest, ProcessBridge, ProcessHandle};
use crate::broker::Output;
use crate::config::Config;
use crate::protocol::{CtrlKey, DisconnectCause};
use crate::session::{
    validate_session_id, CloseReason, CreateRequest, ProcessSnapshot, RegistryError,
    RegistryStats, ResumeReport, SessionEvent, SessionInfo, SessionMode, SessionRegistry,
    SessionStatus,
};
use crate::shell::{ShellDiscovery, ShellError};

pub const DEFAULT_ROWS: u16 = 24;
pub const DEFAULT_COLS: u16 = 80;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    #[error("session {0} has no running process")]
    NoProcess(String),
}

impl OrchestratorError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Registry(e) => e.code(),
            Self::Bridge(BridgeError::Shell(ShellError::NoShellAvailable)) => "no_shell_available",
            Self::Bridge(BridgeError::Shell(ShellError::SpawnExhausted { .. })) => "spawn_failed",
            Self::Bridge(BridgeError::Pty(_)) => "pty_error",
            Self::Bridge(BridgeError::ProcessGone) | Self::NoProcess(_) => "process_gone",
            Self::Bridge(BridgeError::InvalidDimensions { .. }) => "invalid_dimensions",
            Self::Bridge(BridgeError::InvalidEnvKey(_)) => "invalid_env_key",
            Self::Bridge(BridgeError::AssistantUnavailable) => "assistant_unavailable",
        }
    }

    /// True when the shell could not be started at all.
    pub fn is_spawn_failure(&self) -> bool {
        matches!(self, Self::Bridge(BridgeError::Shell(_) | BridgeError::Pty(_)))
    }
}

/// Parameters for opening a session, from either the HTTP API or a socket.
#[derive(Debug, Clone, Default)]
pub struct SessionParams {
    pub project_id: String,
    pub user_id: Option<String>,
    pub path: Option<String>,
    pub mode: SessionMode,
    pub rows: Option<u16>,
    pub cols: Option<u16>,
    pub shell: Option<PathBuf>,
}

#[derive(Debug)]
pub enum AttachKind {
    /// A fresh session and process were created.
    New,
    /// Routine reconnect to a live session; carries the replay buffer.
    Reconnected { history: Vec<Bytes> },
    /// Reconnect that lifted a suspension. The output held while suspended
    /// arrives on `output` as a replay.
    Resumed { buffered: usize },
}

/// A connection's view of the session it is now bound to.
pub struct Attachment {
    pub info: SessionInfo,
    pub epoch: u64,
    pub kind: AttachKind,
    pub process: ProcessHandle,
    /// Output already published before `output` was subscribed, for `New`.
    pub initial: Vec<Bytes>,
    pub output: broadcast::Receiver<Output>,
}

#[derive(Debug, Default, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub reclaimed: Vec<String>,
    pub suspensions_expired: Vec<String>,
    pub errored: Vec<String>,
    pub evicted: Vec<String>,
    pub orphans: usize,
    pub purged: usize,
}

impl SweepReport {
    fn is_empty(&self) -> bool {
        self.reclaimed.is_empty()
            && self.suspensions_expired.is_empty()
            && self.errored.is_empty()
            && self.evicted.is_empty()
            && self.orphans == 0
            && self.purged == 0
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorStats {
    pub sessions: RegistryStats,
    pub processes: usize,
}

struct Inner {
    registry: SessionRegistry,
    bridge: ProcessBridge,
    processes: RwLock<HashMap<String, ProcessHandle>>,
    config: Arc<Config>,
    audit: Arc<dyn LoggingSink>,
    cancel: CancellationToken,
}

/// Central coordinator. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(config: Arc<Config>, shells: Arc<ShellDiscovery>, audit: Arc<dyn LoggingSink>) -> Self {
        let registry = SessionRegistry::new(config.limits.clone(), &config.buffers, &config.keepalive);
        let bridge = ProcessBridge::new(
            shells,
            config.buffers.clone(),
            config.env.files.clone(),
            config.shell.assistant_command.clone(),
        );
        Self {
            inner: Arc::new(Inner {
                registry,
                bridge,
                processes: RwLock::new(HashMap::new()),
                config,
                audit,
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn shells(&self) -> &ShellDiscovery {
        self.inner.bridge.shells()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.registry.subscribe_events()
    }

    pub fn process(&self, id: &str) -> Option<ProcessHandle> {
        self.inner.processes.read().get(id).cloned()
    }

    pub fn list(&self, project: Option<&str>) -> Vec<SessionInfo> {
        self.inner.registry.list(project)
    }

    pub fn get(&self, id: &str) -> Option<SessionInfo> {
        self.inner.registry.get(id)
    }

    pub fn stats(&self) -> OrchestratorStats {
        OrchestratorStats {
            sessions: self.inner.registry.stats(),
            processes: self.inner.processes.read().len(),
        }
    }

    /// Create a session with no connection attached. It stays alive for the
    /// intentional keep-alive window unless a client binds to it.
    pub async fn create(&self, params: SessionParams) -> Result<SessionInfo, OrchestratorError> {
        let info = self.spawn_session(params).await?;
        let registry = &self.inner.registry;
        registry.transition(&info.id, SessionStatus::Inactive)?;
        let keepalive = DisconnectCause::Intentional.keepalive(&self.inner.config.keepalive);
        if let Some(deadline) = registry.set_reclaim(&info.id, keepalive) {
            self.schedule_reap(info.id.clone(), deadline);
        }
        registry
            .get(&info.id)
            .ok_or_else(|| RegistryError::SessionNotFound(info.id.clone()).into())
    }

    /// Bind a connection to a session: reconnect to `session_id` if it is
    /// still live in the same project, otherwise create a new one.
    pub async fn attach(
        &self,
        session_id: Option<&str>,
        params: SessionParams,
    ) -> Result<Attachment, OrchestratorError> {
        let registry = &self.inner.registry;
        if let Some(id) = session_id {
            validate_session_id(id)?;
            let existing = registry
                .get(id)
                .filter(|info| !info.status.is_closed() && info.project_id == params.project_id);
            let process = self.process(id).filter(|p| p.is_alive());
            if let (Some(_), Some(process)) = (existing, process) {
                return self.reattach(id, process).await;
            }
            tracing::debug!(session = %id, "requested session is gone, creating a new one");
        }

        let info = self.spawn_session(params).await?;
        let process = self
            .process(&info.id)
            .ok_or_else(|| OrchestratorError::NoProcess(info.id.clone()))?;
        let epoch = registry.bind(&info.id)?;
        let (initial, output) = process.subscribe_with_history();
        let info = registry.get(&info.id).unwrap_or(info);
        Ok(Attachment {
            info,
            epoch,
            kind: AttachKind::New,
            process,
            initial,
            output,
        })
    }

    async fn reattach(&self, id: &str, process: ProcessHandle) -> Result<Attachment, OrchestratorError> {
        let registry = &self.inner.registry;
        let idle = self.idle_keepalive();
        // Subscribe before resuming so the released output lands on this
        // receiver, ahead of anything published after it.
        let pending = process.subscribe();
        let resumed = match registry.resume_session(id, idle).await {
            Ok(resumed) => resumed,
            Err(e) => {
                self.terminate_process(id);
                return Err(e.into());
            }
        };
        let epoch = registry.bind(id)?;
        let info = registry
            .get(id)
            .ok_or_else(|| RegistryError::SessionNotFound(id.to_string()))?;
        let (kind, initial, output) = match resumed {
            Some(resumed) => (
                AttachKind::Resumed {
                    buffered: resumed.buffered,
                },
                Vec::new(),
                pending,
            ),
            None => {
                drop(pending);
                let (history, output) = process.subscribe_with_history();
                (AttachKind::Reconnected { history }, Vec::new(), output)
            }
        };
        tracing::info!(session = %id, epoch, "connection reattached");
        Ok(Attachment {
            info,
            epoch,
            kind,
            process,
            initial,
            output,
        })
    }

    /// Register a session and start its process. The session is left in
    /// `connecting`.
    async fn spawn_session(&self, params: SessionParams) -> Result<SessionInfo, OrchestratorError> {
        let registry = &self.inner.registry;
        let working_dir = resolve_working_dir(params.path.as_deref());
        let created = registry.create_session(CreateRequest {
            project_id: params.project_id.clone(),
            user_id: params.user_id.clone(),
            path: working_dir.display().to_string(),
            mode: params.mode,
        })?;
        for victim in &created.evicted {
            self.finish(victim, CloseReason::Evicted);
        }

        let id = created.info.id.clone();
        let opened = self
            .inner
            .bridge
            .open(OpenRequest {
                session_id: id.clone(),
                working_dir,
                rows: params.rows.unwrap_or(DEFAULT_ROWS),
                cols: params.cols.unwrap_or(DEFAULT_COLS),
                mode: params.mode,
                preferred_shell: params.shell,
                extra_env: HashMap::new(),
                activity: created.activity,
            })
            .await;
        let process = match opened {
            Ok(process) => process,
            Err(e) => {
                tracing::error!(session = %id, error = %e, "failed to start process");
                registry.mark_error(&id);
                return Err(e.into());
            }
        };

        self.inner.audit.record(&AuditRecord::SessionOpened {
            session: &id,
            project: &params.project_id,
            user: params.user_id.as_deref(),
            shell: &process.shell().display_name(),
        });
        self.inner
            .processes
            .write()
            .insert(id.clone(), process.clone());
        tokio::spawn(self.clone().pump(id.clone(), process));
        Ok(created.info)
    }

    /// Follow a process's output for registry bookkeeping until it exits.
    async fn pump(self, id: String, process: ProcessHandle) {
        let mut output = process.subscribe();
        let mut exit = process.on_exit();
        loop {
            tokio::select! {
                item = output.recv() => match item {
                    Ok(item) => self.observe_output(&id, &item),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(session = %id, skipped = n, "output observer lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                changed = exit.changed() => {
                    if changed.is_err() || exit.borrow().is_some() {
                        break;
                    }
                }
                _ = self.inner.cancel.cancelled() => return,
            }
        }
        // A process that exits while suspended hands its held output over
        // ahead of the exit notification.
        process.broker().release();
        while let Ok(item) = output.try_recv() {
            self.observe_output(&id, &item);
        }
        let code = process.exit_info().and_then(|e| e.code);
        self.on_process_exit(&id, code);
    }

    fn observe_output(&self, id: &str, item: &Output) {
        let chunks = match item {
            Output::Data(chunk) => std::slice::from_ref(chunk),
            Output::Replay(chunks) => chunks.as_slice(),
        };
        let mut bytes = 0;
        for chunk in chunks {
            if let Some(path) = scan_cwd(chunk) {
                self.inner.registry.update_path(id, &path);
            }
            bytes += chunk.len();
        }
        self.inner.audit.record(&AuditRecord::Output { session: id, bytes });
    }

    fn on_process_exit(&self, id: &str, code: Option<u32>) {
        self.inner.processes.write().remove(id);
        let registry = &self.inner.registry;
        if !registry.is_live(id) {
            return;
        }
        tracing::info!(session = %id, ?code, "process exited");
        registry.notify_exit(id, code);
        if let Ok(true) = registry.close(id, CloseReason::ProcessExited) {
            self.audit_closed(id, CloseReason::ProcessExited);
        }
    }

    pub async fn write(&self, id: &str, data: Bytes) -> Result<(), OrchestratorError> {
        let len = data.len();
        self.live_process(id)?.write(data).await?;
        self.inner.audit.record(&AuditRecord::Input {
            session: id,
            bytes: len,
        });
        Ok(())
    }

    pub fn resize(&self, id: &str, rows: u16, cols: u16) -> Result<(), OrchestratorError> {
        Ok(self.live_process(id)?.resize(rows, cols)?)
    }

    pub async fn ctrl(&self, id: &str, key: CtrlKey) -> Result<(), OrchestratorError> {
        self.write(id, Bytes::from_static(key.as_bytes())).await
    }

    pub async fn export_env(&self, id: &str, key: &str, value: &str) -> Result<(), OrchestratorError> {
        Ok(self.live_process(id)?.export_env(key, value).await?)
    }

    pub fn focus(&self, id: &str, focused: bool) -> Result<Vec<String>, OrchestratorError> {
        Ok(self.inner.registry.set_focus(id, focused)?)
    }

    pub fn ping(&self, id: &str) {
        self.inner.registry.ping(id);
    }

    fn live_process(&self, id: &str) -> Result<ProcessHandle, OrchestratorError> {
        match self.process(id) {
            Some(p) => Ok(p),
            None if self.inner.registry.get(id).is_none() => {
                Err(RegistryError::SessionNotFound(id.to_string()).into())
            }
            None => Err(OrchestratorError::NoProcess(id.to_string())),
        }
    }

    /// Suspend every active or inactive session of a project, capturing
    /// each process's working directory and output gate.
    pub async fn suspend_project(&self, project: &str) -> Vec<String> {
        let snapshots: HashMap<String, ProcessSnapshot> = {
            let processes = self.inner.processes.read();
            self.inner
                .registry
                .list(Some(project))
                .into_iter()
                .filter_map(|info| {
                    let process = processes.get(&info.id)?;
                    Some((
                        info.id,
                        ProcessSnapshot {
                            working_dir: info.current_path,
                            output: process.broker().clone(),
                        },
                    ))
                })
                .collect()
        };
        self.inner.registry.suspend_project(project, snapshots).await
    }

    /// Resume a project's suspended sessions. Expired ones are closed and
    /// their processes terminated.
    pub async fn resume_project(&self, project: &str) -> ResumeReport {
        let report = self
            .inner
            .registry
            .resume_project(project, self.idle_keepalive())
            .await;
        for id in &report.expired {
            self.terminate_process(id);
            self.audit_closed(id, CloseReason::SuspensionExpired);
        }
        for resumed in &report.resumed {
            if self.inner.registry.binding_epoch(&resumed.id).is_none() {
                self.schedule_reap_for(&resumed.id);
            }
        }
        report
    }

    /// Close a session by request. Returns false if it was already closed.
    pub fn close(&self, id: &str, reason: CloseReason) -> Result<bool, OrchestratorError> {
        let closed = self.inner.registry.close(id, reason)?;
        self.terminate_process(id);
        if closed {
            self.audit_closed(id, reason);
        }
        Ok(closed)
    }

    /// Release a connection's binding. The process lives on for the
    /// keep-alive window chosen by `cause`, then is reclaimed unless a new
    /// connection binds first.
    pub fn detach(&self, id: &str, epoch: u64, cause: DisconnectCause) {
        let keepalive = cause.keepalive(&self.inner.config.keepalive);
        if let Some(deadline) = self.inner.registry.unbind(id, epoch, keepalive) {
            tracing::info!(session = %id, ?cause, keepalive_secs = keepalive.as_secs(), "connection detached");
            self.schedule_reap(id.to_string(), deadline);
        }
    }

    fn schedule_reap_for(&self, id: &str) {
        let deadline = Instant::now() + self.idle_keepalive();
        self.schedule_reap(id.to_string(), deadline);
    }

    fn schedule_reap(&self, id: String, deadline: Instant) {
        let this = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {}
                _ = this.inner.cancel.cancelled() => return,
            }
            if this.inner.registry.reap_if_expired(&id, Instant::now()) {
                tracing::info!(session = %id, "keep-alive expired, reclaiming");
                this.terminate_process(&id);
                this.audit_closed(&id, CloseReason::KeepaliveExpired);
            }
        });
    }

    /// Close the `n` oldest live sessions.
    pub fn close_oldest(&self, n: usize, reason: CloseReason) -> Vec<String> {
        let ids = self.inner.registry.oldest_live(n);
        ids.into_iter()
            .filter(|id| matches!(self.close(id, reason), Ok(true)))
            .collect()
    }

    pub fn close_all(&self, reason: CloseReason) -> Vec<String> {
        let ids = self.inner.registry.close_all(reason);
        for id in &ids {
            self.terminate_process(id);
            self.audit_closed(id, reason);
        }
        ids
    }

    /// One maintenance pass: reclaim expired keep-alives and suspensions,
    /// close errored sessions, kill orphaned processes, enforce caps, reset
    /// breakers and purge old closed sessions.
    pub fn sweep(&self) -> SweepReport {
        let registry = &self.inner.registry;
        let now = Instant::now();
        let mut report = SweepReport::default();

        for id in registry.expired_reclaims(now) {
            if registry.reap_if_expired(&id, now) {
                self.finish(&id, CloseReason::KeepaliveExpired);
                report.reclaimed.push(id);
            }
        }
        for id in registry.close_expired_suspensions(now) {
            self.finish(&id, CloseReason::SuspensionExpired);
            report.suspensions_expired.push(id);
        }
        for info in registry.list(None) {
            if info.status == SessionStatus::Error {
                if let Ok(true) = registry.close(&info.id, CloseReason::SpawnFailed) {
                    self.finish(&info.id, CloseReason::SpawnFailed);
                    report.errored.push(info.id);
                }
            }
        }
        let orphans: Vec<String> = self
            .inner
            .processes
            .read()
            .keys()
            .filter(|id| !registry.is_live(id))
            .cloned()
            .collect();
        for id in &orphans {
            tracing::warn!(session = %id, "terminating orphaned process");
            self.terminate_process(id);
        }
        report.orphans = orphans.len();
        for id in registry.reconcile_capacity() {
            self.finish(&id, CloseReason::Evicted);
            report.evicted.push(id);
        }
        registry.reset_breakers(now);
        report.purged = registry.purge_closed(now);

        if !report.is_empty() {
            tracing::info!(
                reclaimed = report.reclaimed.len(),
                suspensions_expired = report.suspensions_expired.len(),
                errored = report.errored.len(),
                evicted = report.evicted.len(),
                orphans = report.orphans,
                purged = report.purged,
                "sweep complete"
            );
        }
        report
    }

    pub async fn run_sweeper(self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep();
                }
                _ = cancel.cancelled() => break,
            }
        }
    }

    /// Close every session and stop background tasks.
    pub fn shutdown(&self) -> Vec<String> {
        let closed = self.close_all(CloseReason::Shutdown);
        self.inner.cancel.cancel();
        if !closed.is_empty() {
            tracing::info!(count = closed.len(), "closed sessions on shutdown");
        }
        closed
    }

    fn idle_keepalive(&self) -> Duration {
        DisconnectCause::Network.keepalive(&self.inner.config.keepalive)
    }

    /// Terminate the process of a session the registry already closed.
    fn finish(&self, id: &str, reason: CloseReason) {
        self.terminate_process(id);
        self.audit_closed(id, reason);
    }

    fn terminate_process(&self, id: &str) {
        let process = self.inner.processes.write().remove(id);
        if let Some(process) = process {
            process.terminate();
        }
    }

    fn audit_closed(&self, id: &str, reason: CloseReason) {
        let reason = serde_json::to_value(reason)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        self.inner.audit.record(&AuditRecord::SessionClosed {
            session: id,
            reason: &reason,
        });
    }
}

/// Use `path` as the working directory if it names an existing absolute
/// directory, otherwise fall back to the home directory.
pub fn resolve_working_dir(path: Option<&str>) -> PathBuf {
    if let Some(p) = path.map(Path::new) {
        if p.is_absolute() && p.is_dir() {
            return p.to_path_buf();
        }
        tracing::debug!(path = %p.display(), "invalid working directory, using home");
    }
    dirs::home_dir()
        .filter(|h| h.is_dir())
        .unwrap_or_else(|| PathBuf::from("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::NoopSink;
    use crate::config::ShellConfig;

    fn orchestrator_with(config: Config) -> Orchestrator {
        let shells = Arc::new(ShellDiscovery::new(ShellConfig {
            path: Some(PathBuf::from("/bin/sh")),
            ..config.shell.clone()
        }));
        Orchestrator::new(Arc::new(config), shells, Arc::new(NoopSink))
    }

    fn orchestrator() -> Orchestrator {
        orchestrator_with(Config::default())
    }

    fn params(project: &str) -> SessionParams {
        SessionParams {
            project_id: project.to_string(),
            path: Some("/tmp".to_string()),
            ..Default::default()
        }
    }

    fn text(item: &Output) -> String {
        match item {
            Output::Data(chunk) => String::from_utf8_lossy(chunk).into_owned(),
            Output::Replay(chunks) => crate::protocol::join_chunks(chunks),
        }
    }

    async fn read_until(rx: &mut broadcast::Receiver<Output>, needle: &str) -> String {
        let mut seen = String::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while !seen.contains(needle) {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Ok(item)) => seen.push_str(&text(&item)),
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => {}
                _ => panic!("did not see {needle:?}, got {seen:?}"),
            }
        }
        seen
    }

    #[test]
    fn invalid_paths_fall_back() {
        assert_eq!(resolve_working_dir(Some("/tmp")), PathBuf::from("/tmp"));
        let fallback = resolve_working_dir(Some("relative/dir"));
        assert!(fallback.is_absolute());
        assert_eq!(resolve_working_dir(Some("/definitely/not/here")), fallback);
        assert_eq!(resolve_working_dir(None), fallback);
    }

    #[test]
    fn error_codes() {
        let e: OrchestratorError = RegistryError::CapacityExceeded.into();
        assert_eq!(e.code(), "capacity_exceeded");
        let e: OrchestratorError = BridgeError::InvalidEnvKey("1x".into()).into();
        assert_eq!(e.code(), "invalid_env_key");
        assert!(!e.is_spawn_failure());
        let e: OrchestratorError = BridgeError::Shell(ShellError::NoShellAvailable).into();
        assert!(e.is_spawn_failure());
    }

    #[tokio::test]
    async fn attach_creates_and_echoes() {
        let orch = orchestrator();
        let mut att = orch.attach(None, params("p1")).await.unwrap();
        assert!(matches!(att.kind, AttachKind::New));
        assert_eq!(att.info.status, SessionStatus::Active);
        assert!(att.info.ws_connected);

        orch.write(&att.info.id, Bytes::from("echo marker123\n"))
            .await
            .unwrap();
        read_until(&mut att.output, "marker123").await;
        orch.shutdown();
    }

    #[tokio::test]
    async fn reattach_replays_history() {
        let orch = orchestrator();
        let mut att = orch.attach(None, params("p1")).await.unwrap();
        let id = att.info.id.clone();
        orch.write(&id, Bytes::from("echo before-drop\n")).await.unwrap();
        read_until(&mut att.output, "before-drop").await;

        orch.detach(&id, att.epoch, DisconnectCause::PageReload);
        assert_eq!(orch.get(&id).unwrap().status, SessionStatus::Inactive);

        let again = orch.attach(Some(&id), params("p1")).await.unwrap();
        assert_eq!(again.info.id, id);
        let AttachKind::Reconnected { history } = again.kind else {
            panic!("expected reconnect");
        };
        let text = crate::protocol::join_chunks(&history);
        assert!(text.contains("before-drop"));
        assert!(again.epoch > att.epoch);
        orch.shutdown();
    }

    #[tokio::test]
    async fn unknown_session_id_gets_a_new_session() {
        let orch = orchestrator();
        let att = orch.attach(Some("no-such-session"), params("p1")).await.unwrap();
        assert!(matches!(att.kind, AttachKind::New));
        assert_ne!(att.info.id, "no-such-session");
        orch.shutdown();
    }

    #[tokio::test]
    async fn malformed_session_id_is_rejected() {
        let orch = orchestrator();
        let err = orch
            .attach(Some("../etc/passwd"), params("p1"))
            .await
            .err()
            .unwrap();
        assert_eq!(err.code(), "invalid_session_id");
    }

    #[tokio::test]
    async fn session_in_other_project_is_not_reused() {
        let orch = orchestrator();
        let first = orch.attach(None, params("p1")).await.unwrap();
        let other = orch
            .attach(Some(&first.info.id), params("p2"))
            .await
            .unwrap();
        assert_ne!(other.info.id, first.info.id);
        orch.shutdown();
    }

    #[tokio::test]
    async fn create_leaves_session_inactive() {
        let orch = orchestrator();
        let info = orch.create(params("p1")).await.unwrap();
        assert_eq!(info.status, SessionStatus::Inactive);
        assert!(!info.ws_connected);
        assert!(orch.process(&info.id).is_some());
        orch.shutdown();
    }

    #[tokio::test]
    async fn close_terminates_process() {
        let orch = orchestrator();
        let info = orch.create(params("p1")).await.unwrap();
        let process = orch.process(&info.id).unwrap();
        let mut exit = process.on_exit();

        assert!(orch.close(&info.id, CloseReason::Requested).unwrap());
        assert!(!orch.close(&info.id, CloseReason::Requested).unwrap());
        assert!(orch.process(&info.id).is_none());
        tokio::time::timeout(Duration::from_secs(10), exit.wait_for(|e| e.is_some()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(orch.get(&info.id).unwrap().status, SessionStatus::Closed);
    }

    #[tokio::test]
    async fn process_exit_closes_session() {
        let orch = orchestrator();
        let mut events = orch.subscribe_events();
        let att = orch.attach(None, params("p1")).await.unwrap();
        let id = att.info.id.clone();
        orch.write(&id, Bytes::from("exit 3\n")).await.unwrap();

        let mut saw_exit = None;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            match tokio::time::timeout_at(deadline, events.recv()).await.unwrap() {
                Ok(SessionEvent::Exited { id: eid, code, .. }) if eid == id => saw_exit = Some(code),
                Ok(SessionEvent::Closed { id: cid, reason, .. }) if cid == id => {
                    assert_eq!(reason, CloseReason::ProcessExited);
                    break;
                }
                _ => {}
            }
        }
        assert_eq!(saw_exit, Some(Some(3)));
        assert!(orch.process(&id).is_none());
    }

    #[tokio::test]
    async fn suspend_buffers_output_until_resume() {
        let orch = orchestrator();
        let mut att = orch.attach(None, params("p1")).await.unwrap();
        let id = att.info.id.clone();

        let suspended = orch.suspend_project("p1").await;
        assert_eq!(suspended, vec![id.clone()]);
        assert_eq!(orch.get(&id).unwrap().status, SessionStatus::Suspended);

        orch.write(&id, Bytes::from("echo while-away\n")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        while let Ok(item) = att.output.try_recv() {
            assert!(!text(&item).contains("while-away"), "output leaked while suspended");
        }

        let report = orch.resume_project("p1").await;
        assert!(report.expired.is_empty());
        assert_eq!(report.resumed[0].id, id);
        assert!(report.resumed[0].buffered > 0);
        match att.output.recv().await.unwrap() {
            Output::Replay(chunks) => {
                assert!(crate::protocol::join_chunks(&chunks).contains("while-away"))
            }
            other => panic!("expected replay, got {other:?}"),
        }
        assert_eq!(orch.get(&id).unwrap().status, SessionStatus::Active);
        orch.shutdown();
    }

    #[tokio::test]
    async fn reattach_lifts_suspension() {
        let orch = orchestrator();
        let att = orch.attach(None, params("p1")).await.unwrap();
        let id = att.info.id.clone();
        orch.suspend_project("p1").await;
        orch.detach(&id, att.epoch, DisconnectCause::Network);

        let again = orch.attach(Some(&id), params("p1")).await.unwrap();
        assert!(matches!(again.kind, AttachKind::Resumed { .. }));
        assert_eq!(again.info.status, SessionStatus::Active);
        orch.shutdown();
    }

    #[tokio::test]
    async fn detach_reclaims_after_keepalive() {
        let mut config = Config::default();
        config.keepalive.network_secs = 1;
        let orch = orchestrator_with(config);
        let att = orch.attach(None, params("p1")).await.unwrap();
        let id = att.info.id.clone();

        orch.detach(&id, att.epoch, DisconnectCause::Network);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(orch.get(&id).unwrap().status, SessionStatus::Closed);
        assert!(orch.process(&id).is_none());
    }

    #[tokio::test]
    async fn stale_epoch_detach_is_ignored() {
        let orch = orchestrator();
        let first = orch.attach(None, params("p1")).await.unwrap();
        let id = first.info.id.clone();
        let second = orch.attach(Some(&id), params("p1")).await.unwrap();

        orch.detach(&id, first.epoch, DisconnectCause::Network);
        let info = orch.get(&id).unwrap();
        assert_eq!(info.status, SessionStatus::Active);
        assert_eq!(orch.registry().binding_epoch(&id), Some(second.epoch));
        orch.shutdown();
    }

    #[tokio::test]
    async fn close_oldest_closes_in_creation_order() {
        let orch = orchestrator();
        let a = orch.create(params("p1")).await.unwrap();
        let b = orch.create(params("p1")).await.unwrap();
        let c = orch.create(params("p1")).await.unwrap();

        let closed = orch.close_oldest(2, CloseReason::MemoryPressure);
        assert_eq!(closed, vec![a.id.clone(), b.id.clone()]);
        assert!(orch.registry().is_live(&c.id));
        orch.shutdown();
    }

    #[tokio::test]
    async fn sweep_closes_errored_sessions() {
        let mut config = Config::default();
        config.shell.assistant_command = None;
        let orch = orchestrator_with(config);
        let err = orch
            .create(SessionParams {
                mode: SessionMode::Assistant,
                ..params("p1")
            })
            .await
            .err()
            .unwrap();
        assert_eq!(err.code(), "assistant_unavailable");
        let errored = orch.list(Some("p1"));
        assert_eq!(errored.len(), 1);
        assert_eq!(errored[0].status, SessionStatus::Error);

        let report = orch.sweep();
        assert_eq!(report.errored, vec![errored[0].id.clone()]);
        assert!(orch.list(Some("p1")).is_empty());
    }

    #[tokio::test]
    async fn shutdown_closes_everything() {
        let orch = orchestrator();
        orch.create(params("p1")).await.unwrap();
        orch.create(params("p2")).await.unwrap();
        let closed = orch.shutdown();
        assert_eq!(closed.len(), 2);
        assert_eq!(orch.registry().live_count(), 0);
        assert_eq!(orch.stats().processes, 0);
    }
}
