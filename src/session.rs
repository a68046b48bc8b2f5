use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::activity::ActivityTracker;
use crate::broker::Broker;
use crate::config::{BuffersConfig, KeepaliveConfig, LimitsConfig};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Validate a client-supplied session id: 1-128 chars of `[A-Za-z0-9_-]`.
pub fn validate_session_id(id: &str) -> Result<(), RegistryError> {
    if id.is_empty()
        || id.len() > 128
        || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(RegistryError::InvalidSessionId(
            id.chars().take(128).collect(),
        ));
    }
    Ok(())
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Connecting,
    Active,
    Inactive,
    Suspended,
    Error,
    Closed,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Suspended => "suspended",
            Self::Error => "error",
            Self::Closed => "closed",
        }
    }

    pub fn is_closed(self) -> bool {
        self == Self::Closed
    }

    /// `connecting -> active <-> inactive <-> suspended -> closed`, with
    /// `error` reachable from any non-terminal state.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) | (_, Error) => true,
            (Connecting, Active) | (Connecting, Inactive) => true,
            (Active, Inactive) | (Inactive, Active) => true,
            (Active, Suspended) | (Inactive, Suspended) => true,
            (Suspended, Active) | (Suspended, Inactive) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    #[default]
    Normal,
    Assistant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Requested,
    Evicted,
    KeepaliveExpired,
    SuspensionExpired,
    ProcessExited,
    MemoryPressure,
    SpawnFailed,
    Shutdown,
}

/// Public view of a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub project_id: String,
    pub user_id: Option<String>,
    pub status: SessionStatus,
    pub mode: SessionMode,
    pub focused: bool,
    pub tab_name: String,
    pub current_path: String,
    pub created_at: u64,
    pub updated_at: u64,
    pub ws_connected: bool,
    pub last_ping: Option<u64>,
    pub suspended_at: Option<u64>,
}

/// Process state captured when a session is suspended.
#[derive(Clone)]
pub struct ProcessSnapshot {
    pub working_dir: String,
    /// Output gate of the process. Held for as long as the suspension lasts.
    pub output: Broker,
}

struct SuspensionRecord {
    suspended_at: Instant,
    snapshot: Option<ProcessSnapshot>,
}

impl SuspensionRecord {
    /// Release held output to subscribers. Returns the replayed chunk count.
    fn release(&self) -> usize {
        self.snapshot
            .as_ref()
            .and_then(|s| s.output.release())
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    Created { info: SessionInfo },
    StatusChanged { id: String, project_id: String, status: SessionStatus },
    FocusChanged { project_id: String, focused: Vec<String> },
    /// A newer connection took over the session; bindings older than
    /// `epoch` must close.
    BindingReplaced { id: String, epoch: u64 },
    Suspended { project_id: String, sessions: Vec<String> },
    ProjectResumed { project_id: String, resumed: Vec<String>, expired: Vec<String> },
    Exited { id: String, project_id: String, code: Option<u32> },
    Closed { id: String, project_id: String, reason: CloseReason },
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("session creation paused for project {project}, retry in {}s", .retry_after.as_secs())]
    CircuitBreakerOpen { project: String, retry_after: Duration },
    #[error("too many sessions created for project {project}, creation paused")]
    CreationRateExceeded { project: String },
    #[error("session capacity exceeded")]
    CapacityExceeded,
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("invalid session transition from {from} to {to}")]
    InvalidTransition { from: SessionStatus, to: SessionStatus },
    #[error("session is closed: {0}")]
    SessionClosed(String),
    #[error("suspension expired for session {0}")]
    SuspensionExpired(String),
    #[error("invalid session id: {0}")]
    InvalidSessionId(String),
}

impl RegistryError {
    /// Stable machine-readable code shared by the HTTP and socket surfaces.
    pub fn code(&self) -> &'static str {
        match self {
            Self::CircuitBreakerOpen { .. } => "circuit_breaker_open",
            Self::CreationRateExceeded { .. } => "creation_rate_exceeded",
            Self::CapacityExceeded => "capacity_exceeded",
            Self::SessionNotFound(_) => "session_not_found",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::SessionClosed(_) => "session_closed",
            Self::SuspensionExpired(_) => "suspension_expired",
            Self::InvalidSessionId(_) => "invalid_session_id",
        }
    }
}

pub struct CreateRequest {
    pub project_id: String,
    pub user_id: Option<String>,
    pub path: String,
    pub mode: SessionMode,
}

#[derive(Debug)]
pub struct Created {
    pub info: SessionInfo,
    pub activity: ActivityTracker,
    /// Sessions closed to make room; their processes must be terminated.
    pub evicted: Vec<String>,
}

/// One session brought back from suspension.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumedSession {
    pub id: String,
    /// Working directory captured at suspend time.
    pub working_dir: String,
    /// Output chunks replayed to subscribers.
    pub buffered: usize,
    pub suspended_ms: u64,
}

/// Outcome of a project resume.
#[derive(Debug, Default)]
pub struct ResumeReport {
    pub resumed: Vec<ResumedSession>,
    pub expired: Vec<String>,
}

impl ResumeReport {
    pub fn resumed_ids(&self) -> Vec<String> {
        self.resumed.iter().map(|s| s.id.clone()).collect()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectStats {
    pub sessions: usize,
    pub focused: usize,
    pub breaker_open: bool,
    pub creations_in_window: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub live: usize,
    pub retained_closed: usize,
    pub by_status: BTreeMap<String, usize>,
    pub projects: BTreeMap<String, ProjectStats>,
}

struct Binding {
    epoch: u64,
}

struct Entry {
    info: SessionInfo,
    activity: ActivityTracker,
    seq: u64,
    binding: Option<Binding>,
    next_epoch: u64,
    reclaim_at: Option<Instant>,
    suspension: Option<SuspensionRecord>,
    closed_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self) -> bool {
        !self.info.status.is_closed()
    }

    fn set_status(&mut self, status: SessionStatus) {
        self.info.status = status;
        self.info.updated_at = now_ms();
    }

    /// Ranking key for eviction: least recently active first, then oldest.
    fn lru_key(&self) -> (Instant, u64) {
        (self.activity.last_activity(), self.seq)
    }
}

#[derive(Default)]
struct ProjectState {
    /// Focused session ids, in the order they gained focus.
    focused: Vec<String>,
    tab_counter: u64,
    creations: VecDeque<Instant>,
    breaker_until: Option<Instant>,
}

impl ProjectState {
    fn prune_window(&mut self, now: Instant, window: Duration) {
        while let Some(front) = self.creations.front() {
            if now.saturating_duration_since(*front) >= window {
                self.creations.pop_front();
            } else {
                break;
            }
        }
    }
}

struct RegistryInner {
    sessions: HashMap<String, Entry>,
    projects: HashMap<String, ProjectState>,
    next_seq: u64,
}

impl RegistryInner {
    fn live_in_project<'a>(&'a self, project: &'a str) -> impl Iterator<Item = (&'a String, &'a Entry)> + 'a {
        self.sessions
            .iter()
            .filter(move |(_, e)| e.is_live() && e.info.project_id == project)
    }

    fn live_count(&self) -> usize {
        self.sessions.values().filter(|e| e.is_live()).count()
    }

    fn lru_victim<'a>(entries: impl Iterator<Item = (&'a String, &'a Entry)>) -> Option<String> {
        entries
            .min_by_key(|(_, e)| e.lru_key())
            .map(|(id, _)| id.clone())
    }

    fn focused_list(&self, project: &str) -> Vec<String> {
        self.projects
            .get(project)
            .map(|p| p.focused.clone())
            .unwrap_or_default()
    }
}

/// Authoritative in-memory store of session metadata.
///
/// All registry state sits behind one `RwLock`; suspend and resume are
/// additionally serialized per project through a FIFO async mutex so that
/// concurrent requests for the same project apply in arrival order.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RwLock<RegistryInner>>,
    events_tx: broadcast::Sender<SessionEvent>,
    limits: Arc<LimitsConfig>,
    suspension_capacity: usize,
    suspension_max_age: Duration,
    queues: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl SessionRegistry {
    pub fn new(limits: LimitsConfig, buffers: &BuffersConfig, keepalive: &KeepaliveConfig) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(RwLock::new(RegistryInner {
                sessions: HashMap::new(),
                projects: HashMap::new(),
                next_seq: 0,
            })),
            events_tx,
            limits: Arc::new(limits),
            suspension_capacity: buffers.suspension_entries,
            suspension_max_age: keepalive.suspension_max_age(),
            queues: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Subscribe to session lifecycle events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }

    pub fn limits(&self) -> &LimitsConfig {
        &self.limits
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Create a session in `connecting` state.
    ///
    /// Rejects while the project's breaker is open, counts the attempt in the
    /// sliding creation window (tripping the breaker once the window holds
    /// more than the allowed number), then evicts least-recently-active
    /// sessions if the project or global cap is reached.
    pub fn create_session(&self, req: CreateRequest) -> Result<Created, RegistryError> {
        let now = Instant::now();
        let limits = &*self.limits;
        let mut guard = self.inner.write();
        let inner = &mut *guard;

        {
            let project = inner.projects.entry(req.project_id.clone()).or_default();
            if let Some(until) = project.breaker_until {
                if now < until {
                    return Err(RegistryError::CircuitBreakerOpen {
                        project: req.project_id,
                        retry_after: until - now,
                    });
                }
                tracing::info!(project = %req.project_id, "creation breaker reset");
                project.breaker_until = None;
                project.creations.clear();
            }

            project.prune_window(now, limits.creation_window());
            project.creations.push_back(now);
            if project.creations.len() > limits.max_creations_per_window {
                project.breaker_until = Some(now + limits.breaker_cooldown());
                tracing::warn!(
                    project = %req.project_id,
                    window_secs = limits.creation_window_secs,
                    cooldown_secs = limits.breaker_cooldown_secs,
                    "creation rate exceeded, breaker tripped"
                );
                return Err(RegistryError::CreationRateExceeded {
                    project: req.project_id,
                });
            }
        }

        let mut evicted = Vec::new();
        if inner.live_in_project(&req.project_id).count() >= limits.max_sessions_per_project {
            let victim = RegistryInner::lru_victim(inner.live_in_project(&req.project_id));
            if let Some(victim) = victim {
                tracing::info!(session = %victim, project = %req.project_id, "project at capacity, evicting");
                self.close_locked(inner, &victim, CloseReason::Evicted, now);
                evicted.push(victim);
            }
        }
        if inner.live_count() >= limits.max_total_sessions {
            let victim = RegistryInner::lru_victim(inner.sessions.iter().filter(|(_, e)| e.is_live()));
            if let Some(victim) = victim {
                tracing::info!(session = %victim, "global capacity reached, evicting");
                self.close_locked(inner, &victim, CloseReason::Evicted, now);
                evicted.push(victim);
            }
        }
        if inner.live_count() >= limits.max_total_sessions
            || inner.live_in_project(&req.project_id).count() >= limits.max_sessions_per_project
        {
            return Err(RegistryError::CapacityExceeded);
        }

        let id = uuid::Uuid::new_v4().to_string();
        let seq = inner.next_seq;
        inner.next_seq += 1;

        let project = inner.projects.entry(req.project_id.clone()).or_default();
        project.tab_counter += 1;
        let focused = project.focused.len() < limits.max_focused_per_project;
        if focused {
            project.focused.push(id.clone());
        }
        let focused_list = project.focused.clone();

        let ts = now_ms();
        let info = SessionInfo {
            id: id.clone(),
            project_id: req.project_id.clone(),
            user_id: req.user_id,
            status: SessionStatus::Connecting,
            mode: req.mode,
            focused,
            tab_name: format!("Terminal {}", project.tab_counter),
            current_path: req.path,
            created_at: ts,
            updated_at: ts,
            ws_connected: false,
            last_ping: None,
            suspended_at: None,
        };
        let activity = ActivityTracker::new();
        inner.sessions.insert(
            id.clone(),
            Entry {
                info: info.clone(),
                activity: activity.clone(),
                seq,
                binding: None,
                next_epoch: 1,
                reclaim_at: None,
                suspension: None,
                closed_at: None,
            },
        );
        drop(guard);

        tracing::info!(session = %id, project = %info.project_id, mode = ?info.mode, focused, "session created");
        self.emit(SessionEvent::Created { info: info.clone() });
        if focused {
            self.emit(SessionEvent::FocusChanged {
                project_id: info.project_id.clone(),
                focused: focused_list,
            });
        }
        Ok(Created {
            info,
            activity,
            evicted,
        })
    }

    /// Mark a session closed. Returns false if it was already closed.
    fn close_locked(&self, inner: &mut RegistryInner, id: &str, reason: CloseReason, now: Instant) -> bool {
        let Some(entry) = inner.sessions.get_mut(id) else {
            return false;
        };
        if !entry.is_live() {
            return false;
        }
        entry.set_status(SessionStatus::Closed);
        entry.info.focused = false;
        entry.info.ws_connected = false;
        entry.binding = None;
        entry.reclaim_at = None;
        if let Some(record) = entry.suspension.take() {
            record.release();
        }
        entry.closed_at = Some(now);
        let project_id = entry.info.project_id.clone();

        let mut focus_changed = None;
        if let Some(project) = inner.projects.get_mut(&project_id) {
            let before = project.focused.len();
            project.focused.retain(|f| f != id);
            if project.focused.len() != before {
                focus_changed = Some(project.focused.clone());
            }
        }
        tracing::info!(session = %id, project = %project_id, ?reason, "session closed");
        self.emit(SessionEvent::Closed {
            id: id.to_string(),
            project_id: project_id.clone(),
            reason,
        });
        if let Some(focused) = focus_changed {
            self.emit(SessionEvent::FocusChanged { project_id, focused });
        }
        true
    }

    /// Close a session. Idempotent: closing a closed session returns false.
    pub fn close(&self, id: &str, reason: CloseReason) -> Result<bool, RegistryError> {
        let mut guard = self.inner.write();
        if !guard.sessions.contains_key(id) {
            return Err(RegistryError::SessionNotFound(id.to_string()));
        }
        Ok(self.close_locked(&mut guard, id, reason, Instant::now()))
    }

    pub fn get(&self, id: &str) -> Option<SessionInfo> {
        self.inner.read().sessions.get(id).map(|e| e.info.clone())
    }

    pub fn is_live(&self, id: &str) -> bool {
        self.inner
            .read()
            .sessions
            .get(id)
            .map(|e| e.is_live())
            .unwrap_or(false)
    }

    pub fn activity(&self, id: &str) -> Option<ActivityTracker> {
        self.inner.read().sessions.get(id).map(|e| e.activity.clone())
    }

    /// Live sessions, optionally restricted to one project, in creation order.
    pub fn list(&self, project: Option<&str>) -> Vec<SessionInfo> {
        let inner = self.inner.read();
        let mut entries: Vec<&Entry> = inner
            .sessions
            .values()
            .filter(|e| e.is_live() && project.map_or(true, |p| e.info.project_id == p))
            .collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.info.clone()).collect()
    }

    pub fn live_count(&self) -> usize {
        self.inner.read().live_count()
    }

    /// The `n` oldest live sessions, by creation order.
    pub fn oldest_live(&self, n: usize) -> Vec<String> {
        let inner = self.inner.read();
        let mut live: Vec<(&String, u64)> = inner
            .sessions
            .iter()
            .filter(|(_, e)| e.is_live())
            .map(|(id, e)| (id, e.seq))
            .collect();
        live.sort_by_key(|(_, seq)| *seq);
        live.into_iter().take(n).map(|(id, _)| id.clone()).collect()
    }

    pub fn transition(&self, id: &str, next: SessionStatus) -> Result<(), RegistryError> {
        let mut guard = self.inner.write();
        let entry = guard
            .sessions
            .get_mut(id)
            .ok_or_else(|| RegistryError::SessionNotFound(id.to_string()))?;
        let from = entry.info.status;
        if from == next {
            return Ok(());
        }
        if !from.can_transition_to(next) {
            return Err(RegistryError::InvalidTransition { from, to: next });
        }
        if next == SessionStatus::Closed {
            self.close_locked(&mut guard, id, CloseReason::Requested, Instant::now());
            return Ok(());
        }
        entry.set_status(next);
        let project_id = entry.info.project_id.clone();
        drop(guard);
        tracing::debug!(session = %id, %from, to = %next, "session status changed");
        self.emit(SessionEvent::StatusChanged {
            id: id.to_string(),
            project_id,
            status: next,
        });
        Ok(())
    }

    /// Focus or unfocus a session. Focusing beyond the per-project cap
    /// first drops the least-recently-active focused session from the
    /// focused set. Returns the project's focused ids.
    pub fn set_focus(&self, id: &str, focused: bool) -> Result<Vec<String>, RegistryError> {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        let entry = inner
            .sessions
            .get(id)
            .ok_or_else(|| RegistryError::SessionNotFound(id.to_string()))?;
        if !entry.is_live() {
            return Err(RegistryError::SessionClosed(id.to_string()));
        }
        let project_id = entry.info.project_id.clone();
        let project = inner.projects.entry(project_id.clone()).or_default();
        let already = project.focused.iter().any(|f| f == id);

        let mut unfocused = None;
        if focused && !already {
            if project.focused.len() >= self.limits.max_focused_per_project {
                let sessions = &inner.sessions;
                let victim = project
                    .focused
                    .iter()
                    .filter_map(|f| sessions.get(f).map(|e| (f, e.lru_key())))
                    .min_by_key(|(_, key)| *key)
                    .map(|(f, _)| f.clone());
                if let Some(victim) = victim {
                    project.focused.retain(|f| *f != victim);
                    unfocused = Some(victim);
                }
            }
            project.focused.push(id.to_string());
        } else if !focused && already {
            project.focused.retain(|f| f != id);
        } else {
            return Ok(project.focused.clone());
        }
        let list = project.focused.clone();

        if let Some(victim) = &unfocused {
            if let Some(e) = inner.sessions.get_mut(victim) {
                e.info.focused = false;
                e.info.updated_at = now_ms();
            }
            tracing::debug!(session = %victim, project = %project_id, "focus cap reached, unfocusing");
        }
        if let Some(e) = inner.sessions.get_mut(id) {
            e.info.focused = focused;
            e.info.updated_at = now_ms();
            e.activity.touch();
        }
        drop(guard);

        self.emit(SessionEvent::FocusChanged {
            project_id,
            focused: list.clone(),
        });
        Ok(list)
    }

    pub fn is_focused(&self, id: &str) -> bool {
        self.inner
            .read()
            .sessions
            .get(id)
            .map(|e| e.info.focused)
            .unwrap_or(false)
    }

    pub fn focused(&self, project: &str) -> Vec<String> {
        self.inner.read().focused_list(project)
    }

    /// Attach a connection. Any previous binding is superseded; the returned
    /// epoch identifies this binding for a later [`unbind`](Self::unbind).
    pub fn bind(&self, id: &str) -> Result<u64, RegistryError> {
        let mut guard = self.inner.write();
        let entry = guard
            .sessions
            .get_mut(id)
            .ok_or_else(|| RegistryError::SessionNotFound(id.to_string()))?;
        if !entry.is_live() {
            return Err(RegistryError::SessionClosed(id.to_string()));
        }
        let epoch = entry.next_epoch;
        entry.next_epoch += 1;
        let replaced = entry.binding.replace(Binding { epoch }).is_some();
        entry.reclaim_at = None;
        entry.info.ws_connected = true;
        entry.info.last_ping = Some(now_ms());
        let status_change = match entry.info.status {
            SessionStatus::Connecting | SessionStatus::Inactive => {
                entry.set_status(SessionStatus::Active);
                Some(entry.info.project_id.clone())
            }
            _ => {
                entry.info.updated_at = now_ms();
                None
            }
        };
        entry.activity.touch();
        drop(guard);

        if replaced {
            tracing::info!(session = %id, epoch, "connection replaced");
            self.emit(SessionEvent::BindingReplaced {
                id: id.to_string(),
                epoch,
            });
        }
        if let Some(project_id) = status_change {
            self.emit(SessionEvent::StatusChanged {
                id: id.to_string(),
                project_id,
                status: SessionStatus::Active,
            });
        }
        Ok(epoch)
    }

    /// Drop the binding identified by `epoch` and start the keep-alive
    /// clock. Suspended sessions get no reclaim deadline; suspension expiry
    /// governs them. Returns the reclaim deadline, if one was set.
    pub fn unbind(&self, id: &str, epoch: u64, keepalive: Duration) -> Option<Instant> {
        let mut guard = self.inner.write();
        let entry = guard.sessions.get_mut(id)?;
        match &entry.binding {
            Some(b) if b.epoch == epoch => {}
            _ => return None,
        }
        entry.binding = None;
        entry.info.ws_connected = false;
        let mut became_inactive = false;
        if entry.info.status == SessionStatus::Active {
            entry.set_status(SessionStatus::Inactive);
            became_inactive = true;
        }
        let deadline = match entry.info.status {
            SessionStatus::Suspended | SessionStatus::Closed => None,
            _ => Some(Instant::now() + keepalive),
        };
        entry.reclaim_at = deadline;
        let project_id = entry.info.project_id.clone();
        drop(guard);

        if became_inactive {
            self.emit(SessionEvent::StatusChanged {
                id: id.to_string(),
                project_id,
                status: SessionStatus::Inactive,
            });
        }
        deadline
    }

    /// Set a reclaim deadline on an unbound session.
    pub fn set_reclaim(&self, id: &str, keepalive: Duration) -> Option<Instant> {
        let mut guard = self.inner.write();
        let entry = guard.sessions.get_mut(id)?;
        if !entry.is_live() || entry.binding.is_some() {
            return None;
        }
        let deadline = Instant::now() + keepalive;
        entry.reclaim_at = Some(deadline);
        Some(deadline)
    }

    pub fn binding_epoch(&self, id: &str) -> Option<u64> {
        self.inner
            .read()
            .sessions
            .get(id)
            .and_then(|e| e.binding.as_ref().map(|b| b.epoch))
    }

    pub fn ping(&self, id: &str) {
        if let Some(entry) = self.inner.write().sessions.get_mut(id) {
            entry.info.last_ping = Some(now_ms());
        }
    }

    pub fn update_path(&self, id: &str, path: &str) {
        let mut guard = self.inner.write();
        if let Some(entry) = guard.sessions.get_mut(id) {
            if entry.info.current_path != path {
                entry.info.current_path = path.to_string();
                entry.info.updated_at = now_ms();
            }
        }
    }

    fn project_queue(&self, project: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.queues
            .lock()
            .entry(project.to_string())
            .or_default()
            .clone()
    }

    /// Suspend every active or inactive session of a project. Sessions that
    /// are already suspended are left untouched. Returns newly suspended ids.
    ///
    /// Each snapshot's output gate is held from here until resume, so output
    /// produced meanwhile reaches subscribers as one replay.
    pub async fn suspend_project(
        &self,
        project: &str,
        mut snapshots: HashMap<String, ProcessSnapshot>,
    ) -> Vec<String> {
        let queue = self.project_queue(project);
        let _turn = queue.lock().await;

        let now = Instant::now();
        let mut suspended = Vec::new();
        {
            let mut guard = self.inner.write();
            for (id, entry) in guard.sessions.iter_mut() {
                if entry.info.project_id != project
                    || !matches!(
                        entry.info.status,
                        SessionStatus::Active | SessionStatus::Inactive
                    )
                {
                    continue;
                }
                let snapshot = snapshots.remove(id);
                if let Some(snapshot) = &snapshot {
                    snapshot.output.hold(self.suspension_capacity);
                }
                entry.suspension = Some(SuspensionRecord {
                    suspended_at: now,
                    snapshot,
                });
                entry.set_status(SessionStatus::Suspended);
                entry.info.suspended_at = Some(now_ms());
                entry.reclaim_at = None;
                suspended.push(id.clone());
            }
        }

        for id in &suspended {
            self.emit(SessionEvent::StatusChanged {
                id: id.clone(),
                project_id: project.to_string(),
                status: SessionStatus::Suspended,
            });
        }
        if !suspended.is_empty() {
            tracing::info!(project, count = suspended.len(), "project suspended");
            self.emit(SessionEvent::Suspended {
                project_id: project.to_string(),
                sessions: suspended.clone(),
            });
        }
        suspended
    }

    /// Resume every suspended session of a project, releasing the output
    /// each one held. Sessions suspended longer than the maximum age are
    /// closed instead and listed in `expired`. Unbound sessions become
    /// `inactive` with a reclaim deadline of `idle_keepalive`.
    pub async fn resume_project(&self, project: &str, idle_keepalive: Duration) -> ResumeReport {
        let queue = self.project_queue(project);
        let _turn = queue.lock().await;

        let now = Instant::now();
        let mut report = ResumeReport::default();
        {
            let mut guard = self.inner.write();
            let ids: Vec<String> = guard
                .sessions
                .iter()
                .filter(|(_, e)| {
                    e.info.project_id == project && e.info.status == SessionStatus::Suspended
                })
                .map(|(id, _)| id.clone())
                .collect();
            for id in ids {
                match self.resume_locked(&mut guard, &id, now, idle_keepalive) {
                    Ok(resumed) => report.resumed.push(resumed),
                    Err(_) => report.expired.push(id),
                }
            }
        }

        if !report.resumed.is_empty() || !report.expired.is_empty() {
            tracing::info!(
                project,
                resumed = report.resumed.len(),
                expired = report.expired.len(),
                "project resumed"
            );
            self.emit(SessionEvent::ProjectResumed {
                project_id: project.to_string(),
                resumed: report.resumed_ids(),
                expired: report.expired.clone(),
            });
        }
        report
    }

    /// Resume one session (used when a client reattaches to a suspended
    /// session). Returns `None` if the session was not suspended.
    pub async fn resume_session(
        &self,
        id: &str,
        idle_keepalive: Duration,
    ) -> Result<Option<ResumedSession>, RegistryError> {
        let project = self
            .get(id)
            .map(|i| i.project_id)
            .ok_or_else(|| RegistryError::SessionNotFound(id.to_string()))?;
        let queue = self.project_queue(&project);
        let _turn = queue.lock().await;

        let mut guard = self.inner.write();
        match guard.sessions.get(id).map(|e| e.info.status) {
            Some(SessionStatus::Suspended) => {}
            Some(_) => return Ok(None),
            None => return Err(RegistryError::SessionNotFound(id.to_string())),
        }
        let resumed = self.resume_locked(&mut guard, id, Instant::now(), idle_keepalive)?;
        Ok(Some(resumed))
    }

    fn resume_locked(
        &self,
        inner: &mut RegistryInner,
        id: &str,
        now: Instant,
        idle_keepalive: Duration,
    ) -> Result<ResumedSession, RegistryError> {
        let entry = inner
            .sessions
            .get_mut(id)
            .ok_or_else(|| RegistryError::SessionNotFound(id.to_string()))?;
        let Some(record) = entry.suspension.take() else {
            return Err(RegistryError::InvalidTransition {
                from: entry.info.status,
                to: SessionStatus::Active,
            });
        };
        if now.saturating_duration_since(record.suspended_at) > self.suspension_max_age {
            tracing::info!(session = %id, "suspension expired on resume");
            record.release();
            self.close_locked(inner, id, CloseReason::SuspensionExpired, now);
            return Err(RegistryError::SuspensionExpired(id.to_string()));
        }
        let next = if entry.binding.is_some() {
            SessionStatus::Active
        } else {
            entry.reclaim_at = Some(now + idle_keepalive);
            SessionStatus::Inactive
        };
        entry.set_status(next);
        entry.info.suspended_at = None;
        let resumed = ResumedSession {
            id: id.to_string(),
            working_dir: record
                .snapshot
                .as_ref()
                .map(|s| s.working_dir.clone())
                .unwrap_or_else(|| entry.info.current_path.clone()),
            buffered: record.release(),
            suspended_ms: now.saturating_duration_since(record.suspended_at).as_millis() as u64,
        };
        let project_id = entry.info.project_id.clone();
        self.emit(SessionEvent::StatusChanged {
            id: id.to_string(),
            project_id,
            status: next,
        });
        Ok(resumed)
    }

    /// Mark a session as errored (process could not be started).
    pub fn mark_error(&self, id: &str) {
        if let Err(e) = self.transition(id, SessionStatus::Error) {
            tracing::debug!(session = %id, error = %e, "could not mark session errored");
        }
    }

    /// Close the session if it is still unbound and its reclaim deadline has
    /// passed. Returns true if it was closed.
    pub fn reap_if_expired(&self, id: &str, now: Instant) -> bool {
        let mut guard = self.inner.write();
        let expired = guard.sessions.get(id).is_some_and(|e| {
            e.is_live() && e.binding.is_none() && e.reclaim_at.is_some_and(|at| at <= now)
        });
        expired && self.close_locked(&mut guard, id, CloseReason::KeepaliveExpired, now)
    }

    /// Unbound sessions whose keep-alive deadline has passed.
    pub fn expired_reclaims(&self, now: Instant) -> Vec<String> {
        self.inner
            .read()
            .sessions
            .iter()
            .filter(|(_, e)| {
                e.is_live() && e.binding.is_none() && e.reclaim_at.is_some_and(|at| at <= now)
            })
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Close sessions whose suspension exceeded the maximum age.
    pub fn close_expired_suspensions(&self, now: Instant) -> Vec<String> {
        let mut guard = self.inner.write();
        let expired: Vec<String> = guard
            .sessions
            .iter()
            .filter(|(_, e)| {
                e.suspension.as_ref().is_some_and(|r| {
                    now.saturating_duration_since(r.suspended_at) > self.suspension_max_age
                })
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            self.close_locked(&mut guard, id, CloseReason::SuspensionExpired, now);
        }
        expired
    }

    /// Drop closed sessions retained longer than the configured window.
    pub fn purge_closed(&self, now: Instant) -> usize {
        let retention = self.limits.closed_retention();
        let mut guard = self.inner.write();
        let before = guard.sessions.len();
        guard.sessions.retain(|_, e| {
            e.closed_at
                .map_or(true, |at| now.saturating_duration_since(at) < retention)
        });
        let sessions = &guard.sessions;
        let known_projects: std::collections::HashSet<&str> =
            sessions.values().map(|e| e.info.project_id.as_str()).collect();
        let stale: Vec<String> = guard
            .projects
            .iter()
            .filter(|(p, state)| {
                !known_projects.contains(p.as_str())
                    && state.creations.is_empty()
                    && state.breaker_until.is_none()
            })
            .map(|(p, _)| p.clone())
            .collect();
        let removed = before - guard.sessions.len();
        for p in stale {
            guard.projects.remove(&p);
        }
        removed
    }

    /// Clear expired breakers and prune creation windows.
    pub fn reset_breakers(&self, now: Instant) {
        let window = self.limits.creation_window();
        let mut guard = self.inner.write();
        for (project, state) in guard.projects.iter_mut() {
            if state.breaker_until.is_some_and(|until| now >= until) {
                tracing::info!(%project, "creation breaker reset");
                state.breaker_until = None;
                state.creations.clear();
            }
            state.prune_window(now, window);
        }
    }

    /// Enforce every cap, evicting least-recently-active sessions where a
    /// set is over its limit. Returns the closed ids.
    pub fn reconcile_capacity(&self) -> Vec<String> {
        let now = Instant::now();
        let limits = &*self.limits;
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        let mut evicted = Vec::new();

        let projects: Vec<String> = inner.projects.keys().cloned().collect();
        for project in &projects {
            while inner.live_in_project(project).count() > limits.max_sessions_per_project {
                let Some(victim) = RegistryInner::lru_victim(inner.live_in_project(project)) else {
                    break;
                };
                self.close_locked(inner, &victim, CloseReason::Evicted, now);
                evicted.push(victim);
            }
        }
        while inner.live_count() > limits.max_total_sessions {
            let Some(victim) =
                RegistryInner::lru_victim(inner.sessions.iter().filter(|(_, e)| e.is_live()))
            else {
                break;
            };
            self.close_locked(inner, &victim, CloseReason::Evicted, now);
            evicted.push(victim);
        }

        let mut focus_events = Vec::new();
        for project in &projects {
            let Some(state) = inner.projects.get_mut(project) else { continue };
            let mut trimmed = false;
            while state.focused.len() > limits.max_focused_per_project {
                let sessions = &inner.sessions;
                let Some(victim) = state
                    .focused
                    .iter()
                    .filter_map(|f| sessions.get(f).map(|e| (f.clone(), e.lru_key())))
                    .min_by_key(|(_, key)| *key)
                    .map(|(f, _)| f)
                else {
                    break;
                };
                state.focused.retain(|f| *f != victim);
                if let Some(e) = inner.sessions.get_mut(&victim) {
                    e.info.focused = false;
                }
                trimmed = true;
            }
            if trimmed {
                focus_events.push((project.clone(), state.focused.clone()));
            }
        }
        drop(guard);

        for (project_id, focused) in focus_events {
            self.emit(SessionEvent::FocusChanged { project_id, focused });
        }
        if !evicted.is_empty() {
            tracing::warn!(count = evicted.len(), "capacity reconciliation evicted sessions");
        }
        evicted
    }

    /// Emit a process-exit notification.
    pub fn notify_exit(&self, id: &str, code: Option<u32>) {
        let project_id = match self.get(id) {
            Some(info) => info.project_id,
            None => return,
        };
        self.emit(SessionEvent::Exited {
            id: id.to_string(),
            project_id,
            code,
        });
    }

    /// Close every live session. Returns the closed ids.
    pub fn close_all(&self, reason: CloseReason) -> Vec<String> {
        let now = Instant::now();
        let mut guard = self.inner.write();
        let ids: Vec<String> = guard
            .sessions
            .iter()
            .filter(|(_, e)| e.is_live())
            .map(|(id, _)| id.clone())
            .collect();
        for id in &ids {
            self.close_locked(&mut guard, id, reason, now);
        }
        ids
    }


    pub fn stats(&self) -> RegistryStats {
        let now = Instant::now();
        let inner = self.inner.read();
        let mut by_status = BTreeMap::new();
        let mut projects: BTreeMap<String, ProjectStats> = BTreeMap::new();
        let mut live = 0;
        let mut retained_closed = 0;
        for e in inner.sessions.values() {
            *by_status.entry(e.info.status.as_str().to_string()).or_insert(0) += 1;
            if e.is_live() {
                live += 1;
                projects
                    .entry(e.info.project_id.clone())
                    .or_insert_with(|| ProjectStats {
                        sessions: 0,
                        focused: 0,
                        breaker_open: false,
                        creations_in_window: 0,
                    })
                    .sessions += 1;
            } else {
                retained_closed += 1;
            }
        }
        for (project, state) in &inner.projects {
            let entry = projects.entry(project.clone()).or_insert_with(|| ProjectStats {
                sessions: 0,
                focused: 0,
                breaker_open: false,
                creations_in_window: 0,
            });
            entry.focused = state.focused.len();
            entry.breaker_open = state.breaker_until.is_some_and(|u| now < u);
            entry.creations_in_window = state
                .creations
                .iter()
                .filter(|t| now.saturating_duration_since(**t) < self.limits.creation_window())
                .count();
        }
        RegistryStats {
            live,
            retained_closed,
            by_status,
            projects,
        }
    }
}
