use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use portable_pty::ChildKiller;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::activity::ActivityTracker;
use crate::broker::{Broker, Output};
use crate::config::BuffersConfig;
use crate::envfile;
use crate::pty::{Pty, PtyError};
use crate::session::SessionMode;
use crate::shell::{ShellDiscovery, ShellError, ShellInfo, SpawnOptions};

const INPUT_CHANNEL_CAPACITY: usize = 256;

/// Grace period for trailing output after the child has been reaped.
const EXIT_DRAIN_GRACE: Duration = Duration::from_millis(100);

/// Delay between SIGHUP and the SIGKILL escalation.
pub const KILL_ESCALATION: Duration = Duration::from_secs(3);

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error(transparent)]
    Shell(#[from] ShellError),
    #[error(transparent)]
    Pty(#[from] PtyError),
    #[error("process has exited")]
    ProcessGone,
    #[error("invalid terminal dimensions {rows}x{cols}")]
    InvalidDimensions { rows: u16, cols: u16 },
    #[error("invalid environment variable name: {0}")]
    InvalidEnvKey(String),
    #[error("assistant mode requires shell.assistant_command to be configured")]
    AssistantUnavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExitInfo {
    pub code: Option<u32>,
}

pub struct OpenRequest {
    pub session_id: String,
    pub working_dir: PathBuf,
    pub rows: u16,
    pub cols: u16,
    pub mode: SessionMode,
    pub preferred_shell: Option<PathBuf>,
    /// Applied after ambient and project env files.
    pub extra_env: HashMap<String, String>,
    pub activity: ActivityTracker,
}

/// Spawns PTY-backed shells and wires their I/O to a [`Broker`].
pub struct ProcessBridge {
    shells: Arc<ShellDiscovery>,
    buffers: BuffersConfig,
    env_files: Vec<String>,
    assistant_command: Option<String>,
}

impl ProcessBridge {
    pub fn new(
        shells: Arc<ShellDiscovery>,
        buffers: BuffersConfig,
        env_files: Vec<String>,
        assistant_command: Option<String>,
    ) -> Self {
        Self {
            shells,
            buffers,
            env_files,
            assistant_command,
        }
    }

    pub fn shells(&self) -> &ShellDiscovery {
        &self.shells
    }

    /// Spawn a shell for a session and start relaying its I/O.
    pub async fn open(&self, req: OpenRequest) -> Result<ProcessHandle, BridgeError> {
        validate_dims(req.rows, req.cols)?;
        let assistant = match req.mode {
            SessionMode::Assistant => Some(
                self.assistant_command
                    .clone()
                    .ok_or(BridgeError::AssistantUnavailable)?,
            ),
            SessionMode::Normal => None,
        };

        let project_env = envfile::load_project_env(&req.working_dir, &self.env_files);
        let mut env = envfile::merge_env(std::env::vars(), project_env);
        env.extend(req.extra_env);

        let spawned = self
            .shells
            .spawn_shell(SpawnOptions {
                preferred: req.preferred_shell,
                cwd: req.working_dir.clone(),
                env,
                rows: req.rows,
                cols: req.cols,
                read_chunk_bytes: self.buffers.read_chunk_bytes,
            })
            .await?;

        let mut pty = spawned.pty;
        let pid = pty.pid();
        let killer = pty.clone_killer();
        let child = pty.take_child()?;

        let exited = Arc::new(AtomicBool::new(false));
        let (wait_tx, wait_rx) = oneshot::channel::<ExitInfo>();
        let exited_clone = exited.clone();
        let session_for_wait = req.session_id.clone();
        tokio::task::spawn_blocking(move || {
            let mut child = child;
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| child.wait()));
            let info = match result {
                Ok(Ok(status)) => ExitInfo {
                    code: Some(status.exit_code()),
                },
                Ok(Err(e)) => {
                    tracing::error!(session = %session_for_wait, ?e, "error waiting for child");
                    ExitInfo { code: None }
                }
                Err(e) => {
                    tracing::error!("child exit monitor task panicked: {:?}", e);
                    ExitInfo { code: None }
                }
            };
            exited_clone.store(true, Ordering::Release);
            let _ = wait_tx.send(info);
        });

        let (input_tx, input_rx) = mpsc::channel::<Bytes>(INPUT_CHANNEL_CAPACITY);
        spawn_writer(spawned.writer, input_rx);

        let broker = Broker::new(self.buffers.recent_entries);
        let mut carry = Utf8Carry::default();
        for chunk in spawned.initial_output {
            if let Some(data) = carry.feed(&chunk) {
                broker.publish(data);
            }
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let cancel = CancellationToken::new();
        tokio::spawn(pump_output(
            spawned.output_rx,
            carry,
            broker.clone(),
            req.activity.clone(),
            wait_rx,
            exit_tx,
            cancel.clone(),
        ));

        let handle = ProcessHandle {
            inner: Arc::new(HandleInner {
                session_id: req.session_id,
                pid,
                shell: spawned.shell,
                working_dir: req.working_dir,
                input_tx,
                broker,
                pty: Mutex::new(pty),
                killer: Mutex::new(killer),
                exit_rx,
                exited,
                activity: req.activity,
                cancel,
            }),
        };

        if let Some(cmd) = assistant {
            handle.write(Bytes::from(format!("{cmd}\n"))).await?;
        }

        tracing::info!(
            session = %handle.session_id(),
            pid = ?pid,
            shell = %handle.shell().display_name(),
            cwd = %handle.working_dir().display(),
            "process opened"
        );
        Ok(handle)
    }
}

/// The live OS process bound to a session. Cloning shares the process.
#[derive(Clone)]
pub struct ProcessHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    session_id: String,
    pid: Option<u32>,
    shell: ShellInfo,
    working_dir: PathBuf,
    input_tx: mpsc::Sender<Bytes>,
    broker: Broker,
    pty: Mutex<Pty>,
    killer: Mutex<Option<Box<dyn ChildKiller + Send + Sync>>>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
    exited: Arc<AtomicBool>,
    activity: ActivityTracker,
    cancel: CancellationToken,
}

impl ProcessHandle {
    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner.pid
    }

    pub fn shell(&self) -> &ShellInfo {
        &self.inner.shell
    }

    pub fn working_dir(&self) -> &std::path::Path {
        &self.inner.working_dir
    }

    pub fn is_alive(&self) -> bool {
        !self.inner.exited.load(Ordering::Acquire) && self.inner.exit_rx.borrow().is_none()
    }

    pub async fn write(&self, data: Bytes) -> Result<(), BridgeError> {
        if !self.is_alive() {
            return Err(BridgeError::ProcessGone);
        }
        self.inner
            .input_tx
            .send(data)
            .await
            .map_err(|_| BridgeError::ProcessGone)?;
        self.inner.activity.touch();
        Ok(())
    }

    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), BridgeError> {
        validate_dims(rows, cols)?;
        self.inner.pty.lock().resize(rows, cols)?;
        Ok(())
    }

    /// Export a variable into the running shell using its own syntax.
    pub async fn export_env(&self, key: &str, value: &str) -> Result<(), BridgeError> {
        if !is_valid_env_key(key) {
            return Err(BridgeError::InvalidEnvKey(key.to_string()));
        }
        let line = self.inner.shell.kind.export_line(key, value);
        self.write(Bytes::from(line)).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Output> {
        self.inner.broker.subscribe()
    }

    pub fn subscribe_with_history(&self) -> (Vec<Bytes>, broadcast::Receiver<Output>) {
        self.inner.broker.subscribe_with_history()
    }

    /// The output fan-out, for holding output while suspended.
    pub fn broker(&self) -> &Broker {
        &self.inner.broker
    }

    /// Resolves to `Some` once the child has exited and its output drained.
    pub fn on_exit(&self) -> watch::Receiver<Option<ExitInfo>> {
        self.inner.exit_rx.clone()
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        *self.inner.exit_rx.borrow()
    }

    /// SIGHUP the process group, escalating to SIGKILL if it survives.
    pub fn terminate(&self) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        self.inner.cancel.cancel();
        if self.inner.exited.load(Ordering::Acquire) {
            return;
        }
        if !self.signal_group(Signal::Hangup) {
            self.kill_via_handle();
            return;
        }
        let handle = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(KILL_ESCALATION).await;
            if !handle.inner.exited.load(Ordering::Acquire) {
                tracing::warn!(session = %handle.session_id(), "process ignored SIGHUP, sending SIGKILL");
                if !handle.signal_group(Signal::Kill) {
                    handle.kill_via_handle();
                }
            }
        });
    }

    fn kill_via_handle(&self) {
        if let Some(killer) = self.inner.killer.lock().as_mut() {
            if let Err(e) = killer.kill() {
                tracing::debug!(session = %self.session_id(), ?e, "kill failed");
            }
        }
    }

    /// Signal the child's process group. Returns false when no signal could
    /// be delivered this way.
    ///
    /// portable_pty calls setsid() when spawning, so the child leads its own
    /// process group and the negative PID reaches anything it forked.
    #[cfg(unix)]
    fn signal_group(&self, signal: Signal) -> bool {
        let Some(pid) = self.inner.pid else {
            return false;
        };
        if pid == 0 || pid > i32::MAX as u32 {
            tracing::warn!(pid, "PID is 0 or exceeds i32::MAX, cannot send signal");
            return false;
        }
        if self.inner.exited.load(Ordering::Acquire) {
            tracing::debug!(pid, "child already exited, skipping signal");
            return true;
        }
        let sig = match signal {
            Signal::Hangup => libc::SIGHUP,
            Signal::Kill => libc::SIGKILL,
        };
        unsafe {
            libc::kill(-(pid as i32), sig);
        }
        true
    }

    #[cfg(not(unix))]
    fn signal_group(&self, _signal: Signal) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Hangup,
    Kill,
}

fn validate_dims(rows: u16, cols: u16) -> Result<(), BridgeError> {
    if rows == 0 || cols == 0 {
        return Err(BridgeError::InvalidDimensions { rows, cols });
    }
    Ok(())
}

/// `[A-Za-z_][A-Za-z0-9_]*`
pub fn is_valid_env_key(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn spawn_writer(writer: Box<dyn std::io::Write + Send>, input_rx: mpsc::Receiver<Bytes>) {
    tokio::task::spawn_blocking(move || {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            use std::io::Write;
            let mut writer = writer;
            let mut rx = input_rx;
            while let Some(data) = rx.blocking_recv() {
                if writer.write_all(&data).is_err() {
                    break;
                }
                let _ = writer.flush();
            }
        }));
        if let Err(e) = result {
            tracing::error!("PTY writer task panicked: {:?}", e);
        }
    });
}

async fn pump_output(
    mut output_rx: mpsc::Receiver<Bytes>,
    mut carry: Utf8Carry,
    broker: Broker,
    activity: ActivityTracker,
    mut wait_rx: oneshot::Receiver<ExitInfo>,
    exit_tx: watch::Sender<Option<ExitInfo>>,
    cancel: CancellationToken,
) {
    let publish = |data: Option<Bytes>| {
        if let Some(data) = data {
            broker.publish(data);
            activity.touch();
        }
    };

    let mut exit: Option<ExitInfo> = None;
    loop {
        tokio::select! {
            biased;
            chunk = output_rx.recv() => match chunk {
                Some(chunk) => publish(carry.feed(&chunk)),
                None => break,
            },
            res = &mut wait_rx, if exit.is_none() => {
                exit = Some(res.unwrap_or(ExitInfo { code: None }));
                while let Ok(Some(chunk)) =
                    tokio::time::timeout(EXIT_DRAIN_GRACE, output_rx.recv()).await
                {
                    publish(carry.feed(&chunk));
                }
                break;
            }
            _ = cancel.cancelled() => break,
        }
    }
    publish(carry.flush());

    let info = match exit {
        Some(info) => info,
        None => wait_rx.await.unwrap_or(ExitInfo { code: None }),
    };
    exit_tx.send_replace(Some(info));
}

/// Holds back a trailing partial UTF-8 sequence so chunks never split a
/// character.
#[derive(Default)]
struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    fn feed(&mut self, chunk: &[u8]) -> Option<Bytes> {
        let mut buf = std::mem::take(&mut self.pending);
        buf.extend_from_slice(chunk);
        let cut = complete_prefix_len(&buf);
        self.pending = buf.split_off(cut);
        (!buf.is_empty()).then(|| Bytes::from(buf))
    }

    fn flush(&mut self) -> Option<Bytes> {
        let rest = std::mem::take(&mut self.pending);
        (!rest.is_empty()).then(|| Bytes::from(rest))
    }
}

fn complete_prefix_len(buf: &[u8]) -> usize {
    let len = buf.len();
    for back in 1..=len.min(3) {
        let b = buf[len - back];
        if b & 0xC0 == 0x80 {
            continue;
        }
        let need = match b {
            0xF0..=0xFF => 4,
            0xE0..=0xEF => 3,
            0xC0..=0xDF => 2,
            _ => 1,
        };
        return if need > back { len - back } else { len };
    }
    len
}

/// Extract the working directory from the last OSC 7 sequence in `chunk`
/// (`ESC ] 7 ; file://host/path` terminated by BEL or ST).
pub fn scan_cwd(chunk: &[u8]) -> Option<String> {
    const OSC7: &[u8] = b"\x1b]7;";
    let start = chunk
        .windows(OSC7.len())
        .rposition(|w| w == OSC7)?
        + OSC7.len();
    let rest = &chunk[start..];
    let end = rest
        .iter()
        .position(|&b| b == 0x07 || b == 0x1b)?;
    let uri = std::str::from_utf8(&rest[..end]).ok()?;
    let after_scheme = uri.strip_prefix("file://")?;
    let path = &after_scheme[after_scheme.find('/')?..];
    percent_decode(path)
}

fn percent_decode(s: &str) -> Option<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok()?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}
