//! Shell discovery and spawning.
//!
//! [`ShellDiscovery`] probes an ordered, platform-specific list of shell
//! candidates once and caches every shell that answered. [`spawn_shell`]
//! then walks that list (preferred shell first) until one spawns inside a
//! PTY and echoes something back within the liveness timeout.
//!
//! [`spawn_shell`]: ShellDiscovery::spawn_shell

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use bytes::Bytes;
use portable_pty::CommandBuilder;
use serde::Serialize;
use tokio::sync::{mpsc, OnceCell};

use crate::config::ShellConfig;
use crate::pty::Pty;

/// Capacity of the per-shell output channel. Each message is one PTY read
/// (at most `read_chunk_bytes`), so the reader blocks once this many chunks
/// are waiting.
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

const PROBE_MARKER: &str = "termgate-probe";

#[cfg(unix)]
const DEFAULT_CANDIDATES: &[&str] = &[
    "/bin/bash",
    "/usr/bin/bash",
    "/bin/zsh",
    "/usr/bin/zsh",
    "/usr/bin/fish",
    "/bin/sh",
    "/bin/dash",
    "/bin/ksh",
];

#[cfg(windows)]
const DEFAULT_CANDIDATES: &[&str] = &["pwsh.exe", "powershell.exe", "cmd.exe"];

#[cfg(unix)]
const EMERGENCY_NAMES: &[&str] = &["bash", "zsh", "sh", "dash", "ksh", "fish"];

#[cfg(windows)]
const EMERGENCY_NAMES: &[&str] = &["pwsh", "powershell", "cmd"];

#[derive(Debug, thiserror::Error)]
pub enum ShellError {
    #[error("no usable shell found on this host")]
    NoShellAvailable,
    #[error("failed to spawn a shell (tried: {}): {last_error}", .tried.join(", "))]
    SpawnExhausted {
        tried: Vec<String>,
        last_error: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ShellKind {
    Bash,
    Zsh,
    Fish,
    Sh,
    Dash,
    Ksh,
    PowerShell,
    Cmd,
    Other,
}

impl ShellKind {
    pub fn from_path(path: &Path) -> Self {
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        match stem.as_str() {
            "bash" => Self::Bash,
            "zsh" => Self::Zsh,
            "fish" => Self::Fish,
            "sh" => Self::Sh,
            "dash" => Self::Dash,
            "ksh" | "mksh" => Self::Ksh,
            "pwsh" | "powershell" => Self::PowerShell,
            "cmd" => Self::Cmd,
            _ => Self::Other,
        }
    }

    /// Arguments that start the shell as an interactive login shell.
    pub fn login_args(self) -> &'static [&'static str] {
        match self {
            Self::Bash | Self::Zsh | Self::Fish | Self::Ksh => &["-l"],
            Self::Sh | Self::Dash => &["-i"],
            Self::PowerShell => &["-NoLogo"],
            Self::Cmd | Self::Other => &[],
        }
    }

    fn probe_args(self) -> Vec<String> {
        match self {
            Self::PowerShell => vec![
                "-NoProfile".into(),
                "-NonInteractive".into(),
                "-Command".into(),
                format!("Write-Output '{PROBE_MARKER} \u{2713}'"),
            ],
            Self::Cmd => vec!["/C".into(), format!("echo {PROBE_MARKER}")],
            _ => vec![
                "-c".into(),
                format!("echo '{PROBE_MARKER} \u{2713}'; tput colors 2>/dev/null"),
            ],
        }
    }

    /// A no-op command that makes the shell produce output.
    pub fn sentinel(self) -> &'static str {
        match self {
            // Leading space keeps it out of history.
            Self::PowerShell => "$null\r\n",
            Self::Cmd => "rem\r\n",
            _ => " true\n",
        }
    }

    /// Line that exports `key=value` into a running shell.
    pub fn export_line(self, key: &str, value: &str) -> String {
        match self {
            Self::Fish => {
                let escaped = value.replace('\\', "\\\\").replace('\'', "\\'");
                format!(" set -gx {key} '{escaped}'\n")
            }
            Self::PowerShell => {
                let escaped = value.replace('\'', "''");
                format!("$env:{key} = '{escaped}'\r\n")
            }
            Self::Cmd => format!("set \"{key}={value}\"\r\n"),
            _ => {
                let escaped = value.replace('\'', "'\\''");
                format!(" export {key}='{escaped}'\n")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShellCapabilities {
    pub interactive: bool,
    pub color: bool,
    pub unicode: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShellInfo {
    pub path: PathBuf,
    pub kind: ShellKind,
    pub capabilities: ShellCapabilities,
}

impl ShellInfo {
    pub fn display_name(&self) -> String {
        self.path.display().to_string()
    }
}

pub struct SpawnOptions {
    pub preferred: Option<PathBuf>,
    pub cwd: PathBuf,
    /// Complete environment for the child; nothing is inherited implicitly.
    pub env: HashMap<String, String>,
    pub rows: u16,
    pub cols: u16,
    pub read_chunk_bytes: usize,
}

/// A shell that spawned and answered the liveness check.
pub struct SpawnedShell {
    pub pty: Pty,
    pub writer: Box<dyn Write + Send>,
    /// Output chunks from the PTY reader thread, after `initial_output`.
    pub output_rx: mpsc::Receiver<Bytes>,
    pub shell: ShellInfo,
    /// Output consumed while checking liveness.
    pub initial_output: Vec<Bytes>,
}

pub struct ShellDiscovery {
    config: ShellConfig,
    available: OnceCell<Vec<ShellInfo>>,
}

impl ShellDiscovery {
    pub fn new(config: ShellConfig) -> Self {
        Self {
            config,
            available: OnceCell::new(),
        }
    }

    /// Ordered, de-duplicated candidate list: configured override, the
    /// environment-declared default shell, then the fixed list.
    pub fn candidates(&self) -> Vec<PathBuf> {
        let mut out: Vec<PathBuf> = Vec::new();
        let mut push = |p: PathBuf| {
            if !p.as_os_str().is_empty() && !out.contains(&p) {
                out.push(p);
            }
        };
        if let Some(p) = &self.config.path {
            push(p.clone());
        }
        #[cfg(unix)]
        let declared = std::env::var_os("SHELL");
        #[cfg(windows)]
        let declared = std::env::var_os("COMSPEC");
        if let Some(p) = declared {
            push(PathBuf::from(p));
        }
        if self.config.candidates.is_empty() {
            for p in DEFAULT_CANDIDATES {
                push(PathBuf::from(p));
            }
        } else {
            for p in &self.config.candidates {
                push(p.clone());
            }
        }
        out
    }

    /// Every shell that passed its probe, in preference order. Probing runs
    /// once; an empty result is not cached so a later call can retry.
    pub async fn available(&self) -> Result<&[ShellInfo], ShellError> {
        self.available
            .get_or_try_init(|| async {
                let found = self.discover().await;
                if found.is_empty() {
                    Err(ShellError::NoShellAvailable)
                } else {
                    Ok(found)
                }
            })
            .await
            .map(Vec::as_slice)
    }

    /// The first confirmed-working shell.
    pub async fn resolve_shell(&self) -> Result<ShellInfo, ShellError> {
        self.available()
            .await?
            .first()
            .cloned()
            .ok_or(ShellError::NoShellAvailable)
    }

    async fn discover(&self) -> Vec<ShellInfo> {
        let mut found = Vec::new();
        let mut tried = Vec::new();
        for candidate in self.candidates() {
            tried.push(candidate.clone());
            match self.probe(&candidate).await {
                Ok(info) => found.push(info),
                Err(reason) => {
                    tracing::debug!(shell = %candidate.display(), %reason, "shell candidate rejected")
                }
            }
        }
        if found.is_empty() {
            tracing::warn!("no configured shell candidate works, searching PATH");
            for name in EMERGENCY_NAMES {
                let Ok(path) = which::which(name) else { continue };
                if tried.contains(&path) {
                    continue;
                }
                tried.push(path.clone());
                if let Ok(info) = self.probe(&path).await {
                    found.push(info);
                }
            }
        }
        tracing::info!(
            shells = ?found.iter().map(|s| s.display_name()).collect::<Vec<_>>(),
            "shell discovery complete"
        );
        found
    }

    /// Check that `path` exists and runs a trivial command within the probe
    /// timeout, recording its capabilities.
    pub async fn probe(&self, path: &Path) -> Result<ShellInfo, String> {
        let resolved = locate(path).ok_or_else(|| "not found".to_string())?;
        let kind = ShellKind::from_path(&resolved);

        let mut cmd = tokio::process::Command::new(&resolved);
        cmd.args(kind.probe_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .env("TERM", "xterm-256color")
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.config.probe_timeout(), cmd.output())
            .await
            .map_err(|_| "probe timed out".to_string())?
            .map_err(|e| format!("probe failed to run: {e}"))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.contains(PROBE_MARKER) {
            return Err(format!("unexpected probe output (status {})", output.status));
        }
        let colors = stdout
            .lines()
            .filter_map(|l| l.trim().parse::<u32>().ok())
            .next();
        let capabilities = ShellCapabilities {
            interactive: kind != ShellKind::Other,
            color: colors.map(|n| n >= 8).unwrap_or(kind != ShellKind::Cmd),
            unicode: stdout.contains('\u{2713}'),
        };
        Ok(ShellInfo {
            path: resolved,
            kind,
            capabilities,
        })
    }

    /// Spawn the preferred shell, falling back through every other available
    /// shell until one responds to the sentinel.
    pub async fn spawn_shell(&self, opts: SpawnOptions) -> Result<SpawnedShell, ShellError> {
        let available = self.available().await?;

        let mut order: Vec<ShellInfo> = Vec::with_capacity(available.len() + 1);
        if let Some(pref) = &opts.preferred {
            match available.iter().find(|s| &s.path == pref) {
                Some(info) => order.push(info.clone()),
                None => order.push(ShellInfo {
                    path: pref.clone(),
                    kind: ShellKind::from_path(pref),
                    capabilities: ShellCapabilities::default(),
                }),
            }
        }
        for info in available {
            if !order.iter().any(|s| s.path == info.path) {
                order.push(info.clone());
            }
        }

        let mut tried = Vec::new();
        let mut last_error = String::from("no shell attempted");
        for shell in order {
            tried.push(shell.display_name());
            match self.try_spawn(&shell, &opts).await {
                Ok(spawned) => return Ok(spawned),
                Err(e) => {
                    tracing::warn!(shell = %shell.display_name(), error = %e, "shell spawn attempt failed");
                    last_error = e;
                }
            }
        }
        Err(ShellError::SpawnExhausted { tried, last_error })
    }

    async fn try_spawn(&self, shell: &ShellInfo, opts: &SpawnOptions) -> Result<SpawnedShell, String> {
        let mut cmd = CommandBuilder::new(&shell.path);
        cmd.args(shell.kind.login_args());
        cmd.cwd(&opts.cwd);
        cmd.env_clear();
        for (k, v) in prepare_env(shell, &opts.env) {
            cmd.env(k, v);
        }

        let (rows, cols) = (opts.rows, opts.cols);
        let pty = tokio::task::spawn_blocking(move || Pty::spawn(rows, cols, cmd))
            .await
            .map_err(|e| format!("spawn task failed: {e}"))?
            .map_err(|e| e.to_string())?;

        let reader = pty.take_reader().map_err(|e| e.to_string())?;
        let mut writer = pty.take_writer().map_err(|e| e.to_string())?;
        let mut output_rx = spawn_reader(reader, opts.read_chunk_bytes);

        let live: Result<Bytes, String> = async {
            writer
                .write_all(shell.kind.sentinel().as_bytes())
                .and_then(|_| writer.flush())
                .map_err(|e| format!("sentinel write failed: {e}"))?;
            match tokio::time::timeout(self.config.liveness_timeout(), output_rx.recv()).await {
                Ok(Some(chunk)) => Ok(chunk),
                Ok(None) => Err("shell exited before responding".to_string()),
                Err(_) => Err("shell did not respond within liveness timeout".to_string()),
            }
        }
        .await;

        match live {
            Ok(first) => {
                tracing::debug!(shell = %shell.display_name(), pid = ?pty.pid(), "shell is live");
                Ok(SpawnedShell {
                    pty,
                    writer,
                    output_rx,
                    shell: shell.clone(),
                    initial_output: vec![first],
                })
            }
            Err(e) => {
                if let Some(mut killer) = pty.clone_killer() {
                    let _ = killer.kill();
                }
                Err(e)
            }
        }
    }
}

/// Resolve a candidate to an existing executable path.
fn locate(path: &Path) -> Option<PathBuf> {
    if path.is_absolute() {
        path.is_file().then(|| path.to_path_buf())
    } else {
        which::which(path).ok()
    }
}

/// Fill in defaults the spawned shell needs to behave like a terminal.
pub fn prepare_env(shell: &ShellInfo, env: &HashMap<String, String>) -> HashMap<String, String> {
    let mut out = env.clone();
    #[cfg(unix)]
    out.entry("PATH".into())
        .or_insert_with(|| "/usr/local/bin:/usr/bin:/bin:/usr/sbin:/sbin".into());
    match out.get("TERM").map(String::as_str) {
        None | Some("") | Some("dumb") => {
            out.insert("TERM".into(), "xterm-256color".into());
        }
        _ => {}
    }
    out.entry("COLORTERM".into()).or_insert_with(|| "truecolor".into());
    if !out.contains_key("LANG") && !out.contains_key("LC_ALL") {
        out.insert("LANG".into(), "en_US.UTF-8".into());
    }
    out.insert("SHELL".into(), shell.path.display().to_string());
    out.insert("TERM_PROGRAM".into(), "termgate".into());

    match shell.kind {
        ShellKind::Bash => {
            out.entry("HISTCONTROL".into()).or_insert_with(|| "ignorespace".into());
        }
        ShellKind::PowerShell => {
            out.entry("POWERSHELL_UPDATECHECK".into()).or_insert_with(|| "Off".into());
        }
        _ => {}
    }
    out
}

/// Read PTY output on the blocking pool. `blocking_send` applies
/// backpressure to the PTY when the consumer falls behind.
fn spawn_reader(reader: Box<dyn std::io::Read + Send>, chunk: usize) -> mpsc::Receiver<Bytes> {
    let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
    let chunk = chunk.max(1);
    tokio::task::spawn_blocking(move || {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let mut reader = reader;
            let mut buf = vec![0u8; chunk];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
        }));
        if let Err(e) = result {
            tracing::error!("PTY reader task panicked: {:?}", e);
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(path: &str) -> ShellInfo {
        ShellInfo {
            path: PathBuf::from(path),
            kind: ShellKind::from_path(Path::new(path)),
            capabilities: ShellCapabilities::default(),
        }
    }

    #[test]
    fn kind_from_path() {
        assert_eq!(ShellKind::from_path(Path::new("/bin/bash")), ShellKind::Bash);
        assert_eq!(ShellKind::from_path(Path::new("/usr/bin/zsh")), ShellKind::Zsh);
        assert_eq!(ShellKind::from_path(Path::new("/usr/local/bin/fish")), ShellKind::Fish);
        assert_eq!(
            ShellKind::from_path(Path::new(r"C:\Windows\System32\WindowsPowerShell\v1.0\powershell.exe")),
            ShellKind::PowerShell
        );
        assert_eq!(ShellKind::from_path(Path::new("cmd.exe")), ShellKind::Cmd);
        assert_eq!(ShellKind::from_path(Path::new("/opt/xonsh")), ShellKind::Other);
    }

    #[test]
    fn login_args_per_kind() {
        assert_eq!(ShellKind::Bash.login_args(), &["-l"]);
        assert_eq!(ShellKind::Dash.login_args(), &["-i"]);
        assert_eq!(ShellKind::PowerShell.login_args(), &["-NoLogo"]);
        assert!(ShellKind::Cmd.login_args().is_empty());
    }

    #[test]
    fn export_line_posix_quotes_single_quotes() {
        assert_eq!(
            ShellKind::Bash.export_line("GREETING", "it's"),
            " export GREETING='it'\\''s'\n"
        );
    }

    #[test]
    fn export_line_fish() {
        assert_eq!(ShellKind::Fish.export_line("A", "b c"), " set -gx A 'b c'\n");
        assert_eq!(ShellKind::Fish.export_line("A", "x'y"), " set -gx A 'x\\'y'\n");
    }

    #[test]
    fn export_line_powershell() {
        assert_eq!(
            ShellKind::PowerShell.export_line("A", "it's"),
            "$env:A = 'it''s'\r\n"
        );
    }

    #[test]
    fn prepare_env_fills_defaults() {
        let env = prepare_env(&info("/bin/bash"), &HashMap::new());
        assert_eq!(env["TERM"], "xterm-256color");
        assert_eq!(env["LANG"], "en_US.UTF-8");
        assert_eq!(env["SHELL"], "/bin/bash");
        assert_eq!(env["HISTCONTROL"], "ignorespace");
        assert!(env.contains_key("COLORTERM"));
        #[cfg(unix)]
        assert!(env["PATH"].contains("/usr/bin"));
    }

    #[test]
    fn prepare_env_keeps_caller_values() {
        let mut given = HashMap::new();
        given.insert("TERM".to_string(), "screen-256color".to_string());
        given.insert("LC_ALL".to_string(), "C.UTF-8".to_string());
        given.insert("PATH".to_string(), "/custom/bin".to_string());
        let env = prepare_env(&info("/bin/zsh"), &given);
        assert_eq!(env["TERM"], "screen-256color");
        assert_eq!(env["PATH"], "/custom/bin");
        assert!(!env.contains_key("LANG"));
    }

    #[test]
    fn prepare_env_replaces_dumb_term() {
        let mut given = HashMap::new();
        given.insert("TERM".to_string(), "dumb".to_string());
        let env = prepare_env(&info("/bin/sh"), &given);
        assert_eq!(env["TERM"], "xterm-256color");
    }

    #[test]
    fn candidates_start_with_override_and_dedupe() {
        let config = ShellConfig {
            path: Some(PathBuf::from("/custom/shell")),
            candidates: vec![
                PathBuf::from("/custom/shell"),
                PathBuf::from("/bin/sh"),
                PathBuf::from("/bin/sh"),
            ],
            ..ShellConfig::default()
        };
        let discovery = ShellDiscovery::new(config);
        let candidates = discovery.candidates();
        assert_eq!(candidates[0], PathBuf::from("/custom/shell"));
        assert_eq!(
            candidates.iter().filter(|p| **p == PathBuf::from("/bin/sh")).count(),
            1
        );
        assert_eq!(
            candidates.iter().filter(|p| **p == PathBuf::from("/custom/shell")).count(),
            1
        );
    }

    #[tokio::test]
    async fn probe_rejects_missing_binary() {
        let discovery = ShellDiscovery::new(ShellConfig::default());
        assert!(discovery.probe(Path::new("/nonexistent/shell")).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn probe_accepts_sh() {
        let discovery = ShellDiscovery::new(ShellConfig::default());
        let info = discovery.probe(Path::new("/bin/sh")).await.unwrap();
        assert_eq!(info.kind, ShellKind::Sh);
        assert!(info.capabilities.interactive);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn bogus_candidates_still_resolve_a_shell() {
        let config = ShellConfig {
            candidates: vec![PathBuf::from("/nonexistent/one"), PathBuf::from("/nonexistent/two")],
            ..ShellConfig::default()
        };
        let discovery = ShellDiscovery::new(config);
        let shell = discovery.resolve_shell().await.unwrap();
        assert!(shell.path.is_file());
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread")]
    async fn spawn_shell_falls_back_past_bad_preferred() {
        let config = ShellConfig {
            candidates: vec![PathBuf::from("/bin/sh")],
            ..ShellConfig::default()
        };
        let discovery = ShellDiscovery::new(config);
        let spawned = discovery
            .spawn_shell(SpawnOptions {
                preferred: Some(PathBuf::from("/nonexistent/shell")),
                cwd: std::env::temp_dir(),
                env: std::env::vars().collect(),
                rows: 24,
                cols: 80,
                read_chunk_bytes: 4096,
            })
            .await
            .unwrap();
        assert_ne!(spawned.shell.path, PathBuf::from("/nonexistent/shell"));
        assert!(!spawned.initial_output.is_empty());
        if let Some(mut killer) = spawned.pty.clone_killer() {
            let _ = killer.kill();
        }
    }
}
