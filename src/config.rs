use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::health::PressureAction;

/// Top-level server config, loaded from TOML. Every field has a default, so
/// an empty file (or no file at all) yields a working configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub limits: LimitsConfig,
    pub buffers: BuffersConfig,
    pub keepalive: KeepaliveConfig,
    pub sweep: SweepConfig,
    pub health: HealthConfig,
    pub shell: ShellConfig,
    pub env: EnvConfig,
    pub audit: AuditConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// Bearer token. Overridden by `--token` / `TERMGATE_TOKEN`.
    pub token: Option<String>,
    /// Allowed CORS origins. Empty disables the CORS layer.
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:7420".to_string(),
            token: None,
            cors_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_focused_per_project: usize,
    pub max_sessions_per_project: usize,
    pub max_total_sessions: usize,
    pub max_creations_per_window: usize,
    pub creation_window_secs: u64,
    pub breaker_cooldown_secs: u64,
    /// How long a closed session id stays visible before it is purged.
    pub closed_retention_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_focused_per_project: 10,
            max_sessions_per_project: 20,
            max_total_sessions: 50,
            max_creations_per_window: 10,
            creation_window_secs: 60,
            breaker_cooldown_secs: 300,
            closed_retention_secs: 60,
        }
    }
}

impl LimitsConfig {
    pub fn creation_window(&self) -> Duration {
        Duration::from_secs(self.creation_window_secs)
    }

    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_secs(self.breaker_cooldown_secs)
    }

    pub fn closed_retention(&self) -> Duration {
        Duration::from_secs(self.closed_retention_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuffersConfig {
    /// Chunks kept for replay on a routine reconnect.
    pub recent_entries: usize,
    /// Chunks kept while a session is suspended.
    pub suspension_entries: usize,
    /// PTY read size in bytes.
    pub read_chunk_bytes: usize,
}

impl Default for BuffersConfig {
    fn default() -> Self {
        Self {
            recent_entries: 500,
            suspension_entries: 1000,
            read_chunk_bytes: 4096,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepaliveConfig {
    pub intentional_secs: u64,
    pub reload_secs: u64,
    pub policy_secs: u64,
    pub network_secs: u64,
    pub suspension_max_age_secs: u64,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            intentional_secs: 30 * 60,
            reload_secs: 60,
            policy_secs: 10 * 60,
            network_secs: 60,
            suspension_max_age_secs: 30 * 60,
        }
    }
}

impl KeepaliveConfig {
    pub fn suspension_max_age(&self) -> Duration {
        Duration::from_secs(self.suspension_max_age_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    pub interval_secs: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self { interval_secs: 120 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    pub name: String,
    /// Fraction of `memory_budget_mb` at which this tier applies.
    pub threshold: f64,
    pub action: PressureAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub interval_secs: u64,
    pub memory_budget_mb: u64,
    pub tiers: Vec<TierConfig>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            memory_budget_mb: 1024,
            tiers: vec![
                TierConfig {
                    name: "high".to_string(),
                    threshold: 0.80,
                    action: PressureAction::CloseOldestHalf,
                },
                TierConfig {
                    name: "critical".to_string(),
                    threshold: 0.95,
                    action: PressureAction::CloseAll,
                },
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellConfig {
    /// Shell tried before `$SHELL` and the built-in candidates.
    pub path: Option<PathBuf>,
    /// Replaces the built-in candidate list when non-empty.
    pub candidates: Vec<PathBuf>,
    pub probe_timeout_ms: u64,
    pub liveness_timeout_ms: u64,
    /// Command launched inside the shell for `assistant` sessions.
    pub assistant_command: Option<String>,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            path: None,
            candidates: Vec::new(),
            probe_timeout_ms: 5000,
            liveness_timeout_ms: 2000,
            assistant_command: None,
        }
    }
}

impl ShellConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvConfig {
    /// Env files read from the working directory, highest priority first.
    pub files: Vec<String>,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            files: crate::envfile::DEFAULT_ENV_FILES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditSinkKind {
    #[default]
    None,
    Tracing,
    Jsonl,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub sink: AuditSinkKind,
    /// Output file for the `jsonl` sink.
    pub path: Option<PathBuf>,
}

impl Config {
    /// Load config from a TOML file.
    ///
    /// Checks file permissions and warns if world-readable.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        check_config_permissions(path);

        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the registry or monitor misbehave.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let l = &self.limits;
        if l.max_total_sessions == 0 || l.max_sessions_per_project == 0 {
            return Err(ConfigError::Invalid("session caps must be at least 1".into()));
        }
        if l.max_focused_per_project == 0 {
            return Err(ConfigError::Invalid(
                "max_focused_per_project must be at least 1".into(),
            ));
        }
        if l.max_creations_per_window == 0 || l.creation_window_secs == 0 {
            return Err(ConfigError::Invalid(
                "creation rate limit must allow at least one creation per window".into(),
            ));
        }
        if self.buffers.recent_entries == 0 || self.buffers.suspension_entries == 0 {
            return Err(ConfigError::Invalid("buffer sizes must be at least 1".into()));
        }
        if self.buffers.read_chunk_bytes == 0 {
            return Err(ConfigError::Invalid("read_chunk_bytes must be at least 1".into()));
        }
        if self.sweep.interval_secs == 0 || self.health.interval_secs == 0 {
            return Err(ConfigError::Invalid("timer intervals must be at least 1s".into()));
        }
        let mut prev = 0.0;
        for tier in &self.health.tiers {
            if !(tier.threshold > 0.0) || tier.threshold <= prev {
                return Err(ConfigError::Invalid(format!(
                    "health tier '{}' threshold must be positive and strictly ascending",
                    tier.name
                )));
            }
            prev = tier.threshold;
        }
        if self.audit.sink == AuditSinkKind::Jsonl && self.audit.path.is_none() {
            return Err(ConfigError::Invalid("audit sink 'jsonl' requires a path".into()));
        }
        Ok(())
    }
}

/// Errors that can occur when loading config.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {}", .0.display(), .1)]
    ReadFailed(PathBuf, #[source] std::io::Error),
    #[error("failed to parse config {}: {}", .0.display(), .1)]
    ParseFailed(PathBuf, #[source] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Check file permissions on a config file and warn if world-readable.
///
/// On Unix, checks `st_mode & 0o004` (world-readable bit). If set, logs a
/// warning because the config file may contain the API token.
#[cfg(unix)]
pub fn check_config_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(_) => return,
    };

    let mode = metadata.permissions().mode();
    if is_world_readable(mode) {
        tracing::warn!(
            "config file {} is world-readable (mode {:o}). \
             It may contain a token -- consider restricting permissions to 600.",
            path.display(),
            mode & 0o7777,
        );
    }
}

#[cfg(not(unix))]
pub fn check_config_permissions(_path: &Path) {}

/// Returns true if the given file mode has the world-readable bit set.
pub fn is_world_readable(mode: u32) -> bool {
    mode & 0o004 != 0
}
