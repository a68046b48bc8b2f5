//! Periodic memory-pressure sampling with tiered eviction.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::{HealthConfig, TierConfig};
use crate::orchestrator::Orchestrator;
use crate::session::CloseReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PressureAction {
    Warn,
    CloseOldestHalf,
    CloseAll,
}

/// Ordered table of (threshold, action) tiers.
#[derive(Debug, Clone)]
pub struct PressurePolicy {
    budget_bytes: u64,
    tiers: Vec<TierConfig>,
}

impl PressurePolicy {
    pub fn new(budget_mb: u64, mut tiers: Vec<TierConfig>) -> Self {
        tiers.sort_by(|a, b| a.threshold.total_cmp(&b.threshold));
        Self {
            budget_bytes: budget_mb.saturating_mul(1024 * 1024),
            tiers,
        }
    }

    pub fn from_config(cfg: &HealthConfig) -> Self {
        Self::new(cfg.memory_budget_mb, cfg.tiers.clone())
    }

    /// Highest tier whose threshold `rss_bytes` has reached.
    pub fn evaluate(&self, rss_bytes: u64) -> Option<&TierConfig> {
        if self.budget_bytes == 0 {
            return None;
        }
        let ratio = rss_bytes as f64 / self.budget_bytes as f64;
        self.tiers.iter().rev().find(|t| ratio >= t.threshold)
    }
}

/// Source of the current process memory footprint.
pub trait MemorySampler: Send + Sync + 'static {
    /// Resident set size in bytes, if it can be determined.
    fn rss_bytes(&self) -> Option<u64>;
}

/// Reads `/proc/self/statm` (Linux).
pub struct ProcMemorySampler;

impl MemorySampler for ProcMemorySampler {
    #[cfg(target_os = "linux")]
    fn rss_bytes(&self) -> Option<u64> {
        let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
        let resident: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if page <= 0 {
            return None;
        }
        Some(resident * page as u64)
    }

    #[cfg(not(target_os = "linux"))]
    fn rss_bytes(&self) -> Option<u64> {
        None
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSample {
    pub rss_bytes: Option<u64>,
    pub budget_bytes: u64,
    pub live_sessions: usize,
    pub tier: Option<String>,
    pub closed: usize,
}

pub struct HealthMonitor {
    orchestrator: Orchestrator,
    policy: PressurePolicy,
    sampler: Box<dyn MemorySampler>,
    interval: Duration,
    last: Arc<RwLock<Option<HealthSample>>>,
}

impl HealthMonitor {
    pub fn new(
        orchestrator: Orchestrator,
        cfg: &HealthConfig,
        sampler: Box<dyn MemorySampler>,
    ) -> Self {
        Self {
            orchestrator,
            policy: PressurePolicy::from_config(cfg),
            sampler,
            interval: Duration::from_secs(cfg.interval_secs.max(1)),
            last: Arc::new(RwLock::new(None)),
        }
    }

    /// Shared handle to the most recent sample, for `/stats`.
    pub fn last_sample(&self) -> Arc<RwLock<Option<HealthSample>>> {
        self.last.clone()
    }

    /// Take one sample and apply the matching tier's action.
    pub fn tick(&self) -> HealthSample {
        let rss = self.sampler.rss_bytes();
        let live = self.orchestrator.registry().live_count();
        let tier = rss.and_then(|r| self.policy.evaluate(r));

        let mut closed = 0;
        if let Some(tier) = tier {
            match tier.action {
                PressureAction::Warn => {
                    tracing::warn!(tier = %tier.name, rss = ?rss, live, "memory pressure");
                }
                PressureAction::CloseOldestHalf => {
                    let n = live.div_ceil(2);
                    tracing::warn!(tier = %tier.name, rss = ?rss, live, closing = n, "memory pressure, closing oldest sessions");
                    closed = self
                        .orchestrator
                        .close_oldest(n, CloseReason::MemoryPressure)
                        .len();
                    release_memory();
                }
                PressureAction::CloseAll => {
                    tracing::error!(tier = %tier.name, rss = ?rss, live, "critical memory pressure, closing all sessions");
                    closed = self.orchestrator.close_all(CloseReason::MemoryPressure).len();
                    release_memory();
                }
            }
        }

        let sample = HealthSample {
            rss_bytes: rss,
            budget_bytes: self.policy.budget_bytes,
            live_sessions: live,
            tier: tier.map(|t| t.name.clone()),
            closed,
        };
        *self.last.write() = Some(sample.clone());
        sample
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let sample = self.tick();
                    tracing::debug!(?sample, "health sample");
                }
                _ = cancel.cancelled() => break,
            }
        }
    }
}

/// Return freed heap pages to the OS.
fn release_memory() {
    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    unsafe {
        libc::malloc_trim(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1024 * 1024;

    fn default_policy() -> PressurePolicy {
        PressurePolicy::from_config(&HealthConfig::default())
    }

    #[test]
    fn below_all_tiers() {
        assert!(default_policy().evaluate(100 * MB).is_none());
    }

    #[test]
    fn high_tier_at_eighty_percent() {
        let policy = default_policy();
        let tier = policy.evaluate(820 * MB).unwrap();
        assert_eq!(tier.name, "high");
        assert_eq!(tier.action, PressureAction::CloseOldestHalf);
    }

    #[test]
    fn critical_wins_over_high() {
        let policy = default_policy();
        let tier = policy.evaluate(1000 * MB).unwrap();
        assert_eq!(tier.action, PressureAction::CloseAll);
    }

    #[test]
    fn tiers_are_sorted_by_threshold() {
        let policy = PressurePolicy::new(
            100,
            vec![
                TierConfig {
                    name: "critical".into(),
                    threshold: 0.9,
                    action: PressureAction::CloseAll,
                },
                TierConfig {
                    name: "warn".into(),
                    threshold: 0.5,
                    action: PressureAction::Warn,
                },
            ],
        );
        assert_eq!(policy.evaluate(60 * MB).unwrap().name, "warn");
        assert_eq!(policy.evaluate(95 * MB).unwrap().name, "critical");
    }

    #[test]
    fn zero_budget_disables_policy() {
        let policy = PressurePolicy::new(0, HealthConfig::default().tiers);
        assert!(policy.evaluate(u64::MAX).is_none());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn proc_sampler_reports_rss() {
        assert!(ProcMemorySampler.rss_bytes().unwrap() > 0);
    }
}
