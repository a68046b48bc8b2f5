use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::Instant;

/// Tracks the timestamp of the last activity on a session (process output,
/// client input, or a focus change).
///
/// The registry ranks sessions by this timestamp when it has to pick an
/// eviction victim, so the tracker is created together with the session and
/// a clone is handed to the process bridge, whose reader touches it for every
/// output chunk.
///
/// Each touch increments a monotonic generation counter, which lets callers
/// cheaply detect "anything happened since I last looked".
#[derive(Clone)]
pub struct ActivityTracker {
    tx: Arc<watch::Sender<Instant>>,
    generation: Arc<AtomicU64>,
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ActivityTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityTracker")
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}

impl ActivityTracker {
    /// Create a new tracker seeded with the current instant.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Instant::now());
        Self {
            tx: Arc::new(tx),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Record activity. Safe to call from blocking threads.
    pub fn touch(&self) {
        self.generation.fetch_add(1, Ordering::Release);
        self.tx.send_replace(Instant::now());
    }

    /// Current generation counter value.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Instant of the most recent activity.
    pub fn last_activity(&self) -> Instant {
        *self.tx.borrow()
    }
}
