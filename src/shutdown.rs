use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

/// Coordinates graceful shutdown of long-lived socket connections.
///
/// Each socket handler calls [`register`](Self::register) and keeps the
/// returned guard alive for the lifetime of the connection. When
/// [`shutdown`](Self::shutdown) is called, every registered receiver observes
/// `true` and the handler sends a close frame before exiting.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    tx: Arc<watch::Sender<bool>>,
    active: Arc<AtomicUsize>,
}

/// RAII guard that decrements the active connection count on drop.
pub struct ConnectionGuard {
    active: Arc<AtomicUsize>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::Release);
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Register a connection. Returns a guard plus a receiver that flips to
    /// `true` when shutdown begins.
    pub fn register(&self) -> (ConnectionGuard, watch::Receiver<bool>) {
        self.active.fetch_add(1, Ordering::AcqRel);
        (
            ConnectionGuard {
                active: Arc::clone(&self.active),
            },
            self.tx.subscribe(),
        )
    }

    /// Signal all registered connections to close.
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.tx.borrow()
    }

    /// Number of connections currently registered.
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Wait until every registered connection has dropped its guard, or the
    /// timeout elapses. Returns `true` if all connections closed in time.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.active_connections() > 0 {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_tracks_active_connections() {
        let coordinator = ShutdownCoordinator::new();
        assert_eq!(coordinator.active_connections(), 0);

        let (guard1, _rx1) = coordinator.register();
        let (guard2, _rx2) = coordinator.register();
        assert_eq!(coordinator.active_connections(), 2);

        drop(guard1);
        assert_eq!(coordinator.active_connections(), 1);
        drop(guard2);
        assert_eq!(coordinator.active_connections(), 0);
    }

    #[tokio::test]
    async fn shutdown_notifies_receivers() {
        let coordinator = ShutdownCoordinator::new();
        let (_guard, mut rx) = coordinator.register();
        assert!(!*rx.borrow());

        coordinator.shutdown();

        rx.changed().await.expect("sender should still be alive");
        assert!(*rx.borrow());
        assert!(coordinator.is_shutting_down());
    }

    #[tokio::test]
    async fn wait_for_drain_returns_when_guards_drop() {
        let coordinator = ShutdownCoordinator::new();
        let (guard, _rx) = coordinator.register();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(guard);
        });

        assert!(coordinator.wait_for_drain(Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn wait_for_drain_times_out() {
        let coordinator = ShutdownCoordinator::new();
        let (_guard, _rx) = coordinator.register();
        assert!(!coordinator.wait_for_drain(Duration::from_millis(30)).await);
    }
}
