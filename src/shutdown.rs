//! Graceful shutdown: signal handling plus the ordered drain of the
//! background services.
//!
//! The coordinator owns the shutdown budget. Listeners stop accepting work
//! first; the drain then runs jobs-before-pipeline (jobs produce log
//! records, the pipeline consumes them) and reserves a slice of the budget
//! so the final log flush cannot be starved by slow request teardown.

use crate::group::GroupManager;
use crate::jobs::JobScheduler;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::{signal, sync::watch, task::JoinHandle};
use tracing::{info, warn};

/// Slice of the budget reserved for background services once the listeners
/// are down.
const BACKGROUND_RESERVE: Duration = Duration::from_secs(5);

pub struct ShutdownCoordinator {
    requested: AtomicBool,
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
    budget: Duration,
}

impl ShutdownCoordinator {
    pub fn new(budget: Duration) -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            requested: AtomicBool::new(false),
            tx,
            rx,
            budget,
        }
    }

    /// Receiver that flips to `true` exactly once, when shutdown begins.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.rx.clone()
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.requested.load(Ordering::Relaxed)
    }

    pub fn initiate_shutdown(&self) {
        if self
            .requested
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            info!(budget = ?self.budget, "initiating graceful shutdown");
            let _ = self.tx.send(true);
        }
    }

    /// Block until SIGTERM/SIGINT, then begin shutdown.
    pub async fn wait_for_shutdown_signal(&self) {
        let ctrl_c = async {
            signal::ctrl_c()
                .await
                .expect("failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("failed to install signal handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("received Ctrl+C"),
            _ = terminate => info!("received terminate signal"),
        }

        self.initiate_shutdown();
    }

    /// Ordered drain of the background services, called after the HTTP
    /// listeners have stopped. Jobs stop before the log pipeline so the
    /// final flush sees everything they produced; the pipeline gets the
    /// reserved slice of the budget, then the group cache is flushed.
    pub async fn drain(
        &self,
        scheduler: Option<JobScheduler>,
        log_consumer: JoinHandle<()>,
        groups: &GroupManager,
    ) {
        self.initiate_shutdown();

        if let Some(scheduler) = scheduler {
            scheduler.stop().await;
        }

        let flush_budget = std::cmp::max(
            self.budget.saturating_sub(BACKGROUND_RESERVE),
            BACKGROUND_RESERVE,
        );
        if tokio::time::timeout(flush_budget, log_consumer).await.is_err() {
            warn!(
                budget = ?flush_budget,
                "log pipeline did not drain within the shutdown budget"
            );
        }

        groups.stop().await;
        info!("shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::DatabaseManager;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_shutdown_broadcast() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(30));
        let mut rx = coordinator.subscribe();
        assert!(!*rx.borrow());
        assert!(!coordinator.is_shutdown_requested());

        coordinator.initiate_shutdown();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
        assert!(coordinator.is_shutdown_requested());

        // Idempotent.
        coordinator.initiate_shutdown();
        assert!(coordinator.is_shutdown_requested());
    }

    #[tokio::test]
    async fn test_drain_waits_for_consumer() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(30));

        // A consumer that only exits once it observes the shutdown signal,
        // like the log pipeline does.
        let mut rx = coordinator.subscribe();
        let consumer = tokio::spawn(async move {
            let _ = rx.changed().await;
        });

        let db = Arc::new(DatabaseManager::connect("sqlite::memory:").await.unwrap());
        let groups = GroupManager::new(db);

        coordinator.drain(None, consumer, &groups).await;
        assert!(coordinator.is_shutdown_requested());
    }

    #[tokio::test]
    async fn test_drain_times_out_on_stuck_consumer() {
        // Budget below the reserve still leaves the minimum flush window;
        // paused time auto-advances through it.
        tokio::time::pause();
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));

        let consumer = tokio::spawn(async {
            std::future::pending::<()>().await;
        });

        let db = Arc::new(DatabaseManager::connect("sqlite::memory:").await.unwrap());
        let groups = GroupManager::new(db);

        coordinator.drain(None, consumer, &groups).await;
        assert!(coordinator.is_shutdown_requested());
    }
}
