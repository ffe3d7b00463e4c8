//! C6: the foreground/background polling-mode toggle sitting atop the
//! retry executor, plus the one-shot "sync now with a timeout" operation
//! driven by app-lifecycle events (§4.8).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::retry::RetryExecutor;

/// Tracks whether the retry executor is currently running in background-poll
/// mode, so a repeated app-lifecycle event (e.g. two `onBackground` calls in
/// a row) is a no-op rather than a pointless stop/start cycle.
pub struct BackgroundSyncManager {
    executor: Arc<RetryExecutor>,
    config: Arc<EngineConfig>,
    background_mode: AtomicBool,
}

impl BackgroundSyncManager {
    pub fn new(executor: Arc<RetryExecutor>, config: Arc<EngineConfig>) -> Arc<Self> {
        Arc::new(Self { executor, config, background_mode: AtomicBool::new(false) })
    }

    /// App moved to the foreground: restart the executor on the tighter
    /// foreground poll interval if it was running in background mode.
    pub async fn enter_foreground(&self) {
        if self.background_mode.swap(false, Ordering::SeqCst) {
            self.executor.stop().await;
            self.executor.start(false).await;
        } else {
            self.executor.start(false).await;
        }
    }

    /// App moved to the background: restart on the longer background poll
    /// interval. A no-op if already in background mode.
    pub async fn enter_background(&self) {
        if !self.background_mode.swap(true, Ordering::SeqCst) {
            self.executor.stop().await;
            self.executor.start(true).await;
        }
    }

    /// §4.8 `processBackgroundSync`: force-syncs every non-dead queue item
    /// right now, bounded by `backgroundSyncTimeout` so a platform background
    /// task budget is never exceeded.
    pub async fn process_background_sync(&self) -> Result<()> {
        let timeout = self.config.background_sync_timeout;
        match tokio::time::timeout(timeout, self.executor.process_due_tasks_now(true)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Network(format!("background sync exceeded its {timeout:?} budget"))),
        }
    }

    /// Clears the background-mode flag without touching the executor. Used
    /// by `Engine::obliterate_local_storage`'s "clear cached instances" step
    /// (§9 open question: `clearInstances()` only drops cached flags/handles,
    /// it never implies a running executor should be stopped).
    pub fn reset(&self) {
        self.background_mode.store(false, Ordering::SeqCst);
    }

    /// Stops and restarts the executor in foreground mode unconditionally.
    /// Used by `Engine::obliterate_local_storage`, which needs the executor
    /// itself — not just the flag — back to a known-clean state.
    pub async fn restart_foreground(&self) {
        self.executor.stop().await;
        self.background_mode.store(false, Ordering::SeqCst);
        self.executor.start(false).await;
    }

    pub fn is_background(&self) -> bool {
        self.background_mode.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::WatchConnectivity;
    use crate::dependency::DependencyResolver;
    use crate::queue::request_queue::RequestQueueManager;
    use crate::queue::store::{run_migrations, SyncQueueDao};
    use crate::store::SqliteStore;

    async fn harness() -> Arc<BackgroundSyncManager> {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        let queue = Arc::new(SyncQueueDao::new(pool.clone()));
        let store: Arc<dyn crate::store::Store> = Arc::new(SqliteStore::new(pool).await.unwrap());
        let config = Arc::new(EngineConfig::default());
        let connectivity = Arc::new(WatchConnectivity::new(true));
        let request_queue = RequestQueueManager::new(config.clone(), connectivity.clone());
        let dependency_resolver = Arc::new(DependencyResolver::new());
        let executor = RetryExecutor::new(config.clone(), queue, store, request_queue, dependency_resolver, connectivity, None);
        BackgroundSyncManager::new(executor, config)
    }

    #[tokio::test]
    async fn process_background_sync_completes_with_no_pending_tasks() {
        let manager = harness().await;
        manager.process_background_sync().await.unwrap();
    }

    #[tokio::test]
    async fn repeated_background_transitions_are_idempotent() {
        let manager = harness().await;
        manager.enter_background().await;
        assert!(manager.is_background());
        manager.enter_background().await;
        assert!(manager.is_background());
        manager.enter_foreground().await;
        assert!(!manager.is_background());
    }

    #[tokio::test]
    async fn reset_clears_flag_without_stopping_executor() {
        let manager = harness().await;
        manager.enter_background().await;
        manager.reset();
        assert!(!manager.is_background());
    }
}
