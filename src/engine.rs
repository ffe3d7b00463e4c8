//! C10: the top-level lifecycle orchestrator — init, connectivity wiring,
//! `obliterateLocalStorage`, `processBackgroundSync`, and a health probe
//! (§4.8; health check grounded on the teacher's `Database::health_check()`).

use std::sync::Arc;

use serde::Serialize;

use crate::background_sync::BackgroundSyncManager;
use crate::config::EngineConfig;
use crate::connectivity::Connectivity;
use crate::dependency::DependencyResolver;
use crate::error::Result;
use crate::idnegotiation::IdNegotiationService;
use crate::queue::request_queue::RequestQueueManager;
use crate::queue::store::{run_migrations, SyncQueueDao};
use crate::registry::ModelInfoRegistry;
use crate::repository::RepositoryRegistry;
use crate::retry::RetryExecutor;
use crate::store::Store;

/// Diagnostic snapshot for a host application's "sync status" surface.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub store_reachable: bool,
    pub connected: bool,
    pub queue_depth: std::collections::HashMap<String, usize>,
    pub background_mode: bool,
}

pub struct Engine {
    config: Arc<EngineConfig>,
    store: Arc<dyn Store>,
    queue: Arc<SyncQueueDao>,
    request_queue: Arc<RequestQueueManager>,
    dependency_resolver: Arc<DependencyResolver>,
    retry_executor: Arc<RetryExecutor>,
    background_sync: Arc<BackgroundSyncManager>,
    connectivity: Arc<dyn Connectivity>,
    model_registry: Arc<ModelInfoRegistry>,
    id_negotiation: Arc<IdNegotiationService>,
    repositories: RepositoryRegistry,
}

impl Engine {
    /// §4.8 initialization: store config, install the store, initialize
    /// `RequestQueueManager`/`DependencyResolver`/`SyncQueueDao`, build the
    /// `IdNegotiationService` shared by the retry executor and every
    /// `Repository`, start the retry executor in foreground mode, initialize
    /// `BackgroundSyncManager`, subscribe to connectivity.
    pub async fn init(
        pool: sqlx::SqlitePool,
        config: Arc<EngineConfig>,
        connectivity: Arc<dyn Connectivity>,
        dependency_resolver: Arc<DependencyResolver>,
        model_registry: Arc<ModelInfoRegistry>,
    ) -> Result<Arc<Self>> {
        run_migrations(&pool).await?;
        let queue = Arc::new(SyncQueueDao::new(pool.clone()));
        let store: Arc<dyn Store> = Arc::new(crate::store::SqliteStore::new(pool).await?);
        let request_queue = RequestQueueManager::new(config.clone(), connectivity.clone());
        let id_negotiation = Arc::new(IdNegotiationService::new(store.clone(), queue.clone(), model_registry.clone(), config.clone()));
        let retry_executor = RetryExecutor::new(
            config.clone(),
            queue.clone(),
            store.clone(),
            request_queue.clone(),
            dependency_resolver.clone(),
            connectivity.clone(),
            Some(id_negotiation.clone()),
        );
        retry_executor.start(false).await;

        let background_sync = BackgroundSyncManager::new(retry_executor.clone(), config.clone());

        let engine = Arc::new(Self {
            config,
            store,
            queue,
            request_queue: request_queue.clone(),
            dependency_resolver,
            retry_executor: retry_executor.clone(),
            background_sync,
            connectivity,
            model_registry,
            id_negotiation,
            repositories: RepositoryRegistry::new(),
        });

        let restore_executor = retry_executor.clone();
        request_queue.watch_connectivity(Arc::new(move || {
            let executor = restore_executor.clone();
            tokio::spawn(async move {
                if let Err(err) = executor.process_due_tasks_now(false).await {
                    tracing::warn!(%err, "failed to drain due tasks after connectivity restore");
                }
            });
        }));

        tracing::info!("engine initialized");
        Ok(engine)
    }

    pub fn store(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    pub fn queue(&self) -> Arc<SyncQueueDao> {
        self.queue.clone()
    }

    pub fn request_queue(&self) -> Arc<RequestQueueManager> {
        self.request_queue.clone()
    }

    pub fn dependency_resolver(&self) -> Arc<DependencyResolver> {
        self.dependency_resolver.clone()
    }

    pub fn retry_executor(&self) -> Arc<RetryExecutor> {
        self.retry_executor.clone()
    }

    pub fn background_sync(&self) -> Arc<BackgroundSyncManager> {
        self.background_sync.clone()
    }

    pub fn repositories(&self) -> RepositoryRegistry {
        self.repositories.clone()
    }

    pub fn model_registry(&self) -> Arc<ModelInfoRegistry> {
        self.model_registry.clone()
    }

    /// Shared negotiation service every `Repository<T>::new` for a
    /// `SERVER_GENERATED_ID` model must be wired with, so the retry executor
    /// and the repository's own `remoteFirst` save path agree on outcome.
    pub fn id_negotiation(&self) -> Arc<IdNegotiationService> {
        self.id_negotiation.clone()
    }

    /// §4.8 `processBackgroundSync`: re-entry point for platform background
    /// tasks, bounded by `backgroundSyncTimeout`.
    pub async fn process_background_sync(&self) -> Result<()> {
        self.background_sync.process_background_sync().await
    }

    /// §4.8 `obliterateLocalStorage`: destructive, never used during normal
    /// operation. Clears all queues (cancel errors are swallowed), resets
    /// `BackgroundSyncManager`, deletes every queue item, truncates every
    /// registered repository's table, clears cached repository instances,
    /// and reinitializes `BackgroundSyncManager`.
    pub async fn obliterate_local_storage(&self) -> Result<()> {
        tracing::warn!("obliterating all local storage");
        self.request_queue.recreate_all();
        self.background_sync.reset();

        self.queue.clear_all().await?;

        for repo in self.repositories.all().await {
            if let Err(err) = repo.truncate_local().await {
                tracing::warn!(%err, "failed to truncate a repository's table during obliterate");
            }
        }

        self.background_sync.restart_foreground().await;
        tracing::info!("local storage obliterated");
        Ok(())
    }

    /// Grounded on the teacher's `Database::health_check()`: probes the
    /// store, reports connectivity and per-queue depth.
    pub async fn health_check(&self) -> HealthReport {
        let store_reachable = self.store.get_row("__health__", "__probe__").await.is_ok();
        let connected = self.connectivity.is_connected();
        let queue_depth = self
            .request_queue
            .queue_stats()
            .into_iter()
            .map(|(kind, stat)| (format!("{kind:?}"), stat.active_and_pending))
            .collect();
        HealthReport { store_reachable, connected, queue_depth, background_mode: self.background_sync.is_background() }
    }

    pub async fn shutdown(&self) {
        self.retry_executor.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::WatchConnectivity;

    async fn engine() -> Arc<Engine> {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        let config = Arc::new(EngineConfig::default());
        let connectivity = Arc::new(WatchConnectivity::new(true));
        let dependency_resolver = Arc::new(DependencyResolver::new());
        let model_registry = Arc::new(ModelInfoRegistry::new());
        Engine::init(pool, config, connectivity, dependency_resolver, model_registry).await.unwrap()
    }

    #[tokio::test]
    async fn init_starts_retry_executor_and_reports_health() {
        let engine = engine().await;
        let health = engine.health_check().await;
        assert!(health.store_reachable);
        assert!(health.connected);
        assert!(!health.background_mode);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn obliterate_local_storage_clears_queue_and_repositories() {
        let engine = engine().await;
        engine
            .queue()
            .handle_model_save("Note", "n1", r#"{"id":"n1"}"#, crate::queue::SyncOp::Create, "k1", None, None)
            .await
            .unwrap();
        engine.store().upsert_row("Note", "n1", serde_json::json!({"id": "n1"})).await.unwrap();

        engine.obliterate_local_storage().await.unwrap();

        let items = engine.queue().get_all_items().await.unwrap();
        assert!(items.is_empty());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn process_background_sync_runs_without_error() {
        let engine = engine().await;
        engine.process_background_sync().await.unwrap();
        engine.shutdown().await;
    }

    /// `Engine::init` must wire the same `IdNegotiationService`/`ModelInfoRegistry`
    /// instances into the retry executor it starts and hand them back out via
    /// accessors, so host code building a `Repository<T>` gets the instance
    /// the executor actually dispatches negotiation tasks through.
    #[tokio::test]
    async fn id_negotiation_and_model_registry_are_wired_and_retrievable() {
        let engine = engine().await;
        let id_negotiation_a = engine.id_negotiation();
        let id_negotiation_b = engine.id_negotiation();
        assert!(Arc::ptr_eq(&id_negotiation_a, &id_negotiation_b));

        let model_registry_a = engine.model_registry();
        let model_registry_b = engine.model_registry();
        assert!(Arc::ptr_eq(&model_registry_a, &model_registry_b));
        engine.shutdown().await;
    }
}
