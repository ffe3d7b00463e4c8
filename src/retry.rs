//! C5: polls the sync queue, prioritizes, schedules retries with
//! exponential backoff + jitter, dead-letters, and handles the 404->create
//! fallback and double-404 (§4.4).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use rand::Rng;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::adapter::{HttpAdapter, RequestMeta};
use crate::config::{EngineConfig, QueueKind};
use crate::connectivity::Connectivity;
use crate::dependency::DependencyResolver;
use crate::error::{Error, Result, TaskOutcome};
use crate::idnegotiation::IdNegotiationService;
use crate::queue::request_queue::{NetworkTask, Operation, RequestQueueManager};
use crate::queue::store::SyncQueueDao;
use crate::queue::{QueueItemStatus, SyncOp, SyncQueueItem};
use crate::store::Store;

pub struct RetryExecutor {
    config: Arc<EngineConfig>,
    queue: Arc<SyncQueueDao>,
    store: Arc<dyn Store>,
    request_queue: Arc<RequestQueueManager>,
    dependency_resolver: Arc<DependencyResolver>,
    adapters: RwLock<HashMap<String, Arc<dyn HttpAdapter>>>,
    connectivity: Arc<dyn Connectivity>,
    id_negotiation: Option<Arc<IdNegotiationService>>,
    running: Arc<AtomicBool>,
    poll_handle: RwLock<Option<JoinHandle<()>>>,
}

fn parse_meta(item: &SyncQueueItem) -> RequestMeta {
    RequestMeta {
        headers: item.headers.as_deref().and_then(|s| serde_json::from_str(s).ok()),
        extra: item.extra.as_deref().and_then(|s| serde_json::from_str(s).ok()),
    }
}

impl RetryExecutor {
    pub fn new(
        config: Arc<EngineConfig>,
        queue: Arc<SyncQueueDao>,
        store: Arc<dyn Store>,
        request_queue: Arc<RequestQueueManager>,
        dependency_resolver: Arc<DependencyResolver>,
        connectivity: Arc<dyn Connectivity>,
        id_negotiation: Option<Arc<IdNegotiationService>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            queue,
            store,
            request_queue,
            dependency_resolver,
            adapters: RwLock::new(HashMap::new()),
            connectivity,
            id_negotiation,
            running: Arc::new(AtomicBool::new(false)),
            poll_handle: RwLock::new(None),
        })
    }

    pub async fn register_adapter(&self, model_type: impl Into<String>, adapter: Arc<dyn HttpAdapter>) {
        self.adapters.write().await.insert(model_type.into(), adapter);
    }

    /// §4.4: processes due tasks immediately, then on every poll interval.
    /// The caller's runtime must be driving the returned task; this
    /// spawns it and stores the handle so `stop` can abort it.
    pub async fn start(self: &Arc<Self>, background_mode: bool) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let executor = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                if let Err(err) = executor.process_due_tasks_now(false).await {
                    tracing::warn!(%err, "retry executor cycle failed");
                }
                if !executor.running.load(Ordering::SeqCst) {
                    break;
                }
                let interval = if background_mode {
                    executor.config.background_poll_interval
                } else {
                    executor.config.foreground_poll_interval
                };
                tokio::time::sleep(interval).await;
            }
        });
        *self.poll_handle.write().await = Some(handle);
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.poll_handle.write().await.take() {
            handle.abort();
        }
    }

    /// One processing cycle (§4.4 steps 1-8). `force_sync`: ignore
    /// `nextRetryAt` and fetch all non-dead items when connected.
    pub async fn process_due_tasks_now(&self, force_sync: bool) -> Result<()> {
        let connected = self.connectivity.check_now().await;

        let due = if force_sync {
            if !connected {
                return Ok(());
            }
            self.queue.get_all_non_dead().await?
        } else if connected {
            self.queue.get_due_tasks(Utc::now()).await?
        } else {
            return Ok(());
        };

        if due.is_empty() {
            return Ok(());
        }

        let (network_error, other): (Vec<_>, Vec<_>) = due.into_iter().partition(|t| {
            t.last_error.as_deref().map(Error::is_network_like).unwrap_or(false)
        });

        let network_error = self.dependency_resolver.sort_tasks_by_dependency_order(network_error);
        let other = self.dependency_resolver.sort_tasks_by_dependency_order(other);

        for task in network_error.into_iter().chain(other.into_iter()) {
            if !self.connectivity.check_now().await {
                tracing::debug!("connectivity lost mid-cycle; halting further tasks this cycle");
                break;
            }
            self.process_task(task).await;
        }

        Ok(())
    }

    async fn process_task(&self, task: SyncQueueItem) {
        let task_id = task.id;
        if let Err(err) = self.queue.mark_processing(task_id).await {
            tracing::warn!(%err, task_id, "failed to mark task processing");
            return;
        }

        let outcome = match self.execute_one(&task).await {
            TaskOutcome::TransientFailure(err) => match self.schedule_retry(task_id, task.attempt_count, err).await {
                Ok(next) => next,
                Err(e) => {
                    tracing::warn!(%e, task_id, "failed to schedule retry");
                    TaskOutcome::TransientFailure(e)
                }
            },
            other => other,
        };

        match outcome {
            TaskOutcome::Ok => {
                if let Err(err) = self.queue.delete(task_id).await {
                    tracing::warn!(%err, task_id, "failed to delete completed queue row");
                }
            }
            TaskOutcome::Skip { reason } => {
                tracing::info!(task_id, reason, "skipping task: local row no longer exists");
                if let Err(err) = self.queue.delete(task_id).await {
                    tracing::warn!(%err, task_id, "failed to delete skipped queue row");
                }
            }
            TaskOutcome::PermanentConfigFailure(_) => {
                // Double-fallback: the queue row was already rewritten by
                // execute_one; next_retry_at is left null so it is manually
                // retriable without backoff.
            }
            TaskOutcome::TransientFailure(_) => {
                // `schedule_retry` already persisted the backoff; the row
                // stays queued for the next poll cycle.
            }
            TaskOutcome::MaxAttemptsReached => {
                if let Err(e) = self.queue.mark_dead(task_id, task.last_error.as_deref().unwrap_or("max attempts reached")).await {
                    tracing::warn!(%e, task_id, "failed to mark dead");
                }
            }
        }

        if let Err(err) = self.queue.update_model_sync_status(&self.store, &task.model_type, &task.model_id).await {
            tracing::warn!(%err, task_id, "failed to update sync status projection");
        }
    }

    async fn execute_one(&self, task: &SyncQueueItem) -> TaskOutcome {
        let adapter = match self.adapters.read().await.get(&task.model_type).cloned() {
            Some(a) => a,
            None => {
                return TaskOutcome::TransientFailure(Error::Config(format!(
                    "no HttpAdapter registered for model type {}",
                    task.model_type
                )))
            }
        };

        let payload: Value = match serde_json::from_str(&task.payload) {
            Ok(v) => v,
            Err(err) => return TaskOutcome::TransientFailure(Error::Serialization(err.to_string())),
        };
        let meta = parse_meta(task);

        if task.id_negotiation_status.is_some() {
            return match self.id_negotiation.clone() {
                Some(id_negotiation) => id_negotiation.process_negotiation(task, adapter).await,
                None => TaskOutcome::TransientFailure(Error::Config(format!(
                    "task for {} carries an id-negotiation status but no IdNegotiationService is wired into this executor",
                    task.model_type
                ))),
            };
        }

        match task.op {
            SyncOp::Create => self.run_create(task, adapter, payload, meta).await,
            SyncOp::Update => self.run_update(task, adapter, payload, meta).await,
            SyncOp::Delete => self.run_delete(task, adapter, meta).await,
        }
    }

    async fn model_row_exists(&self, model_type: &str, model_id: &str) -> bool {
        matches!(self.store.get_row(model_type, model_id).await, Ok(Some(_)))
    }

    async fn run_create(&self, task: &SyncQueueItem, adapter: Arc<dyn HttpAdapter>, payload: Value, meta: RequestMeta) -> TaskOutcome {
        if !self.model_row_exists(&task.model_type, &task.model_id).await {
            return TaskOutcome::Skip { reason: "local row gone before create sync".into() };
        }
        let key = task.idempotency_key.clone();
        let model_type = task.model_type.clone();
        let model_id = task.model_id.clone();
        let request_queue = self.request_queue.clone();

        let result = request_queue
            .enqueue(
                NetworkTask::new(key, Operation::Create, model_type, model_id, move || async move { adapter.create_one(&payload, &meta).await }),
                Some(QueueKind::Background),
            )
            .await;

        match result {
            Ok(server_item) => {
                if let Err(err) = self.store.upsert_row(&task.model_type, &task.model_id, server_item).await {
                    return TaskOutcome::TransientFailure(err);
                }
                TaskOutcome::Ok
            }
            Err(err) => TaskOutcome::TransientFailure(err),
        }
    }

    async fn run_update(&self, task: &SyncQueueItem, adapter: Arc<dyn HttpAdapter>, payload: Value, meta: RequestMeta) -> TaskOutcome {
        if !self.model_row_exists(&task.model_type, &task.model_id).await {
            return TaskOutcome::Skip { reason: "local row gone before update sync".into() };
        }

        let key = task.idempotency_key.clone();
        let model_type = task.model_type.clone();
        let model_id = task.model_id.clone();
        let request_queue = self.request_queue.clone();
        let update_payload = payload.clone();
        let update_meta = meta.clone();
        let update_adapter = adapter.clone();

        let put_result = request_queue
            .enqueue(
                NetworkTask::new(key.clone(), Operation::Update, model_type.clone(), model_id.clone(), move || async move {
                    update_adapter.update_one(&update_payload, &update_meta).await
                }),
                Some(QueueKind::Background),
            )
            .await;

        match put_result {
            Ok(server_item) => {
                if let Err(err) = self.store.upsert_row(&task.model_type, &task.model_id, server_item).await {
                    return TaskOutcome::TransientFailure(err);
                }
                TaskOutcome::Ok
            }
            Err(Error::NotFound(_)) => self.fallback_update_to_create(task, adapter, payload, meta).await,
            Err(err) => TaskOutcome::TransientFailure(err),
        }
    }

    async fn fallback_update_to_create(&self, task: &SyncQueueItem, adapter: Arc<dyn HttpAdapter>, payload: Value, meta: RequestMeta) -> TaskOutcome {
        let key = crate::id::generate_idempotency_key();
        let model_type = task.model_type.clone();
        let model_id = task.model_id.clone();
        let request_queue = self.request_queue.clone();

        let post_result = request_queue
            .enqueue(
                NetworkTask::new(key, Operation::Create, model_type, model_id, move || async move { adapter.create_one(&payload, &meta).await }),
                Some(QueueKind::Background),
            )
            .await;

        match post_result {
            Ok(server_item) => {
                if let Err(err) = self.queue.update_op(task.id, SyncOp::Create, true).await {
                    return TaskOutcome::TransientFailure(err);
                }
                if let Err(err) = self.store.upsert_row(&task.model_type, &task.model_id, server_item).await {
                    return TaskOutcome::TransientFailure(err);
                }
                TaskOutcome::Ok
            }
            Err(Error::NotFound(_)) => {
                let error = format!("Fallback failed: update and create both returned 404 for {}/{}", task.model_type, task.model_id);
                if let Err(err) = self.queue.record_double_fallback(task.id, SyncOp::Update, &error).await {
                    return TaskOutcome::TransientFailure(err);
                }
                TaskOutcome::PermanentConfigFailure(error)
            }
            Err(err) => TaskOutcome::TransientFailure(err),
        }
    }

    async fn run_delete(&self, task: &SyncQueueItem, adapter: Arc<dyn HttpAdapter>, meta: RequestMeta) -> TaskOutcome {
        let key = task.idempotency_key.clone();
        let model_type = task.model_type.clone();
        let model_id = task.model_id.clone();
        let request_queue = self.request_queue.clone();
        let delete_id = task.model_id.clone();

        let result = request_queue
            .enqueue(
                NetworkTask::new(key, Operation::Delete, model_type, model_id, move || async move { adapter.delete_one(&delete_id, &meta).await }),
                Some(QueueKind::Background),
            )
            .await;

        match result {
            Ok(()) | Err(Error::Gone(_)) | Err(Error::NotFound(_)) => TaskOutcome::Ok,
            Err(err) => TaskOutcome::TransientFailure(err),
        }
    }

    /// §4.4 retry scheduling: backoff + jitter, or signals `MaxAttemptsReached`
    /// once `max_retry_attempts` is exceeded so the caller dead-letters the
    /// task (see the matching arm in `process_task`).
    async fn schedule_retry(&self, task_id: i64, current_attempt: u32, err: Error) -> Result<TaskOutcome> {
        let next_attempt = current_attempt + 1;
        if next_attempt > self.config.max_retry_attempts {
            return Ok(TaskOutcome::MaxAttemptsReached);
        }

        let base = self.config.initial_retry_delay.as_secs_f64()
            * self.config.backoff_multiplier.powi((next_attempt - 1) as i32);
        let base = base.min(self.config.max_retry_delay.as_secs_f64());

        let jitter = self.config.jitter_percent;
        let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
        let jittered = base * factor;
        let bounded = jittered.max(self.config.min_retry_delay.as_secs_f64()).min(self.config.max_retry_delay.as_secs_f64());

        let next_retry_at = Utc::now() + chrono::Duration::milliseconds((bounded * 1000.0) as i64);
        let error_text = err.to_string();
        self.queue.update_retry(task_id, Some(next_retry_at), next_attempt, Some(&error_text)).await?;
        Ok(TaskOutcome::TransientFailure(err))
    }
}

/// §8 P6: computes the valid `[min, max]` retry-delay bounds for attempt
/// `n`, used by tests to assert `schedule_retry`'s output falls inside them.
pub fn retry_delay_bounds(config: &EngineConfig, attempt: u32) -> (f64, f64) {
    let base = config.initial_retry_delay.as_secs_f64() * config.backoff_multiplier.powi((attempt - 1) as i32);
    let base = base.min(config.max_retry_delay.as_secs_f64());
    let jitter = config.jitter_percent;
    let min = (base * (1.0 - jitter)).max(config.min_retry_delay.as_secs_f64()).min(config.max_retry_delay.as_secs_f64());
    let max = (base * (1.0 + jitter)).max(config.min_retry_delay.as_secs_f64()).min(config.max_retry_delay.as_secs_f64());
    (min, max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::WatchConnectivity;
    use crate::queue::store::run_migrations;
    use crate::queue::IdNegotiationStatus;
    use crate::registry::ModelInfoRegistry;
    use crate::store::SqliteStore;
    use crate::testing::ScriptedAdapter;

    /// Regression for a live-path gap: a queue row carrying an
    /// `idNegotiationStatus` must be routed to `IdNegotiationService`, not
    /// treated as an ordinary create that upserts under the old temporary id.
    #[tokio::test]
    async fn due_task_with_id_negotiation_status_is_routed_to_id_negotiation_service() {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        let queue = Arc::new(SyncQueueDao::new(pool.clone()));
        let store: Arc<dyn Store> = Arc::new(SqliteStore::new(pool).await.unwrap());
        let config = Arc::new(EngineConfig::default());
        let connectivity = Arc::new(WatchConnectivity::new(true));
        let request_queue = RequestQueueManager::new(config.clone(), connectivity.clone());
        let dependency_resolver = Arc::new(DependencyResolver::new());
        let registry = Arc::new(ModelInfoRegistry::new());
        let id_negotiation =
            Arc::new(crate::idnegotiation::IdNegotiationService::new(store.clone(), queue.clone(), registry, config.clone()));

        let executor = RetryExecutor::new(
            config,
            queue.clone(),
            store.clone(),
            request_queue,
            dependency_resolver,
            connectivity,
            Some(id_negotiation),
        );

        let adapter = Arc::new(ScriptedAdapter::new());
        adapter.push_create(Ok(serde_json::json!({"id": "srv1", "title": "a"})));
        executor.register_adapter("Note", adapter).await;

        store.upsert_row("Note", "tmp1", serde_json::json!({"id": "tmp1", "title": "a"})).await.unwrap();
        let qid = queue
            .handle_model_save("Note", "tmp1", r#"{"id":"tmp1","title":"a"}"#, SyncOp::Create, "k1", None, None)
            .await
            .unwrap();
        queue.set_id_negotiation_status(qid, IdNegotiationStatus::Pending, None).await.unwrap();

        executor.process_due_tasks_now(true).await.unwrap();

        assert!(store.get_row("Note", "tmp1").await.unwrap().is_none());
        let row = store.get_row("Note", "srv1").await.unwrap().unwrap();
        assert_eq!(row["id"], "srv1");
        assert!(queue.get_by_id(qid).await.unwrap().is_none());
    }

    /// Regression: a task already at `max_retry_attempts` must be
    /// dead-lettered via `TaskOutcome::MaxAttemptsReached`, not silently
    /// retried forever.
    #[tokio::test]
    async fn task_past_max_attempts_is_dead_lettered() {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        let queue = Arc::new(SyncQueueDao::new(pool.clone()));
        let store: Arc<dyn Store> = Arc::new(SqliteStore::new(pool).await.unwrap());
        let config = Arc::new(EngineConfig::default());
        let connectivity = Arc::new(WatchConnectivity::new(true));
        let request_queue = RequestQueueManager::new(config.clone(), connectivity.clone());
        let dependency_resolver = Arc::new(DependencyResolver::new());

        let executor = RetryExecutor::new(config.clone(), queue.clone(), store.clone(), request_queue, dependency_resolver, connectivity, None);

        let adapter = Arc::new(ScriptedAdapter::new());
        adapter.push_create(Err(Error::Network("boom".into())));
        executor.register_adapter("Note", adapter).await;

        store.upsert_row("Note", "n1", serde_json::json!({"id": "n1"})).await.unwrap();
        let qid = queue
            .handle_model_save("Note", "n1", r#"{"id":"n1"}"#, SyncOp::Create, "k1", None, None)
            .await
            .unwrap();
        queue.update_retry(qid, None, config.max_retry_attempts, None).await.unwrap();

        executor.process_due_tasks_now(true).await.unwrap();

        let row = queue.get_by_id(qid).await.unwrap().unwrap();
        assert_eq!(row.status, QueueItemStatus::Dead);
    }

    #[test]
    fn retry_bounds_grow_with_attempt() {
        let config = EngineConfig::default();
        let (min1, max1) = retry_delay_bounds(&config, 1);
        let (min3, max3) = retry_delay_bounds(&config, 3);
        assert!(min1 <= max1);
        assert!(min3 >= min1);
        assert!(max3 >= max1);
    }

    #[test]
    fn retry_bounds_clamp_to_max_delay() {
        let config = EngineConfig::default();
        let (_, max) = retry_delay_bounds(&config, 40);
        assert!(max <= config.max_retry_delay.as_secs_f64() * (1.0 + config.jitter_percent));
    }
}
