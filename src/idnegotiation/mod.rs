//! C7: server-ID negotiation — temporary-id tracking, atomic server-ID
//! replacement, conflict resolution, and FK integrity checks (§4.6).

pub mod conflict;
pub mod fk;

use std::sync::Arc;

use serde_json::Value;

use crate::adapter::{HttpAdapter, RequestMeta};
use crate::config::EngineConfig;
use crate::error::{Error, Result, TaskOutcome};
use crate::model::ModelChange;
use crate::queue::store::SyncQueueDao;
use crate::queue::{IdNegotiationStatus, SyncQueueItem};
use crate::registry::ModelInfoRegistry;
use crate::store::Store;

pub use conflict::IdConflictResolver;
pub use fk::ForeignKeyUpdateService;

pub struct IdNegotiationService {
    store: Arc<dyn Store>,
    queue: Arc<SyncQueueDao>,
    config: Arc<EngineConfig>,
    fk_service: ForeignKeyUpdateService,
    conflict_resolver: IdConflictResolver,
    changes: tokio::sync::broadcast::Sender<(String, ModelChange<Value>)>,
}

fn parse_meta(item: &SyncQueueItem) -> RequestMeta {
    RequestMeta {
        headers: item.headers.as_deref().and_then(|s| serde_json::from_str(s).ok()),
        extra: item.extra.as_deref().and_then(|s| serde_json::from_str(s).ok()),
    }
}

impl IdNegotiationService {
    pub fn new(store: Arc<dyn Store>, queue: Arc<SyncQueueDao>, registry: Arc<ModelInfoRegistry>, config: Arc<EngineConfig>) -> Self {
        let fk_service = ForeignKeyUpdateService::new(store.clone(), registry.clone());
        let conflict_resolver = IdConflictResolver::new(store.clone(), queue.clone(), registry, config.clone());
        let (changes, _rx) = tokio::sync::broadcast::channel(128);
        Self { store, queue, config, fk_service, conflict_resolver, changes }
    }

    pub fn subscribe_id_changes(&self) -> tokio::sync::broadcast::Receiver<(String, ModelChange<Value>)> {
        self.changes.subscribe()
    }

    /// §4.6 background negotiation sync, run by the retry executor for any
    /// queue row carrying an `idNegotiationStatus`.
    pub async fn process_negotiation(&self, task: &SyncQueueItem, adapter: Arc<dyn HttpAdapter>) -> TaskOutcome {
        let siblings = match self.queue.get_by_model(&task.model_type, &task.model_id).await {
            Ok(s) => s,
            Err(err) => return TaskOutcome::TransientFailure(err),
        };
        if siblings.iter().any(|s| s.id != task.id && s.id_negotiation_status == Some(IdNegotiationStatus::Pending)) {
            let error = "Concurrent ID negotiation detected".to_string();
            if let Err(err) = self.queue.set_id_negotiation_status(task.id, IdNegotiationStatus::Failed, Some(&error)).await {
                return TaskOutcome::TransientFailure(err);
            }
            return TaskOutcome::PermanentConfigFailure(error);
        }

        if let Err(err) = self.queue.set_id_negotiation_status(task.id, IdNegotiationStatus::InProgress, None).await {
            return TaskOutcome::TransientFailure(err);
        }

        let payload: Value = match serde_json::from_str(&task.payload) {
            Ok(v) => v,
            Err(err) => return TaskOutcome::TransientFailure(Error::Serialization(err.to_string())),
        };
        let meta = parse_meta(task);

        let post = tokio::time::timeout(self.config.id_negotiation_timeout, adapter.create_one(&payload, &meta)).await;
        let server_item = match post {
            Err(_) => return TaskOutcome::TransientFailure(Error::Network("id negotiation POST timed out".into())),
            Ok(Err(err)) => return TaskOutcome::TransientFailure(err),
            Ok(Ok(v)) => v,
        };

        let server_id = match server_item.get("id").and_then(|v| v.as_str()) {
            Some(id) => id.to_string(),
            None => return TaskOutcome::PermanentConfigFailure("server response carried no id".into()),
        };

        if server_id == task.model_id {
            if let Err(err) = self.store.upsert_row(&task.model_type, &task.model_id, server_item).await {
                return TaskOutcome::TransientFailure(err);
            }
            if let Err(err) = self.queue.set_id_negotiation_status(task.id, IdNegotiationStatus::Completed, None).await {
                return TaskOutcome::TransientFailure(err);
            }
            return TaskOutcome::Ok;
        }

        let collision = match self.store.get_row(&task.model_type, &server_id).await {
            Ok(v) => v.is_some(),
            Err(err) => return TaskOutcome::TransientFailure(err),
        };

        let resolved_id = if !collision {
            match self.atomic_replace(&task.model_type, &task.model_id, &server_id).await {
                Ok(()) => server_id.clone(),
                Err(err) => return TaskOutcome::TransientFailure(err),
            }
        } else {
            match self.conflict_resolver.resolve_id_conflict(&task.model_type, &task.model_id, &server_id).await {
                Ok(id) => id,
                Err(err @ Error::IdConflict(_)) => return TaskOutcome::PermanentConfigFailure(err.to_string()),
                Err(err) => return TaskOutcome::TransientFailure(err),
            }
        };

        // rekey_row already patches the row's embedded "id", but the server
        // response may carry other fields (timestamps, server-owned data)
        // beyond what the temp row had; re-upsert the full response under
        // the resolved id so the local row matches the server exactly.
        if let Err(err) = self.store.upsert_row(&task.model_type, &resolved_id, server_item).await {
            return TaskOutcome::TransientFailure(err);
        }
        if let Err(err) = self.queue.set_id_negotiation_status(task.id, IdNegotiationStatus::Completed, None).await {
            return TaskOutcome::TransientFailure(err);
        }

        let _ = self.changes.send((
            task.model_type.clone(),
            ModelChange::IdChanged { old_id: task.model_id.clone(), new_id: resolved_id },
        ));
        TaskOutcome::Ok
    }

    /// Conflict-resolution entry point used directly by a repository's
    /// `remoteFirst` save path when the proposed server id collides with an
    /// existing row (§4.6 step 5, "Collision -> hand off to IdConflictResolver").
    pub async fn resolve_conflict_and_replace(&self, model_type: &str, temporary_id: &str, proposed_server_id: &str) -> Result<String> {
        self.conflict_resolver.resolve_id_conflict(model_type, temporary_id, proposed_server_id).await
    }

    /// §4.6 atomic replacement (steps 1-5). Transactional at the store
    /// level; on any error the caller's retry path handles backoff.
    pub async fn atomic_replace(&self, model_type: &str, old_id: &str, new_id: &str) -> Result<()> {
        // 1. assert temp row exists.
        if self.store.get_row(model_type, old_id).await?.is_none() {
            return Err(Error::NotFound(format!("{model_type}/{old_id} no longer exists locally")));
        }
        // 2. recheck no collision under "transaction" (best-effort at this layer).
        if self.store.get_row(model_type, new_id).await?.is_some() {
            return Err(Error::IdConflict(format!("{model_type}/{new_id} appeared since the pre-check")));
        }

        // 3. FK pre-validation: informational only, never aborts.
        let pre_new = self.fk_service.count_stale_references(model_type, new_id).await?;
        if pre_new > 0 {
            tracing::warn!(model_type, new_id, count = pre_new, "rows already reference the proposed server id before replacement");
        }
        let pre_old = self.fk_service.count_stale_references(model_type, old_id).await?;
        tracing::debug!(model_type, old_id, count = pre_old, "rows referencing temporary id before replacement");

        // 4. perform.
        self.store.rekey_row(model_type, old_id, new_id).await?;
        self.queue.rewrite_model_id(model_type, old_id, new_id).await?;
        self.fk_service.update_references(model_type, old_id, new_id).await?;

        // 5. post-validation: warn, never roll back.
        let stale = self.fk_service.count_stale_references(model_type, old_id).await?;
        if stale > 0 {
            tracing::warn!(model_type, old_id, count = stale, "rows still reference the temporary id after replacement");
        }
        let now_referencing_new = self.fk_service.count_stale_references(model_type, new_id).await?;
        tracing::info!(model_type, new_id, count = now_referencing_new, "rows now reference the server id");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::store::run_migrations;
    use crate::store::SqliteStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    struct FakeAdapter {
        response: Value,
    }

    #[async_trait]
    impl HttpAdapter for FakeAdapter {
        async fn create_one(&self, _item: &Value, _meta: &RequestMeta) -> Result<Value> {
            Ok(self.response.clone())
        }
        async fn update_one(&self, item: &Value, _meta: &RequestMeta) -> Result<Value> {
            Ok(item.clone())
        }
        async fn delete_one(&self, _id: &str, _meta: &RequestMeta) -> Result<()> {
            Ok(())
        }
        async fn fetch_one(&self, _id: &str, _params: Option<&crate::query::QueryParams>, _meta: &RequestMeta) -> Result<Value> {
            Ok(json!({}))
        }
        async fn fetch_all(&self, _params: Option<&crate::query::QueryParams>, _meta: &RequestMeta) -> Result<Vec<Value>> {
            Ok(vec![])
        }
    }

    async fn harness() -> (IdNegotiationService, Arc<dyn Store>, Arc<SyncQueueDao>) {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        let queue = Arc::new(SyncQueueDao::new(pool.clone()));
        let store: Arc<dyn Store> = Arc::new(SqliteStore::new(pool).await.unwrap());
        let registry = Arc::new(ModelInfoRegistry::new());
        let config = Arc::new(EngineConfig::default());
        let service = IdNegotiationService::new(store.clone(), queue.clone(), registry, config);
        let _ = Mutex::new(());
        (service, store, queue)
    }

    #[tokio::test]
    async fn negotiation_without_collision_rekeys() {
        let (service, store, queue) = harness().await;
        store.upsert_row("Note", "tmp1", json!({"id": "tmp1", "title": "a"})).await.unwrap();
        let qid = queue
            .handle_model_save("Note", "tmp1", r#"{"id":"tmp1","title":"a"}"#, crate::queue::SyncOp::Create, "k1", None, None)
            .await
            .unwrap();
        queue.set_id_negotiation_status(qid, IdNegotiationStatus::Pending, None).await.unwrap();

        let task = queue.get_by_id(qid).await.unwrap().unwrap();
        let adapter: Arc<dyn HttpAdapter> = Arc::new(FakeAdapter { response: json!({"id": "srv1", "title": "a"}) });
        let outcome = service.process_negotiation(&task, adapter).await;
        assert!(matches!(outcome, TaskOutcome::Ok));
        assert!(store.get_row("Note", "tmp1").await.unwrap().is_none());
        let row = store.get_row("Note", "srv1").await.unwrap().unwrap();
        assert_eq!(row["id"], "srv1");
    }

    #[tokio::test]
    async fn matching_id_completes_without_rekey() {
        let (service, store, queue) = harness().await;
        store.upsert_row("Note", "tmp1", json!({"id": "tmp1"})).await.unwrap();
        let qid = queue
            .handle_model_save("Note", "tmp1", r#"{"id":"tmp1"}"#, crate::queue::SyncOp::Create, "k1", None, None)
            .await
            .unwrap();
        queue.set_id_negotiation_status(qid, IdNegotiationStatus::Pending, None).await.unwrap();
        let task = queue.get_by_id(qid).await.unwrap().unwrap();
        let adapter: Arc<dyn HttpAdapter> = Arc::new(FakeAdapter { response: json!({"id": "tmp1"}) });
        let outcome = service.process_negotiation(&task, adapter).await;
        assert!(matches!(outcome, TaskOutcome::Ok));
        assert!(store.get_row("Note", "tmp1").await.unwrap().is_some());
    }
}
