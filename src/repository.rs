//! C8: the public repository API — load/save policy orchestration, local
//! cache reconciliation, and cascade delete with cycle detection (§4.5, §4.7).
//!
//! Per the redesign flag in §9 (mixin composition -> explicit composition):
//! a concrete `Repository<T>` owns a store handle, an optional remote
//! adapter, a queue-manager handle, and a registry handle; the model type
//! disappears into `T: Model` rather than a runtime class name.

use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::{broadcast, watch, RwLock};

use crate::adapter::{HttpAdapter, RequestMeta};
use crate::config::{EngineConfig, LoadPolicy, QueueKind, SavePolicy};
use crate::error::{Error, Result};
use crate::idnegotiation::IdNegotiationService;
use crate::model::{Model, ModelChange};
use crate::queue::request_queue::{NetworkTask, Operation, RequestQueueManager};
use crate::queue::store::SyncQueueDao;
use crate::queue::{IdNegotiationStatus, QueueItemStatus, SyncOp};
use crate::query::QueryParams;
use crate::registry::ModelInfoRegistry;
use crate::store::Store;

/// `(type, id)` pairs already visited in the current cascade, per the
/// redesign flag against traversing cyclic relations in object form.
pub type DeletionContext = Arc<std::sync::Mutex<HashSet<(String, String)>>>;

fn new_deletion_context() -> DeletionContext {
    Arc::new(std::sync::Mutex::new(HashSet::new()))
}

/// Type-erased handle used by cascade delete to reach a sibling repository
/// by model-type name (§4.7 step 1: "look up the target repository by type name").
#[async_trait]
pub trait DeletableRepository: Send + Sync {
    async fn cascade_delete(&self, id: &str, save_policy: SavePolicy, deletion_context: DeletionContext) -> Result<()>;
    async fn truncate_local(&self) -> Result<()>;
}

/// Process-wide lookup from model-type name to its repository, used by
/// cascade delete and by `Engine::obliterate_local_storage`. Doubles as the
/// "keep factories, drop caches" registry referenced in §9's open question —
/// here factory and instance are the same long-lived `Arc`, so `reset()`
/// would need to actually drop and rebuild entries; this engine never resets
/// it, only truncates each repository's table (see DESIGN.md).
#[derive(Clone, Default)]
pub struct RepositoryRegistry {
    inner: Arc<RwLock<HashMap<String, Arc<dyn DeletableRepository>>>>,
}

impl RepositoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, model_type: impl Into<String>, repo: Arc<dyn DeletableRepository>) {
        self.inner.write().await.insert(model_type.into(), repo);
    }

    pub async fn get(&self, model_type: &str) -> Option<Arc<dyn DeletableRepository>> {
        self.inner.read().await.get(model_type).cloned()
    }

    pub async fn all(&self) -> Vec<Arc<dyn DeletableRepository>> {
        self.inner.read().await.values().cloned().collect()
    }
}

fn to_value<T: Model>(item: &T) -> Result<Value> {
    item.to_json().map_err(Error::from)
}

pub struct Repository<T: Model> {
    _marker: PhantomData<T>,
    store: Arc<dyn Store>,
    queue: Arc<SyncQueueDao>,
    adapter: Option<Arc<dyn HttpAdapter>>,
    request_queue: Arc<RequestQueueManager>,
    model_registry: Arc<ModelInfoRegistry>,
    repositories: RepositoryRegistry,
    id_negotiation: Option<Arc<IdNegotiationService>>,
    config: Arc<EngineConfig>,
    changes: broadcast::Sender<ModelChange<T>>,
}

impl<T: Model> Repository<T> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<SyncQueueDao>,
        adapter: Option<Arc<dyn HttpAdapter>>,
        request_queue: Arc<RequestQueueManager>,
        model_registry: Arc<ModelInfoRegistry>,
        repositories: RepositoryRegistry,
        id_negotiation: Option<Arc<IdNegotiationService>>,
        config: Arc<EngineConfig>,
    ) -> Arc<Self> {
        let (changes, _rx) = broadcast::channel(256);
        Arc::new(Self {
            _marker: PhantomData,
            store,
            queue,
            adapter,
            request_queue,
            model_registry,
            repositories,
            id_negotiation,
            config,
            changes,
        })
    }

    pub fn changes(&self) -> broadcast::Receiver<ModelChange<T>> {
        self.changes.subscribe()
    }

    fn require_adapter(&self) -> Result<Arc<dyn HttpAdapter>> {
        self.adapter.clone().ok_or_else(|| Error::Config(format!("{} repository has no HttpAdapter configured", T::MODEL_TYPE)))
    }

    async fn read_local_one(&self, id: &str) -> Result<Option<T>> {
        match self.store.get_row(T::MODEL_TYPE, id).await? {
            Some(row) => Ok(Some(T::from_json(&row)?)),
            None => Ok(None),
        }
    }

    async fn read_local_all(&self, params: Option<&QueryParams>) -> Result<Vec<T>> {
        let params = params.cloned().unwrap_or_default();
        let rows = self.store.query_rows(T::MODEL_TYPE, &params).await?;
        rows.iter().map(|v| T::from_json(v).map_err(Error::from)).collect()
    }

    // ---- findOne / findAll (§4.5 load policies) ----

    pub async fn find_one(self: &Arc<Self>, id: &str, load_policy: Option<LoadPolicy>, params: Option<&QueryParams>) -> Result<Option<T>> {
        match load_policy.unwrap_or(self.config.default_load_policy) {
            LoadPolicy::LocalOnly => self.read_local_one(id).await,
            LoadPolicy::RemoteFirst => self.find_one_remote_first(id, params).await,
            LoadPolicy::LocalThenRemote => self.find_one_local_then_remote(id, params).await,
        }
    }

    pub async fn find_one_or_fail(self: &Arc<Self>, id: &str, load_policy: Option<LoadPolicy>, params: Option<&QueryParams>) -> Result<T> {
        self.find_one(id, load_policy, params).await?.ok_or_else(|| Error::NotFound(format!("{}/{id}", T::MODEL_TYPE)))
    }

    async fn find_one_remote_first(self: &Arc<Self>, id: &str, params: Option<&QueryParams>) -> Result<Option<T>> {
        let adapter = self.require_adapter()?;
        let id_owned = id.to_string();
        let params_owned = params.cloned();
        let result = self
            .request_queue
            .enqueue(
                NetworkTask::new(crate::id::generate_idempotency_key(), Operation::Read, T::MODEL_TYPE, id, move || async move {
                    adapter.fetch_one(&id_owned, params_owned.as_ref(), &RequestMeta::default()).await
                }),
                Some(QueueKind::Foreground),
            )
            .await;

        match result {
            Ok(value) => {
                self.update_local_cache(vec![value]).await?;
                self.read_local_one(id).await
            }
            Err(Error::Gone(_)) => {
                self.handle_cascade_delete_after_gone(id).await?;
                Ok(None)
            }
            Err(_) => self.read_local_one(id).await,
        }
    }

    async fn find_one_local_then_remote(self: &Arc<Self>, id: &str, params: Option<&QueryParams>) -> Result<Option<T>> {
        let local = self.read_local_one(id).await?;
        if self.adapter.is_some() {
            let repo = self.clone();
            let id_owned = id.to_string();
            let params_owned = params.cloned();
            tokio::spawn(async move {
                if let Err(err) = repo.refresh_one_via_load_queue(&id_owned, params_owned.as_ref()).await {
                    tracing::debug!(%err, model_type = T::MODEL_TYPE, id = %id_owned, "localThenRemote single refresh failed");
                }
            });
        }
        Ok(local)
    }

    async fn refresh_one_via_load_queue(self: &Arc<Self>, id: &str, params: Option<&QueryParams>) -> Result<()> {
        let adapter = self.require_adapter()?;
        let id_owned = id.to_string();
        let params_owned = params.cloned();
        let result = self
            .request_queue
            .enqueue(
                NetworkTask::new(crate::id::generate_idempotency_key(), Operation::Read, T::MODEL_TYPE, id, move || async move {
                    adapter.fetch_one(&id_owned, params_owned.as_ref(), &RequestMeta::default()).await
                }),
                Some(QueueKind::Load),
            )
            .await;

        match result {
            Ok(value) => self.update_local_cache(vec![value]).await,
            Err(Error::NotFound(_)) | Err(Error::Gone(_)) => self.handle_cascade_delete_after_gone(id).await,
            Err(_) => Ok(()),
        }
    }

    pub async fn find_all(self: &Arc<Self>, load_policy: Option<LoadPolicy>, params: Option<&QueryParams>) -> Result<Vec<T>> {
        match load_policy.unwrap_or(self.config.default_load_policy) {
            LoadPolicy::LocalOnly => self.read_local_all(params).await,
            LoadPolicy::RemoteFirst => self.find_all_remote_first(params).await,
            LoadPolicy::LocalThenRemote => self.find_all_local_then_remote(params).await,
        }
    }

    async fn find_all_remote_first(self: &Arc<Self>, params: Option<&QueryParams>) -> Result<Vec<T>> {
        let adapter = self.require_adapter()?;
        let params_owned = params.cloned();
        let result = self
            .request_queue
            .enqueue(
                NetworkTask::new(crate::id::generate_idempotency_key(), Operation::Read, T::MODEL_TYPE, "*", move || async move {
                    adapter.fetch_all(params_owned.as_ref(), &RequestMeta::default()).await
                }),
                Some(QueueKind::Foreground),
            )
            .await;

        match result {
            Ok(items) => {
                self.update_local_cache(items).await?;
                self.read_local_all(params).await
            }
            Err(Error::NotFound(_)) | Err(Error::Gone(_)) => {
                self.store.truncate(T::MODEL_TYPE).await?;
                Ok(Vec::new())
            }
            Err(_) => self.read_local_all(params).await,
        }
    }

    async fn find_all_local_then_remote(self: &Arc<Self>, params: Option<&QueryParams>) -> Result<Vec<T>> {
        let local = self.read_local_all(params).await?;
        if self.adapter.is_some() {
            let repo = self.clone();
            let params_owned = params.cloned();
            tokio::spawn(async move {
                if let Err(err) = repo.refresh_all_via_load_queue(params_owned.as_ref()).await {
                    tracing::debug!(%err, model_type = T::MODEL_TYPE, "localThenRemote list refresh failed");
                }
            });
        }
        Ok(local)
    }

    async fn refresh_all_via_load_queue(self: &Arc<Self>, params: Option<&QueryParams>) -> Result<()> {
        let adapter = self.require_adapter()?;
        let params_owned = params.cloned();
        let result = self
            .request_queue
            .enqueue(
                NetworkTask::new(crate::id::generate_idempotency_key(), Operation::Read, T::MODEL_TYPE, "*", move || async move {
                    adapter.fetch_all(params_owned.as_ref(), &RequestMeta::default()).await
                }),
                Some(QueueKind::Load),
            )
            .await;

        match result {
            Ok(items) => self.update_local_cache(items).await,
            Err(Error::NotFound(_)) | Err(Error::Gone(_)) => self.store.truncate(T::MODEL_TYPE).await,
            Err(_) => Ok(()),
        }
    }

    /// §4.5 `updateLocalCache`: local pending mutations win; reconstructs
    /// rows whose local copy vanished (e.g. after a truncate) from the
    /// sync queue's own payload snapshot.
    async fn update_local_cache(&self, items: Vec<Value>) -> Result<()> {
        for item in &items {
            let Some(id) = item.get("id").and_then(|v| v.as_str()) else { continue };
            let pending = self.queue.get_by_model(T::MODEL_TYPE, id).await?;
            if pending.iter().any(|p| p.status != QueueItemStatus::Dead) {
                continue;
            }
            self.store.upsert_row(T::MODEL_TYPE, id, item.clone()).await?;
        }

        for queue_item in self.queue.get_by_type(T::MODEL_TYPE).await? {
            if queue_item.status == QueueItemStatus::Dead || !matches!(queue_item.op, SyncOp::Create | SyncOp::Update) {
                continue;
            }
            if self.store.get_row(T::MODEL_TYPE, &queue_item.model_id).await?.is_none() {
                let payload: Value = serde_json::from_str(&queue_item.payload)?;
                self.store.upsert_row(T::MODEL_TYPE, &queue_item.model_id, payload).await?;
            }
        }
        Ok(())
    }

    // ---- watchOne / watchAll ----

    pub async fn watch_one(
        self: &Arc<Self>,
        id: &str,
        load_policy: Option<LoadPolicy>,
        params: Option<&QueryParams>,
    ) -> Result<watch::Receiver<Option<T>>> {
        if matches!(load_policy, Some(LoadPolicy::RemoteFirst)) {
            return Err(Error::Unimplemented("watchOne does not support remoteFirst".into()));
        }
        let initial = self.read_local_one(id).await?;
        let (tx, rx) = watch::channel(initial);
        let mut store_changes = self.store.watch(T::MODEL_TYPE);
        let repo = self.clone();
        let id_owned = id.to_string();
        tokio::spawn(async move {
            while store_changes.recv().await.is_ok() {
                if tx.receiver_count() == 0 {
                    break;
                }
                match repo.read_local_one(&id_owned).await {
                    Ok(value) => {
                        if tx.send(value).is_err() {
                            break;
                        }
                    }
                    Err(err) => tracing::warn!(%err, model_type = T::MODEL_TYPE, id = %id_owned, "watchOne re-query failed"),
                }
            }
        });

        if matches!(load_policy, Some(LoadPolicy::LocalThenRemote)) {
            let repo = self.clone();
            let id_owned = id.to_string();
            let params_owned = params.cloned();
            tokio::spawn(async move {
                let _ = repo.refresh_one_via_load_queue(&id_owned, params_owned.as_ref()).await;
            });
        }
        Ok(rx)
    }

    pub async fn watch_all(self: &Arc<Self>, load_policy: Option<LoadPolicy>, params: Option<&QueryParams>) -> Result<watch::Receiver<Vec<T>>> {
        if matches!(load_policy, Some(LoadPolicy::RemoteFirst)) {
            return Err(Error::Unimplemented("watchAll does not support remoteFirst".into()));
        }
        let initial = self.read_local_all(params).await?;
        let (tx, rx) = watch::channel(initial);
        let mut store_changes = self.store.watch(T::MODEL_TYPE);
        let repo = self.clone();
        let params_owned = params.cloned();
        tokio::spawn(async move {
            while store_changes.recv().await.is_ok() {
                if tx.receiver_count() == 0 {
                    break;
                }
                match repo.read_local_all(params_owned.as_ref()).await {
                    Ok(rows) => {
                        if tx.send(rows).is_err() {
                            break;
                        }
                    }
                    Err(err) => tracing::warn!(%err, model_type = T::MODEL_TYPE, "watchAll re-query failed"),
                }
            }
        });

        if matches!(load_policy, Some(LoadPolicy::LocalThenRemote)) {
            let repo = self.clone();
            let params_owned = params.cloned();
            tokio::spawn(async move {
                let _ = repo.refresh_all_via_load_queue(params_owned.as_ref()).await;
            });
        }
        Ok(rx)
    }

    // ---- save (§4.5 save policies, §4.6 id negotiation) ----

    pub async fn save(self: &Arc<Self>, item: T, save_policy: Option<SavePolicy>, update_timestamps: bool) -> Result<T> {
        match save_policy.unwrap_or(self.config.default_save_policy) {
            SavePolicy::LocalFirst => self.save_local_first(item, update_timestamps).await,
            SavePolicy::RemoteFirst => self.save_remote_first(item, update_timestamps).await,
        }
    }

    fn apply_timestamp_rule(&self, item: &mut T, is_existing: bool, update_timestamps: bool) {
        if !update_timestamps {
            return;
        }
        let now = Utc::now();
        if !is_existing && item.created_at().is_none() {
            item.set_created_at(Some(now));
        }
        item.set_updated_at(Some(now));
    }

    async fn save_local_first(self: &Arc<Self>, mut item: T, update_timestamps: bool) -> Result<T> {
        let is_existing = self.store.get_row(T::MODEL_TYPE, item.id()).await?.is_some();
        self.apply_timestamp_rule(&mut item, is_existing, update_timestamps);

        let value = to_value(&item)?;
        self.store.upsert_row(T::MODEL_TYPE, item.id(), value.clone()).await?;
        let _ = self.changes.send(if is_existing { ModelChange::Updated(item.clone()) } else { ModelChange::Created(item.clone()) });

        let Some(adapter) = self.adapter.clone() else {
            return Ok(item);
        };

        let op = if is_existing { SyncOp::Update } else { SyncOp::Create };
        let payload = serde_json::to_string(&value)?;
        let key = crate::id::generate_idempotency_key();
        let queue_id = self.queue.handle_model_save(T::MODEL_TYPE, item.id(), &payload, op, &key, None, None).await?;

        if T::SERVER_GENERATED_ID && !is_existing {
            self.queue.set_id_negotiation_status(queue_id, IdNegotiationStatus::Pending, None).await?;
        }
        self.queue.update_model_sync_status(&self.store, T::MODEL_TYPE, item.id()).await?;

        // Fire-and-forget immediate sync attempt (§9 redesign flag: an
        // explicit spawn, errors logged but never joined; the caller's save
        // has already completed after the local write + queue-row insert).
        if !T::SERVER_GENERATED_ID {
            let repo = self.clone();
            let model_id = item.id().to_string();
            let immediate_key = crate::id::generate_idempotency_key();
            let net_op = if is_existing { Operation::Update } else { Operation::Create };
            let value_for_sync = value.clone();
            tokio::spawn(async move {
                let outcome = repo
                    .request_queue
                    .enqueue(
                        NetworkTask::new(immediate_key, net_op, T::MODEL_TYPE, model_id.clone(), move || async move {
                            match op {
                                SyncOp::Create => adapter.create_one(&value_for_sync, &RequestMeta::default()).await,
                                SyncOp::Update => adapter.update_one(&value_for_sync, &RequestMeta::default()).await,
                                SyncOp::Delete => unreachable!("save never enqueues a delete"),
                            }
                        }),
                        Some(QueueKind::Background),
                    )
                    .await;

                match outcome {
                    Ok(server_item) => {
                        if let Err(err) = repo.store.upsert_row(T::MODEL_TYPE, &model_id, server_item).await {
                            tracing::warn!(%err, model_type = T::MODEL_TYPE, model_id, "failed to persist immediate-sync result");
                            return;
                        }
                        if let Err(err) = repo.queue.delete(queue_id).await {
                            tracing::warn!(%err, model_type = T::MODEL_TYPE, model_id, "failed to delete queue row after immediate sync");
                        }
                        if let Err(err) = repo.queue.update_model_sync_status(&repo.store, T::MODEL_TYPE, &model_id).await {
                            tracing::warn!(%err, model_type = T::MODEL_TYPE, model_id, "failed to refresh sync status after immediate sync");
                        }
                    }
                    Err(err) => {
                        tracing::debug!(%err, model_type = T::MODEL_TYPE, model_id, "immediate background sync failed; leaving for retry executor");
                    }
                }
            });
        }

        Ok(item)
    }

    async fn save_remote_first(self: &Arc<Self>, mut item: T, update_timestamps: bool) -> Result<T> {
        let is_existing = self.store.get_row(T::MODEL_TYPE, item.id()).await?.is_some();
        self.apply_timestamp_rule(&mut item, is_existing, update_timestamps);

        if T::SERVER_GENERATED_ID && !is_existing {
            return self.save_remote_first_with_id_negotiation(item).await;
        }

        let adapter = self.require_adapter()?;
        let value = to_value(&item)?;
        let value_for_net = value.clone();
        let op = if is_existing { SyncOp::Update } else { SyncOp::Create };
        let net_op = if is_existing { Operation::Update } else { Operation::Create };
        let result = self
            .request_queue
            .enqueue(
                NetworkTask::new(crate::id::generate_idempotency_key(), net_op, T::MODEL_TYPE, item.id(), move || async move {
                    match op {
                        SyncOp::Create => adapter.create_one(&value_for_net, &RequestMeta::default()).await,
                        SyncOp::Update => adapter.update_one(&value_for_net, &RequestMeta::default()).await,
                        SyncOp::Delete => unreachable!("save never enqueues a delete"),
                    }
                }),
                Some(QueueKind::Foreground),
            )
            .await;

        match result {
            Ok(server_value) => {
                let server_id = server_value.get("id").and_then(|v| v.as_str()).unwrap_or(item.id()).to_string();
                self.store.upsert_row(T::MODEL_TYPE, &server_id, server_value.clone()).await?;
                let resolved = T::from_json(&server_value)?;
                let _ = self.changes.send(if is_existing { ModelChange::Updated(resolved.clone()) } else { ModelChange::Created(resolved.clone()) });
                Ok(resolved)
            }
            Err(err @ Error::Offline(_)) => Err(err),
            Err(err @ Error::ApiException { .. }) => Err(err),
            Err(err) => Err(Error::Network(err.to_string())),
        }
    }

    /// §4.6 `remoteFirst` save path for a server-generated-id model: POST
    /// directly; on a proposed id matching the client's, persist as-is; on
    /// mismatch, atomically replace (or hand to the conflict resolver) and
    /// emit `idChanged`; on POST failure, fall back to `localFirst`.
    async fn save_remote_first_with_id_negotiation(self: &Arc<Self>, item: T) -> Result<T> {
        let Some(adapter) = self.adapter.clone() else {
            return self.save_local_first(item, true).await;
        };
        let value = to_value(&item)?;
        let post = adapter.create_one(&value, &RequestMeta::default()).await;

        match post {
            Ok(server_value) => {
                let server_id = server_value.get("id").and_then(|v| v.as_str()).unwrap_or(item.id()).to_string();
                if server_id == item.id() {
                    self.store.upsert_row(T::MODEL_TYPE, item.id(), server_value.clone()).await?;
                    let resolved = T::from_json(&server_value)?;
                    let _ = self.changes.send(ModelChange::Created(resolved.clone()));
                    return Ok(resolved);
                }

                self.store.upsert_row(T::MODEL_TYPE, item.id(), value.clone()).await?;
                let id_negotiation = self
                    .id_negotiation
                    .clone()
                    .ok_or_else(|| Error::Config("no IdNegotiationService configured for a server-generated-id model".into()))?;

                match self.store.get_row(T::MODEL_TYPE, &server_id).await? {
                    None => id_negotiation.atomic_replace(T::MODEL_TYPE, item.id(), &server_id).await?,
                    Some(_) => {
                        id_negotiation.resolve_conflict_and_replace(T::MODEL_TYPE, item.id(), &server_id).await?;
                    }
                }

                self.store.upsert_row(T::MODEL_TYPE, &server_id, server_value.clone()).await?;
                let _ = self.changes.send(ModelChange::IdChanged { old_id: item.id().to_string(), new_id: server_id.clone() });
                T::from_json(&server_value).map_err(Error::from)
            }
            Err(_) => self.save_local_first(item, true).await,
        }
    }

    // ---- delete (§4.5, §4.7 cascade with cycle detection) ----

    pub async fn delete(&self, id: &str, save_policy: Option<SavePolicy>, deletion_context: Option<DeletionContext>) -> Result<()> {
        let ctx = deletion_context.unwrap_or_else(new_deletion_context);
        let policy = save_policy.unwrap_or(self.config.default_save_policy);
        self.delete_with_context(id, policy, ctx).await
    }

    async fn delete_with_context(&self, id: &str, save_policy: SavePolicy, ctx: DeletionContext) -> Result<()> {
        let key = (T::MODEL_TYPE.to_string(), id.to_string());
        {
            let mut guard = ctx.lock().unwrap();
            if guard.contains(&key) {
                tracing::debug!(model_type = T::MODEL_TYPE, id, "cascade-delete cycle detected, skipping");
                return Ok(());
            }
            guard.insert(key);
        }

        match save_policy {
            SavePolicy::LocalFirst => self.delete_local_first(id, ctx).await,
            SavePolicy::RemoteFirst => self.delete_remote_first(id, ctx).await,
        }
    }

    async fn delete_local_first(&self, id: &str, ctx: DeletionContext) -> Result<()> {
        self.cascade_delete_children(id, SavePolicy::LocalFirst, ctx).await;

        let payload = match self.store.get_row(T::MODEL_TYPE, id).await? {
            Some(row) => serde_json::to_string(&row)?,
            None => format!(r#"{{"id":{}}}"#, serde_json::to_string(id)?),
        };

        let key = crate::id::generate_idempotency_key();
        self.queue.handle_model_deletion(T::MODEL_TYPE, id, &payload, true, &key, None, None).await?;
        self.store.delete_row(T::MODEL_TYPE, id).await?;
        self.queue.update_model_sync_status(&self.store, T::MODEL_TYPE, id).await?;
        let _ = self.changes.send(ModelChange::Deleted(id.to_string()));
        Ok(())
    }

    async fn delete_remote_first(&self, id: &str, ctx: DeletionContext) -> Result<()> {
        self.cascade_delete_children(id, SavePolicy::RemoteFirst, ctx).await;

        let adapter = self.require_adapter()?;
        let id_owned = id.to_string();
        let result = self
            .request_queue
            .enqueue(
                NetworkTask::new(crate::id::generate_idempotency_key(), Operation::Delete, T::MODEL_TYPE, id, move || async move {
                    adapter.delete_one(&id_owned, &RequestMeta::default()).await
                }),
                Some(QueueKind::Foreground),
            )
            .await;

        match result {
            Ok(()) | Err(Error::Gone(_)) => {
                let key = crate::id::generate_idempotency_key();
                let payload = format!(r#"{{"id":{}}}"#, serde_json::to_string(id)?);
                self.queue.handle_model_deletion(T::MODEL_TYPE, id, &payload, false, &key, None, None).await?;
                self.store.delete_row(T::MODEL_TYPE, id).await?;
                self.queue.update_model_sync_status(&self.store, T::MODEL_TYPE, id).await?;
                let _ = self.changes.send(ModelChange::Deleted(id.to_string()));
                Ok(())
            }
            Err(err @ Error::Offline(_)) | Err(err @ Error::ApiException { .. }) => {
                let _ = self.changes.send(ModelChange::Error(err.to_string()));
                Err(err)
            }
            Err(err) => {
                let wrapped = Error::Network(err.to_string());
                let _ = self.changes.send(ModelChange::Error(wrapped.to_string()));
                Err(wrapped)
            }
        }
    }

    async fn cascade_delete_children(&self, id: &str, save_policy: SavePolicy, ctx: DeletionContext) {
        for relation in self.model_registry.cascade_delete_relations(T::MODEL_TYPE) {
            let Some(child_repo) = self.repositories.get(&relation.target_type).await else {
                tracing::warn!(target_type = relation.target_type, "cascade delete: no repository registered for target type");
                continue;
            };

            let params = QueryParams::filter_eq(&relation.mapped_by, id);
            let children = match self.store.query_rows(&relation.target_type, &params).await {
                Ok(rows) => rows,
                Err(err) => {
                    tracing::warn!(%err, target_type = relation.target_type, "cascade delete: failed to query children");
                    continue;
                }
            };

            for child in children {
                let Some(child_id) = child.get("id").and_then(|v| v.as_str()) else { continue };
                if let Err(err) = child_repo.cascade_delete(child_id, save_policy, ctx.clone()).await {
                    tracing::warn!(%err, target_type = relation.target_type, child_id, "cascade delete of child failed");
                }
            }
        }
    }

    /// §4.5 `handleCascadeDeleteAfterGone`: cascades with `remoteFirst`
    /// (children are assumed already-gone on the server), then cleans up
    /// local state the same way a successful `remoteFirst` delete would.
    async fn handle_cascade_delete_after_gone(&self, id: &str) -> Result<()> {
        let ctx = new_deletion_context();
        ctx.lock().unwrap().insert((T::MODEL_TYPE.to_string(), id.to_string()));
        self.cascade_delete_children(id, SavePolicy::RemoteFirst, ctx).await;

        let key = crate::id::generate_idempotency_key();
        let payload = format!(r#"{{"id":{}}}"#, serde_json::to_string(id)?);
        self.queue.handle_model_deletion(T::MODEL_TYPE, id, &payload, false, &key, None, None).await?;
        self.store.delete_row(T::MODEL_TYPE, id).await?;
        self.queue.update_model_sync_status(&self.store, T::MODEL_TYPE, id).await?;
        let _ = self.changes.send(ModelChange::Deleted(id.to_string()));
        Ok(())
    }

    pub async fn truncate_local(&self) -> Result<()> {
        self.store.truncate(T::MODEL_TYPE).await?;
        let _ = self.changes.send(ModelChange::Deleted("*".to_string()));
        Ok(())
    }
}

#[async_trait]
impl<T: Model> DeletableRepository for Repository<T> {
    async fn cascade_delete(&self, id: &str, save_policy: SavePolicy, deletion_context: DeletionContext) -> Result<()> {
        self.delete_with_context(id, save_policy, deletion_context).await
    }

    async fn truncate_local(&self) -> Result<()> {
        Repository::truncate_local(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::connectivity::WatchConnectivity;
    use crate::model::SyncStatus;
    use crate::queue::store::run_migrations;
    use crate::registry::CascadeDeleteRelation;
    use crate::store::SqliteStore;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Note {
        id: String,
        title: String,
        #[serde(rename = "createdAt")]
        created_at: Option<chrono::DateTime<Utc>>,
        #[serde(rename = "updatedAt")]
        updated_at: Option<chrono::DateTime<Utc>>,
        #[serde(rename = "lastSyncedAt")]
        last_synced_at: Option<chrono::DateTime<Utc>>,
        #[serde(rename = "syncStatus", default = "default_sync_status")]
        sync_status: SyncStatus,
    }

    fn default_sync_status() -> SyncStatus {
        SyncStatus::Pending
    }

    impl Model for Note {
        const MODEL_TYPE: &'static str = "Note";

        fn id(&self) -> &str {
            &self.id
        }
        fn set_id(&mut self, id: String) {
            self.id = id;
        }
        fn created_at(&self) -> Option<chrono::DateTime<Utc>> {
            self.created_at
        }
        fn set_created_at(&mut self, at: Option<chrono::DateTime<Utc>>) {
            self.created_at = at;
        }
        fn updated_at(&self) -> Option<chrono::DateTime<Utc>> {
            self.updated_at
        }
        fn set_updated_at(&mut self, at: Option<chrono::DateTime<Utc>>) {
            self.updated_at = at;
        }
        fn last_synced_at(&self) -> Option<chrono::DateTime<Utc>> {
            self.last_synced_at
        }
        fn set_last_synced_at(&mut self, at: Option<chrono::DateTime<Utc>>) {
            self.last_synced_at = at;
        }
        fn sync_status(&self) -> SyncStatus {
            self.sync_status
        }
        fn set_sync_status(&mut self, status: SyncStatus) {
            self.sync_status = status;
        }
        fn to_json(&self) -> serde_json::Result<Value> {
            serde_json::to_value(self)
        }
        fn from_json(value: &Value) -> serde_json::Result<Self> {
            serde_json::from_value(value.clone())
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Task {
        id: String,
        project_id: String,
        #[serde(rename = "createdAt")]
        created_at: Option<chrono::DateTime<Utc>>,
        #[serde(rename = "updatedAt")]
        updated_at: Option<chrono::DateTime<Utc>>,
        #[serde(rename = "lastSyncedAt")]
        last_synced_at: Option<chrono::DateTime<Utc>>,
        #[serde(rename = "syncStatus", default = "default_sync_status")]
        sync_status: SyncStatus,
    }

    impl Model for Task {
        const MODEL_TYPE: &'static str = "Task";

        fn id(&self) -> &str {
            &self.id
        }
        fn set_id(&mut self, id: String) {
            self.id = id;
        }
        fn created_at(&self) -> Option<chrono::DateTime<Utc>> {
            self.created_at
        }
        fn set_created_at(&mut self, at: Option<chrono::DateTime<Utc>>) {
            self.created_at = at;
        }
        fn updated_at(&self) -> Option<chrono::DateTime<Utc>> {
            self.updated_at
        }
        fn set_updated_at(&mut self, at: Option<chrono::DateTime<Utc>>) {
            self.updated_at = at;
        }
        fn last_synced_at(&self) -> Option<chrono::DateTime<Utc>> {
            self.last_synced_at
        }
        fn set_last_synced_at(&mut self, at: Option<chrono::DateTime<Utc>>) {
            self.last_synced_at = at;
        }
        fn sync_status(&self) -> SyncStatus {
            self.sync_status
        }
        fn set_sync_status(&mut self, status: SyncStatus) {
            self.sync_status = status;
        }
        fn to_json(&self) -> serde_json::Result<Value> {
            serde_json::to_value(self)
        }
        fn from_json(value: &Value) -> serde_json::Result<Self> {
            serde_json::from_value(value.clone())
        }
    }

    async fn note_repo() -> (Arc<Repository<Note>>, Arc<dyn Store>, Arc<SyncQueueDao>) {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        let queue = Arc::new(SyncQueueDao::new(pool.clone()));
        let store: Arc<dyn Store> = Arc::new(SqliteStore::new(pool).await.unwrap());
        let config = Arc::new(EngineConfig::default());
        let connectivity = Arc::new(WatchConnectivity::new(true));
        let request_queue = RequestQueueManager::new(config.clone(), connectivity);
        let registry = Arc::new(ModelInfoRegistry::new());
        let repositories = RepositoryRegistry::new();
        let repo = Repository::<Note>::new(store.clone(), queue.clone(), None, request_queue, registry, repositories, None, config);
        (repo, store, queue)
    }

    #[tokio::test]
    async fn save_then_find_one_local_only_roundtrips() {
        let (repo, _store, _queue) = note_repo().await;
        let note = Note { id: "n1".into(), title: "hi".into(), created_at: None, updated_at: None, last_synced_at: None, sync_status: SyncStatus::Pending };
        repo.save(note, Some(SavePolicy::LocalFirst), true).await.unwrap();

        let found = repo.find_one("n1", Some(LoadPolicy::LocalOnly), None).await.unwrap().unwrap();
        assert_eq!(found.title, "hi");
        assert!(found.created_at.is_some());
        assert!(found.updated_at.is_some());
    }

    #[tokio::test]
    async fn local_only_save_without_adapter_still_queues_row() {
        let (repo, _store, queue) = note_repo().await;
        let note = Note { id: "n1".into(), title: "hi".into(), created_at: None, updated_at: None, last_synced_at: None, sync_status: SyncStatus::Pending };
        repo.save(note, Some(SavePolicy::LocalFirst), true).await.unwrap();
        let rows = queue.get_by_model("Note", "n1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].op, SyncOp::Create);
    }

    #[tokio::test]
    async fn delete_local_first_removes_row_and_queues_delete() {
        let (repo, store, queue) = note_repo().await;
        let note = Note { id: "n1".into(), title: "hi".into(), created_at: None, updated_at: None, last_synced_at: None, sync_status: SyncStatus::Pending };
        repo.save(note, Some(SavePolicy::LocalFirst), true).await.unwrap();
        queue.clear_all().await.unwrap();

        repo.delete("n1", Some(SavePolicy::LocalFirst), None).await.unwrap();
        assert!(store.get_row("Note", "n1").await.unwrap().is_none());
        let rows = queue.get_by_model("Note", "n1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].op, SyncOp::Delete);
    }

    #[tokio::test]
    async fn cascade_delete_removes_children() {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        let queue = Arc::new(SyncQueueDao::new(pool.clone()));
        let store: Arc<dyn Store> = Arc::new(SqliteStore::new(pool).await.unwrap());
        let config = Arc::new(EngineConfig::default());
        let connectivity = Arc::new(WatchConnectivity::new(true));
        let request_queue = RequestQueueManager::new(config.clone(), connectivity);

        let mut model_registry = ModelInfoRegistry::new();
        model_registry.register_cascade_delete(
            "Note",
            CascadeDeleteRelation { field_name: "tasks".into(), target_type: "Task".into(), mapped_by: "project_id".into() },
        );
        let model_registry = Arc::new(model_registry);
        let repositories = RepositoryRegistry::new();

        let task_repo = Repository::<Task>::new(
            store.clone(),
            queue.clone(),
            None,
            request_queue.clone(),
            model_registry.clone(),
            repositories.clone(),
            None,
            config.clone(),
        );
        repositories.register("Task", task_repo.clone()).await;

        let project_repo =
            Repository::<Note>::new(store.clone(), queue.clone(), None, request_queue, model_registry, repositories, None, config);

        store.upsert_row("Task", "t1", json!({"id": "t1", "project_id": "p1"})).await.unwrap();
        store.upsert_row("Task", "t2", json!({"id": "t2", "project_id": "other"})).await.unwrap();
        store.upsert_row("Note", "p1", json!({"id": "p1", "title": "root"})).await.unwrap();

        project_repo.delete("p1", Some(SavePolicy::LocalFirst), None).await.unwrap();

        assert!(store.get_row("Note", "p1").await.unwrap().is_none());
        assert!(store.get_row("Task", "t1").await.unwrap().is_none());
        assert!(store.get_row("Task", "t2").await.unwrap().is_some());
    }
}
