//! `IdConflictResolver`: strategies for resolving a collision between a
//! temporary client id and a server-proposed id (§4.6).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::queue::store::SyncQueueDao;
use crate::queue::IdNegotiationStatus;
use crate::registry::ModelInfoRegistry;
use crate::store::Store;

pub struct IdConflictResolver {
    store: Arc<dyn Store>,
    queue: Arc<SyncQueueDao>,
    registry: Arc<ModelInfoRegistry>,
    config: Arc<EngineConfig>,
}

enum Attempt {
    Resolved(String),
    Retry { after: std::time::Duration },
    Conflicted,
}

impl IdConflictResolver {
    pub fn new(store: Arc<dyn Store>, queue: Arc<SyncQueueDao>, registry: Arc<ModelInfoRegistry>, config: Arc<EngineConfig>) -> Self {
        Self { store, queue, registry, config }
    }

    pub async fn resolve_id_conflict(&self, model_type: &str, temporary_id: &str, proposed_server_id: &str) -> Result<String> {
        for attempt in 1..=self.config.max_id_conflict_attempts {
            match self.try_resolve(model_type, temporary_id, proposed_server_id, attempt).await? {
                Attempt::Resolved(id) => return Ok(id),
                Attempt::Retry { after } => {
                    tokio::time::sleep(after).await;
                    continue;
                }
                Attempt::Conflicted => {
                    let error = format!(
                        "id conflict for {model_type}/{temporary_id}: server proposed {proposed_server_id}, no merge strategy applied"
                    );
                    for item in self.queue.get_by_model(model_type, temporary_id).await? {
                        self.queue
                            .set_id_negotiation_status(item.id, IdNegotiationStatus::Conflict, Some(&error))
                            .await?;
                    }
                    return Err(Error::IdConflict(error));
                }
            }
        }
        Err(Error::IdConflict(format!(
            "id conflict for {model_type}/{temporary_id} could not be resolved after {} attempts",
            self.config.max_id_conflict_attempts
        )))
    }

    async fn try_resolve(&self, model_type: &str, temporary_id: &str, proposed_server_id: &str, attempt: u32) -> Result<Attempt> {
        let Some(existing) = self.store.get_row(model_type, proposed_server_id).await? else {
            return Ok(Attempt::Resolved(proposed_server_id.to_string()));
        };
        let Some(temp) = self.store.get_row(model_type, temporary_id).await? else {
            return Ok(Attempt::Resolved(proposed_server_id.to_string()));
        };

        if self.deadlock_potential(model_type).await? {
            let delay = std::time::Duration::from_secs(2 * 2u64.pow(attempt));
            tracing::warn!(model_type, temporary_id, "deadlock potential detected, deferring id-conflict resolution");
            return Ok(Attempt::Retry { after: delay });
        }

        // 1: byte-identical ignoring id/created_at/updated_at/sync_status.
        if records_equivalent(&existing, &temp) {
            self.store.delete_row(model_type, temporary_id).await?;
            return Ok(Attempt::Resolved(proposed_server_id.to_string()));
        }

        // 2: existing record is itself temporary (under negotiation).
        if self.is_under_negotiation(model_type, proposed_server_id).await? {
            return Ok(Attempt::Retry { after: std::time::Duration::from_secs(2u64.pow(attempt)) });
        }

        // 3: timestamp-based merge.
        if let (Some(temp_created), Some(existing_created)) = (parse_created_at(&temp), parse_created_at(&existing)) {
            if temp_created > existing_created {
                let merged = merge_non_system_fields(&existing, &temp);
                self.store.upsert_row(model_type, proposed_server_id, merged).await?;
                self.store.delete_row(model_type, temporary_id).await?;
                return Ok(Attempt::Resolved(proposed_server_id.to_string()));
            }
        }

        Ok(Attempt::Conflicted)
    }

    async fn is_under_negotiation(&self, model_type: &str, model_id: &str) -> Result<bool> {
        let items = self.queue.get_by_model(model_type, model_id).await?;
        Ok(items.iter().any(|i| {
            matches!(
                i.id_negotiation_status,
                Some(IdNegotiationStatus::Pending) | Some(IdNegotiationStatus::InProgress)
            )
        }))
    }

    /// Heuristic: more than `deadlock_pending_task_threshold` pending tasks
    /// on any cascade-related model type for `model_type`.
    async fn deadlock_potential(&self, model_type: &str) -> Result<bool> {
        for relation in self.registry.cascade_delete_relations(model_type) {
            let pending = self.queue.get_by_type(&relation.target_type).await?;
            if pending.len() > self.config.deadlock_pending_task_threshold {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

const SYSTEM_FIELDS: &[&str] = &["id", "createdAt", "updatedAt", "syncStatus"];

fn field_equivalent(a: Option<&Value>, b: Option<&Value>) -> bool {
    let normalize = |v: Option<&Value>| match v {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    };
    normalize(a) == normalize(b)
}

fn records_equivalent(existing: &Value, temp: &Value) -> bool {
    let mut fields: std::collections::HashSet<&str> = std::collections::HashSet::new();
    if let (Some(e), Some(t)) = (existing.as_object(), temp.as_object()) {
        fields.extend(e.keys().map(|s| s.as_str()));
        fields.extend(t.keys().map(|s| s.as_str()));
    }
    fields.into_iter().filter(|f| !SYSTEM_FIELDS.contains(f)).all(|field| field_equivalent(existing.get(field), temp.get(field)))
}

fn merge_non_system_fields(existing: &Value, temp: &Value) -> Value {
    let mut merged = existing.clone();
    if let (Some(merged_obj), Some(temp_obj)) = (merged.as_object_mut(), temp.as_object()) {
        for (key, value) in temp_obj {
            if SYSTEM_FIELDS.contains(&key.as_str()) {
                continue;
            }
            if !value.is_null() {
                merged_obj.insert(key.clone(), value.clone());
            }
        }
        merged_obj.insert("updatedAt".to_string(), Value::String(Utc::now().to_rfc3339()));
    }
    merged
}

fn parse_created_at(row: &Value) -> Option<DateTime<Utc>> {
    row.get("createdAt")?.as_str().and_then(|s| DateTime::parse_from_rfc3339(s).ok()).map(|d| d.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::store::{run_migrations, SyncQueueDao};
    use crate::store::SqliteStore;
    use serde_json::json;

    async fn harness() -> (IdConflictResolver, Arc<dyn Store>) {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        let queue = Arc::new(SyncQueueDao::new(pool.clone()));
        let store: Arc<dyn Store> = Arc::new(SqliteStore::new(pool).await.unwrap());
        let registry = Arc::new(ModelInfoRegistry::new());
        let config = Arc::new(EngineConfig::default());
        (IdConflictResolver::new(store.clone(), queue, registry, config), store)
    }

    #[tokio::test]
    async fn identical_records_merge_by_deleting_temp() {
        let (resolver, store) = harness().await;
        store.upsert_row("Note", "srv1", json!({"id": "srv1", "title": "a"})).await.unwrap();
        store.upsert_row("Note", "tmp1", json!({"id": "tmp1", "title": "a"})).await.unwrap();

        let resolved = resolver.resolve_id_conflict("Note", "tmp1", "srv1").await.unwrap();
        assert_eq!(resolved, "srv1");
        assert!(store.get_row("Note", "tmp1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn newer_temp_record_wins_timestamp_merge() {
        let (resolver, store) = harness().await;
        let t1 = Utc::now() - chrono::Duration::hours(1);
        let t2 = Utc::now();
        store
            .upsert_row("Note", "srv1", json!({"id": "srv1", "title": "old", "createdAt": t1.to_rfc3339()}))
            .await
            .unwrap();
        store
            .upsert_row("Note", "tmp1", json!({"id": "tmp1", "title": "new", "createdAt": t2.to_rfc3339()}))
            .await
            .unwrap();

        let resolved = resolver.resolve_id_conflict("Note", "tmp1", "srv1").await.unwrap();
        assert_eq!(resolved, "srv1");
        assert!(store.get_row("Note", "tmp1").await.unwrap().is_none());
        let merged = store.get_row("Note", "srv1").await.unwrap().unwrap();
        assert_eq!(merged["title"], "new");
    }

    #[tokio::test]
    async fn unmergeable_conflict_raises_id_conflict() {
        let (resolver, store) = harness().await;
        let t1 = Utc::now();
        let t2 = Utc::now() - chrono::Duration::hours(1);
        store
            .upsert_row("Note", "srv1", json!({"id": "srv1", "title": "existing", "createdAt": t1.to_rfc3339()}))
            .await
            .unwrap();
        store
            .upsert_row("Note", "tmp1", json!({"id": "tmp1", "title": "mine", "createdAt": t2.to_rfc3339()}))
            .await
            .unwrap();

        let result = resolver.resolve_id_conflict("Note", "tmp1", "srv1").await;
        assert!(matches!(result, Err(Error::IdConflict(_))));
    }
}
