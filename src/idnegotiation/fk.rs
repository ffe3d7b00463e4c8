//! `ForeignKeyUpdateService`: rewrites every row referencing a replaced id
//! (§4.6 atomic replacement, step 4).

use std::sync::Arc;

use crate::error::Result;
use crate::registry::ModelInfoRegistry;
use crate::store::Store;

pub struct ForeignKeyUpdateService {
    store: Arc<dyn Store>,
    registry: Arc<ModelInfoRegistry>,
}

impl ForeignKeyUpdateService {
    pub fn new(store: Arc<dyn Store>, registry: Arc<ModelInfoRegistry>) -> Self {
        Self { store, registry }
    }

    /// For every relation referencing `model_type`, issues the rewrite and
    /// returns the total number of rows changed.
    pub async fn update_references(&self, model_type: &str, old_id: &str, new_id: &str) -> Result<u64> {
        let mut total = 0u64;
        for relation in self.registry.foreign_key_relations(model_type) {
            let changed = self
                .store
                .rewrite_foreign_key(&relation.source_type, &relation.fk_column, old_id, new_id)
                .await?;
            if changed > 0 {
                tracing::debug!(
                    source_type = relation.source_type,
                    fk_column = relation.fk_column,
                    old_id,
                    new_id,
                    changed,
                    "rewrote foreign key references"
                );
            }
            total += changed;
        }
        Ok(total)
    }

    /// Post-validation (§4.6 step 5): counts rows still referencing `old_id`
    /// across all declared relations for `model_type`. Non-zero is logged
    /// as a warning, never rolled back.
    pub async fn count_stale_references(&self, model_type: &str, old_id: &str) -> Result<u64> {
        let mut total = 0u64;
        for relation in self.registry.foreign_key_relations(model_type) {
            total += self.store.count_foreign_key_references(&relation.source_type, &relation.fk_column, old_id).await?;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{CascadeDeleteRelation, ForeignKeyRelation};
    use crate::store::SqliteStore;
    use serde_json::json;

    #[tokio::test]
    async fn rewrites_all_referencing_rows() {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        let store: Arc<dyn Store> = Arc::new(SqliteStore::new(pool).await.unwrap());
        store.upsert_row("Task", "t1", json!({"id": "t1", "project_id": "tmp1"})).await.unwrap();
        store.upsert_row("Task", "t2", json!({"id": "t2", "project_id": "other"})).await.unwrap();

        let mut registry = ModelInfoRegistry::new();
        registry.register_foreign_key(
            "Project",
            ForeignKeyRelation { source_type: "Task".into(), fk_column: "project_id".into(), target_type: "Project".into() },
        );
        let _ = CascadeDeleteRelation { field_name: "x".into(), target_type: "y".into(), mapped_by: "z".into() };
        let registry = Arc::new(registry);

        let service = ForeignKeyUpdateService::new(store.clone(), registry);
        let changed = service.update_references("Project", "tmp1", "srv1").await.unwrap();
        assert_eq!(changed, 1);

        let t1 = store.get_row("Task", "t1").await.unwrap().unwrap();
        assert_eq!(t1["project_id"], "srv1");
        let t2 = store.get_row("Task", "t2").await.unwrap().unwrap();
        assert_eq!(t2["project_id"], "other");

        assert_eq!(service.count_stale_references("Project", "tmp1").await.unwrap(), 0);
    }
}
