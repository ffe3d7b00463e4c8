//! §6 "Store contract" — the underlying relational store is an external
//! collaborator (a generic SQL engine with transactions, reactive change
//! notifications, and parameterized queries). Only its contract is in
//! scope; the per-model table/DAO/codec generator that sits on top of it
//! is out of scope (§1). `SqliteStore` below is a concrete, generic
//! stand-in good enough to exercise the coordination layer end-to-end in
//! tests, using a single physical table keyed by `(model_type, id)` rather
//! than the generated one-table-per-model schema a real deployment would use.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::{Row, SqlitePool};
use tokio::sync::broadcast;

use crate::error::Result;
use crate::model::SyncStatus;
use crate::query::QueryParams;

/// A change committed to a watched table, re-queried by subscribers.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub model_type: String,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn get_row(&self, model_type: &str, id: &str) -> Result<Option<Value>>;
    async fn query_rows(&self, model_type: &str, params: &QueryParams) -> Result<Vec<Value>>;
    async fn upsert_row(&self, model_type: &str, id: &str, row: Value) -> Result<()>;
    async fn delete_row(&self, model_type: &str, id: &str) -> Result<()>;
    async fn truncate(&self, model_type: &str) -> Result<()>;
    async fn update_sync_status(&self, model_type: &str, id: &str, status: SyncStatus) -> Result<()>;

    /// Rewrites a row's primary key in place (used by atomic id replacement, §4.6).
    async fn rekey_row(&self, model_type: &str, old_id: &str, new_id: &str) -> Result<()>;

    /// Counts rows of `model_type` whose `fk_field` equals `value` (§4.6 FK
    /// pre/post-validation).
    async fn count_foreign_key_references(&self, model_type: &str, fk_field: &str, value: &str) -> Result<u64>;

    /// Rewrites `fk_field` from `old_value` to `new_value` on every row of
    /// `model_type` that references it, returning the number of rows
    /// changed (the `ForeignKeyUpdateService`'s primitive, §4.6 step 4).
    async fn rewrite_foreign_key(&self, model_type: &str, fk_field: &str, old_value: &str, new_value: &str) -> Result<u64>;

    /// Subscribes to committed changes for a model type (§6 reactive subscription).
    fn watch(&self, model_type: &str) -> broadcast::Receiver<ChangeEvent>;
}

pub struct SqliteStore {
    pool: SqlitePool,
    changes: broadcast::Sender<ChangeEvent>,
}

impl SqliteStore {
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS model_rows (
                model_type TEXT NOT NULL,
                id TEXT NOT NULL,
                data TEXT NOT NULL,
                sync_status TEXT NOT NULL DEFAULT 'synced',
                created_at TEXT,
                updated_at TEXT,
                last_synced_at TEXT,
                PRIMARY KEY (model_type, id)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let (tx, _rx) = broadcast::channel(256);
        Ok(Self { pool, changes: tx })
    }

    fn notify(&self, model_type: &str) {
        let _ = self.changes.send(ChangeEvent { model_type: model_type.to_string() });
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn get_row(&self, model_type: &str, id: &str) -> Result<Option<Value>> {
        let row = sqlx::query("SELECT data FROM model_rows WHERE model_type = ? AND id = ?")
            .bind(model_type)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| {
            let data: String = r.get("data");
            serde_json::from_str(&data).map_err(Into::into)
        })
        .transpose()
    }

    async fn query_rows(&self, model_type: &str, params: &QueryParams) -> Result<Vec<Value>> {
        let rows = sqlx::query("SELECT data FROM model_rows WHERE model_type = ?")
            .bind(model_type)
            .fetch_all(&self.pool)
            .await?;
        let mut values = rows
            .iter()
            .map(|r| {
                let data: String = r.get("data");
                serde_json::from_str::<Value>(&data).map_err(Into::into)
            })
            .collect::<Result<Vec<_>>>()?;

        values.retain(|v| params.matches(v));

        for sort in params.sorts.iter().rev() {
            values.sort_by(|a, b| {
                let av = a.get(&sort.field);
                let bv = b.get(&sort.field);
                let ord = av
                    .and_then(|v| v.as_f64())
                    .partial_cmp(&bv.and_then(|v| v.as_f64()))
                    .unwrap_or(std::cmp::Ordering::Equal);
                match sort.direction {
                    crate::query::SortDirection::Ascending => ord,
                    crate::query::SortDirection::Descending => ord.reverse(),
                }
            });
        }

        if let Some(offset) = params.offset {
            values = values.into_iter().skip(offset as usize).collect();
        }
        if let Some(limit) = params.limit {
            values.truncate(limit as usize);
        }

        Ok(values)
    }

    async fn upsert_row(&self, model_type: &str, id: &str, row: Value) -> Result<()> {
        let data = serde_json::to_string(&row)?;
        let created_at = row.get("createdAt").and_then(|v| v.as_str()).map(String::from);
        let updated_at = row.get("updatedAt").and_then(|v| v.as_str()).map(String::from);
        let last_synced_at = row.get("lastSyncedAt").and_then(|v| v.as_str()).map(String::from);
        let sync_status = row
            .get("syncStatus")
            .and_then(|v| v.as_str())
            .unwrap_or("synced")
            .to_string();

        sqlx::query(
            "INSERT INTO model_rows (model_type, id, data, sync_status, created_at, updated_at, last_synced_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(model_type, id) DO UPDATE SET \
                data = excluded.data, sync_status = excluded.sync_status, \
                created_at = excluded.created_at, updated_at = excluded.updated_at, \
                last_synced_at = excluded.last_synced_at",
        )
        .bind(model_type)
        .bind(id)
        .bind(data)
        .bind(sync_status)
        .bind(created_at)
        .bind(updated_at)
        .bind(last_synced_at)
        .execute(&self.pool)
        .await?;

        self.notify(model_type);
        Ok(())
    }

    async fn delete_row(&self, model_type: &str, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM model_rows WHERE model_type = ? AND id = ?")
            .bind(model_type)
            .bind(id)
            .execute(&self.pool)
            .await?;
        self.notify(model_type);
        Ok(())
    }

    async fn truncate(&self, model_type: &str) -> Result<()> {
        sqlx::query("DELETE FROM model_rows WHERE model_type = ?")
            .bind(model_type)
            .execute(&self.pool)
            .await?;
        self.notify(model_type);
        Ok(())
    }

    async fn update_sync_status(&self, model_type: &str, id: &str, status: SyncStatus) -> Result<()> {
        sqlx::query("UPDATE model_rows SET sync_status = ? WHERE model_type = ? AND id = ?")
            .bind(status.as_str())
            .bind(model_type)
            .bind(id)
            .execute(&self.pool)
            .await?;
        self.notify(model_type);
        Ok(())
    }

    async fn rekey_row(&self, model_type: &str, old_id: &str, new_id: &str) -> Result<()> {
        let Some(row) = sqlx::query("SELECT data FROM model_rows WHERE model_type = ? AND id = ?")
            .bind(model_type)
            .bind(old_id)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(());
        };
        let data: String = row.get("data");
        let mut json: Value = serde_json::from_str(&data)?;
        json["id"] = Value::String(new_id.to_string());
        let data = serde_json::to_string(&json)?;

        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "UPDATE model_rows SET id = ?, data = ?, last_synced_at = ? WHERE model_type = ? AND id = ?",
        )
        .bind(new_id)
        .bind(data)
        .bind(now)
        .bind(model_type)
        .bind(old_id)
        .execute(&self.pool)
        .await?;
        self.notify(model_type);
        Ok(())
    }

    async fn count_foreign_key_references(&self, model_type: &str, fk_field: &str, value: &str) -> Result<u64> {
        let rows = sqlx::query("SELECT data FROM model_rows WHERE model_type = ?")
            .bind(model_type)
            .fetch_all(&self.pool)
            .await?;
        let mut count = 0u64;
        for r in &rows {
            let data: String = r.get("data");
            let json: Value = serde_json::from_str(&data)?;
            if json.get(fk_field).and_then(|v| v.as_str()) == Some(value) {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn rewrite_foreign_key(&self, model_type: &str, fk_field: &str, old_value: &str, new_value: &str) -> Result<u64> {
        let rows = sqlx::query("SELECT id, data FROM model_rows WHERE model_type = ?")
            .bind(model_type)
            .fetch_all(&self.pool)
            .await?;

        let mut changed = 0u64;
        let mut tx = self.pool.begin().await?;
        for r in &rows {
            let id: String = r.get("id");
            let data: String = r.get("data");
            let mut json: Value = serde_json::from_str(&data)?;
            if json.get(fk_field).and_then(|v| v.as_str()) == Some(old_value) {
                json[fk_field] = Value::String(new_value.to_string());
                let updated = serde_json::to_string(&json)?;
                sqlx::query("UPDATE model_rows SET data = ? WHERE model_type = ? AND id = ?")
                    .bind(updated)
                    .bind(model_type)
                    .bind(&id)
                    .execute(&mut *tx)
                    .await?;
                changed += 1;
            }
        }
        tx.commit().await?;
        if changed > 0 {
            self.notify(model_type);
        }
        Ok(changed)
    }

    fn watch(&self, model_type: &str) -> broadcast::Receiver<ChangeEvent> {
        let _ = model_type;
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn store() -> SqliteStore {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        SqliteStore::new(pool).await.unwrap()
    }

    #[tokio::test]
    async fn upsert_then_get_roundtrips() {
        let store = store().await;
        store.upsert_row("Note", "A", json!({"id": "A", "title": "hi"})).await.unwrap();
        let row = store.get_row("Note", "A").await.unwrap().unwrap();
        assert_eq!(row["title"], "hi");
    }

    #[tokio::test]
    async fn delete_removes_row() {
        let store = store().await;
        store.upsert_row("Note", "A", json!({"id": "A"})).await.unwrap();
        store.delete_row("Note", "A").await.unwrap();
        assert!(store.get_row("Note", "A").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rekey_moves_row_under_new_id() {
        let store = store().await;
        store.upsert_row("Note", "tmp1", json!({"id": "tmp1"})).await.unwrap();
        store.rekey_row("Note", "tmp1", "srv1").await.unwrap();
        assert!(store.get_row("Note", "tmp1").await.unwrap().is_none());
        let row = store.get_row("Note", "srv1").await.unwrap().unwrap();
        assert_eq!(row["id"], "srv1");
    }
}
