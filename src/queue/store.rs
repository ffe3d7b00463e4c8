//! The sync queue's DAO: durable CRUD plus the smart-merge primitives that
//! keep invariants I1-I3 (§3, §4.1).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use crate::error::{Error, Result};
use crate::model::SyncStatus;
use crate::queue::{IdNegotiationStatus, QueueItemStatus, SmartDeleteOutcome, SyncOp, SyncQueueItem};
use crate::store::Store;

/// Runs the migration that creates `sync_queue_items` (§6 persisted-state
/// column list) if it does not already exist.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_queue_items (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            model_type TEXT NOT NULL,
            model_id TEXT NOT NULL,
            op TEXT NOT NULL CHECK(op IN ('create','update','delete')),
            payload TEXT NOT NULL,
            attempt_count INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            next_retry_at TEXT,
            idempotency_key TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending' CHECK(status IN ('pending','processing','dead')),
            created_at TEXT NOT NULL,
            headers TEXT,
            extra TEXT,
            temporary_client_id TEXT,
            id_negotiation_status TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_sync_queue_model ON sync_queue_items(model_type, model_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

pub struct SyncQueueDao {
    pool: SqlitePool,
}

fn row_to_item(row: &sqlx::sqlite::SqliteRow) -> Result<SyncQueueItem> {
    let op: String = row.try_get("op")?;
    let status: String = row.try_get("status")?;
    let id_neg: Option<String> = row.try_get("id_negotiation_status")?;
    let created_at: String = row.try_get("created_at")?;
    let next_retry_at: Option<String> = row.try_get("next_retry_at")?;

    Ok(SyncQueueItem {
        id: row.try_get("id")?,
        model_type: row.try_get("model_type")?,
        model_id: row.try_get("model_id")?,
        op: SyncOp::parse(&op).ok_or_else(|| Error::Database(format!("bad op {op}")))?,
        payload: row.try_get("payload")?,
        attempt_count: row.try_get::<i64, _>("attempt_count")? as u32,
        last_error: row.try_get("last_error")?,
        next_retry_at: next_retry_at
            .map(|s| DateTime::parse_from_rfc3339(&s).map(|d| d.with_timezone(&Utc)))
            .transpose()
            .map_err(|e| Error::Serialization(e.to_string()))?,
        idempotency_key: row.try_get("idempotency_key")?,
        status: QueueItemStatus::parse(&status).ok_or_else(|| Error::Database(format!("bad status {status}")))?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map_err(|e| Error::Serialization(e.to_string()))?
            .with_timezone(&Utc),
        headers: row.try_get("headers")?,
        extra: row.try_get("extra")?,
        temporary_client_id: row.try_get("temporary_client_id")?,
        id_negotiation_status: id_neg.and_then(|s| IdNegotiationStatus::parse(&s)),
    })
}

impl SyncQueueDao {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Option<SyncQueueItem>> {
        let row = sqlx::query("SELECT * FROM sync_queue_items WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_item).transpose()
    }

    pub async fn get_by_model(&self, model_type: &str, model_id: &str) -> Result<Vec<SyncQueueItem>> {
        let rows = sqlx::query(
            "SELECT * FROM sync_queue_items WHERE model_type = ? AND model_id = ? ORDER BY id ASC",
        )
        .bind(model_type)
        .bind(model_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_item).collect()
    }

    pub async fn get_by_type(&self, model_type: &str) -> Result<Vec<SyncQueueItem>> {
        let rows = sqlx::query("SELECT * FROM sync_queue_items WHERE model_type = ? ORDER BY id ASC")
            .bind(model_type)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_item).collect()
    }

    pub async fn get_all_items(&self) -> Result<Vec<SyncQueueItem>> {
        let rows = sqlx::query("SELECT * FROM sync_queue_items ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_item).collect()
    }

    /// Due tasks: `next_retry_at IS NULL OR <= now`, status != dead.
    pub async fn get_due_tasks(&self, now: DateTime<Utc>) -> Result<Vec<SyncQueueItem>> {
        let rows = sqlx::query(
            "SELECT * FROM sync_queue_items \
             WHERE status != 'dead' AND (next_retry_at IS NULL OR next_retry_at <= ?) \
             ORDER BY id ASC",
        )
        .bind(now.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_item).collect()
    }

    /// All non-dead items, ignoring `next_retry_at` (used for `forceSync`, §4.4 step 1).
    pub async fn get_all_non_dead(&self) -> Result<Vec<SyncQueueItem>> {
        let rows = sqlx::query("SELECT * FROM sync_queue_items WHERE status != 'dead' ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_item).collect()
    }

    pub async fn find_pending_sync_task(
        &self,
        model_type: &str,
        model_id: &str,
        op: SyncOp,
    ) -> Result<Option<i64>> {
        let row = sqlx::query(
            "SELECT id FROM sync_queue_items \
             WHERE model_type = ? AND model_id = ? AND op = ? AND status != 'dead' \
             LIMIT 1",
        )
        .bind(model_type)
        .bind(model_id)
        .bind(op.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get::<i64, _>("id")))
    }

    pub async fn delete(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM sync_queue_items WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_dead(&self, id: i64, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE sync_queue_items SET status = 'dead', last_error = ?, next_retry_at = NULL WHERE id = ?",
        )
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await?;
        tracing::info!(queue_id = id, "task dead-lettered after exceeding max retry attempts");
        Ok(())
    }

    pub async fn update_retry(
        &self,
        id: i64,
        next_retry_at: Option<DateTime<Utc>>,
        attempt_count: u32,
        last_error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE sync_queue_items \
             SET next_retry_at = ?, attempt_count = ?, last_error = ?, status = 'pending' \
             WHERE id = ?",
        )
        .bind(next_retry_at.map(|d| d.to_rfc3339()))
        .bind(attempt_count)
        .bind(last_error)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_processing(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE sync_queue_items SET status = 'processing' WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Rewrites a task's op (used on update -> 404 -> create success, §4.4).
    pub async fn update_op(&self, id: i64, op: SyncOp, clear_error: bool) -> Result<()> {
        if clear_error {
            sqlx::query("UPDATE sync_queue_items SET op = ?, last_error = NULL WHERE id = ?")
                .bind(op.as_str())
                .bind(id)
                .execute(&self.pool)
                .await?;
        } else {
            sqlx::query("UPDATE sync_queue_items SET op = ? WHERE id = ?")
                .bind(op.as_str())
                .bind(id)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    /// Used by the double-404 fallback: leaves `next_retry_at = NULL` so the
    /// row is manually retriable without backoff (§4.4).
    pub async fn record_double_fallback(&self, id: i64, op: SyncOp, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE sync_queue_items SET op = ?, next_retry_at = NULL, last_error = ?, status = 'pending' WHERE id = ?",
        )
        .bind(op.as_str())
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_id_negotiation_status(&self, id: i64, status: IdNegotiationStatus, error: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE sync_queue_items SET id_negotiation_status = ?, last_error = COALESCE(?, last_error) WHERE id = ?")
            .bind(status.as_str())
            .bind(error)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Rewrites every queue row for `(model_type, old_id)` onto `new_id`
    /// (part of atomic id replacement, §4.6).
    pub async fn rewrite_model_id(&self, model_type: &str, old_id: &str, new_id: &str) -> Result<()> {
        sqlx::query("UPDATE sync_queue_items SET model_id = ? WHERE model_type = ? AND model_id = ?")
            .bind(new_id)
            .bind(model_type)
            .bind(old_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ---- smart merge (§4.1) ----

    /// `handleModelSave`: collapse concurrent saves into a single pending op.
    #[allow(clippy::too_many_arguments)]
    pub async fn handle_model_save(
        &self,
        model_type: &str,
        model_id: &str,
        payload: &str,
        op: SyncOp,
        idempotency_key: &str,
        headers: Option<&str>,
        extra: Option<&str>,
    ) -> Result<i64> {
        let mut tx = self.pool.begin().await?;

        let existing_create: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM sync_queue_items WHERE model_type = ? AND model_id = ? AND op = 'create' AND status != 'dead' LIMIT 1",
        )
        .bind(model_type)
        .bind(model_id)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(id) = existing_create {
            sqlx::query(
                "UPDATE sync_queue_items SET payload = ?, attempt_count = 0, next_retry_at = NULL, last_error = NULL WHERE id = ?",
            )
            .bind(payload)
            .bind(id)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            tracing::debug!(model_type, model_id, "smart save: merged into pending create");
            return Ok(id);
        }

        if op == SyncOp::Update {
            let existing_update: Option<i64> = sqlx::query_scalar(
                "SELECT id FROM sync_queue_items WHERE model_type = ? AND model_id = ? AND op = 'update' AND status != 'dead' LIMIT 1",
            )
            .bind(model_type)
            .bind(model_id)
            .fetch_optional(&mut *tx)
            .await?;

            if let Some(id) = existing_update {
                sqlx::query(
                    "UPDATE sync_queue_items SET payload = ?, attempt_count = 0, next_retry_at = NULL, last_error = NULL WHERE id = ?",
                )
                .bind(payload)
                .bind(id)
                .execute(&mut *tx)
                .await?;
                tx.commit().await?;
                tracing::debug!(model_type, model_id, "smart save: merged into pending update");
                return Ok(id);
            }
        }

        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO sync_queue_items \
             (model_type, model_id, op, payload, attempt_count, idempotency_key, status, created_at, headers, extra) \
             VALUES (?, ?, ?, ?, 0, ?, 'pending', ?, ?, ?)",
        )
        .bind(model_type)
        .bind(model_id)
        .bind(op.as_str())
        .bind(payload)
        .bind(idempotency_key)
        .bind(now.to_rfc3339())
        .bind(headers)
        .bind(extra)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        tracing::debug!(model_type, model_id, op = op.as_str(), "smart save: inserted new queue row");
        Ok(result.last_insert_rowid())
    }

    /// `handleModelDeletion`: smart delete, §4.1.
    #[allow(clippy::too_many_arguments)]
    pub async fn handle_model_deletion(
        &self,
        model_type: &str,
        model_id: &str,
        payload: &str,
        schedule_delete: bool,
        idempotency_key: &str,
        headers: Option<&str>,
        extra: Option<&str>,
    ) -> Result<SmartDeleteOutcome> {
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query("SELECT id, op FROM sync_queue_items WHERE model_type = ? AND model_id = ? AND status != 'dead'")
            .bind(model_type)
            .bind(model_id)
            .fetch_all(&mut *tx)
            .await?;

        let mut delete_id = None;
        let mut create_id = None;
        let mut update_id = None;
        for row in &rows {
            let id: i64 = row.get("id");
            let op: String = row.get("op");
            match op.as_str() {
                "delete" => delete_id = Some(id),
                "create" => create_id = Some(id),
                "update" => update_id = Some(id),
                _ => {}
            }
        }

        let outcome = if delete_id.is_some() {
            SmartDeleteOutcome::DeleteAlreadyExists
        } else if let Some(cid) = create_id {
            sqlx::query("DELETE FROM sync_queue_items WHERE id = ?").bind(cid).execute(&mut *tx).await?;
            if let Some(uid) = update_id {
                sqlx::query("DELETE FROM sync_queue_items WHERE id = ?").bind(uid).execute(&mut *tx).await?;
            }
            SmartDeleteOutcome::RemovedCreate
        } else if let Some(uid) = update_id {
            sqlx::query("DELETE FROM sync_queue_items WHERE id = ?").bind(uid).execute(&mut *tx).await?;
            if schedule_delete {
                insert_delete_row(&mut tx, model_type, model_id, payload, idempotency_key, headers, extra).await?;
                SmartDeleteOutcome::ReplacedUpdateWithDelete
            } else {
                SmartDeleteOutcome::ClearedUpdate
            }
        } else if schedule_delete {
            insert_delete_row(&mut tx, model_type, model_id, payload, idempotency_key, headers, extra).await?;
            SmartDeleteOutcome::CreatedDelete
        } else {
            SmartDeleteOutcome::ClearedNoOperations
        };

        tx.commit().await?;
        tracing::debug!(model_type, model_id, ?outcome, "smart delete");
        Ok(outcome)
    }

    /// §4.1 `updateModelSyncStatus`: write-through projection of I3 into the
    /// model table, notifying reactive subscribers via the store.
    pub async fn update_model_sync_status(
        &self,
        store: &Arc<dyn Store>,
        model_type: &str,
        model_id: &str,
    ) -> Result<()> {
        let items = self.get_by_model(model_type, model_id).await?;
        let non_dead: Vec<_> = items.iter().filter(|i| i.status != QueueItemStatus::Dead).collect();
        let status = if !non_dead.is_empty() {
            SyncStatus::Pending
        } else if items.iter().any(|i| i.status == QueueItemStatus::Dead) {
            SyncStatus::Dead
        } else {
            SyncStatus::Synced
        };
        store.update_sync_status(model_type, model_id, status).await
    }

    pub async fn clear_dead(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM sync_queue_items WHERE status = 'dead'")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn retry_all_dead(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE sync_queue_items SET status = 'pending', attempt_count = 0, next_retry_at = NULL, last_error = NULL WHERE status = 'dead'",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn clear_all(&self) -> Result<()> {
        sqlx::query("DELETE FROM sync_queue_items").execute(&self.pool).await?;
        Ok(())
    }
}

async fn insert_delete_row(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    model_type: &str,
    model_id: &str,
    payload: &str,
    idempotency_key: &str,
    headers: Option<&str>,
    extra: Option<&str>,
) -> Result<()> {
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO sync_queue_items \
         (model_type, model_id, op, payload, attempt_count, idempotency_key, status, created_at, headers, extra) \
         VALUES (?, ?, 'delete', ?, 0, ?, 'pending', ?, ?, ?)",
    )
    .bind(model_type)
    .bind(model_id)
    .bind(payload)
    .bind(idempotency_key)
    .bind(now.to_rfc3339())
    .bind(headers)
    .bind(extra)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id;

    async fn dao() -> SyncQueueDao {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        SyncQueueDao::new(pool)
    }

    #[tokio::test]
    async fn smart_create_then_update_collapses() {
        let dao = dao().await;
        dao.handle_model_save("Note", "A", r#"{"v":1}"#, SyncOp::Create, &id::generate_idempotency_key(), None, None)
            .await
            .unwrap();
        dao.handle_model_save("Note", "A", r#"{"v":2}"#, SyncOp::Update, &id::generate_idempotency_key(), None, None)
            .await
            .unwrap();

        let items = dao.get_by_model("Note", "A").await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].op, SyncOp::Create);
        assert_eq!(items[0].payload, r#"{"v":2}"#);
        assert_eq!(items[0].attempt_count, 0);
    }

    #[tokio::test]
    async fn smart_update_then_delete_replaces() {
        let dao = dao().await;
        dao.handle_model_save("Note", "A", r#"{"v":1}"#, SyncOp::Update, &id::generate_idempotency_key(), None, None)
            .await
            .unwrap();
        let outcome = dao
            .handle_model_deletion("Note", "A", r#"{"id":"A"}"#, true, &id::generate_idempotency_key(), None, None)
            .await
            .unwrap();
        assert_eq!(outcome, SmartDeleteOutcome::ReplacedUpdateWithDelete);

        let items = dao.get_by_model("Note", "A").await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].op, SyncOp::Delete);
    }

    #[tokio::test]
    async fn smart_create_then_delete_removes_both() {
        let dao = dao().await;
        dao.handle_model_save("Note", "A", r#"{"v":1}"#, SyncOp::Create, &id::generate_idempotency_key(), None, None)
            .await
            .unwrap();
        let outcome = dao
            .handle_model_deletion("Note", "A", r#"{"id":"A"}"#, true, &id::generate_idempotency_key(), None, None)
            .await
            .unwrap();
        assert_eq!(outcome, SmartDeleteOutcome::RemovedCreate);
        assert!(dao.get_by_model("Note", "A").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn double_deletion_is_idempotent() {
        let dao = dao().await;
        dao.handle_model_save("Note", "A", r#"{"v":1}"#, SyncOp::Update, &id::generate_idempotency_key(), None, None)
            .await
            .unwrap();
        dao.handle_model_deletion("Note", "A", r#"{"id":"A"}"#, true, &id::generate_idempotency_key(), None, None)
            .await
            .unwrap();
        let first_state = dao.get_by_model("Note", "A").await.unwrap();

        let outcome = dao
            .handle_model_deletion("Note", "A", r#"{"id":"A"}"#, true, &id::generate_idempotency_key(), None, None)
            .await
            .unwrap();
        assert_eq!(outcome, SmartDeleteOutcome::DeleteAlreadyExists);
        let second_state = dao.get_by_model("Note", "A").await.unwrap();
        assert_eq!(first_state.len(), second_state.len());
    }

    #[tokio::test]
    async fn due_tasks_respect_next_retry_at() {
        let dao = dao().await;
        let id = dao
            .handle_model_save("Note", "A", r#"{"v":1}"#, SyncOp::Create, &id::generate_idempotency_key(), None, None)
            .await
            .unwrap();
        dao.update_retry(id, Some(Utc::now() + chrono::Duration::hours(1)), 1, Some("timeout"))
            .await
            .unwrap();
        let due = dao.get_due_tasks(Utc::now()).await.unwrap();
        assert!(due.is_empty());
        let all = dao.get_all_non_dead().await.unwrap();
        assert_eq!(all.len(), 1);
    }
}
