//! §3 DATA MODEL: the `Model` contract every repository is generic over.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Derived sync status, denormalized into the model's table row for
/// reactive subscribers (§3, I3/P2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Pending,
    Synced,
    Dead,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Synced => "synced",
            SyncStatus::Dead => "dead",
        }
    }
}

/// An application entity synchronized by the engine.
///
/// The per-model code generator (out of scope here; only its contract is
/// used) is expected to implement this for each `#[model]`-annotated type.
pub trait Model: Clone + Send + Sync + 'static {
    /// Stable type name used as the `modelType` key throughout the engine
    /// (queue rows, registry lookups, dependency edges). Redesign flag §9:
    /// an explicit constant, not a runtime reflection lookup.
    const MODEL_TYPE: &'static str;

    /// Whether this model's `id` is assigned by the server rather than the
    /// client (activates §4.6 id negotiation).
    const SERVER_GENERATED_ID: bool = false;

    fn id(&self) -> &str;
    fn set_id(&mut self, id: String);

    fn created_at(&self) -> Option<DateTime<Utc>>;
    fn set_created_at(&mut self, at: Option<DateTime<Utc>>);

    fn updated_at(&self) -> Option<DateTime<Utc>>;
    fn set_updated_at(&mut self, at: Option<DateTime<Utc>>);

    fn last_synced_at(&self) -> Option<DateTime<Utc>>;
    fn set_last_synced_at(&mut self, at: Option<DateTime<Utc>>);

    fn sync_status(&self) -> SyncStatus;
    fn set_sync_status(&mut self, status: SyncStatus);

    fn to_json(&self) -> serde_json::Result<Value>;
    fn from_json(value: &Value) -> serde_json::Result<Self>
    where
        Self: Sized;
}

/// A change event broadcast on a repository's `changes` stream (§4.5).
#[derive(Debug, Clone)]
pub enum ModelChange<T> {
    Created(T),
    Updated(T),
    Deleted(String),
    IdChanged { old_id: String, new_id: String },
    Error(String),
}
