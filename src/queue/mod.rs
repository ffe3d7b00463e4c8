//! C2: the durable sync queue — its record shapes and the smart-merge DAO.

pub mod request_queue;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// §3: `op ∈ {create, update, delete}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncOp {
    Create,
    Update,
    Delete,
}

impl SyncOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncOp::Create => "create",
            SyncOp::Update => "update",
            SyncOp::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(SyncOp::Create),
            "update" => Some(SyncOp::Update),
            "delete" => Some(SyncOp::Delete),
            _ => None,
        }
    }
}

/// §3: `status ∈ {pending, processing, dead}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueItemStatus {
    Pending,
    Processing,
    Dead,
}

impl QueueItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueItemStatus::Pending => "pending",
            QueueItemStatus::Processing => "processing",
            QueueItemStatus::Dead => "dead",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(QueueItemStatus::Pending),
            "processing" => Some(QueueItemStatus::Processing),
            "dead" => Some(QueueItemStatus::Dead),
            _ => None,
        }
    }
}

/// §3: `idNegotiationStatus ∈ {pending,in_progress,conflict,completed,failed,cancelled}|null`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdNegotiationStatus {
    Pending,
    InProgress,
    Conflict,
    Completed,
    Failed,
    Cancelled,
}

impl IdNegotiationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdNegotiationStatus::Pending => "pending",
            IdNegotiationStatus::InProgress => "in_progress",
            IdNegotiationStatus::Conflict => "conflict",
            IdNegotiationStatus::Completed => "completed",
            IdNegotiationStatus::Failed => "failed",
            IdNegotiationStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(IdNegotiationStatus::Pending),
            "in_progress" => Some(IdNegotiationStatus::InProgress),
            "conflict" => Some(IdNegotiationStatus::Conflict),
            "completed" => Some(IdNegotiationStatus::Completed),
            "failed" => Some(IdNegotiationStatus::Failed),
            "cancelled" => Some(IdNegotiationStatus::Cancelled),
            _ => None,
        }
    }
}

/// §3: the durable record of a pending mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncQueueItem {
    pub id: i64,
    pub model_type: String,
    pub model_id: String,
    pub op: SyncOp,
    pub payload: String,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub idempotency_key: String,
    pub status: QueueItemStatus,
    pub created_at: DateTime<Utc>,
    pub headers: Option<String>,
    pub extra: Option<String>,
    pub temporary_client_id: Option<String>,
    pub id_negotiation_status: Option<IdNegotiationStatus>,
}

/// Outcome tag returned by [`store::SyncQueueDao::handle_model_deletion`],
/// named after §4.1's rule labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmartDeleteOutcome {
    DeleteAlreadyExists,
    RemovedCreate,
    ReplacedUpdateWithDelete,
    ClearedUpdate,
    CreatedDelete,
    ClearedNoOperations,
}
