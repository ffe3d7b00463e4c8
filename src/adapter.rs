//! §6 "HTTP adapter contract" — per-model remote access, out of scope for
//! its transport implementation but required here as the trait the
//! repository and retry executor drive.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::query::QueryParams;

/// Per-request metadata the caller may attach (§3: `headers`, `extra`).
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    pub headers: Option<Value>,
    pub extra: Option<Value>,
}

/// The remote counterpart of a model's repository. Implementations wrap an
/// HTTP transport (the default, grounded on the teacher's `TrailBaseClient`,
/// uses `reqwest`); errors must be raised as the specific `Error` variants
/// named in §6 so the retry executor and load/save policies can branch on
/// them (`NotFound`, `Gone`, `ApiException`, `Offline`, `Network`).
#[async_trait]
pub trait HttpAdapter: Send + Sync {
    async fn create_one(&self, item: &Value, meta: &RequestMeta) -> Result<Value>;
    async fn update_one(&self, item: &Value, meta: &RequestMeta) -> Result<Value>;
    async fn delete_one(&self, id: &str, meta: &RequestMeta) -> Result<()>;
    async fn fetch_one(&self, id: &str, params: Option<&QueryParams>, meta: &RequestMeta) -> Result<Value>;
    async fn fetch_all(&self, params: Option<&QueryParams>, meta: &RequestMeta) -> Result<Vec<Value>>;
}
