//! Test-only `HttpAdapter` double shared across integration-style tests in
//! this crate. Scripts a queue of responses per HTTP verb; once exhausted,
//! falls back to echoing the input payload back as the "server" response so
//! a test that doesn't care about the create/update response shape doesn't
//! need to script one.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::adapter::{HttpAdapter, RequestMeta};
use crate::error::Result;
use crate::query::QueryParams;

#[derive(Default)]
pub struct ScriptedAdapter {
    creates: Mutex<VecDeque<Result<Value>>>,
    updates: Mutex<VecDeque<Result<Value>>>,
    deletes: Mutex<VecDeque<Result<()>>>,
    fetch_ones: Mutex<VecDeque<Result<Value>>>,
    fetch_alls: Mutex<VecDeque<Result<Vec<Value>>>>,
}

impl ScriptedAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_create(&self, result: Result<Value>) {
        self.creates.lock().unwrap().push_back(result);
    }

    pub fn push_update(&self, result: Result<Value>) {
        self.updates.lock().unwrap().push_back(result);
    }

    pub fn push_delete(&self, result: Result<()>) {
        self.deletes.lock().unwrap().push_back(result);
    }

    pub fn push_fetch_one(&self, result: Result<Value>) {
        self.fetch_ones.lock().unwrap().push_back(result);
    }

    pub fn push_fetch_all(&self, result: Result<Vec<Value>>) {
        self.fetch_alls.lock().unwrap().push_back(result);
    }
}

#[async_trait]
impl HttpAdapter for ScriptedAdapter {
    async fn create_one(&self, item: &Value, _meta: &RequestMeta) -> Result<Value> {
        match self.creates.lock().unwrap().pop_front() {
            Some(scripted) => scripted,
            None => Ok(item.clone()),
        }
    }

    async fn update_one(&self, item: &Value, _meta: &RequestMeta) -> Result<Value> {
        match self.updates.lock().unwrap().pop_front() {
            Some(scripted) => scripted,
            None => Ok(item.clone()),
        }
    }

    async fn delete_one(&self, _id: &str, _meta: &RequestMeta) -> Result<()> {
        match self.deletes.lock().unwrap().pop_front() {
            Some(scripted) => scripted,
            None => Ok(()),
        }
    }

    async fn fetch_one(&self, id: &str, _params: Option<&QueryParams>, _meta: &RequestMeta) -> Result<Value> {
        match self.fetch_ones.lock().unwrap().pop_front() {
            Some(scripted) => scripted,
            None => Ok(serde_json::json!({ "id": id })),
        }
    }

    async fn fetch_all(&self, _params: Option<&QueryParams>, _meta: &RequestMeta) -> Result<Vec<Value>> {
        match self.fetch_alls.lock().unwrap().pop_front() {
            Some(scripted) => scripted,
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[tokio::test]
    async fn echoes_input_when_unscripted() {
        let adapter = ScriptedAdapter::new();
        let item = serde_json::json!({"id": "a", "title": "hi"});
        let result = adapter.create_one(&item, &RequestMeta::default()).await.unwrap();
        assert_eq!(result, item);
    }

    #[tokio::test]
    async fn scripted_responses_are_consumed_in_order() {
        let adapter = ScriptedAdapter::new();
        adapter.push_create(Ok(serde_json::json!({"id": "srv1"})));
        adapter.push_create(Err(Error::Network("boom".into())));

        let first = adapter.create_one(&serde_json::json!({}), &RequestMeta::default()).await.unwrap();
        assert_eq!(first["id"], "srv1");

        let second = adapter.create_one(&serde_json::json!({}), &RequestMeta::default()).await;
        assert!(matches!(second, Err(Error::Network(_))));
    }
}
