//! HTTP work item store client.
//!
//! Talks to the ops backend's REST surface. Queue reads ask for exactly one
//! item, oldest first; writes are PATCHes of only the changed fields.

use async_trait::async_trait;
use uuid::Uuid;

use super::{WorkItemPatch, WorkItemStore};
use crate::errors::PipelineError;
use crate::workitem::WorkItem;

pub struct HttpStore {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

fn store_err(e: reqwest::Error) -> PipelineError {
    PipelineError::Store(e.to_string())
}

impl HttpStore {
    pub fn new(base_url: &str, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn fetch_oldest(&self, status: &str) -> Result<Option<WorkItem>, PipelineError> {
        let url = format!("{}/work-items", self.base_url);
        let req = self
            .client
            .get(&url)
            .query(&[("status", status), ("order", "created_at"), ("limit", "1")]);
        let resp = self
            .authed(req)
            .send()
            .await
            .map_err(store_err)?
            .error_for_status()
            .map_err(store_err)?;
        let items: Vec<WorkItem> = resp.json().await.map_err(store_err)?;
        Ok(items.into_iter().next())
    }
}

#[async_trait]
impl WorkItemStore for HttpStore {
    async fn next_pending(&self) -> Result<Option<WorkItem>, PipelineError> {
        self.fetch_oldest("pending").await
    }

    async fn next_approved(&self) -> Result<Option<WorkItem>, PipelineError> {
        self.fetch_oldest("approved").await
    }

    async fn update(&self, id: Uuid, patch: WorkItemPatch) -> Result<(), PipelineError> {
        let url = format!("{}/work-items/{}", self.base_url, id);
        let req = self.client.patch(&url).json(&patch);
        self.authed(req)
            .send()
            .await
            .map_err(store_err)?
            .error_for_status()
            .map_err(store_err)?;
        Ok(())
    }
}
