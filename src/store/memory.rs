//! In-memory work item store.
//!
//! Backs the test suite with the same trait surface as the HTTP client,
//! including the transition check a real backend performs.

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{WorkItemPatch, WorkItemStore, apply_patch};
use crate::errors::PipelineError;
use crate::workitem::{WorkItem, WorkItemStatus};

#[derive(Default)]
pub struct MemoryStore {
    items: Mutex<Vec<WorkItem>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed(&self, item: WorkItem) {
        self.items.lock().await.push(item);
    }

    pub async fn get(&self, id: Uuid) -> Option<WorkItem> {
        self.items.lock().await.iter().find(|i| i.id == id).cloned()
    }

    pub async fn snapshot(&self) -> Vec<WorkItem> {
        self.items.lock().await.clone()
    }

    async fn next_with_status(&self, status: WorkItemStatus) -> Option<WorkItem> {
        let items = self.items.lock().await;
        items
            .iter()
            .filter(|i| i.status == status)
            .min_by_key(|i| i.created_at)
            .cloned()
    }
}

#[async_trait]
impl WorkItemStore for MemoryStore {
    async fn next_pending(&self) -> Result<Option<WorkItem>, PipelineError> {
        Ok(self.next_with_status(WorkItemStatus::Pending).await)
    }

    async fn next_approved(&self) -> Result<Option<WorkItem>, PipelineError> {
        Ok(self.next_with_status(WorkItemStatus::Approved).await)
    }

    async fn update(&self, id: Uuid, patch: WorkItemPatch) -> Result<(), PipelineError> {
        let mut items = self.items.lock().await;
        let item = items
            .iter_mut()
            .find(|i| i.id == id)
            .ok_or_else(|| PipelineError::Store(format!("work item {} not found", id)))?;
        apply_patch(item, patch)
    }
}
