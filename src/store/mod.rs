//! Work item store client.
//!
//! The store is an external persisted queue; the pipeline only ever fetches
//! the oldest item of a given status and patches fields back. Status writes
//! go through the fixed transition edges — an illegal transition is a store
//! error, not a silent overwrite.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::errors::PipelineError;
use crate::workitem::{DeployDecision, RiskAssessment, WorkItem, WorkItemStatus};

pub mod http;
pub mod memory;

pub use http::HttpStore;
pub use memory::MemoryStore;

/// A partial write. Only set fields are sent.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkItemPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<WorkItemStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deploy_decision: Option<DeployDecision>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merged_sha: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files_created: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files_modified: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_assessment: Option<RiskAssessment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkItemPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: WorkItemStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn progress(mut self, message: &str) -> Self {
        self.progress_message = Some(message.to_string());
        self
    }

    pub fn deploy_decision(mut self, decision: DeployDecision) -> Self {
        self.deploy_decision = Some(decision);
        self
    }

    pub fn branch_name(mut self, branch: &str) -> Self {
        self.branch_name = Some(branch.to_string());
        self
    }

    pub fn commit_sha(mut self, sha: &str) -> Self {
        self.commit_sha = Some(sha.to_string());
        self
    }

    pub fn merged_sha(mut self, sha: &str) -> Self {
        self.merged_sha = Some(sha.to_string());
        self
    }

    pub fn files(mut self, created: Vec<String>, modified: Vec<String>) -> Self {
        self.files_created = Some(created);
        self.files_modified = Some(modified);
        self
    }

    pub fn build_summary(mut self, summary: &str) -> Self {
        self.build_summary = Some(summary.to_string());
        self
    }

    pub fn risk_assessment(mut self, assessment: RiskAssessment) -> Self {
        self.risk_assessment = Some(assessment);
        self
    }

    pub fn started_at(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(at);
        self
    }

    pub fn completed_at(mut self, at: DateTime<Utc>) -> Self {
        self.completed_at = Some(at);
        self
    }
}

#[async_trait]
pub trait WorkItemStore: Send + Sync {
    /// Oldest pending item, if any.
    async fn next_pending(&self) -> Result<Option<WorkItem>, PipelineError>;

    /// Oldest human-approved item awaiting its merge cycle, if any.
    async fn next_approved(&self) -> Result<Option<WorkItem>, PipelineError>;

    /// Patch fields on an item. Status changes must follow the lifecycle.
    async fn update(&self, id: Uuid, patch: WorkItemPatch) -> Result<(), PipelineError>;
}

/// Apply a patch to an in-memory item, enforcing the transition edges.
/// Shared by the memory store; the HTTP store's server does the same check.
pub fn apply_patch(item: &mut WorkItem, patch: WorkItemPatch) -> Result<(), PipelineError> {
    if let Some(status) = patch.status {
        if !item.status.can_transition(status) {
            return Err(PipelineError::Store(format!(
                "illegal status transition {} -> {} for item {}",
                item.status, status, item.id
            )));
        }
        item.status = status;
    }
    if let Some(message) = patch.progress_message {
        item.progress_message = message;
    }
    if let Some(decision) = patch.deploy_decision {
        item.deploy_decision = Some(decision);
    }
    if let Some(branch) = patch.branch_name {
        item.branch_name = Some(branch);
    }
    if let Some(sha) = patch.commit_sha {
        item.commit_sha = Some(sha);
    }
    if let Some(sha) = patch.merged_sha {
        item.merged_sha = Some(sha);
    }
    if let Some(files) = patch.files_created {
        item.files_created = files;
    }
    if let Some(files) = patch.files_modified {
        item.files_modified = files;
    }
    if let Some(summary) = patch.build_summary {
        item.build_summary = Some(summary);
    }
    if let Some(assessment) = patch.risk_assessment {
        item.risk_assessment = Some(assessment);
    }
    if let Some(at) = patch.started_at {
        item.started_at = Some(at);
    }
    if let Some(at) = patch.completed_at {
        item.completed_at = Some(at);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_serializes_only_set_fields() {
        let patch = WorkItemPatch::new()
            .status(WorkItemStatus::Processing)
            .progress("working");
        let json = serde_json::to_value(&patch).unwrap();
        let obj = json.as_object().unwrap();
        assert_eq!(obj.len(), 2);
        assert_eq!(obj["status"], "processing");
        assert_eq!(obj["progress_message"], "working");
    }

    #[test]
    fn apply_patch_rejects_illegal_transition() {
        let mut item = WorkItem::new("x", "y");
        let err = apply_patch(&mut item, WorkItemPatch::new().status(WorkItemStatus::Completed))
            .unwrap_err();
        assert!(err.to_string().contains("illegal status transition"));
        assert_eq!(item.status, WorkItemStatus::Pending);
    }

    #[test]
    fn apply_patch_walks_the_lifecycle() {
        let mut item = WorkItem::new("x", "y");
        apply_patch(&mut item, WorkItemPatch::new().status(WorkItemStatus::Processing)).unwrap();
        apply_patch(&mut item, WorkItemPatch::new().status(WorkItemStatus::Building)).unwrap();
        apply_patch(
            &mut item,
            WorkItemPatch::new()
                .status(WorkItemStatus::Completed)
                .merged_sha("abc123")
                .progress("done"),
        )
        .unwrap();
        assert_eq!(item.status, WorkItemStatus::Completed);
        assert_eq!(item.merged_sha.as_deref(), Some("abc123"));
        assert_eq!(item.progress_message, "done");
    }
}
