//! Work item model and lifecycle.
//!
//! A `WorkItem` is the unit of work the pipeline pulls from the store: a
//! free-text work order plus everything the pipeline records about what it
//! did with it. Status transitions follow a fixed edge set; anything else is
//! rejected before it reaches the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemStatus {
    Pending,
    Processing,
    Building,
    Review,
    Approved,
    Completed,
    Failed,
    Cancelled,
}

impl WorkItemStatus {
    /// The fixed transition edges of the lifecycle.
    ///
    /// Pending → Processing → Building → {Completed | Review | Failed} is the
    /// normal path. Review → Approved re-enters via Processing for the merge
    /// cycle, which ends Completed or reverts to Review. Processing can fail
    /// directly (tree sync faults happen before Building). Queued items can
    /// be cancelled from outside; an item mid-cycle cannot.
    pub fn can_transition(self, to: WorkItemStatus) -> bool {
        use WorkItemStatus::*;
        matches!(
            (self, to),
            (Pending, Processing)
                | (Pending, Cancelled)
                | (Processing, Building)
                | (Processing, Completed)
                | (Processing, Review)
                | (Processing, Failed)
                | (Building, Completed)
                | (Building, Review)
                | (Building, Failed)
                | (Review, Approved)
                | (Review, Cancelled)
                | (Approved, Processing)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkItemStatus::Completed | WorkItemStatus::Failed | WorkItemStatus::Cancelled
        )
    }

    /// Statuses that mean a cycle is in flight right now.
    pub fn is_in_flight(self) -> bool {
        matches!(self, WorkItemStatus::Processing | WorkItemStatus::Building)
    }
}

impl std::fmt::Display for WorkItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkItemStatus::Pending => "pending",
            WorkItemStatus::Processing => "processing",
            WorkItemStatus::Building => "building",
            WorkItemStatus::Review => "review",
            WorkItemStatus::Approved => "approved",
            WorkItemStatus::Completed => "completed",
            WorkItemStatus::Failed => "failed",
            WorkItemStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// How a completed change reached (or will reach) the integrated line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployDecision {
    AutoMerged,
    BranchedForReview,
    AdminApproved,
}

/// Risk verdict, shared between the classifier and the persisted record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskDecision {
    AutoMerge,
    NeedsReview,
    HardBlock,
}

impl std::fmt::Display for RiskDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RiskDecision::AutoMerge => "auto_merge",
            RiskDecision::NeedsReview => "needs_review",
            RiskDecision::HardBlock => "hard_block",
        };
        write!(f, "{}", s)
    }
}

/// Risk assessment as recorded on the work item.
///
/// The same shape carries the agent's self-assessment (advisory) and the
/// classifier's final verdict (authoritative); only the latter is persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub decision: RiskDecision,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub touches_existing_functionality: bool,
    #[serde(default)]
    pub could_confuse_users: bool,
    #[serde(default)]
    pub removes_or_changes_features: bool,
}

impl RiskAssessment {
    /// The default used when agent output is missing or unparseable.
    pub fn default_needs_review(reason: &str) -> Self {
        Self {
            decision: RiskDecision::NeedsReview,
            reason: reason.to_string(),
            touches_existing_functionality: false,
            could_confuse_users: false,
            removes_or_changes_features: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: Uuid,
    pub description: String,
    pub requested_by: String,
    pub status: WorkItemStatus,
    #[serde(default)]
    pub deploy_decision: Option<DeployDecision>,
    #[serde(default)]
    pub branch_name: Option<String>,
    #[serde(default)]
    pub commit_sha: Option<String>,
    #[serde(default)]
    pub merged_sha: Option<String>,
    #[serde(default)]
    pub files_created: Vec<String>,
    #[serde(default)]
    pub files_modified: Vec<String>,
    #[serde(default)]
    pub build_summary: Option<String>,
    #[serde(default)]
    pub risk_assessment: Option<RiskAssessment>,
    #[serde(default)]
    pub progress_message: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkItem {
    pub fn new(description: &str, requested_by: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            description: description.to_string(),
            requested_by: requested_by.to_string(),
            status: WorkItemStatus::Pending,
            deploy_decision: None,
            branch_name: None,
            commit_sha: None,
            merged_sha: None,
            files_created: Vec::new(),
            files_modified: Vec::new(),
            build_summary: None,
            risk_assessment: None,
            progress_message: String::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// The branch this item ships on. Assigned once, stable for the item's
    /// life, never reused: slug of the description + a date stamp + the
    /// item's short id.
    pub fn derive_branch_name(&self, now: DateTime<Utc>) -> String {
        let slug = slugify(&self.description, 40);
        let short_id = &self.id.simple().to_string()[..8];
        format!("ship/{}-{}-{}", slug, now.format("%Y%m%d"), short_id)
    }
}

/// Convert a title to a branch-safe slug, limited to `max_len` characters.
pub fn slugify(title: &str, max_len: usize) -> String {
    let slug: String = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.len() > max_len {
        slug[..max_len].trim_end_matches('-').to_string()
    } else {
        slug
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_path_transitions_allowed() {
        use WorkItemStatus::*;
        assert!(Pending.can_transition(Processing));
        assert!(Processing.can_transition(Building));
        assert!(Building.can_transition(Completed));
        assert!(Building.can_transition(Review));
        assert!(Building.can_transition(Failed));
    }

    #[test]
    fn review_path_transitions_allowed() {
        use WorkItemStatus::*;
        assert!(Review.can_transition(Approved));
        assert!(Approved.can_transition(Processing));
        assert!(Processing.can_transition(Completed));
        assert!(Processing.can_transition(Review));
    }

    #[test]
    fn skipping_edges_rejected() {
        use WorkItemStatus::*;
        assert!(!Pending.can_transition(Building));
        assert!(!Pending.can_transition(Completed));
        assert!(!Building.can_transition(Approved));
        assert!(!Completed.can_transition(Processing));
        assert!(!Failed.can_transition(Pending));
    }

    #[test]
    fn cancellation_only_while_queued() {
        use WorkItemStatus::*;
        assert!(Pending.can_transition(Cancelled));
        assert!(Review.can_transition(Cancelled));
        assert!(!Processing.can_transition(Cancelled));
        assert!(!Building.can_transition(Cancelled));
    }

    #[test]
    fn in_flight_statuses() {
        assert!(WorkItemStatus::Processing.is_in_flight());
        assert!(WorkItemStatus::Building.is_in_flight());
        assert!(!WorkItemStatus::Pending.is_in_flight());
        assert!(!WorkItemStatus::Review.is_in_flight());
    }

    #[test]
    fn slugify_basic() {
        assert_eq!(slugify("Add a new status page", 40), "add-a-new-status-page");
    }

    #[test]
    fn slugify_strips_punctuation_and_collapses() {
        assert_eq!(slugify("Fix: the  (broken) page!!", 40), "fix-the-broken-page");
    }

    #[test]
    fn slugify_truncates_without_trailing_dash() {
        let slug = slugify("a very long description that keeps going and going", 20);
        assert!(slug.len() <= 20);
        assert!(!slug.ends_with('-'));
    }

    #[test]
    fn branch_name_is_deterministic_and_prefixed() {
        let item = WorkItem::new("Add a contact page", "admin@example.com");
        let now = Utc::now();
        let a = item.derive_branch_name(now);
        let b = item.derive_branch_name(now);
        assert_eq!(a, b);
        assert!(a.starts_with("ship/add-a-contact-page-"));
        assert!(a.contains(&item.id.simple().to_string()[..8]));
    }

    #[test]
    fn branch_names_differ_across_items() {
        let now = Utc::now();
        let a = WorkItem::new("same description", "x").derive_branch_name(now);
        let b = WorkItem::new("same description", "x").derive_branch_name(now);
        assert_ne!(a, b);
    }

    #[test]
    fn status_serde_is_snake_case() {
        let json = serde_json::to_string(&WorkItemStatus::Processing).unwrap();
        assert_eq!(json, "\"processing\"");
        let back: WorkItemStatus = serde_json::from_str("\"review\"").unwrap();
        assert_eq!(back, WorkItemStatus::Review);
    }

    #[test]
    fn risk_assessment_defaults_to_needs_review() {
        let risk = RiskAssessment::default_needs_review("output unparseable");
        assert_eq!(risk.decision, RiskDecision::NeedsReview);
        assert!(!risk.touches_existing_functionality);
    }
}
