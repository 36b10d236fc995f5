//! Pipeline orchestrator.
//!
//! The state machine that turns a work item into a shipped change:
//! dequeue → prepare tree → invoke agent → diff → classify → commit →
//! merge-or-branch → notify → return to a clean state. Owns the
//! single-flight guard and the poll loop. The working checkout is a
//! singleton shared resource, so the whole pipeline is serialized: while a
//! cycle runs, the timer tick is a no-op.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, info, info_span, warn};

use crate::agent::{AgentOutcome, CodeAgent, PermissionEnvelope};
use crate::errors::{ERROR_TEXT_CAP, PipelineError, truncate_error};
use crate::notify::{self, Channel, Notifier};
use crate::release::ReleaseWatcher;
use crate::risk::{self, RiskPolicy};
use crate::store::{WorkItemPatch, WorkItemStore};
use crate::tree::SourceTree;
use crate::workitem::{DeployDecision, RiskDecision, WorkItem, WorkItemStatus};

pub struct Orchestrator {
    store: Arc<dyn WorkItemStore>,
    agent: Arc<dyn CodeAgent>,
    notifier: Arc<dyn Notifier>,
    releases: Arc<dyn ReleaseWatcher>,
    tree: SourceTree,
    policy: RiskPolicy,
    envelope: PermissionEnvelope,
    poll_interval: Duration,
    in_flight: Arc<Mutex<()>>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn WorkItemStore>,
        agent: Arc<dyn CodeAgent>,
        notifier: Arc<dyn Notifier>,
        releases: Arc<dyn ReleaseWatcher>,
        tree: SourceTree,
        policy: RiskPolicy,
        envelope: PermissionEnvelope,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            agent,
            notifier,
            releases,
            tree,
            policy,
            envelope,
            poll_interval,
            in_flight: Arc::new(Mutex::new(())),
        }
    }

    /// Share a guard with another instance. Whoever holds it runs; the
    /// other's ticks are no-ops.
    pub fn with_shared_guard(mut self, guard: Arc<Mutex<()>>) -> Self {
        self.in_flight = guard;
        self
    }

    pub fn guard(&self) -> Arc<Mutex<()>> {
        Arc::clone(&self.in_flight)
    }

    /// The poll loop. Runs until the process is stopped.
    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = self.poll_interval.as_secs(), "pipeline started");
        loop {
            ticker.tick().await;
            if let Err(e) = self.tick().await {
                warn!(error = %e, "tick failed");
            }
        }
    }

    /// One poll: process at most one item, pending before approved. A no-op
    /// while a cycle is already in flight.
    pub async fn tick(&self) -> Result<(), PipelineError> {
        let Ok(_guard) = self.in_flight.try_lock() else {
            return Ok(());
        };

        if let Some(item) = self.store.next_pending().await? {
            let span = info_span!("cycle", item = %item.id, queue = "pending");
            self.process_pending(item).instrument(span).await;
        } else if let Some(item) = self.store.next_approved().await? {
            let span = info_span!("cycle", item = %item.id, queue = "approved");
            self.process_approved(item).instrument(span).await;
        }
        Ok(())
    }

    async fn process_pending(&self, mut item: WorkItem) {
        info!(description = %item.description, "starting pending cycle");
        let outcome = self.pending_cycle(&mut item).await;

        // Unconditional: normal flow already cleans up, but this must also
        // cover the exception path.
        if let Err(e) = self.tree.restore_clean() {
            warn!(error = %e, "failed to restore clean tree after cycle");
        }

        if let Err(err) = outcome {
            self.finish_failed(&item, err).await;
        }
    }

    async fn pending_cycle(&self, item: &mut WorkItem) -> Result<(), PipelineError> {
        self.store
            .update(
                item.id,
                WorkItemPatch::new()
                    .status(WorkItemStatus::Processing)
                    .progress("Preparing a clean workspace")
                    .started_at(Utc::now()),
            )
            .await?;
        item.status = WorkItemStatus::Processing;
        self.notifier
            .post(Channel::Status, &notify::processing_started(item))
            .await;

        self.tree.sync_to_integrated()?;
        let base_sha = self.tree.head_sha()?;

        self.store
            .update(
                item.id,
                WorkItemPatch::new()
                    .status(WorkItemStatus::Building)
                    .progress("Generating changes"),
            )
            .await?;
        item.status = WorkItemStatus::Building;

        let report = match self.agent.execute(&item.description, &self.envelope).await {
            AgentOutcome::Completed(report) => report,
            AgentOutcome::TimedOut { secs } => return Err(PipelineError::AgentTimeout { secs }),
            AgentOutcome::Failed { message } => return Err(PipelineError::AgentFailed { message }),
        };
        info!(duration_secs = report.duration_secs, "agent finished");

        // The diff is the ground truth; the report's file lists are advisory.
        let diff = self.tree.diff_since(&base_sha)?;
        if diff.is_empty() {
            return Err(PipelineError::NoChangesProduced);
        }

        let verdict = risk::classify(&diff, &report.risk, &self.policy);
        info!(decision = %verdict.decision, changes = diff.changes.len(), "classified");
        if verdict.decision == RiskDecision::HardBlock {
            return Err(PipelineError::HardBlocked {
                reasons: verdict.reasons,
            });
        }

        let branch = item
            .branch_name
            .clone()
            .unwrap_or_else(|| item.derive_branch_name(Utc::now()));
        item.branch_name = Some(branch.clone());
        self.tree.create_branch(&branch)?;
        let subject = truncate_error(&item.description, 60);
        let commit_sha = self
            .tree
            .commit_all(&format!("[ship] {} ({})", subject, item.id))?;
        self.tree.push(&branch)?;

        let assessment = verdict.clone().into_assessment(&report.risk);
        let recorded = WorkItemPatch::new()
            .branch_name(&branch)
            .commit_sha(&commit_sha)
            .files(report.files_created.clone(), report.files_modified.clone())
            .build_summary(&report.summary)
            .risk_assessment(assessment);

        match verdict.decision {
            RiskDecision::AutoMerge => {
                let merged = self.tree.merge_into_integrated(&branch)?;
                self.tree.push(self.tree.integrated_branch())?;
                self.tree.delete_branch(&branch)?;

                let version = self.releases.wait_for_label(&merged).await;
                if version.is_none() {
                    warn!(%merged, "release label did not arrive within the window");
                }
                let location = report
                    .page_url
                    .clone()
                    .unwrap_or_else(|| short_location(self.tree.integrated_branch(), &merged));
                self.store
                    .update(
                        item.id,
                        recorded
                            .status(WorkItemStatus::Completed)
                            .deploy_decision(DeployDecision::AutoMerged)
                            .merged_sha(&merged)
                            .progress(&format!("Live at {}", location))
                            .completed_at(Utc::now()),
                    )
                    .await?;
                self.notifier
                    .post(
                        Channel::Status,
                        &notify::completed(item, &location, version.as_deref()),
                    )
                    .await;
            }
            RiskDecision::NeedsReview => {
                self.store
                    .update(
                        item.id,
                        recorded
                            .status(WorkItemStatus::Review)
                            .deploy_decision(DeployDecision::BranchedForReview)
                            .progress("Awaiting human review"),
                    )
                    .await?;
                self.notifier
                    .post(Channel::Review, &notify::needs_review(item, &verdict.reasons))
                    .await;
            }
            RiskDecision::HardBlock => unreachable!("hard block short-circuits before any commit"),
        }
        Ok(())
    }

    /// Terminal failure path for a pending cycle. Exactly one notification:
    /// blocked items get the blocked template with their reasons, everything
    /// else the failed template with truncated error text.
    async fn finish_failed(&self, item: &WorkItem, err: PipelineError) {
        let text = truncate_error(&err.to_string(), ERROR_TEXT_CAP);
        warn!(error = %text, "cycle failed");
        let patch = WorkItemPatch::new()
            .status(WorkItemStatus::Failed)
            .progress(&text)
            .completed_at(Utc::now());
        if let Err(e) = self.store.update(item.id, patch).await {
            warn!(error = %e, "failed to record failure on work item");
        }
        let message = match &err {
            PipelineError::HardBlocked { reasons } => notify::blocked(item, reasons),
            _ => notify::failed(item, &text),
        };
        self.notifier.post(Channel::Status, &message).await;
    }

    async fn process_approved(&self, mut item: WorkItem) {
        info!(description = %item.description, "starting approved merge cycle");
        let outcome = self.approved_cycle(&mut item).await;

        if let Err(e) = self.tree.restore_clean() {
            warn!(error = %e, "failed to restore clean tree after cycle");
        }

        if let Err(err) = outcome {
            // Back to review, not failed: the branch is intact and a human
            // can retry the merge.
            let text = truncate_error(&err.to_string(), ERROR_TEXT_CAP);
            warn!(error = %text, "approved merge failed, returning to review");
            let patch = WorkItemPatch::new()
                .status(WorkItemStatus::Review)
                .progress(&format!("Merge failed, returned to review: {}", text));
            if let Err(e) = self.store.update(item.id, patch).await {
                warn!(error = %e, "failed to return item to review");
            }
            self.notifier
                .post(
                    Channel::Review,
                    &notify::needs_review(&item, &[format!("merge failed: {}", text)]),
                )
                .await;
        }
    }

    async fn approved_cycle(&self, item: &mut WorkItem) -> Result<(), PipelineError> {
        self.store
            .update(
                item.id,
                WorkItemPatch::new()
                    .status(WorkItemStatus::Processing)
                    .progress("Merging approved change"),
            )
            .await?;
        item.status = WorkItemStatus::Processing;

        let branch = item.branch_name.clone().ok_or_else(|| {
            PipelineError::Store(format!("approved item {} has no recorded branch", item.id))
        })?;

        self.tree.sync_to_integrated()?;
        let merged = self.tree.merge_into_integrated(&branch)?;
        self.tree.push(self.tree.integrated_branch())?;
        self.tree.delete_branch(&branch)?;

        let version = self.releases.wait_for_label(&merged).await;
        if version.is_none() {
            warn!(%merged, "release label did not arrive within the window");
        }
        let location = short_location(self.tree.integrated_branch(), &merged);
        self.store
            .update(
                item.id,
                WorkItemPatch::new()
                    .status(WorkItemStatus::Completed)
                    .deploy_decision(DeployDecision::AdminApproved)
                    .merged_sha(&merged)
                    .progress(&format!("Merged after approval: {}", location))
                    .completed_at(Utc::now()),
            )
            .await?;
        self.notifier
            .post(
                Channel::Status,
                &notify::completed(item, &location, version.as_deref()),
            )
            .await;
        Ok(())
    }
}

fn short_location(branch: &str, sha: &str) -> String {
    format!("{} @ {}", branch, &sha[..sha.len().min(8)])
}
