//! Risk classification for a produced change.
//!
//! A pure function over the actual diff (authoritative) and the agent's
//! self-assessment (advisory). Path rules are evaluated first and cannot be
//! overridden by anything the agent claims; the self-assessment can only
//! ever make the verdict stricter, never looser.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::tree::{ChangeKind, DiffResult};
use crate::workitem::{RiskAssessment, RiskDecision};

/// Path prefixes no generated change may touch, whatever the agent says.
/// Authentication, shared infrastructure, deployment config, secret stores.
const BUILTIN_FORBIDDEN: &[&str] = &[
    "auth/",
    "shared/",
    "infra/",
    "deploy/",
    ".github/",
    "secrets/",
    ".env",
];

/// The forbidden-path policy. Config can append prefixes; the built-in set
/// is always present and cannot be removed.
#[derive(Debug, Clone)]
pub struct RiskPolicy {
    forbidden: Vec<String>,
}

impl Default for RiskPolicy {
    fn default() -> Self {
        Self::with_extra(&[])
    }
}

impl RiskPolicy {
    pub fn with_extra(extra: &[String]) -> Self {
        let mut forbidden: Vec<String> =
            BUILTIN_FORBIDDEN.iter().map(|p| p.to_string()).collect();
        for prefix in extra {
            let prefix = prefix.trim();
            if !prefix.is_empty() && !forbidden.iter().any(|f| f == prefix) {
                forbidden.push(prefix.to_string());
            }
        }
        Self { forbidden }
    }

    pub fn is_forbidden(&self, path: &Path) -> bool {
        let normalized = path.to_string_lossy().replace('\\', "/");
        self.forbidden.iter().any(|prefix| {
            normalized.starts_with(prefix.as_str())
                || normalized
                    .split('/')
                    .any(|component| component == prefix.trim_end_matches('/'))
        })
    }

    pub fn forbidden_prefixes(&self) -> &[String] {
        &self.forbidden
    }
}

/// The classifier's verdict. Reasons accumulate rather than replace, so a
/// hard block can name every triggering path at once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub decision: RiskDecision,
    pub reasons: Vec<String>,
}

impl Classification {
    /// Fold the verdict and the agent's booleans into the persisted record.
    pub fn into_assessment(self, advisory: &RiskAssessment) -> RiskAssessment {
        RiskAssessment {
            decision: self.decision,
            reason: self.reasons.join("; "),
            touches_existing_functionality: advisory.touches_existing_functionality,
            could_confuse_users: advisory.could_confuse_users,
            removes_or_changes_features: advisory.removes_or_changes_features,
        }
    }
}

/// Classify a change. Fixed priority order over the actual changed paths:
///
/// 1. any forbidden path ⇒ hard block, regardless of self-assessment;
/// 2. any modified or deleted (pre-existing) path ⇒ at best needs review;
/// 3. an agent-declared needs-review (or stricter) is respected, never
///    upgraded — though the advisory alone can never force a hard block;
/// 4. otherwise every change is a new file outside the forbidden set and the
///    agent declared it safe ⇒ auto-merge.
pub fn classify(diff: &DiffResult, advisory: &RiskAssessment, policy: &RiskPolicy) -> Classification {
    let mut reasons = Vec::new();

    let forbidden: Vec<_> = diff
        .changes
        .iter()
        .filter(|c| policy.is_forbidden(&c.path))
        .collect();
    for change in &forbidden {
        reasons.push(format!(
            "touches forbidden path {}",
            change.path.display()
        ));
    }
    if !forbidden.is_empty() {
        return Classification {
            decision: RiskDecision::HardBlock,
            reasons,
        };
    }

    let mut decision = RiskDecision::AutoMerge;

    let touched: Vec<_> = diff
        .changes
        .iter()
        .filter(|c| c.kind != ChangeKind::Added)
        .collect();
    if !touched.is_empty() {
        decision = RiskDecision::NeedsReview;
        for change in &touched {
            reasons.push(format!(
                "{} pre-existing file {}",
                match change.kind {
                    ChangeKind::Modified => "modifies",
                    ChangeKind::Deleted => "deletes",
                    ChangeKind::Added => unreachable!(),
                },
                change.path.display()
            ));
        }
    }

    if advisory.decision > RiskDecision::AutoMerge {
        // Advisory is a floor on caution, not a path rule: it can hold the
        // verdict at needs-review but cannot hard-block on its own.
        decision = RiskDecision::NeedsReview;
        let why = if advisory.reason.is_empty() {
            "no reason given".to_string()
        } else {
            advisory.reason.clone()
        };
        reasons.push(format!("agent assessed {}: {}", advisory.decision, why));
    }

    if decision == RiskDecision::AutoMerge {
        reasons.push("all changes are new files outside the forbidden set".to_string());
    }

    Classification { decision, reasons }
}
