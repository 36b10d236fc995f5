//! Typed error hierarchy for the shipwright pipeline.
//!
//! One enum covers the whole delivery cycle. The variants mirror the ways a
//! cycle can end short of a merge: agent faults, policy blocks, tree faults,
//! and store faults. `NoChangesProduced` and `HardBlocked` are terminal
//! outcomes rather than crashes; they carry enough detail for the work item's
//! progress message.

use thiserror::Error;

/// Cap on error text persisted to the store or sent to humans.
pub const ERROR_TEXT_CAP: usize = 500;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to spawn agent process: {0}")]
    AgentSpawn(#[source] std::io::Error),

    #[error("agent failed: {message}")]
    AgentFailed { message: String },

    #[error("agent exceeded the {secs}s wall-clock budget and was terminated")]
    AgentTimeout { secs: u64 },

    #[error("no changes produced")]
    NoChangesProduced,

    #[error("blocked by policy: {}", reasons.join("; "))]
    HardBlocked { reasons: Vec<String> },

    #[error("git {op} failed: {source}")]
    VersionControl {
        op: &'static str,
        #[source]
        source: git2::Error,
    },

    #[error("merge of {branch} failed: {message}")]
    MergeFailed { branch: String, message: String },

    #[error("work item store error: {0}")]
    Store(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    /// Whether this error is a policy block rather than a fault.
    pub fn is_hard_block(&self) -> bool {
        matches!(self, PipelineError::HardBlocked { .. })
    }
}

/// Truncate error text to `max` characters, marking the cut.
///
/// Always cuts on a char boundary so multi-byte text stays valid.
pub fn truncate_error(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max).collect();
    format!("{}…", cut.trim_end())
}
