//! Code-generation agent invocation.
//!
//! The agent is an external capability: given a work order and a permission
//! envelope it mutates files in the working tree and reports back. Timeout
//! and failure are first-class outcomes rather than exceptions crossing the
//! process boundary.

use std::time::Duration;

use async_trait::async_trait;

pub mod report;
pub mod runner;

pub use report::{ExecutionReport, parse_report};
pub use runner::SubprocessAgent;

/// The fixed envelope every invocation runs under.
#[derive(Debug, Clone)]
pub struct PermissionEnvelope {
    pub allowed_operations: Vec<String>,
    pub forbidden_paths: Vec<String>,
    pub max_iterations: u32,
    pub timeout: Duration,
}

impl PermissionEnvelope {
    pub fn new(forbidden_paths: Vec<String>, max_iterations: u32, timeout: Duration) -> Self {
        Self {
            allowed_operations: vec![
                "create new files".to_string(),
                "edit files you created".to_string(),
                "read any file for context".to_string(),
            ],
            forbidden_paths,
            max_iterations,
            timeout,
        }
    }
}

/// Tagged result of one agent invocation.
#[derive(Debug)]
pub enum AgentOutcome {
    Completed(ExecutionReport),
    TimedOut { secs: u64 },
    Failed { message: String },
}

#[async_trait]
pub trait CodeAgent: Send + Sync {
    /// Run the agent against the working tree. Never panics; every way the
    /// invocation can end maps to an `AgentOutcome` variant.
    async fn execute(&self, description: &str, envelope: &PermissionEnvelope) -> AgentOutcome;
}
