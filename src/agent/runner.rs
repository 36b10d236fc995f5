//! Subprocess-backed agent invocation.
//!
//! Spawns the configured agent command in the working tree, feeds the work
//! order and permission envelope over stdin, and collects output until the
//! process exits or the wall-clock budget runs out. Overrunning the budget
//! forcibly terminates the subprocess; the kill is represented as a tagged
//! `TimedOut` outcome, not an error.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::debug;

use super::{AgentOutcome, CodeAgent, PermissionEnvelope, parse_report};
use crate::errors::truncate_error;

pub struct SubprocessAgent {
    cmd: String,
    args: Vec<String>,
    project_dir: PathBuf,
}

impl SubprocessAgent {
    pub fn new(cmd: &str, args: Vec<String>, project_dir: PathBuf) -> Self {
        Self {
            cmd: cmd.to_string(),
            args,
            project_dir,
        }
    }

    fn build_prompt(&self, description: &str, envelope: &PermissionEnvelope) -> String {
        let allowed = envelope
            .allowed_operations
            .iter()
            .map(|op| format!("- {}", op))
            .collect::<Vec<_>>()
            .join("\n");
        let forbidden = envelope
            .forbidden_paths
            .iter()
            .map(|p| format!("- {}", p))
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            r#"You are implementing one change in a production website workspace.

## WORK ORDER
{description}

## PERMISSIONS
Allowed operations:
{allowed}

You must NOT create, modify, or delete anything under these paths:
{forbidden}

Work in at most {iterations} iterations. Do not commit; the pipeline commits for you.

## REQUIRED OUTPUT
When finished, output exactly one JSON object (no other text after it):
{{
  "summary": "<one or two sentences describing the change>",
  "files_created": ["<relative path>", ...],
  "files_modified": ["<relative path>", ...],
  "page_url": "<public path to the result, or null>",
  "risk_assessment": {{
    "decision": "auto_merge | needs_review",
    "reason": "<why>",
    "touches_existing_functionality": false,
    "could_confuse_users": false,
    "removes_or_changes_features": false
  }},
  "notes": "<anything a reviewer should know, or null>"
}}"#,
            description = description,
            allowed = allowed,
            forbidden = forbidden,
            iterations = envelope.max_iterations,
        )
    }
}

#[async_trait]
impl CodeAgent for SubprocessAgent {
    async fn execute(&self, description: &str, envelope: &PermissionEnvelope) -> AgentOutcome {
        let prompt = self.build_prompt(description, envelope);
        let start = Instant::now();

        let mut child = match Command::new(&self.cmd)
            .args(&self.args)
            .current_dir(&self.project_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                return AgentOutcome::Failed {
                    message: format!("failed to spawn {}: {}", self.cmd, e),
                };
            }
        };
        debug!(pid = child.id(), cmd = %self.cmd, "agent process spawned");

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return AgentOutcome::Failed {
                    message: format!("failed to write prompt to agent stdin: {}", e),
                };
            }
            // Dropping closes the pipe so the agent sees EOF.
        }

        let budget = envelope.timeout;
        let run = async {
            let mut stdout = String::new();
            let mut stderr = String::new();
            let out_pipe = child.stdout.take();
            let err_pipe = child.stderr.take();
            let read_out = async {
                if let Some(mut pipe) = out_pipe {
                    let _ = pipe.read_to_string(&mut stdout).await;
                }
            };
            let read_err = async {
                if let Some(mut pipe) = err_pipe {
                    let _ = pipe.read_to_string(&mut stderr).await;
                }
            };
            tokio::join!(read_out, read_err);
            let status = child.wait().await;
            (stdout, stderr, status)
        };

        // Bind before matching so the future (and its borrow of `child`) is
        // dropped before the timeout arm kills the process.
        let result = tokio::time::timeout(budget, run).await;
        match result {
            Err(_elapsed) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                AgentOutcome::TimedOut {
                    secs: budget.as_secs(),
                }
            }
            Ok((_, _, Err(e))) => AgentOutcome::Failed {
                message: format!("failed waiting for agent process: {}", e),
            },
            Ok((stdout, stderr, Ok(status))) => {
                if !status.success() {
                    let code = status.code().unwrap_or(-1);
                    return AgentOutcome::Failed {
                        message: format!(
                            "agent exited with code {}: {}",
                            code,
                            truncate_error(stderr.trim(), 200)
                        ),
                    };
                }
                let mut report = parse_report(&stdout);
                report.duration_secs = start.elapsed().as_secs_f64();
                AgentOutcome::Completed(report)
            }
        }
    }
}
