//! Runtime configuration for the pipeline.
//!
//! Layered: `shipwright.toml` in the project directory, then environment
//! overrides for deployment-sensitive values (store URL/token, agent
//! command, webhook URLs). Everything has a default except the store URL,
//! which validation insists on.
//!
//! # Configuration File Format
//!
//! ```toml
//! [store]
//! url = "https://ops.example.com/api"
//!
//! [agent]
//! cmd = "claude"
//! args = ["--print", "--dangerously-skip-permissions"]
//! timeout_secs = 900
//! max_iterations = 25
//!
//! [pipeline]
//! poll_interval_secs = 30
//!
//! [git]
//! remote = "origin"
//! integrated_branch = "main"
//!
//! [notify]
//! status_webhook = "https://hooks.example.com/T000/B000/xxx"
//! review_webhook = "https://hooks.example.com/T000/B111/yyy"
//!
//! [risk]
//! forbidden_paths = ["billing/"]
//!
//! [release]
//! poll_interval_secs = 5
//! poll_window_secs = 60
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

pub const CONFIG_FILE: &str = "shipwright.toml";

#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub store_url: String,
    pub store_token: Option<String>,
    pub agent_cmd: String,
    pub agent_args: Vec<String>,
    pub agent_timeout_secs: u64,
    pub agent_max_iterations: u32,
    pub poll_interval_secs: u64,
    pub remote: String,
    pub integrated_branch: String,
    pub status_webhook: Option<String>,
    pub review_webhook: Option<String>,
    /// Extra forbidden path prefixes; the built-in set always applies.
    pub forbidden_paths: Vec<String>,
    pub release_poll_interval_secs: u64,
    pub release_poll_window_secs: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default)]
    store: StoreSection,
    #[serde(default)]
    agent: AgentSection,
    #[serde(default)]
    pipeline: PipelineSection,
    #[serde(default)]
    git: GitSection,
    #[serde(default)]
    notify: NotifySection,
    #[serde(default)]
    risk: RiskSection,
    #[serde(default)]
    release: ReleaseSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct StoreSection {
    url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct AgentSection {
    cmd: Option<String>,
    args: Option<Vec<String>>,
    timeout_secs: Option<u64>,
    max_iterations: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PipelineSection {
    poll_interval_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct GitSection {
    remote: Option<String>,
    integrated_branch: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct NotifySection {
    status_webhook: Option<String>,
    review_webhook: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RiskSection {
    forbidden_paths: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ReleaseSection {
    poll_interval_secs: Option<u64>,
    poll_window_secs: Option<u64>,
}

fn env_or(name: &str, file_value: Option<String>) -> Option<String> {
    std::env::var(name).ok().or(file_value)
}

impl Config {
    pub fn load(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;

        let path = project_dir.join(CONFIG_FILE);
        let file: FileConfig = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            toml::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))?
        } else {
            FileConfig::default()
        };

        Ok(Self {
            project_dir,
            store_url: env_or("SHIPWRIGHT_STORE_URL", file.store.url).unwrap_or_default(),
            store_token: env_or("SHIPWRIGHT_STORE_TOKEN", None),
            agent_cmd: env_or("SHIPWRIGHT_AGENT_CMD", file.agent.cmd)
                .unwrap_or_else(|| "claude".to_string()),
            agent_args: file.agent.args.unwrap_or_else(|| {
                vec![
                    "--print".to_string(),
                    "--dangerously-skip-permissions".to_string(),
                ]
            }),
            agent_timeout_secs: file.agent.timeout_secs.unwrap_or(900),
            agent_max_iterations: file.agent.max_iterations.unwrap_or(25),
            poll_interval_secs: file.pipeline.poll_interval_secs.unwrap_or(30),
            remote: file.git.remote.unwrap_or_else(|| "origin".to_string()),
            integrated_branch: file
                .git
                .integrated_branch
                .unwrap_or_else(|| "main".to_string()),
            status_webhook: env_or("SHIPWRIGHT_STATUS_WEBHOOK", file.notify.status_webhook),
            review_webhook: env_or("SHIPWRIGHT_REVIEW_WEBHOOK", file.notify.review_webhook),
            forbidden_paths: file.risk.forbidden_paths.unwrap_or_default(),
            release_poll_interval_secs: file.release.poll_interval_secs.unwrap_or(5),
            release_poll_window_secs: file.release.poll_window_secs.unwrap_or(60),
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.store_url.is_empty() {
            bail!(
                "store url is not configured; set [store].url in {} or SHIPWRIGHT_STORE_URL",
                CONFIG_FILE
            );
        }
        if !self.store_url.starts_with("http://") && !self.store_url.starts_with("https://") {
            bail!("store url must be http(s), got '{}'", self.store_url);
        }
        if self.agent_cmd.is_empty() {
            bail!("agent command must not be empty");
        }
        if self.agent_timeout_secs == 0 {
            bail!("agent timeout must be greater than zero");
        }
        if self.poll_interval_secs == 0 {
            bail!("poll interval must be greater than zero");
        }
        if self.remote.is_empty() || self.integrated_branch.is_empty() {
            bail!("git remote and integrated branch must not be empty");
        }
        Ok(())
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn release_poll_interval(&self) -> Duration {
        Duration::from_secs(self.release_poll_interval_secs)
    }

    pub fn release_poll_window(&self) -> Duration {
        Duration::from_secs(self.release_poll_window_secs)
    }
}
