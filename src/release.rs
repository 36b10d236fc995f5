//! Versioning-signal watcher.
//!
//! An independent external process stamps each integrated commit with a
//! release identifier sometime after merge. The watcher polls for that
//! stamp for a bounded window; missing the window is non-fatal — the cycle
//! completes without a version label.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::debug;

#[async_trait]
pub trait ReleaseWatcher: Send + Sync {
    /// Wait (bounded) for the release label of `merge_sha`. `None` means
    /// the window elapsed without a stamp.
    async fn wait_for_label(&self, merge_sha: &str) -> Option<String>;
}

#[derive(Debug, Deserialize)]
struct ReleaseRecord {
    version: String,
}

pub struct HttpReleaseWatcher {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    poll_interval: Duration,
    window: Duration,
}

impl HttpReleaseWatcher {
    pub fn new(
        base_url: &str,
        token: Option<String>,
        poll_interval: Duration,
        window: Duration,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            poll_interval,
            window,
        }
    }

    async fn fetch_version(&self, merge_sha: &str) -> Option<String> {
        let url = format!("{}/releases/{}", self.base_url, merge_sha);
        let mut req = self.client.get(&url);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await.ok()?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return None;
        }
        let record: ReleaseRecord = resp.error_for_status().ok()?.json().await.ok()?;
        Some(record.version)
    }
}

#[async_trait]
impl ReleaseWatcher for HttpReleaseWatcher {
    async fn wait_for_label(&self, merge_sha: &str) -> Option<String> {
        let deadline = Instant::now() + self.window;
        loop {
            if let Some(version) = self.fetch_version(merge_sha).await {
                debug!(%merge_sha, %version, "release label arrived");
                return Some(version);
            }
            if Instant::now() + self.poll_interval > deadline {
                return None;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
