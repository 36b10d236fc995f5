//! Notification dispatch.
//!
//! Best-effort by contract: a delivery failure is logged and swallowed,
//! never allowed to fail a cycle. One template per state the pipeline can
//! announce; the webhook payload is the channel-agnostic `{ "text": ... }`.

use async_trait::async_trait;
use serde_json::json;
use tracing::warn;

use crate::workitem::WorkItem;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// General status updates for the requester's benefit.
    Status,
    /// Items waiting on a human reviewer.
    Review,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn post(&self, channel: Channel, message: &str);
}

pub struct WebhookNotifier {
    client: reqwest::Client,
    status_url: Option<String>,
    review_url: Option<String>,
}

impl WebhookNotifier {
    pub fn new(status_url: Option<String>, review_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            status_url,
            review_url,
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn post(&self, channel: Channel, message: &str) {
        // The reviewer channel falls back to the status channel when unset.
        let url = match channel {
            Channel::Status => self.status_url.as_ref(),
            Channel::Review => self.review_url.as_ref().or(self.status_url.as_ref()),
        };
        let Some(url) = url else { return };

        let result = self
            .client
            .post(url)
            .json(&json!({ "text": message }))
            .send()
            .await
            .and_then(|resp| resp.error_for_status());
        if let Err(e) = result {
            warn!(channel = ?channel, error = %e, "notification delivery failed");
        }
    }
}

pub fn processing_started(item: &WorkItem) -> String {
    format!(
        ":gear: Working on \"{}\" (requested by {})",
        item.description, item.requested_by
    )
}

pub fn completed(item: &WorkItem, location: &str, version: Option<&str>) -> String {
    match version {
        Some(version) => format!(
            ":white_check_mark: \"{}\" is live at {} (release {})",
            item.description, location, version
        ),
        None => format!(
            ":white_check_mark: \"{}\" is live at {} (release pending)",
            item.description, location
        ),
    }
}

pub fn needs_review(item: &WorkItem, reasons: &[String]) -> String {
    let branch = item.branch_name.as_deref().unwrap_or("<unknown>");
    format!(
        ":mag: \"{}\" needs review on branch {}\n{}",
        item.description,
        branch,
        reasons
            .iter()
            .map(|r| format!("  - {}", r))
            .collect::<Vec<_>>()
            .join("\n")
    )
}

pub fn blocked(item: &WorkItem, reasons: &[String]) -> String {
    format!(
        ":no_entry: \"{}\" was blocked, no changes kept\n{}",
        item.description,
        reasons
            .iter()
            .map(|r| format!("  - {}", r))
            .collect::<Vec<_>>()
            .join("\n")
    )
}

pub fn failed(item: &WorkItem, error_text: &str) -> String {
    format!(":x: \"{}\" failed: {}", item.description, error_text)
}
