//! Execution report parsing.
//!
//! The agent's output is untyped external text. One total function maps
//! whatever came back — valid JSON, JSON inside a fenced block, JSON buried
//! in narrative, or plain prose — onto the strict `ExecutionReport` shape,
//! so downstream logic only ever sees one type. Unparseable output degrades
//! to the raw text as summary, empty file lists, and a needs-review default.

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;

use crate::errors::truncate_error;
use crate::workitem::{RiskAssessment, RiskDecision};

/// Cap on a summary recovered from unparseable output.
const FALLBACK_SUMMARY_CAP: usize = 500;

static FENCED_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").unwrap());

/// What one agent invocation produced. Ephemeral: folded into the work item
/// at the end of the cycle and discarded.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub summary: String,
    pub files_created: Vec<String>,
    pub files_modified: Vec<String>,
    pub page_url: Option<String>,
    pub risk: RiskAssessment,
    pub notes: Option<String>,
    pub duration_secs: f64,
}

#[derive(Debug, Default, Deserialize)]
struct RawReport {
    #[serde(default)]
    summary: String,
    #[serde(default)]
    files_created: Vec<String>,
    #[serde(default)]
    files_modified: Vec<String>,
    #[serde(default)]
    page_url: Option<String>,
    #[serde(default)]
    risk_assessment: Option<RawRisk>,
    #[serde(default)]
    notes: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawRisk {
    #[serde(default)]
    decision: String,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    touches_existing_functionality: bool,
    #[serde(default)]
    could_confuse_users: bool,
    #[serde(default)]
    removes_or_changes_features: bool,
}

/// Lenient mapping of whatever the agent wrote in `decision`. Unknown
/// strings land on needs-review, never on auto-merge.
fn parse_decision(raw: &str) -> RiskDecision {
    match raw.trim().to_lowercase().replace('-', "_").as_str() {
        "auto_merge" | "automerge" | "auto" | "safe" => RiskDecision::AutoMerge,
        "hard_block" | "block" | "blocked" => RiskDecision::HardBlock,
        _ => RiskDecision::NeedsReview,
    }
}

fn into_report(raw: RawReport) -> ExecutionReport {
    let risk = match raw.risk_assessment {
        Some(r) => RiskAssessment {
            decision: parse_decision(&r.decision),
            reason: r.reason,
            touches_existing_functionality: r.touches_existing_functionality,
            could_confuse_users: r.could_confuse_users,
            removes_or_changes_features: r.removes_or_changes_features,
        },
        None => RiskAssessment::default_needs_review("agent did not assess risk"),
    };
    let summary = if raw.summary.trim().is_empty() {
        "agent returned no summary".to_string()
    } else {
        raw.summary
    };
    ExecutionReport {
        summary,
        files_created: raw.files_created,
        files_modified: raw.files_modified,
        page_url: raw.page_url,
        risk,
        notes: raw.notes,
        duration_secs: 0.0,
    }
}

/// Extract a JSON object from text that may contain other content.
/// Uses brace-counting to find the outermost JSON object.
fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0;
    for (i, ch) in text[start..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

fn try_json(candidate: &str) -> Option<ExecutionReport> {
    serde_json::from_str::<RawReport>(candidate)
        .ok()
        .map(into_report)
}

/// Total parser for agent output. Tries, in order: the whole text as JSON,
/// the first fenced block, the first embedded JSON object, then falls back
/// to raw text with explicit defaults. Never fails.
pub fn parse_report(text: &str) -> ExecutionReport {
    if let Some(report) = try_json(text.trim()) {
        return report;
    }
    if let Some(cap) = FENCED_BLOCK.captures(text) {
        if let Some(report) = try_json(cap.get(1).map(|m| m.as_str()).unwrap_or_default()) {
            return report;
        }
    }
    if let Some(embedded) = extract_json_object(text) {
        if let Some(report) = try_json(embedded) {
            return report;
        }
    }
    let summary = if text.trim().is_empty() {
        "agent produced no output".to_string()
    } else {
        truncate_error(text.trim(), FALLBACK_SUMMARY_CAP)
    };
    ExecutionReport {
        summary,
        files_created: Vec::new(),
        files_modified: Vec::new(),
        page_url: None,
        risk: RiskAssessment::default_needs_review("agent output was not parseable"),
        notes: None,
        duration_secs: 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WELL_FORMED: &str = r#"{
        "summary": "Added a standalone status page",
        "files_created": ["pages/status.html"],
        "files_modified": [],
        "page_url": "/status",
        "risk_assessment": {
            "decision": "auto_merge",
            "reason": "new standalone page",
            "touches_existing_functionality": false,
            "could_confuse_users": false,
            "removes_or_changes_features": false
        },
        "notes": "nothing unusual"
    }"#;

    #[test]
    fn parses_direct_json() {
        let report = parse_report(WELL_FORMED);
        assert_eq!(report.summary, "Added a standalone status page");
        assert_eq!(report.files_created, vec!["pages/status.html"]);
        assert_eq!(report.risk.decision, RiskDecision::AutoMerge);
        assert_eq!(report.page_url.as_deref(), Some("/status"));
    }

    #[test]
    fn parses_json_in_fenced_block() {
        let text = format!("Here is what I did.\n\n```json\n{}\n```\n\nAll done!", WELL_FORMED);
        let report = parse_report(&text);
        assert_eq!(report.summary, "Added a standalone status page");
        assert_eq!(report.risk.decision, RiskDecision::AutoMerge);
    }

    #[test]
    fn parses_json_in_untagged_fence() {
        let text = format!("```\n{}\n```", WELL_FORMED);
        let report = parse_report(&text);
        assert_eq!(report.summary, "Added a standalone status page");
    }

    #[test]
    fn parses_json_embedded_in_narrative() {
        let text = format!(
            "I finished the work order. {} Let me know if anything else is needed.",
            WELL_FORMED.replace('\n', " ")
        );
        let report = parse_report(&text);
        assert_eq!(report.files_created, vec!["pages/status.html"]);
    }

    #[test]
    fn unparseable_output_degrades_to_raw_text() {
        let report = parse_report("I made some changes but forgot the format, sorry.");
        assert_eq!(
            report.summary,
            "I made some changes but forgot the format, sorry."
        );
        assert!(report.files_created.is_empty());
        assert!(report.files_modified.is_empty());
        assert_eq!(report.risk.decision, RiskDecision::NeedsReview);
    }

    #[test]
    fn empty_output_gets_explicit_summary() {
        let report = parse_report("   \n  ");
        assert_eq!(report.summary, "agent produced no output");
        assert_eq!(report.risk.decision, RiskDecision::NeedsReview);
    }

    #[test]
    fn long_unparseable_output_is_truncated() {
        let text = "word ".repeat(500);
        let report = parse_report(&text);
        assert!(report.summary.chars().count() <= FALLBACK_SUMMARY_CAP + 1);
    }

    #[test]
    fn missing_risk_assessment_defaults_to_needs_review() {
        let report = parse_report(r#"{"summary": "did things", "files_created": ["a.html"]}"#);
        assert_eq!(report.risk.decision, RiskDecision::NeedsReview);
        assert!(report.risk.reason.contains("did not assess"));
    }

    #[test]
    fn unknown_decision_string_is_needs_review() {
        let report = parse_report(
            r#"{"summary": "x", "risk_assessment": {"decision": "probably fine"}}"#,
        );
        assert_eq!(report.risk.decision, RiskDecision::NeedsReview);
    }

    #[test]
    fn decision_parsing_is_lenient_about_separators() {
        assert_eq!(parse_decision("auto-merge"), RiskDecision::AutoMerge);
        assert_eq!(parse_decision("AUTO_MERGE"), RiskDecision::AutoMerge);
        assert_eq!(parse_decision("hard-block"), RiskDecision::HardBlock);
        assert_eq!(parse_decision("needs_review"), RiskDecision::NeedsReview);
        assert_eq!(parse_decision(""), RiskDecision::NeedsReview);
    }

    #[test]
    fn empty_summary_in_valid_json_gets_placeholder() {
        let report = parse_report(r#"{"files_created": ["a.html"]}"#);
        assert_eq!(report.summary, "agent returned no summary");
    }

    #[test]
    fn extract_json_object_handles_nesting_and_suffix() {
        let text = r#"prefix {"a": {"b": 1}} suffix"#;
        assert_eq!(extract_json_object(text), Some(r#"{"a": {"b": 1}}"#));
        assert_eq!(extract_json_object("no braces"), None);
        assert_eq!(extract_json_object(r#"{"unclosed": 1"#), None);
    }
}
