use std::fmt::Write as _;

use serde::Serialize;

use crate::activity::{Activity, ActivityStatus};
use crate::composite::IntegratedModel;
use crate::kernel::MessageSummary;
use crate::model::ValidationReport;
use crate::{Error, Result};

/// Status of one activity and its children after a run.
#[derive(Debug, Clone, Serialize)]
pub struct ActivityReport {
    pub name: String,
    pub status: ActivityStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_summary: Option<MessageSummary>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ActivityReport>,
}

impl ActivityReport {
    pub fn from_activity(activity: &dyn Activity) -> Self {
        Self {
            name: activity.name().to_string(),
            status: activity.status(),
            failure: activity.lifecycle().failure().map(str::to_string),
            messages: activity.kernel_messages(),
            message_summary: activity.kernel_summary(),
            children: activity
                .children()
                .iter()
                .map(|child| Self::from_activity(child.as_ref()))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub model: String,
    pub status: ActivityStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow: Option<ActivityReport>,
    pub duration: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<serde_json::Value>,
}

impl RunReport {
    pub fn new(model: &IntegratedModel, error: Option<&Error>) -> Self {
        Self {
            model: model.name().to_string(),
            status: model.status(),
            workflow: model.current_workflow().map(|w| ActivityReport::from_activity(w)),
            duration: model.time().window().duration_text(),
            error: error.map(|e| {
                serde_json::json!({
                    "kind": e.kind(),
                    "exit_code": e.exit_code(),
                    "message": e.to_string(),
                    "activity": e.root_cause().activity_name(),
                })
            }),
        }
    }
}

pub fn format_run_summary(report: &RunReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{} ({}): {}", report.model, report.duration, report.status);
    if let Some(workflow) = &report.workflow {
        write_activity(&mut out, workflow, 1);
    }
    if let Some(error) = &report.error {
        if let Some(message) = error.get("message").and_then(|m| m.as_str()) {
            let _ = writeln!(out, "error: {message}");
        }
    }
    out
}

fn write_activity(out: &mut String, report: &ActivityReport, depth: usize) {
    let indent = "  ".repeat(depth);
    let _ = writeln!(out, "{indent}{:<24} {}", report.name, report.status);
    if let Some(failure) = &report.failure {
        let _ = writeln!(out, "{indent}  failure: {failure}");
    }
    if let Some(summary) = &report.message_summary {
        if summary.dropped > 0 {
            let _ = writeln!(out, "{indent}  | ({} earlier messages dropped)", summary.dropped);
        }
    }
    for message in &report.messages {
        let _ = writeln!(out, "{indent}  | {message}");
    }
    if let Some(summary) = report.message_summary.as_ref().filter(|s| s.has_problems()) {
        let _ = writeln!(
            out,
            "{indent}  messages: {} errors, {} warnings",
            summary.errors, summary.warnings
        );
    }
    for child in &report.children {
        write_activity(out, child, depth + 1);
    }
}

pub fn format_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value).map_err(|e| Error::Serialization(e.to_string()))
}

pub fn format_validation(reports: &[ValidationReport]) -> String {
    let mut out = String::new();
    for report in reports {
        if report.is_valid() {
            let _ = writeln!(out, "{}: ok", report.subject);
        } else {
            for issue in &report.issues {
                let _ = writeln!(out, "{}: {issue}", report.subject);
            }
        }
    }
    out
}
