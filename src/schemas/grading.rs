use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::core::time::format_primitive;
use crate::services::grading::{GradingFailure, GradingReport, RetryStatus};

#[derive(Debug, Deserialize, Validate)]
pub(crate) struct SubmitRequest {
    #[validate(length(min = 1, max = 100_000, message = "artifact_text must be non-empty"))]
    pub(crate) artifact_text: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct SubmitResponse {
    pub(crate) submission_id: String,
    pub(crate) status: String,
    pub(crate) score: Option<f64>,
    pub(crate) feedback: String,
    pub(crate) strengths: Vec<String>,
    pub(crate) improvements: Vec<String>,
    pub(crate) corrections: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) failure: Option<&'static str>,
    pub(crate) processed_at: String,
}

impl From<GradingReport> for SubmitResponse {
    fn from(report: GradingReport) -> Self {
        Self {
            submission_id: report.submission_id,
            status: report.status.as_str().to_string(),
            score: report.score,
            feedback: report.feedback,
            strengths: report.strengths,
            improvements: report.improvements,
            corrections: report.corrections,
            failure: report.failure.map(failure_label),
            processed_at: format_primitive(report.processed_at),
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct RetryStatusResponse {
    pub(crate) attempts_used: u32,
    pub(crate) attempts_remaining: u32,
    pub(crate) can_submit: bool,
    pub(crate) message: String,
}

impl From<RetryStatus> for RetryStatusResponse {
    fn from(status: RetryStatus) -> Self {
        Self {
            attempts_used: status.attempts_used,
            attempts_remaining: status.attempts_remaining,
            can_submit: status.can_submit,
            message: status.message,
        }
    }
}

fn failure_label(failure: GradingFailure) -> &'static str {
    match failure {
        GradingFailure::Rejected => "rejected",
        GradingFailure::Malformed => "malformed",
        GradingFailure::Timeout => "timeout",
        GradingFailure::Persistence => "persistence",
    }
}
