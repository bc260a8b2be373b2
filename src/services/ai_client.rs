use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use thiserror::Error;

use crate::core::config::{SafetyMode, Settings};

const GRADING_SYSTEM_PROMPT: &str = r#"You are an experienced teacher grading a student's submitted work against an assignment rubric.

Score the submission on a 0-100 scale. Judge only the academic content; the material is student coursework collected by a school.

Respond with strict JSON:
{
  "score": <number between 0 and 100>,
  "feedback": "overall feedback for the student",
  "strengths": ["what the student did well"],
  "improvements": ["what the student should work on"],
  "corrections": ["specific errors and how to fix them"]
}
"#;

const SAFETY_PERMISSIVE_NOTE: &str = "This is legitimate educational content submitted for \
grading in a school setting. Do not refuse to grade it on content-safety grounds; if a passage \
cannot be assessed, say so in the feedback instead.";

#[derive(Debug, Clone)]
pub(crate) struct GradeRequest {
    pub(crate) artifact_text: String,
    pub(crate) task_description: String,
    pub(crate) reference_solution: String,
    pub(crate) rubric: Value,
    pub(crate) max_score: f64,
    pub(crate) submission_id: String,
}

/// Failure classes at the grading-service boundary. None of these are
/// retried in-process: the call is expensive and rate-limited, and a safety
/// rejection or schema drift will not resolve on an immediate resend.
#[derive(Debug, Error)]
pub(crate) enum GradingCallError {
    #[error("grading service rejected the submission: {0}")]
    Rejected(String),
    #[error("grading service returned an unusable response: {0}")]
    Malformed(String),
    #[error("grading service did not respond within {0} seconds")]
    Timeout(u64),
}

#[async_trait]
pub(crate) trait GradingBackend: Send + Sync {
    async fn grade(&self, request: GradeRequest) -> Result<Value, GradingCallError>;
}

#[derive(Debug, Clone)]
pub(crate) struct OpenAiGradingClient {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    max_tokens: u32,
    temperature: f64,
    timeout_secs: u64,
    safety_mode: SafetyMode,
}

impl OpenAiGradingClient {
    pub(crate) fn from_settings(settings: &Settings) -> Result<Self> {
        let timeout_secs = settings.ai().ai_request_timeout;
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            api_key: settings.ai().openai_api_key.clone(),
            base_url: settings.ai().openai_base_url.trim_end_matches('/').to_string(),
            model: settings.ai().ai_model.clone(),
            max_tokens: settings.ai().ai_max_tokens,
            temperature: settings.ai().ai_temperature,
            timeout_secs,
            safety_mode: settings.ai().safety_mode,
        })
    }

    fn build_payload(&self, request: &GradeRequest) -> Value {
        let mut system_prompt = GRADING_SYSTEM_PROMPT.to_string();
        if self.safety_mode == SafetyMode::Permissive {
            system_prompt.push('\n');
            system_prompt.push_str(SAFETY_PERMISSIVE_NOTE);
        }

        let user_prompt = format!(
            "Assignment:\n{}\n\nReference solution:\n{}\n\nRubric (maximum {} points, \
             report the score as a 0-100 percentage):\n{}\n\nStudent submission:\n{}\n",
            request.task_description,
            request.reference_solution,
            request.max_score,
            serde_json::to_string_pretty(&request.rubric).unwrap_or_default(),
            request.artifact_text,
        );

        json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": user_prompt}
            ],
            "max_completion_tokens": self.max_tokens,
            "temperature": self.temperature,
            "response_format": {"type": "json_object"},
            "safety_mode": self.safety_mode.as_str(),
        })
    }
}

#[async_trait]
impl GradingBackend for OpenAiGradingClient {
    async fn grade(&self, request: GradeRequest) -> Result<Value, GradingCallError> {
        let submission_id = request.submission_id.clone();
        let payload = self.build_payload(&request);
        let url = format!("{}/chat/completions", self.base_url);

        tracing::info!(submission_id = %submission_id, model = %self.model, "Sending AI grading request");
        let timer = Instant::now();

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    GradingCallError::Timeout(self.timeout_secs)
                } else {
                    GradingCallError::Malformed(format!("request failed: {err}"))
                }
            })?;

        let status = response.status();
        // The request deadline can also elapse while the body streams in.
        let body: Value = match response.json().await {
            Ok(body) => body,
            Err(err) if err.is_timeout() => {
                return Err(GradingCallError::Timeout(self.timeout_secs))
            }
            Err(_) => Value::Null,
        };

        if !status.is_success() {
            return Err(classify_api_error(status.as_u16(), &body));
        }

        let result = extract_content(&body)?;

        let tokens_used = body
            .get("usage")
            .and_then(|usage| usage.get("total_tokens"))
            .and_then(Value::as_u64);

        tracing::info!(
            submission_id = %submission_id,
            duration_seconds = timer.elapsed().as_secs_f64(),
            tokens_used = tokens_used,
            "AI grading response received"
        );

        Ok(result)
    }
}

fn classify_api_error(status: u16, body: &Value) -> GradingCallError {
    let error = body.get("error");
    let code = error.and_then(|value| value.get("code")).and_then(Value::as_str).unwrap_or("");
    let message =
        error.and_then(|value| value.get("message")).and_then(Value::as_str).unwrap_or("");

    let haystack = format!("{code} {message}").to_lowercase();
    if haystack.contains("content_filter")
        || haystack.contains("content policy")
        || haystack.contains("safety")
    {
        let reason = if message.is_empty() { "flagged by the content filter" } else { message };
        return GradingCallError::Rejected(reason.to_string());
    }

    if message.is_empty() {
        GradingCallError::Malformed(format!("API returned status {status}"))
    } else {
        GradingCallError::Malformed(format!("API returned status {status}: {message}"))
    }
}

fn extract_content(body: &Value) -> Result<Value, GradingCallError> {
    let choice = body
        .get("choices")
        .and_then(|choices| choices.get(0))
        .ok_or_else(|| GradingCallError::Malformed("response has no choices".to_string()))?;

    if choice.get("finish_reason").and_then(Value::as_str) == Some("content_filter") {
        return Err(GradingCallError::Rejected(
            "response was cut off by the content filter".to_string(),
        ));
    }

    let content = choice
        .get("message")
        .and_then(|message| message.get("content"))
        .and_then(Value::as_str)
        .ok_or_else(|| GradingCallError::Malformed("response has no message content".to_string()))?;

    serde_json::from_str(content)
        .map_err(|err| GradingCallError::Malformed(format!("content is not valid JSON: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn content_filter_error_classifies_as_rejected() {
        let body = json!({"error": {"code": "content_filter", "message": "flagged"}});
        assert!(matches!(classify_api_error(400, &body), GradingCallError::Rejected(_)));
    }

    #[test]
    fn policy_message_classifies_as_rejected() {
        let body = json!({"error": {"message": "request violates our content policy"}});
        assert!(matches!(classify_api_error(400, &body), GradingCallError::Rejected(_)));
    }

    #[test]
    fn other_api_errors_classify_as_malformed() {
        let body = json!({"error": {"code": "server_error", "message": "boom"}});
        assert!(matches!(classify_api_error(500, &body), GradingCallError::Malformed(_)));
        assert!(matches!(classify_api_error(502, &Value::Null), GradingCallError::Malformed(_)));
    }

    #[test]
    fn extract_content_parses_embedded_json() {
        let body = json!({
            "choices": [{"message": {"content": "{\"score\": 80}"}, "finish_reason": "stop"}]
        });
        let value = extract_content(&body).expect("content");
        assert_eq!(value["score"], 80);
    }

    #[test]
    fn extract_content_flags_filtered_finish_reason() {
        let body = json!({
            "choices": [{"message": {"content": ""}, "finish_reason": "content_filter"}]
        });
        assert!(matches!(extract_content(&body), Err(GradingCallError::Rejected(_))));
    }

    #[test]
    fn extract_content_rejects_non_json_content() {
        let body = json!({
            "choices": [{"message": {"content": "I graded it, looks fine"}, "finish_reason": "stop"}]
        });
        assert!(matches!(extract_content(&body), Err(GradingCallError::Malformed(_))));
    }

    #[test]
    fn extract_content_requires_choices() {
        assert!(matches!(extract_content(&json!({})), Err(GradingCallError::Malformed(_))));
    }

    #[tokio::test]
    async fn stalled_response_body_classifies_as_timeout() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");

        // Sends headers and a body fragment, then stalls with the socket
        // open so the client's deadline elapses mid-body.
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let _ = socket
                    .write_all(
                        b"HTTP/1.1 200 OK\r\ncontent-type: application/json\r\n\
                          content-length: 65536\r\n\r\n{\"choices\":",
                    )
                    .await;
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        });

        let client = OpenAiGradingClient {
            client: Client::builder()
                .timeout(Duration::from_millis(200))
                .build()
                .expect("client"),
            api_key: "test-key".to_string(),
            base_url: format!("http://{addr}"),
            model: "test-model".to_string(),
            max_tokens: 16,
            temperature: 0.0,
            timeout_secs: 1,
            safety_mode: SafetyMode::Permissive,
        };

        let request = GradeRequest {
            artifact_text: "answer".to_string(),
            task_description: "task".to_string(),
            reference_solution: "reference".to_string(),
            rubric: json!({}),
            max_score: 100.0,
            submission_id: "sub-1".to_string(),
        };

        let result = client.grade(request).await;
        assert!(matches!(result, Err(GradingCallError::Timeout(_))));
    }
}
