use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use time::PrimitiveDateTime;
use uuid::Uuid;

use crate::core::config::Settings;
use crate::core::time::primitive_now_utc;
use crate::db::types::SubmissionStatus;
use crate::repositories::submissions::{
    NewSubmission, StoreError, SubmissionOutcome, SubmissionStore,
};
use crate::services::ai_client::{GradeRequest, GradingBackend, GradingCallError};
use crate::services::attempts::{usage_message, AttemptLimiter};
use crate::services::normalizer::{self, NormalizedGrading};

pub(crate) const REFERENCE_MATCH_FEEDBACK: &str =
    "The submission matches the reference answer exactly. Full marks.";

const MALFORMED_FEEDBACK: &str = "The grading service returned an unreadable response, so this \
    attempt could not be graded.";

const PERSISTENCE_FAILED_FEEDBACK: &str = "Grading completed but the result could not be saved. \
    This attempt is recorded as failed; please try again later.";

/// Which terminal failure produced a `failed` report. `None` on a graded one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GradingFailure {
    Rejected,
    Malformed,
    Timeout,
    Persistence,
}

/// A new-artifact grading request, with the assignment context already
/// resolved by the caller.
#[derive(Debug, Clone)]
pub(crate) struct GradeInput {
    pub(crate) assignment_id: String,
    pub(crate) student_id: String,
    pub(crate) artifact_text: String,
    pub(crate) task_description: String,
    pub(crate) reference_answer: Option<String>,
    pub(crate) rubric: serde_json::Value,
    pub(crate) max_score: f64,
}

#[derive(Debug, Clone)]
pub(crate) struct GradingReport {
    pub(crate) submission_id: String,
    pub(crate) status: SubmissionStatus,
    pub(crate) score: Option<f64>,
    pub(crate) feedback: String,
    pub(crate) strengths: Vec<String>,
    pub(crate) improvements: Vec<String>,
    pub(crate) corrections: Vec<String>,
    pub(crate) processed_at: PrimitiveDateTime,
    pub(crate) failure: Option<GradingFailure>,
}

#[derive(Debug, Clone)]
pub(crate) struct RetryStatus {
    pub(crate) attempts_used: u32,
    pub(crate) attempts_remaining: u32,
    pub(crate) can_submit: bool,
    pub(crate) message: String,
}

#[derive(Debug, Error)]
pub(crate) enum SubmitError {
    #[error("grading attempt limit reached ({used} attempts used in the current window)")]
    QuotaExceeded { used: u32 },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One async mutex per (assignment, student) pair so the limiter check and
/// the record insert are atomic for that pair. Pairs never contend with each
/// other. Pair ids arrive from request paths, so entries whose lock is no
/// longer held anywhere are pruned on every access to keep the map bounded
/// by the number of in-flight pairs.
#[derive(Default)]
struct PairLocks {
    inner: std::sync::Mutex<HashMap<(String, String), Arc<tokio::sync::Mutex<()>>>>,
}

impl PairLocks {
    fn entry(&self, assignment_id: &str, student_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        // strong_count == 1 means only the map holds the lock; no guard or
        // pending waiter can exist for it.
        map.retain(|_, lock| Arc::strong_count(lock) > 1);
        map.entry((assignment_id.to_string(), student_id.to_string()))
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }
}

#[derive(Clone)]
pub(crate) struct GradingPipeline {
    inner: Arc<PipelineInner>,
}

struct PipelineInner {
    store: Arc<dyn SubmissionStore>,
    backend: Arc<dyn GradingBackend>,
    limiter: AttemptLimiter,
    locks: PairLocks,
    persist_attempts: u32,
    persist_delay: Duration,
}

impl GradingPipeline {
    pub(crate) fn new(
        store: Arc<dyn SubmissionStore>,
        backend: Arc<dyn GradingBackend>,
        settings: &Settings,
    ) -> Self {
        let grading = settings.grading();
        Self::with_policy(
            store,
            backend,
            grading.max_attempts_per_window,
            grading.attempt_window_hours,
            grading.persist_retry_attempts,
            Duration::from_millis(grading.persist_retry_delay_ms),
        )
    }

    pub(crate) fn with_policy(
        store: Arc<dyn SubmissionStore>,
        backend: Arc<dyn GradingBackend>,
        max_attempts: u32,
        window_hours: i64,
        persist_attempts: u32,
        persist_delay: Duration,
    ) -> Self {
        let limiter = AttemptLimiter::new(store.clone(), max_attempts, window_hours);
        Self {
            inner: Arc::new(PipelineInner {
                store,
                backend,
                limiter,
                locks: PairLocks::default(),
                persist_attempts,
                persist_delay,
            }),
        }
    }

    /// Runs a new-artifact submission to a terminal state. The work is
    /// spawned onto the runtime so a caller that disconnects mid-call does
    /// not abort the attempt: the result is still persisted and the attempt
    /// still counts.
    pub(crate) async fn submit(&self, input: GradeInput) -> Result<GradingReport, SubmitError> {
        let pipeline = self.clone();
        match tokio::spawn(async move { pipeline.run_submission(input).await }).await {
            Ok(result) => result,
            Err(err) => {
                Err(SubmitError::Store(StoreError::Unavailable(format!("grading task: {err}"))))
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn lock_count(&self) -> usize {
        self.inner.locks.len()
    }

    /// Pure inquiry; never consumes an attempt and never fails on an
    /// exhausted budget.
    pub(crate) async fn retry_status(
        &self,
        assignment_id: &str,
        student_id: &str,
    ) -> Result<RetryStatus, StoreError> {
        let usage =
            self.inner.limiter.usage(assignment_id, student_id, primitive_now_utc()).await?;

        Ok(RetryStatus {
            attempts_used: usage.used,
            attempts_remaining: usage.remaining,
            can_submit: usage.can_submit,
            message: usage_message(&usage, self.inner.limiter.max_attempts()),
        })
    }

    async fn run_submission(&self, input: GradeInput) -> Result<GradingReport, SubmitError> {
        let pair_lock = self.inner.locks.entry(&input.assignment_id, &input.student_id);
        let _guard = pair_lock.lock_owned().await;

        let now = primitive_now_utc();
        let usage = self.inner.limiter.usage(&input.assignment_id, &input.student_id, now).await?;
        if !usage.can_submit {
            tracing::info!(
                assignment_id = %input.assignment_id,
                student_id = %input.student_id,
                used = usage.used,
                "Submission rejected: attempt budget exhausted"
            );
            metrics::counter!("grading_jobs_total", "status" => "quota_exceeded").increment(1);
            return Err(SubmitError::QuotaExceeded { used: usage.used });
        }

        // Byte-identical artifacts cannot score below full marks; skipping
        // the AI call avoids spurious safety rejections and does not consume
        // an attempt.
        let short_circuit = input.reference_answer.as_deref() == Some(input.artifact_text.as_str());

        let submission_id = Uuid::new_v4().to_string();
        self.inner
            .store
            .insert_pending(NewSubmission {
                id: submission_id.clone(),
                assignment_id: input.assignment_id.clone(),
                student_id: input.student_id.clone(),
                attempt_index: usage.used as i32 + 1,
                consumed_attempt: !short_circuit,
                created_at: now,
            })
            .await?;

        self.inner.store.mark_processing(&submission_id, primitive_now_utc()).await?;

        if short_circuit {
            tracing::info!(submission_id = %submission_id, "Artifact matches the reference answer; grading without an AI call");
            metrics::counter!("grading_jobs_total", "status" => "short_circuit").increment(1);
            let normalized = NormalizedGrading::perfect(REFERENCE_MATCH_FEEDBACK.to_string());
            return self.finish(&submission_id, SubmissionStatus::Graded, normalized, None).await;
        }

        let request = GradeRequest {
            artifact_text: input.artifact_text.clone(),
            task_description: input.task_description.clone(),
            reference_solution: input
                .reference_answer
                .clone()
                .unwrap_or_else(|| "No reference solution; grade against the rubric.".to_string()),
            rubric: input.rubric.clone(),
            max_score: input.max_score,
            submission_id: submission_id.clone(),
        };

        let timer = Instant::now();
        let call_result = self.inner.backend.grade(request).await;
        metrics::histogram!("grading_duration_seconds").record(timer.elapsed().as_secs_f64());

        match call_result {
            Ok(raw) => match normalizer::normalize(&raw) {
                Ok(normalized) => {
                    metrics::counter!("grading_jobs_total", "status" => "success").increment(1);
                    self.finish(&submission_id, SubmissionStatus::Graded, normalized, None).await
                }
                Err(err) => {
                    tracing::error!(
                        submission_id = %submission_id,
                        error = %err,
                        "AI response failed normalization"
                    );
                    metrics::counter!("grading_jobs_total", "status" => "malformed").increment(1);
                    self.finish(
                        &submission_id,
                        SubmissionStatus::Failed,
                        NormalizedGrading::failure(MALFORMED_FEEDBACK.to_string()),
                        Some(GradingFailure::Malformed),
                    )
                    .await
                }
            },
            Err(err) => self.finish_client_failure(&submission_id, err).await,
        }
    }

    async fn finish_client_failure(
        &self,
        submission_id: &str,
        err: GradingCallError,
    ) -> Result<GradingReport, SubmitError> {
        let (failure, label, feedback) = match &err {
            GradingCallError::Rejected(reason) => (
                GradingFailure::Rejected,
                "rejected",
                format!(
                    "The grading service declined to grade this submission: {reason}. \
                     The attempt still counts toward your daily limit."
                ),
            ),
            GradingCallError::Malformed(_) => {
                (GradingFailure::Malformed, "malformed", MALFORMED_FEEDBACK.to_string())
            }
            GradingCallError::Timeout(secs) => (
                GradingFailure::Timeout,
                "timeout",
                format!(
                    "The grading service did not respond within {secs} seconds. \
                     Submitting again will consume a new attempt."
                ),
            ),
        };

        tracing::error!(submission_id, error = %err, "AI grading call failed");
        metrics::counter!("grading_jobs_total", "status" => label).increment(1);

        self.finish(
            submission_id,
            SubmissionStatus::Failed,
            NormalizedGrading::failure(feedback),
            Some(failure),
        )
        .await
    }

    async fn finish(
        &self,
        submission_id: &str,
        status: SubmissionStatus,
        normalized: NormalizedGrading,
        failure: Option<GradingFailure>,
    ) -> Result<GradingReport, SubmitError> {
        let processed_at = primitive_now_utc();
        let outcome = SubmissionOutcome {
            id: submission_id.to_string(),
            status,
            ai_score: normalized.score,
            ai_feedback: normalized.feedback.clone(),
            ai_strengths: normalizer::serialize_list(&normalized.strengths),
            ai_improvements: normalizer::serialize_list(&normalized.improvements),
            ai_corrections: normalizer::serialize_list(&normalized.corrections),
            processed_at,
        };

        match self.persist_with_retry(&outcome).await {
            Ok(()) => Ok(GradingReport {
                submission_id: submission_id.to_string(),
                status,
                score: normalized.score,
                feedback: normalized.feedback,
                strengths: normalized.strengths,
                improvements: normalized.improvements,
                corrections: normalized.corrections,
                processed_at,
                failure,
            }),
            Err(err) => {
                // The computed result goes into the log so nothing is
                // silently discarded with it.
                tracing::error!(
                    submission_id,
                    error = %err,
                    score = ?normalized.score,
                    feedback = %normalized.feedback,
                    strengths = ?normalized.strengths,
                    improvements = ?normalized.improvements,
                    corrections = ?normalized.corrections,
                    "Persisting grading result failed after all retries"
                );
                metrics::counter!("grading_jobs_total", "status" => "persistence_failed")
                    .increment(1);

                if let Err(mark_err) = self
                    .inner
                    .store
                    .mark_failed(submission_id, PERSISTENCE_FAILED_FEEDBACK, primitive_now_utc())
                    .await
                {
                    tracing::warn!(submission_id, error = %mark_err, "Failed to mark submission as failed");
                }

                Ok(GradingReport {
                    submission_id: submission_id.to_string(),
                    status: SubmissionStatus::Failed,
                    score: normalized.score,
                    feedback: PERSISTENCE_FAILED_FEEDBACK.to_string(),
                    strengths: normalized.strengths,
                    improvements: normalized.improvements,
                    corrections: normalized.corrections,
                    processed_at,
                    failure: Some(GradingFailure::Persistence),
                })
            }
        }
    }

    async fn persist_with_retry(&self, outcome: &SubmissionOutcome) -> Result<(), StoreError> {
        let mut last_error = None;

        for attempt in 1..=self.inner.persist_attempts {
            match self.inner.store.persist_outcome(outcome.clone()).await {
                Ok(()) => {
                    if attempt > 1 {
                        tracing::info!(
                            submission_id = %outcome.id,
                            attempt,
                            "Grading result persisted after retry"
                        );
                    }
                    return Ok(());
                }
                Err(err) => {
                    tracing::warn!(
                        submission_id = %outcome.id,
                        attempt,
                        error = %err,
                        "Persisting grading result failed"
                    );
                    last_error = Some(err);
                    if attempt < self.inner.persist_attempts {
                        tokio::time::sleep(self.inner.persist_delay).await;
                    }
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| StoreError::Unavailable("persistence retries exhausted".into())))
    }
}
