//! Shared fakes and helpers for unit tests. Compiled only for `cfg(test)`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use time::PrimitiveDateTime;
use uuid::Uuid;

use crate::db::models::Submission;
use crate::db::types::SubmissionStatus;
use crate::repositories::submissions::{
    NewSubmission, StoreError, SubmissionOutcome, SubmissionStore,
};
use crate::services::ai_client::{GradeRequest, GradingBackend, GradingCallError};
use crate::services::grading::{GradeInput, GradingPipeline};

/// Serializes tests that mutate process environment variables.
pub(crate) fn env_lock() -> MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(Mutex::default).lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// In-memory [`SubmissionStore`] with injectable persistence failures.
#[derive(Default)]
pub(crate) struct MemoryStore {
    records: Mutex<HashMap<String, Submission>>,
    fail_persists: AtomicU32,
    persist_calls: AtomicU32,
}

impl MemoryStore {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The next `count` calls to `persist_outcome` fail with a synthetic
    /// connection error.
    pub(crate) fn fail_next_persists(&self, count: u32) {
        self.fail_persists.store(count, Ordering::SeqCst);
    }

    pub(crate) fn persist_calls(&self) -> u32 {
        self.persist_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn record(&self, id: &str) -> Option<Submission> {
        self.lock_records().get(id).cloned()
    }

    pub(crate) fn records(&self) -> Vec<Submission> {
        self.lock_records().values().cloned().collect()
    }

    /// Seeds a prior consumed attempt for the pair, backdated to `created_at`.
    pub(crate) fn seed_attempt(
        &self,
        assignment_id: &str,
        student_id: &str,
        created_at: PrimitiveDateTime,
    ) {
        let id = Uuid::new_v4().to_string();
        self.lock_records().insert(
            id.clone(),
            Submission {
                id,
                assignment_id: assignment_id.to_string(),
                student_id: student_id.to_string(),
                status: SubmissionStatus::Graded,
                ai_score: Some(50.0),
                ai_feedback: Some("seeded attempt".to_string()),
                ai_strengths: None,
                ai_improvements: None,
                ai_corrections: None,
                attempt_index: 1,
                consumed_attempt: true,
                processed_at: Some(created_at),
                created_at,
                updated_at: created_at,
            },
        );
    }

    fn lock_records(&self) -> MutexGuard<'_, HashMap<String, Submission>> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl SubmissionStore for MemoryStore {
    async fn count_attempts_since(
        &self,
        assignment_id: &str,
        student_id: &str,
        cutoff: PrimitiveDateTime,
    ) -> Result<u32, StoreError> {
        let count = self
            .lock_records()
            .values()
            .filter(|record| {
                record.assignment_id == assignment_id
                    && record.student_id == student_id
                    && record.consumed_attempt
                    && record.created_at >= cutoff
            })
            .count();

        Ok(count as u32)
    }

    async fn insert_pending(&self, submission: NewSubmission) -> Result<(), StoreError> {
        self.lock_records().insert(
            submission.id.clone(),
            Submission {
                id: submission.id,
                assignment_id: submission.assignment_id,
                student_id: submission.student_id,
                status: SubmissionStatus::Pending,
                ai_score: None,
                ai_feedback: None,
                ai_strengths: None,
                ai_improvements: None,
                ai_corrections: None,
                attempt_index: submission.attempt_index,
                consumed_attempt: submission.consumed_attempt,
                processed_at: None,
                created_at: submission.created_at,
                updated_at: submission.created_at,
            },
        );

        Ok(())
    }

    async fn mark_processing(
        &self,
        submission_id: &str,
        now: PrimitiveDateTime,
    ) -> Result<(), StoreError> {
        if let Some(record) = self.lock_records().get_mut(submission_id) {
            record.status = SubmissionStatus::Processing;
            record.updated_at = now;
        }

        Ok(())
    }

    async fn persist_outcome(&self, outcome: SubmissionOutcome) -> Result<(), StoreError> {
        self.persist_calls.fetch_add(1, Ordering::SeqCst);

        let remaining = self.fail_persists.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_persists.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Unavailable("injected connection failure".to_string()));
        }

        if let Some(record) = self.lock_records().get_mut(&outcome.id) {
            record.status = outcome.status;
            record.ai_score = outcome.ai_score;
            record.ai_feedback = Some(outcome.ai_feedback);
            record.ai_strengths = outcome.ai_strengths;
            record.ai_improvements = outcome.ai_improvements;
            record.ai_corrections = outcome.ai_corrections;
            record.processed_at = Some(outcome.processed_at);
            record.updated_at = outcome.processed_at;
        }

        Ok(())
    }

    async fn mark_failed(
        &self,
        submission_id: &str,
        feedback: &str,
        now: PrimitiveDateTime,
    ) -> Result<(), StoreError> {
        if let Some(record) = self.lock_records().get_mut(submission_id) {
            record.status = SubmissionStatus::Failed;
            record.ai_feedback = Some(feedback.to_string());
            record.processed_at = Some(now);
            record.updated_at = now;
        }

        Ok(())
    }

    async fn find_by_id(&self, submission_id: &str) -> Result<Option<Submission>, StoreError> {
        Ok(self.record(submission_id))
    }
}

/// [`GradingBackend`] that replays queued responses. With an empty queue it
/// answers with a plain graded response, so happy-path tests need no setup.
#[derive(Default)]
pub(crate) struct ScriptedBackend {
    responses: Mutex<VecDeque<Result<Value, GradingCallError>>>,
    calls: AtomicU32,
    delay: Option<Duration>,
}

impl ScriptedBackend {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self { delay: Some(delay), ..Self::default() })
    }

    pub(crate) fn push_ok(&self, response: Value) {
        self.lock_responses().push_back(Ok(response));
    }

    pub(crate) fn push_err(&self, error: GradingCallError) {
        self.lock_responses().push_back(Err(error));
    }

    pub(crate) fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn lock_responses(&self) -> MutexGuard<'_, VecDeque<Result<Value, GradingCallError>>> {
        self.responses.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl GradingBackend for ScriptedBackend {
    async fn grade(&self, _request: GradeRequest) -> Result<Value, GradingCallError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        self.lock_responses().pop_front().unwrap_or_else(|| {
            Ok(json!({"score": 90, "feedback": "scripted default feedback"}))
        })
    }
}

/// Pipeline with the production limits but millisecond persistence retries.
pub(crate) fn test_pipeline(
    store: Arc<MemoryStore>,
    backend: Arc<ScriptedBackend>,
) -> GradingPipeline {
    GradingPipeline::with_policy(store, backend, 3, 24, 3, Duration::from_millis(5))
}

pub(crate) fn sample_input(artifact: &str, reference: Option<&str>) -> GradeInput {
    GradeInput {
        assignment_id: "hw-1".to_string(),
        student_id: "student-1".to_string(),
        artifact_text: artifact.to_string(),
        task_description: "Solve the equation and show your work.".to_string(),
        reference_answer: reference.map(str::to_string),
        rubric: json!({"method": 50, "result": 50}),
        max_score: 100.0,
    }
}
