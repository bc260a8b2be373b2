use async_trait::async_trait;
use sqlx::PgPool;
use thiserror::Error;
use time::PrimitiveDateTime;

use crate::db::models::Submission;
use crate::db::types::SubmissionStatus;

const COLUMNS: &str = "id, assignment_id, student_id, status, ai_score, ai_feedback, \
                       ai_strengths, ai_improvements, ai_corrections, attempt_index, \
                       consumed_attempt, processed_at, created_at, updated_at";

#[derive(Debug, Error)]
pub(crate) enum StoreError {
    #[error("storage error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone)]
pub(crate) struct NewSubmission {
    pub(crate) id: String,
    pub(crate) assignment_id: String,
    pub(crate) student_id: String,
    pub(crate) attempt_index: i32,
    pub(crate) consumed_attempt: bool,
    pub(crate) created_at: PrimitiveDateTime,
}

/// Terminal write for a grading attempt. Applying it twice to the same
/// record is a no-op overwrite, which is what makes persistence retries safe.
#[derive(Debug, Clone)]
pub(crate) struct SubmissionOutcome {
    pub(crate) id: String,
    pub(crate) status: SubmissionStatus,
    pub(crate) ai_score: Option<f64>,
    pub(crate) ai_feedback: String,
    pub(crate) ai_strengths: Option<String>,
    pub(crate) ai_improvements: Option<String>,
    pub(crate) ai_corrections: Option<String>,
    pub(crate) processed_at: PrimitiveDateTime,
}

#[async_trait]
pub(crate) trait SubmissionStore: Send + Sync {
    /// Counts attempts for the pair whose creation time falls after `cutoff`.
    /// Short-circuited submissions carry `consumed_attempt = false` and are
    /// excluded.
    async fn count_attempts_since(
        &self,
        assignment_id: &str,
        student_id: &str,
        cutoff: PrimitiveDateTime,
    ) -> Result<u32, StoreError>;

    async fn insert_pending(&self, submission: NewSubmission) -> Result<(), StoreError>;

    async fn mark_processing(
        &self,
        submission_id: &str,
        now: PrimitiveDateTime,
    ) -> Result<(), StoreError>;

    async fn persist_outcome(&self, outcome: SubmissionOutcome) -> Result<(), StoreError>;

    async fn mark_failed(
        &self,
        submission_id: &str,
        feedback: &str,
        now: PrimitiveDateTime,
    ) -> Result<(), StoreError>;

    async fn find_by_id(&self, submission_id: &str) -> Result<Option<Submission>, StoreError>;
}

#[derive(Debug, Clone)]
pub(crate) struct PgSubmissionStore {
    pool: PgPool,
}

impl PgSubmissionStore {
    pub(crate) fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SubmissionStore for PgSubmissionStore {
    async fn count_attempts_since(
        &self,
        assignment_id: &str,
        student_id: &str,
        cutoff: PrimitiveDateTime,
    ) -> Result<u32, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*)
             FROM submissions
             WHERE assignment_id = $1
               AND student_id = $2
               AND consumed_attempt
               AND created_at >= $3",
        )
        .bind(assignment_id)
        .bind(student_id)
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await?;

        Ok(count.max(0) as u32)
    }

    async fn insert_pending(&self, submission: NewSubmission) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO submissions (id, assignment_id, student_id, status, attempt_index,
                                      consumed_attempt, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $7)",
        )
        .bind(&submission.id)
        .bind(&submission.assignment_id)
        .bind(&submission.student_id)
        .bind(SubmissionStatus::Pending)
        .bind(submission.attempt_index)
        .bind(submission.consumed_attempt)
        .bind(submission.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_processing(
        &self,
        submission_id: &str,
        now: PrimitiveDateTime,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE submissions
             SET status = $1, updated_at = $2
             WHERE id = $3",
        )
        .bind(SubmissionStatus::Processing)
        .bind(now)
        .bind(submission_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn persist_outcome(&self, outcome: SubmissionOutcome) -> Result<(), StoreError> {
        // Every attempt checks out its own pooled connection; the pool is
        // configured with test_before_acquire, so a stale session from a
        // previous failure is discarded instead of reused.
        let mut conn = self.pool.acquire().await?;

        sqlx::query(
            "UPDATE submissions
             SET status = $1,
                 ai_score = $2,
                 ai_feedback = $3,
                 ai_strengths = $4,
                 ai_improvements = $5,
                 ai_corrections = $6,
                 processed_at = $7,
                 updated_at = $7
             WHERE id = $8",
        )
        .bind(outcome.status)
        .bind(outcome.ai_score)
        .bind(&outcome.ai_feedback)
        .bind(&outcome.ai_strengths)
        .bind(&outcome.ai_improvements)
        .bind(&outcome.ai_corrections)
        .bind(outcome.processed_at)
        .bind(&outcome.id)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    async fn mark_failed(
        &self,
        submission_id: &str,
        feedback: &str,
        now: PrimitiveDateTime,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE submissions
             SET status = $1, ai_feedback = $2, processed_at = $3, updated_at = $3
             WHERE id = $4",
        )
        .bind(SubmissionStatus::Failed)
        .bind(feedback)
        .bind(now)
        .bind(submission_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_by_id(&self, submission_id: &str) -> Result<Option<Submission>, StoreError> {
        let submission = sqlx::query_as::<_, Submission>(&format!(
            "SELECT {COLUMNS}
             FROM submissions
             WHERE id = $1"
        ))
        .bind(submission_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(submission)
    }
}
