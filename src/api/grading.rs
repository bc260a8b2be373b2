use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use validator::Validate;

use crate::api::errors::ApiError;
use crate::core::state::AppState;
use crate::repositories::assignments;
use crate::schemas::grading::{RetryStatusResponse, SubmitRequest, SubmitResponse};
use crate::services::grading::{GradeInput, SubmitError};

pub(crate) fn router() -> Router<AppState> {
    Router::new()
        .route("/assignments/:assignment_id/students/:student_id", post(submit_artifact))
        .route("/assignments/:assignment_id/students/:student_id/retry-status", get(retry_status))
}

/// Grades a new artifact. Responds only once the attempt has reached a
/// terminal state, so the returned record is already persisted.
async fn submit_artifact(
    State(state): State<AppState>,
    Path((assignment_id, student_id)): Path<(String, String)>,
    Json(payload): Json<SubmitRequest>,
) -> Result<Json<SubmitResponse>, ApiError> {
    payload.validate().map_err(|err| ApiError::BadRequest(err.to_string()))?;

    let assignment = assignments::find_by_id(state.db(), &assignment_id)
        .await
        .map_err(|err| ApiError::internal(err, "Failed to load assignment"))?
        .ok_or_else(|| ApiError::NotFound(format!("Assignment {assignment_id} not found")))?;

    let task_description =
        assignment.description.clone().unwrap_or_else(|| assignment.title.clone());

    let input = GradeInput {
        assignment_id,
        student_id,
        artifact_text: payload.artifact_text,
        task_description,
        reference_answer: assignment.reference_answer,
        rubric: assignment.rubric.0,
        max_score: assignment.max_score,
    };

    match state.pipeline().submit(input).await {
        Ok(report) => Ok(Json(report.into())),
        Err(SubmitError::QuotaExceeded { used }) => Err(ApiError::TooManyRequests(format!(
            "Grading attempt limit reached ({used} attempts in the current 24-hour window)"
        ))),
        Err(SubmitError::Store(err)) => Err(ApiError::internal(err, "Failed to run grading")),
    }
}

/// Read-only budget inquiry. Always answers, including at zero remaining.
async fn retry_status(
    State(state): State<AppState>,
    Path((assignment_id, student_id)): Path<(String, String)>,
) -> Result<Json<RetryStatusResponse>, ApiError> {
    let assignment = assignments::find_by_id(state.db(), &assignment_id)
        .await
        .map_err(|err| ApiError::internal(err, "Failed to load assignment"))?;
    if assignment.is_none() {
        return Err(ApiError::NotFound(format!("Assignment {assignment_id} not found")));
    }

    let status = state
        .pipeline()
        .retry_status(&assignment_id, &student_id)
        .await
        .map_err(|err| ApiError::internal(err, "Failed to read attempt usage"))?;

    Ok(Json(status.into()))
}
