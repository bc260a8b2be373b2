use sqlx::PgPool;

use crate::db::models::Assignment;

const COLUMNS: &str = "id, title, description, rubric, reference_answer, max_score, \
                       created_at, updated_at";

pub(crate) async fn find_by_id(
    pool: &PgPool,
    assignment_id: &str,
) -> Result<Option<Assignment>, sqlx::Error> {
    sqlx::query_as::<_, Assignment>(&format!(
        "SELECT {COLUMNS}
         FROM assignments
         WHERE id = $1"
    ))
    .bind(assignment_id)
    .fetch_optional(pool)
    .await
}
