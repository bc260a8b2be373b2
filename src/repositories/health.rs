use sqlx::PgPool;

/// Round-trips a trivial query so the health endpoint reflects actual
/// database reachability, not just pool state.
pub(crate) async fn ping(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query_scalar::<_, i32>("SELECT 1").fetch_one(pool).await?;
    Ok(())
}
