use sqlx::PgPool;

/// Runs the SQL query objects in [`crate::entities`] against a shared pool.
#[derive(Clone)]
pub struct DatabaseProcessor {
    pub pool: PgPool,
}
