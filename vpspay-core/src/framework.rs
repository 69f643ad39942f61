use sqlx::PgPool;

/// Runs query objects (see the `entities` module) against the pool.
#[derive(Clone)]
pub struct DatabaseProcessor {
    pub pool: PgPool,
}
