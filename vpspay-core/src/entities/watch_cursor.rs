//! Height the chain watcher resumes backfilling from after a restart.

use crate::framework::DatabaseProcessor;
use kanau::processor::Processor;

#[derive(Debug, Clone, Copy)]
pub struct LoadWatchCursor;

impl Processor<LoadWatchCursor> for DatabaseProcessor {
    type Output = Option<i64>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:LoadWatchCursor")]
    async fn process(&self, _query: LoadWatchCursor) -> Result<Option<i64>, sqlx::Error> {
        sqlx::query_scalar::<_, i64>("SELECT height FROM watch_cursor WHERE id = 0")
            .fetch_optional(&self.pool)
            .await
    }
}

/// Raise the cursor to `height`. It never moves down.
#[derive(Debug, Clone, Copy)]
pub struct SaveWatchCursor {
    pub height: i64,
}

impl Processor<SaveWatchCursor> for DatabaseProcessor {
    type Output = ();
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:SaveWatchCursor")]
    async fn process(&self, save: SaveWatchCursor) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO watch_cursor (id, height) VALUES (0, $1) \
             ON CONFLICT (id) DO UPDATE SET height = GREATEST(watch_cursor.height, EXCLUDED.height)",
        )
        .bind(save.height)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
