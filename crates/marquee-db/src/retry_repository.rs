use chrono::{DateTime, Utc};
use sqlx::{PgPool, Pool, Postgres};
use uuid::Uuid;

use marquee_core::error::AppError;
use marquee_core::retry::RetryItem;
use marquee_core::traits::RetryRepository;

/// PostgreSQL-backed retry queue. The `task_id` unique constraint enforces
/// one queued item per task across every process sharing the database.
#[derive(Clone)]
pub struct PgRetryRepository {
    pool: Pool<Postgres>,
}

impl PgRetryRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

// -- Internal row type for sqlx deserialization --

#[derive(sqlx::FromRow)]
struct RetryItemRow {
    id: Uuid,
    task_id: String,
    task_type: String,
    payload: String,
    attempt_count: i32,
    max_attempts: i32,
    last_error: Option<String>,
    next_attempt_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<RetryItemRow> for RetryItem {
    fn from(row: RetryItemRow) -> Self {
        RetryItem {
            id: row.id,
            task_id: row.task_id,
            task_type: row.task_type,
            payload: row.payload,
            attempt_count: row.attempt_count.max(0) as u32,
            max_attempts: row.max_attempts.max(1) as u32,
            last_error: row.last_error,
            next_attempt_at: row.next_attempt_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

fn db_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

impl RetryRepository for PgRetryRepository {
    async fn add(&self, item: &RetryItem) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO retry_items
                (id, task_id, task_type, payload, attempt_count, max_attempts,
                 last_error, next_attempt_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (task_id) DO NOTHING
            "#,
        )
        .bind(item.id)
        .bind(&item.task_id)
        .bind(&item.task_type)
        .bind(&item.payload)
        .bind(item.attempt_count as i32)
        .bind(item.max_attempts as i32)
        .bind(&item.last_error)
        .bind(item.next_attempt_at)
        .bind(item.created_at)
        .bind(item.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(result.rows_affected() == 1)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<RetryItem>, AppError> {
        let row = sqlx::query_as::<_, RetryItemRow>(r#"SELECT * FROM retry_items WHERE id = $1"#)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(row.map(Into::into))
    }

    async fn find_by_task_id(&self, task_id: &str) -> Result<Option<RetryItem>, AppError> {
        let row =
            sqlx::query_as::<_, RetryItemRow>(r#"SELECT * FROM retry_items WHERE task_id = $1"#)
                .bind(task_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(row.map(Into::into))
    }

    async fn get_pending(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RetryItem>, AppError> {
        let rows = sqlx::query_as::<_, RetryItemRow>(
            r#"
            SELECT * FROM retry_items
            WHERE next_attempt_at <= $1
            ORDER BY next_attempt_at ASC, created_at ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(db_limit(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn list(&self, limit: usize) -> Result<Vec<RetryItem>, AppError> {
        let rows = sqlx::query_as::<_, RetryItemRow>(
            r#"
            SELECT * FROM retry_items
            ORDER BY next_attempt_at ASC, created_at ASC
            LIMIT $1
            "#,
        )
        .bind(db_limit(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn update(&self, item: &RetryItem) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE retry_items
            SET attempt_count = $2,
                max_attempts = $3,
                last_error = $4,
                next_attempt_at = $5,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(item.id)
        .bind(item.attempt_count as i32)
        .bind(item.max_attempts as i32)
        .bind(&item.last_error)
        .bind(item.next_attempt_at)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("retry item {}", item.id)));
        }
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool, AppError> {
        let result = sqlx::query(r#"DELETE FROM retry_items WHERE id = $1"#)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_by_task_id(&self, task_id: &str) -> Result<bool, AppError> {
        let result = sqlx::query(r#"DELETE FROM retry_items WHERE task_id = $1"#)
            .bind(task_id)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn count(&self) -> Result<u64, AppError> {
        let (count,): (i64,) = sqlx::query_as(r#"SELECT COUNT(*) FROM retry_items"#)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(count.max(0) as u64)
    }

    async fn clear_all(&self) -> Result<u64, AppError> {
        let result = sqlx::query(r#"DELETE FROM retry_items"#)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        tracing::info!(removed = result.rows_affected(), "Cleared retry queue");
        Ok(result.rows_affected())
    }
}
