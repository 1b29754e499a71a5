use async_trait::async_trait;
use farmsync_types::InstructionPayload;
use serde_json::Value;
use sqlx::{PgConnection, Postgres, Transaction};
use time::OffsetDateTime;

use crate::application::repos::{InstructionLogRepo, InstructionScope, RepoError};
use crate::domain::entities::InstructionRecord;

use super::{APPEND_LOCK_KEY, PostgresRepositories, map_sqlx_error};

/// Rows older than the cutoff, except the newest row of the log.
pub(super) const DELETE_EXPIRED_INSTRUCTIONS_SQL: &str = r#"
    DELETE FROM cache_instructions
    WHERE created_at < $1
      AND id < (SELECT COALESCE(MAX(id), 0) FROM cache_instructions)
"#;

#[derive(sqlx::FromRow)]
struct InstructionRow {
    id: i64,
    created_at: OffsetDateTime,
    origin_id: String,
    payload: Value,
    command_count: i32,
}

impl From<InstructionRow> for InstructionRecord {
    fn from(row: InstructionRow) -> Self {
        Self {
            id: row.id,
            created_at: row.created_at,
            origin_id: row.origin_id,
            payload: row.payload,
            command_count: row.command_count,
        }
    }
}

fn encode_row(payload: &InstructionPayload) -> Result<(Value, i32), RepoError> {
    if payload.is_empty() {
        return Err(RepoError::InvalidInput {
            message: "instruction payload has no commands".to_string(),
        });
    }
    let value = payload.to_value().map_err(|err| RepoError::InvalidInput {
        message: err.to_string(),
    })?;
    let count = i32::try_from(payload.command_count()).map_err(|_| RepoError::InvalidInput {
        message: "instruction payload has too many keyed effects".to_string(),
    })?;
    Ok((value, count))
}

/// Insert one row while holding the append lock until the surrounding transaction ends.
async fn insert_instruction(
    conn: &mut PgConnection,
    origin_id: &str,
    payload: &InstructionPayload,
) -> Result<i64, RepoError> {
    let (value, command_count) = encode_row(payload)?;

    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(APPEND_LOCK_KEY)
        .execute(&mut *conn)
        .await
        .map_err(map_sqlx_error)?;

    sqlx::query_scalar::<_, i64>(
        r#"
        INSERT INTO cache_instructions (origin_id, payload, command_count)
        VALUES ($1, $2, $3)
        RETURNING id
        "#,
    )
    .bind(origin_id)
    .bind(value)
    .bind(command_count)
    .fetch_one(&mut *conn)
    .await
    .map_err(map_sqlx_error)
}

#[async_trait]
impl<'c> InstructionScope for Transaction<'c, Postgres> {
    async fn append_instruction(
        &mut self,
        origin_id: &str,
        payload: &InstructionPayload,
    ) -> Result<i64, RepoError> {
        insert_instruction(&mut **self, origin_id, payload).await
    }
}

#[async_trait]
impl InstructionLogRepo for PostgresRepositories {
    async fn append(
        &self,
        origin_id: &str,
        payload: &InstructionPayload,
    ) -> Result<i64, RepoError> {
        let mut tx = self.begin().await.map_err(map_sqlx_error)?;
        let id = insert_instruction(&mut *tx, origin_id, payload).await?;
        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(id)
    }

    async fn read_since(
        &self,
        after_id: i64,
        limit: u32,
    ) -> Result<Vec<InstructionRecord>, RepoError> {
        let rows = sqlx::query_as::<_, InstructionRow>(
            r#"
            SELECT id, created_at, origin_id, payload, command_count
            FROM cache_instructions
            WHERE id > $1
            ORDER BY id ASC
            LIMIT $2
            "#,
        )
        .bind(after_id)
        .bind(i64::from(limit))
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(rows.into_iter().map(InstructionRecord::from).collect())
    }

    async fn max_id(&self) -> Result<i64, RepoError> {
        let max = sqlx::query_scalar::<_, Option<i64>>("SELECT MAX(id) FROM cache_instructions")
            .fetch_one(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        Ok(max.unwrap_or(0))
    }

    async fn oldest_id(&self) -> Result<Option<i64>, RepoError> {
        sqlx::query_scalar::<_, Option<i64>>("SELECT MIN(id) FROM cache_instructions")
            .fetch_one(self.pool())
            .await
            .map_err(map_sqlx_error)
    }

    async fn contains(&self, id: i64) -> Result<bool, RepoError> {
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM cache_instructions WHERE id = $1)",
        )
        .bind(id)
        .fetch_one(self.pool())
        .await
        .map_err(map_sqlx_error)
    }

    async fn count(&self) -> Result<u64, RepoError> {
        let total = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM cache_instructions")
            .fetch_one(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        Self::convert_count(total)
    }

    async fn pending_command_count(&self, after_id: i64) -> Result<u64, RepoError> {
        let total = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COALESCE(SUM(command_count), 0)::BIGINT
            FROM cache_instructions
            WHERE id > $1
            "#,
        )
        .bind(after_id)
        .fetch_one(self.pool())
        .await
        .map_err(map_sqlx_error)?;
        Self::convert_count(total)
    }

    async fn delete_older_than(&self, cutoff: OffsetDateTime) -> Result<u64, RepoError> {
        let result = sqlx::query(DELETE_EXPIRED_INSTRUCTIONS_SQL)
            .bind(cutoff)
            .execute(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        Ok(result.rows_affected())
    }
}
