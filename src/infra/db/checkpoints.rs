use async_trait::async_trait;
use time::OffsetDateTime;

use crate::application::repos::{CheckpointRepo, RepoError};
use crate::domain::entities::CheckpointRecord;
use crate::domain::types::NodeId;

use super::{PostgresRepositories, map_sqlx_error};

pub(super) const DELETE_RETIRED_CHECKPOINTS_SQL: &str =
    "DELETE FROM cache_checkpoints WHERE updated_at < $1";

#[derive(sqlx::FromRow)]
struct CheckpointRow {
    node_id: String,
    last_applied_id: i64,
    updated_at: OffsetDateTime,
}

impl TryFrom<CheckpointRow> for CheckpointRecord {
    type Error = RepoError;

    fn try_from(row: CheckpointRow) -> Result<Self, Self::Error> {
        let node_id = NodeId::parse(row.node_id).map_err(|err| RepoError::Integrity {
            message: format!("stored checkpoint has an invalid node id: {err}"),
        })?;
        Ok(Self {
            node_id,
            last_applied_id: row.last_applied_id,
            updated_at: row.updated_at,
        })
    }
}

#[async_trait]
impl CheckpointRepo for PostgresRepositories {
    async fn get(&self, node_id: &NodeId) -> Result<Option<CheckpointRecord>, RepoError> {
        let row = sqlx::query_as::<_, CheckpointRow>(
            r#"
            SELECT node_id, last_applied_id, updated_at
            FROM cache_checkpoints
            WHERE node_id = $1
            "#,
        )
        .bind(node_id.as_str())
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        row.map(CheckpointRecord::try_from).transpose()
    }

    async fn advance(&self, node_id: &NodeId, last_applied_id: i64) -> Result<bool, RepoError> {
        let result = sqlx::query(
            r#"
            INSERT INTO cache_checkpoints (node_id, last_applied_id, updated_at)
            VALUES ($1, $2, now())
            ON CONFLICT (node_id) DO UPDATE
            SET last_applied_id = EXCLUDED.last_applied_id,
                updated_at = EXCLUDED.updated_at
            WHERE cache_checkpoints.last_applied_id < EXCLUDED.last_applied_id
            "#,
        )
        .bind(node_id.as_str())
        .bind(last_applied_id)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn touch(&self, node_id: &NodeId) -> Result<bool, RepoError> {
        let result =
            sqlx::query("UPDATE cache_checkpoints SET updated_at = now() WHERE node_id = $1")
                .bind(node_id.as_str())
                .execute(self.pool())
                .await
                .map_err(map_sqlx_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn list(&self) -> Result<Vec<CheckpointRecord>, RepoError> {
        let rows = sqlx::query_as::<_, CheckpointRow>(
            r#"
            SELECT node_id, last_applied_id, updated_at
            FROM cache_checkpoints
            ORDER BY node_id ASC
            "#,
        )
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        rows.into_iter().map(CheckpointRecord::try_from).collect()
    }

    async fn delete_older_than(&self, cutoff: OffsetDateTime) -> Result<u64, RepoError> {
        let result = sqlx::query(DELETE_RETIRED_CHECKPOINTS_SQL)
            .bind(cutoff)
            .execute(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        Ok(result.rows_affected())
    }
}
