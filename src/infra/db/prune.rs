use async_trait::async_trait;
use time::OffsetDateTime;
use tracing::debug;

use crate::application::repos::{PruneRepo, RepoError};
use crate::domain::entities::PruneReport;

use super::checkpoints::DELETE_RETIRED_CHECKPOINTS_SQL;
use super::instructions::DELETE_EXPIRED_INSTRUCTIONS_SQL;
use super::{PRUNE_LOCK_KEY, PostgresRepositories, map_sqlx_error};

#[async_trait]
impl PruneRepo for PostgresRepositories {
    async fn prune(&self, cutoff: OffsetDateTime) -> Result<PruneReport, RepoError> {
        let mut tx = self.begin().await.map_err(map_sqlx_error)?;

        let acquired = sqlx::query_scalar::<_, bool>("SELECT pg_try_advisory_xact_lock($1)")
            .bind(PRUNE_LOCK_KEY)
            .fetch_one(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
        if !acquired {
            tx.rollback().await.map_err(map_sqlx_error)?;
            debug!("Prune lock held by another process");
            return Ok(PruneReport {
                lock_contended: true,
                ..PruneReport::default()
            });
        }

        let instructions = sqlx::query(DELETE_EXPIRED_INSTRUCTIONS_SQL)
            .bind(cutoff)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
        let checkpoints = sqlx::query(DELETE_RETIRED_CHECKPOINTS_SQL)
            .bind(cutoff)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

        tx.commit().await.map_err(map_sqlx_error)?;

        Ok(PruneReport {
            instructions_deleted: instructions.rows_affected(),
            checkpoints_deleted: checkpoints.rows_affected(),
            lock_contended: false,
        })
    }
}
