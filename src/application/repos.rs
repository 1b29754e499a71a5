//! Repository traits describing persistence adapters.

use async_trait::async_trait;
use farmsync_types::InstructionPayload;
use thiserror::Error;
use time::OffsetDateTime;

use crate::domain::entities::{CheckpointRecord, InstructionRecord, PruneReport};
use crate::domain::types::NodeId;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("duplicate record violates unique constraint `{constraint}`")]
    Duplicate { constraint: String },
    #[error("resource not found")]
    NotFound,
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
    #[error("integrity error: {message}")]
    Integrity { message: String },
    #[error("database timeout")]
    Timeout,
}

impl RepoError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }

    /// Transient failures leave no state behind and are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, RepoError::Persistence(_) | RepoError::Timeout)
    }
}

/// Append-only log of cache instructions shared by the farm.
#[async_trait]
pub trait InstructionLogRepo: Send + Sync {
    /// Append one row outside any caller transaction.
    async fn append(&self, origin_id: &str, payload: &InstructionPayload)
    -> Result<i64, RepoError>;

    /// Rows with `id > after_id`, ascending, at most `limit`.
    async fn read_since(
        &self,
        after_id: i64,
        limit: u32,
    ) -> Result<Vec<InstructionRecord>, RepoError>;

    /// Highest id present in the log, `0` when empty.
    async fn max_id(&self) -> Result<i64, RepoError>;

    async fn oldest_id(&self) -> Result<Option<i64>, RepoError>;

    async fn contains(&self, id: i64) -> Result<bool, RepoError>;

    async fn count(&self) -> Result<u64, RepoError>;

    /// Sum of `command_count` over rows newer than `after_id`.
    async fn pending_command_count(&self, after_id: i64) -> Result<u64, RepoError>;

    async fn delete_older_than(&self, cutoff: OffsetDateTime) -> Result<u64, RepoError>;
}

/// Durable per-node replay cursors.
#[async_trait]
pub trait CheckpointRepo: Send + Sync {
    async fn get(&self, node_id: &NodeId) -> Result<Option<CheckpointRecord>, RepoError>;

    /// Move the cursor forward to `last_applied_id`, creating it if absent.
    ///
    /// Returns `false` when the stored value is already at or beyond `last_applied_id`.
    async fn advance(&self, node_id: &NodeId, last_applied_id: i64) -> Result<bool, RepoError>;

    /// Refresh `updated_at` without moving the cursor.
    ///
    /// Returns `false` when no checkpoint exists for `node_id`.
    async fn touch(&self, node_id: &NodeId) -> Result<bool, RepoError>;

    async fn list(&self) -> Result<Vec<CheckpointRecord>, RepoError>;

    async fn delete_older_than(&self, cutoff: OffsetDateTime) -> Result<u64, RepoError>;
}

/// Retention housekeeping over both tables.
#[async_trait]
pub trait PruneRepo: Send + Sync {
    /// Delete instructions and checkpoints older than `cutoff` in one transaction.
    ///
    /// The newest instruction always survives so the id sequence keeps its anchor.
    async fn prune(&self, cutoff: OffsetDateTime) -> Result<PruneReport, RepoError>;
}

/// A transactional write scope that can carry instruction rows alongside a data mutation.
#[async_trait]
pub trait InstructionScope: Send {
    async fn append_instruction(
        &mut self,
        origin_id: &str,
        payload: &InstructionPayload,
    ) -> Result<i64, RepoError>;
}
