use farmsync_types::{PayloadError, RefresherId};
use thiserror::Error;

use crate::application::repos::RepoError;

use super::refresher::RefresherError;

/// Why a node abandons replay and rebuilds its caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColdStartReason {
    /// The node has never recorded a checkpoint, or it was pruned as retired.
    NoCheckpoint,
    /// Replaying the backlog would cost more than a rebuild.
    Backlog,
    /// Instructions the node has not applied may have been pruned.
    Gap,
    /// One instruction kept failing past the retry limit.
    RetryLimit,
}

impl ColdStartReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ColdStartReason::NoCheckpoint => "no_checkpoint",
            ColdStartReason::Backlog => "backlog",
            ColdStartReason::Gap => "gap",
            ColdStartReason::RetryLimit => "retry_limit",
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("store call `{operation}` failed: {source}")]
    Store {
        operation: &'static str,
        #[source]
        source: RepoError,
    },
    #[error("refresher `{refresher}` failed on instruction {instruction_id}: {source}")]
    Handler {
        instruction_id: i64,
        refresher: RefresherId,
        #[source]
        source: RefresherError,
    },
    #[error("instruction {instruction_id} has an undecodable payload: {source}")]
    CorruptPayload {
        instruction_id: i64,
        #[source]
        source: PayloadError,
    },
    #[error("cache rebuild failed: {0}")]
    Rebuild(#[source] RefresherError),
    #[error("sync cycle exceeded its time budget")]
    CycleTimeout,
    #[error("cache rebuild exceeded its time budget")]
    RebuildTimeout,
    #[error("cold start required ({})", reason.as_str())]
    ColdStartRequired { reason: ColdStartReason },
}

impl SyncError {
    pub(crate) fn store(operation: &'static str, source: RepoError) -> Self {
        Self::Store { operation, source }
    }

    /// Metric label for the failure.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Store { .. } => "store",
            SyncError::Handler { .. } => "handler",
            SyncError::CorruptPayload { .. } => "corrupt_payload",
            SyncError::Rebuild(_) => "rebuild",
            SyncError::CycleTimeout => "timeout",
            SyncError::RebuildTimeout => "rebuild_timeout",
            SyncError::ColdStartRequired { .. } => "cold_start_required",
        }
    }

    /// Instruction the failure is pinned to, if any.
    pub fn instruction_id(&self) -> Option<i64> {
        match self {
            SyncError::Handler { instruction_id, .. }
            | SyncError::CorruptPayload { instruction_id, .. } => Some(*instruction_id),
            _ => None,
        }
    }

    /// Failures that block one instruction and count toward the retry limit.
    pub fn blocks_instruction(&self) -> bool {
        self.instruction_id().is_some()
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("nothing to publish")]
    Empty,
    #[error("failed to encode instruction payload: {0}")]
    Encode(#[from] PayloadError),
    #[error("failed to append instruction: {0}")]
    Append(#[from] RepoError),
}
