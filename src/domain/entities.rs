//! Domain entities mirrored from persistent storage.

use farmsync_types::{InstructionPayload, PayloadError};
use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;

use crate::domain::types::NodeId;

/// One row of the shared instruction log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstructionRecord {
    pub id: i64,
    pub created_at: OffsetDateTime,
    pub origin_id: String,
    /// Raw JSON as stored; decoded lazily so a corrupt row can still be reported by id.
    pub payload: Value,
    pub command_count: i32,
}

impl InstructionRecord {
    pub fn decode_payload(&self) -> Result<InstructionPayload, PayloadError> {
        InstructionPayload::from_value(self.payload.clone())
    }
}

/// A node's durable synchronisation progress.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckpointRecord {
    pub node_id: NodeId,
    pub last_applied_id: i64,
    pub updated_at: OffsetDateTime,
}

/// Rows removed by one pruning pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub instructions_deleted: u64,
    pub checkpoints_deleted: u64,
    /// Another process held the store-level prune lock; nothing was deleted.
    pub lock_contended: bool,
}
