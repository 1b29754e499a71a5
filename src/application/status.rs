//! Farm-wide synchronisation report.

use std::fmt;

use serde::Serialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::application::repos::{CheckpointRepo, InstructionLogRepo, RepoError};
use crate::domain::types::NodeId;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FarmStatus {
    pub head_id: i64,
    pub oldest_id: Option<i64>,
    pub instruction_rows: u64,
    pub nodes: Vec<NodeLag>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeLag {
    pub node_id: NodeId,
    pub last_applied_id: i64,
    #[serde(serialize_with = "serialize_rfc3339")]
    pub updated_at: OffsetDateTime,
    /// Instructions between the node's cursor and the head.
    pub lag: i64,
    /// The node's cursor points below the oldest surviving row; it will cold start.
    pub behind_retention: bool,
}

fn serialize_rfc3339<S>(value: &OffsetDateTime, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    let formatted = value.format(&Rfc3339).map_err(serde::ser::Error::custom)?;
    serializer.serialize_str(&formatted)
}

pub async fn farm_status(
    log: &dyn InstructionLogRepo,
    checkpoints: &dyn CheckpointRepo,
) -> Result<FarmStatus, RepoError> {
    let head_id = log.max_id().await?;
    let oldest_id = log.oldest_id().await?;
    let instruction_rows = log.count().await?;

    let mut nodes: Vec<NodeLag> = checkpoints
        .list()
        .await?
        .into_iter()
        .map(|record| NodeLag {
            lag: (head_id - record.last_applied_id).max(0),
            behind_retention: oldest_id
                .is_some_and(|oldest| oldest > record.last_applied_id.saturating_add(1)),
            node_id: record.node_id,
            last_applied_id: record.last_applied_id,
            updated_at: record.updated_at,
        })
        .collect();
    nodes.sort_by(|a, b| b.lag.cmp(&a.lag).then_with(|| a.node_id.cmp(&b.node_id)));

    Ok(FarmStatus {
        head_id,
        oldest_id,
        instruction_rows,
        nodes,
    })
}

impl fmt::Display for FarmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let oldest = self
            .oldest_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string());
        writeln!(
            f,
            "head={} oldest={} rows={}",
            self.head_id, oldest, self.instruction_rows
        )?;
        if self.nodes.is_empty() {
            return writeln!(f, "no checkpoints recorded");
        }
        for node in &self.nodes {
            let updated = node
                .updated_at
                .format(&Rfc3339)
                .unwrap_or_else(|_| node.updated_at.to_string());
            writeln!(
                f,
                "{:<24} applied={:<10} lag={:<8} updated={}{}",
                node.node_id.as_str(),
                node.last_applied_id,
                node.lag,
                updated,
                if node.behind_retention {
                    " (behind retention)"
                } else {
                    ""
                }
            )?;
        }
        Ok(())
    }
}
