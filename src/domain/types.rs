//! Shared domain enumerations and identifiers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::DomainError;

const MAX_NODE_ID_LEN: usize = 200;

/// Stable identity of a farm node; the key of its checkpoint row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn parse(value: impl Into<String>) -> Result<Self, DomainError> {
        let value = value.into();
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(DomainError::validation("node id must not be empty"));
        }
        if trimmed.len() > MAX_NODE_ID_LEN {
            return Err(DomainError::validation(format!(
                "node id must be at most {MAX_NODE_ID_LEN} characters"
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of the running process: the node it belongs to plus a per-process origin tag.
///
/// The origin changes on every restart, so instructions written by a previous incarnation
/// of the same node are not mistaken for local ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    node_id: NodeId,
    origin: String,
}

impl LocalIdentity {
    pub fn new(node_id: NodeId) -> Self {
        let origin = format!(
            "{node_id} [P{}] {}",
            std::process::id(),
            Uuid::new_v4().simple().to_string().to_uppercase()
        );
        Self { node_id, origin }
    }

    /// Build an identity with a fixed origin tag.
    pub fn with_origin(node_id: NodeId, origin: impl Into<String>) -> Self {
        Self {
            node_id,
            origin: origin.into(),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }
}

/// Farm role of a node; decides whether it may own the pruning task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerRole {
    /// The only node of a deployment.
    #[default]
    Single,
    /// The designated housekeeping node of a farm.
    Leader,
    /// Any other farm member.
    Replica,
}

impl ServerRole {
    pub fn as_str(self) -> &'static str {
        match self {
            ServerRole::Single => "single",
            ServerRole::Leader => "leader",
            ServerRole::Replica => "replica",
        }
    }

    pub fn owns_pruning(self) -> bool {
        matches!(self, ServerRole::Single | ServerRole::Leader)
    }
}

impl FromStr for ServerRole {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "single" => Ok(ServerRole::Single),
            "leader" | "master" => Ok(ServerRole::Leader),
            "replica" | "subscriber" => Ok(ServerRole::Replica),
            other => Err(DomainError::unknown("server role", other)),
        }
    }
}

/// What the sync worker does with an instruction row whose payload cannot be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorruptPayloadPolicy {
    /// Stop at the row and retry it, escalating like a handler failure.
    #[default]
    Block,
    /// Log the row and advance past it.
    Skip,
}

impl CorruptPayloadPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            CorruptPayloadPolicy::Block => "block",
            CorruptPayloadPolicy::Skip => "skip",
        }
    }
}

impl FromStr for CorruptPayloadPolicy {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "block" => Ok(CorruptPayloadPolicy::Block),
            "skip" => Ok(CorruptPayloadPolicy::Skip),
            other => Err(DomainError::unknown("corrupt payload policy", other)),
        }
    }
}
