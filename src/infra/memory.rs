//! In-process implementation of the sync repositories.
//!
//! Follows the Postgres adapter's semantics (monotonic checkpoints, pruning keeps the newest
//! row, serialised appends) for single-process deployments and tests.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use farmsync_types::InstructionPayload;
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::application::repos::{
    CheckpointRepo, InstructionLogRepo, InstructionScope, PruneRepo, RepoError,
};
use crate::cache::mutex_lock;
use crate::domain::entities::{CheckpointRecord, InstructionRecord, PruneReport};
use crate::domain::types::NodeId;

const SOURCE: &str = "infra::memory";

#[derive(Default)]
struct MemoryState {
    next_id: i64,
    instructions: BTreeMap<i64, InstructionRecord>,
    checkpoints: BTreeMap<NodeId, CheckpointRecord>,
}

impl MemoryState {
    fn reserve_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn newest_id(&self) -> i64 {
        self.instructions.keys().next_back().copied().unwrap_or(0)
    }

    fn delete_expired_instructions(&mut self, cutoff: OffsetDateTime) -> u64 {
        let newest = self.newest_id();
        let before = self.instructions.len();
        self.instructions
            .retain(|id, record| !(record.created_at < cutoff && *id < newest));
        (before - self.instructions.len()) as u64
    }

    fn delete_retired_checkpoints(&mut self, cutoff: OffsetDateTime) -> u64 {
        let before = self.checkpoints.len();
        self.checkpoints
            .retain(|_, record| record.updated_at >= cutoff);
        (before - self.checkpoints.len()) as u64
    }
}

#[derive(Default)]
pub struct InMemorySyncStore {
    state: Mutex<MemoryState>,
    /// Held by an open scope or an append; keeps commit order equal to id order.
    append_gate: Arc<AsyncMutex<()>>,
}

impl InMemorySyncStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A write scope that publishes its rows only on [`MemoryScope::commit`].
    pub fn scope(&self) -> MemoryScope<'_> {
        MemoryScope {
            store: self,
            gate: None,
            pending: Vec::new(),
        }
    }

    /// Insert a row as-is, bypassing payload validation. Intended for tests and tooling.
    pub fn append_raw(&self, origin_id: &str, payload: Value, created_at: OffsetDateTime) -> i64 {
        let command_count = InstructionPayload::from_value(payload.clone())
            .map(|decoded| decoded.command_count())
            .unwrap_or(0);
        let mut state = mutex_lock(&self.state, SOURCE, "append_raw");
        let id = state.reserve_id();
        state.instructions.insert(
            id,
            InstructionRecord {
                id,
                created_at,
                origin_id: origin_id.to_string(),
                payload,
                command_count: i32::try_from(command_count).unwrap_or(i32::MAX),
            },
        );
        id
    }

    /// Backdate or postdate a checkpoint's `updated_at`. Intended for tests and tooling.
    pub fn set_checkpoint_updated_at(&self, node_id: &NodeId, updated_at: OffsetDateTime) {
        let mut state = mutex_lock(&self.state, SOURCE, "set_checkpoint_updated_at");
        if let Some(record) = state.checkpoints.get_mut(node_id) {
            record.updated_at = updated_at;
        }
    }

    fn build_record(
        id: i64,
        origin_id: &str,
        payload: &InstructionPayload,
    ) -> Result<InstructionRecord, RepoError> {
        if payload.is_empty() {
            return Err(RepoError::InvalidInput {
                message: "instruction payload has no commands".to_string(),
            });
        }
        let value = payload.to_value().map_err(|err| RepoError::InvalidInput {
            message: err.to_string(),
        })?;
        let command_count =
            i32::try_from(payload.command_count()).map_err(|_| RepoError::InvalidInput {
                message: "instruction payload has too many keyed effects".to_string(),
            })?;
        Ok(InstructionRecord {
            id,
            created_at: OffsetDateTime::now_utc(),
            origin_id: origin_id.to_string(),
            payload: value,
            command_count,
        })
    }
}

/// Open write scope over an [`InMemorySyncStore`]; dropping it without committing rolls back.
pub struct MemoryScope<'a> {
    store: &'a InMemorySyncStore,
    gate: Option<OwnedMutexGuard<()>>,
    pending: Vec<InstructionRecord>,
}

impl MemoryScope<'_> {
    pub fn commit(self) {
        if self.pending.is_empty() {
            return;
        }
        let mut state = mutex_lock(&self.store.state, SOURCE, "commit");
        let now = OffsetDateTime::now_utc();
        for mut record in self.pending {
            record.created_at = now;
            state.instructions.insert(record.id, record);
        }
    }
}

#[async_trait]
impl<'a> InstructionScope for MemoryScope<'a> {
    async fn append_instruction(
        &mut self,
        origin_id: &str,
        payload: &InstructionPayload,
    ) -> Result<i64, RepoError> {
        if self.gate.is_none() {
            self.gate = Some(Arc::clone(&self.store.append_gate).lock_owned().await);
        }
        let id = mutex_lock(&self.store.state, SOURCE, "reserve_id").reserve_id();
        let record = InMemorySyncStore::build_record(id, origin_id, payload)?;
        self.pending.push(record);
        Ok(id)
    }
}

#[async_trait]
impl InstructionLogRepo for InMemorySyncStore {
    async fn append(
        &self,
        origin_id: &str,
        payload: &InstructionPayload,
    ) -> Result<i64, RepoError> {
        let _gate = self.append_gate.lock().await;
        let mut state = mutex_lock(&self.state, SOURCE, "append");
        let id = state.next_id + 1;
        let record = Self::build_record(id, origin_id, payload)?;
        state.next_id = id;
        state.instructions.insert(id, record);
        Ok(id)
    }

    async fn read_since(
        &self,
        after_id: i64,
        limit: u32,
    ) -> Result<Vec<InstructionRecord>, RepoError> {
        let state = mutex_lock(&self.state, SOURCE, "read_since");
        Ok(state
            .instructions
            .range((Bound::Excluded(after_id), Bound::Unbounded))
            .take(limit as usize)
            .map(|(_, record)| record.clone())
            .collect())
    }

    async fn max_id(&self) -> Result<i64, RepoError> {
        Ok(mutex_lock(&self.state, SOURCE, "max_id").newest_id())
    }

    async fn oldest_id(&self) -> Result<Option<i64>, RepoError> {
        let state = mutex_lock(&self.state, SOURCE, "oldest_id");
        Ok(state.instructions.keys().next().copied())
    }

    async fn contains(&self, id: i64) -> Result<bool, RepoError> {
        let state = mutex_lock(&self.state, SOURCE, "contains");
        Ok(state.instructions.contains_key(&id))
    }

    async fn count(&self) -> Result<u64, RepoError> {
        Ok(mutex_lock(&self.state, SOURCE, "count").instructions.len() as u64)
    }

    async fn pending_command_count(&self, after_id: i64) -> Result<u64, RepoError> {
        let state = mutex_lock(&self.state, SOURCE, "pending_command_count");
        Ok(state
            .instructions
            .range((Bound::Excluded(after_id), Bound::Unbounded))
            .map(|(_, record)| u64::try_from(record.command_count).unwrap_or(0))
            .sum())
    }

    async fn delete_older_than(&self, cutoff: OffsetDateTime) -> Result<u64, RepoError> {
        let mut state = mutex_lock(&self.state, SOURCE, "delete_instructions");
        Ok(state.delete_expired_instructions(cutoff))
    }
}

#[async_trait]
impl CheckpointRepo for InMemorySyncStore {
    async fn get(&self, node_id: &NodeId) -> Result<Option<CheckpointRecord>, RepoError> {
        let state = mutex_lock(&self.state, SOURCE, "checkpoint_get");
        Ok(state.checkpoints.get(node_id).cloned())
    }

    async fn advance(&self, node_id: &NodeId, last_applied_id: i64) -> Result<bool, RepoError> {
        if last_applied_id < 0 {
            return Err(RepoError::InvalidInput {
                message: format!("checkpoint id {last_applied_id} is negative"),
            });
        }
        let mut state = mutex_lock(&self.state, SOURCE, "checkpoint_advance");
        let now = OffsetDateTime::now_utc();
        match state.checkpoints.get_mut(node_id) {
            Some(record) if record.last_applied_id >= last_applied_id => Ok(false),
            Some(record) => {
                record.last_applied_id = last_applied_id;
                record.updated_at = now;
                Ok(true)
            }
            None => {
                state.checkpoints.insert(
                    node_id.clone(),
                    CheckpointRecord {
                        node_id: node_id.clone(),
                        last_applied_id,
                        updated_at: now,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn touch(&self, node_id: &NodeId) -> Result<bool, RepoError> {
        let mut state = mutex_lock(&self.state, SOURCE, "checkpoint_touch");
        match state.checkpoints.get_mut(node_id) {
            Some(record) => {
                record.updated_at = OffsetDateTime::now_utc();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list(&self) -> Result<Vec<CheckpointRecord>, RepoError> {
        let state = mutex_lock(&self.state, SOURCE, "checkpoint_list");
        Ok(state.checkpoints.values().cloned().collect())
    }

    async fn delete_older_than(&self, cutoff: OffsetDateTime) -> Result<u64, RepoError> {
        let mut state = mutex_lock(&self.state, SOURCE, "delete_checkpoints");
        Ok(state.delete_retired_checkpoints(cutoff))
    }
}

#[async_trait]
impl PruneRepo for InMemorySyncStore {
    async fn prune(&self, cutoff: OffsetDateTime) -> Result<PruneReport, RepoError> {
        let mut state = mutex_lock(&self.state, SOURCE, "prune");
        Ok(PruneReport {
            instructions_deleted: state.delete_expired_instructions(cutoff),
            checkpoints_deleted: state.delete_retired_checkpoints(cutoff),
            lock_contended: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use farmsync_types::RefresherCommand;
    use serde_json::json;

    fn node(id: &str) -> NodeId {
        NodeId::parse(id).unwrap()
    }

    fn payload(key: &str) -> InstructionPayload {
        InstructionPayload::new(vec![RefresherCommand::refresh_key("content", key)])
    }

    #[tokio::test]
    async fn checkpoints_only_move_forward() {
        let store = InMemorySyncStore::new();
        let web = node("web-01");

        assert!(store.advance(&web, 5).await.unwrap());
        assert!(!store.advance(&web, 3).await.unwrap());
        assert!(!store.advance(&web, 5).await.unwrap());
        assert!(store.advance(&web, 9).await.unwrap());

        let record = store.get(&web).await.unwrap().unwrap();
        assert_eq!(record.last_applied_id, 9);
        assert!(store.advance(&web, -1).await.is_err());
    }

    #[tokio::test]
    async fn rolled_back_scope_leaves_a_hole() {
        let store = InMemorySyncStore::new();
        {
            let mut scope = store.scope();
            scope.append_instruction("a", &payload("x")).await.unwrap();
        }
        let id = store.append("a", &payload("y")).await.unwrap();

        assert_eq!(id, 2);
        assert_eq!(store.oldest_id().await.unwrap(), Some(2));
        assert_eq!(store.read_since(0, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn empty_payload_is_rejected() {
        let store = InMemorySyncStore::new();
        let err = store
            .append("a", &InstructionPayload::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RepoError::InvalidInput { .. }));
        assert_eq!(store.max_id().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn prune_keeps_newest_row_and_fresh_checkpoints() {
        let store = InMemorySyncStore::new();
        let old = OffsetDateTime::now_utc() - time::Duration::days(3);
        for _ in 0..3 {
            store.append_raw("a", json!([]), old);
        }
        store.advance(&node("retired"), 1).await.unwrap();
        store.set_checkpoint_updated_at(&node("retired"), old);
        store.advance(&node("active"), 3).await.unwrap();

        let report = store
            .prune(OffsetDateTime::now_utc() - time::Duration::days(2))
            .await
            .unwrap();

        assert_eq!(report.instructions_deleted, 2);
        assert_eq!(report.checkpoints_deleted, 1);
        assert_eq!(store.oldest_id().await.unwrap(), Some(3));
        assert_eq!(store.max_id().await.unwrap(), 3);
        let nodes: Vec<NodeId> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|record| record.node_id)
            .collect();
        assert_eq!(nodes, vec![node("active")]);
    }

    #[tokio::test]
    async fn pending_count_sums_keyed_effects() {
        let store = InMemorySyncStore::new();
        store
            .append(
                "a",
                &InstructionPayload::new(vec![RefresherCommand::refresh_keys(
                    "content",
                    [1_i64, 2, 3],
                )]),
            )
            .await
            .unwrap();
        store.append("a", &payload("x")).await.unwrap();

        assert_eq!(store.pending_command_count(0).await.unwrap(), 4);
        assert_eq!(store.pending_command_count(1).await.unwrap(), 1);
        assert_eq!(store.pending_command_count(2).await.unwrap(), 0);
    }
}
