//! Publishing cache instructions alongside data mutations.
//!
//! ```ignore
//! let mut tx = repos.begin().await?;
//! // ... mutate rows ...
//! let receipt = publisher.publish(&mut tx, vec![RefresherCommand::refresh_key("content", id)]).await?;
//! tx.commit().await?;
//! publisher.confirm(receipt).await;
//! ```

use std::sync::Arc;

use farmsync_types::{InstructionPayload, RefresherCommand};
use tracing::{debug, instrument, warn};

use crate::application::repos::{InstructionLogRepo, InstructionScope};
use crate::domain::types::LocalIdentity;

use super::config::SyncConfig;
use super::error::PublishError;
use super::registry::RefresherRegistry;

/// Rows written by one publish, waiting for the caller's commit.
///
/// Hand it back to [`Publisher::confirm`] once the transaction commits so the local caches
/// catch up; the local sync worker skips instructions of its own origin.
#[must_use = "pass the receipt to Publisher::confirm after the transaction commits"]
#[derive(Debug)]
pub struct PublishReceipt {
    ids: Vec<i64>,
    commands: Vec<RefresherCommand>,
}

impl PublishReceipt {
    pub fn ids(&self) -> &[i64] {
        &self.ids
    }

    pub fn commands(&self) -> &[RefresherCommand] {
        &self.commands
    }
}

pub struct Publisher {
    identity: Arc<LocalIdentity>,
    registry: Arc<RefresherRegistry>,
    max_commands_per_row: usize,
}

impl Publisher {
    pub fn new(
        config: &SyncConfig,
        identity: Arc<LocalIdentity>,
        registry: Arc<RefresherRegistry>,
    ) -> Self {
        Self {
            identity,
            registry,
            max_commands_per_row: config.max_commands_per_row,
        }
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    /// Append `commands` inside `scope`.
    ///
    /// Large publishes are split into several rows, appended in order. Nothing becomes
    /// visible to the farm until the scope commits.
    #[instrument(skip(self, scope, commands), fields(commands = commands.len()))]
    pub async fn publish<S>(
        &self,
        scope: &mut S,
        commands: Vec<RefresherCommand>,
    ) -> Result<PublishReceipt, PublishError>
    where
        S: InstructionScope + ?Sized,
    {
        let rows = self.rows_for(&commands)?;
        let mut ids = Vec::with_capacity(rows.len());
        for row in &rows {
            let id = scope
                .append_instruction(self.identity.origin(), row)
                .await?;
            ids.push(id);
        }
        debug!(ids = ?ids, "Instruction rows appended");
        Ok(PublishReceipt { ids, commands })
    }

    /// Apply a committed publish to this node's caches.
    pub async fn confirm(&self, receipt: PublishReceipt) {
        self.apply_local(&receipt.commands).await;
    }

    /// Append outside any caller transaction and apply locally straight away.
    #[instrument(skip(self, log, commands), fields(commands = commands.len()))]
    pub async fn publish_now(
        &self,
        log: &dyn InstructionLogRepo,
        commands: Vec<RefresherCommand>,
    ) -> Result<Vec<i64>, PublishError> {
        let rows = self.rows_for(&commands)?;
        let mut ids = Vec::with_capacity(rows.len());
        for row in &rows {
            ids.push(log.append(self.identity.origin(), row).await?);
        }
        self.apply_local(&commands).await;
        Ok(ids)
    }

    fn rows_for(&self, commands: &[RefresherCommand]) -> Result<Vec<InstructionPayload>, PublishError> {
        if commands.is_empty() {
            return Err(PublishError::Empty);
        }
        let rows = InstructionPayload::new(commands.to_vec()).split(self.max_commands_per_row);
        for row in &rows {
            row.to_value()?;
        }
        Ok(rows)
    }

    async fn apply_local(&self, commands: &[RefresherCommand]) {
        for command in commands {
            if let Err(err) = self.registry.apply(command).await {
                warn!(
                    refresher = %command.refresher,
                    action = command.action.name(),
                    error = %err,
                    "Local cache refresh failed after publish"
                );
            }
        }
    }
}
