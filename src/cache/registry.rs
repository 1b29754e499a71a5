//! Refresher registry.
//!
//! Routes each command to the handler registered for its refresher id. Handlers
//! own their caches; nothing else in the subsystem touches cache contents.

use std::sync::Arc;

use dashmap::DashMap;
use farmsync_types::{RefresherCommand, RefresherId};
use tracing::{debug, warn};

use super::refresher::{Refresher, RefresherError, dispatch};

/// Result of routing one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Handled,
    /// No handler is registered for the command's refresher on this node.
    Unrouted,
}

#[derive(Default)]
pub struct RefresherRegistry {
    handlers: DashMap<RefresherId, Arc<dyn Refresher>>,
}

impl RefresherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `id`, returning the handler it replaced.
    pub fn register(
        &self,
        id: impl Into<RefresherId>,
        handler: Arc<dyn Refresher>,
    ) -> Option<Arc<dyn Refresher>> {
        let id = id.into();
        let previous = self.handlers.insert(id.clone(), handler);
        if previous.is_some() {
            warn!(refresher = %id, "Replaced an already registered refresher");
        } else {
            debug!(refresher = %id, "Registered refresher");
        }
        previous
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Refresher>> {
        self.handlers.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.handlers.contains_key(id)
    }

    /// Registered ids in lexical order.
    pub fn ids(&self) -> Vec<RefresherId> {
        let mut ids: Vec<RefresherId> = self.handlers.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Apply one command through its handler.
    ///
    /// Commands for refreshers this node does not host are acknowledged as [`Applied::Unrouted`].
    pub async fn apply(&self, command: &RefresherCommand) -> Result<Applied, RefresherError> {
        let Some(handler) = self.get(command.refresher.as_str()) else {
            debug!(
                refresher = %command.refresher,
                action = command.action.name(),
                "No refresher registered; command ignored"
            );
            return Ok(Applied::Unrouted);
        };

        dispatch(handler.as_ref(), &command.action).await?;
        Ok(Applied::Handled)
    }

    /// Rebuild every registered cache, in id order.
    ///
    /// All handlers are attempted; the first failure is returned.
    pub async fn rebuild_all(&self) -> Result<(), RefresherError> {
        let handlers: Vec<(RefresherId, Arc<dyn Refresher>)> = self
            .ids()
            .into_iter()
            .filter_map(|id| self.get(id.as_str()).map(|handler| (id, handler)))
            .collect();

        let mut first_error = None;
        for (id, handler) in handlers {
            if let Err(err) = handler.rebuild().await {
                warn!(refresher = %id, error = %err, "Refresher rebuild failed");
                first_error.get_or_insert(err);
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
