//! The handler contract every cache domain implements.

use async_trait::async_trait;
use farmsync_types::{RefreshAction, RefreshKey};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RefresherError {
    #[error("action `{action}` is not supported by this refresher")]
    Unsupported { action: &'static str },
    #[error("invalid refresh payload: {message}")]
    InvalidPayload { message: String },
    #[error("snapshot source failed: {message}")]
    Source { message: String },
    #[error("refresh failed: {message}")]
    Failed { message: String },
}

impl RefresherError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Source {
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }

    pub fn invalid_payload(message: impl Into<String>) -> Self {
        Self::InvalidPayload {
            message: message.into(),
        }
    }
}

/// An in-process cache that can be kept in step with the farm.
///
/// Implementations must be idempotent: the sync worker delivers at least once.
#[async_trait]
pub trait Refresher: Send + Sync {
    /// Drop or reload everything this cache holds.
    async fn refresh_all(&self) -> Result<(), RefresherError>;

    /// Invalidate one entry; it reloads on next read.
    async fn refresh(&self, key: &RefreshKey) -> Result<(), RefresherError>;

    async fn refresh_many(&self, keys: &[RefreshKey]) -> Result<(), RefresherError> {
        for key in keys {
            self.refresh(key).await?;
        }
        Ok(())
    }

    /// Evict one entry without reloading it.
    async fn remove(&self, key: &RefreshKey) -> Result<(), RefresherError>;

    async fn refresh_payload(&self, _payload: &Value) -> Result<(), RefresherError> {
        Err(RefresherError::Unsupported {
            action: "refresh_by_payload",
        })
    }

    /// Full rebuild from the authoritative store, used on cold start.
    async fn rebuild(&self) -> Result<(), RefresherError> {
        self.refresh_all().await
    }
}

pub(crate) async fn dispatch(
    handler: &dyn Refresher,
    action: &RefreshAction,
) -> Result<(), RefresherError> {
    match action {
        RefreshAction::RefreshAll => handler.refresh_all().await,
        RefreshAction::RefreshByKey { key } => handler.refresh(key).await,
        RefreshAction::RefreshByKeys { keys } => handler.refresh_many(keys).await,
        RefreshAction::RemoveByKey { key } => handler.remove(key).await,
        RefreshAction::RefreshByPayload { payload } => handler.refresh_payload(payload).await,
    }
}
