use std::error::Error as StdError;

use thiserror::Error;

use crate::{
    application::repos::RepoError, cache::PublishError, config::LoadError,
    domain::error::DomainError, infra::error::InfraError,
};

/// Top-level failure of an operator command.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] LoadError),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error(transparent)]
    Publish(#[from] PublishError),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }

    /// Process exit code reported by the binary.
    pub fn exit_code(&self) -> u8 {
        match self {
            AppError::Config(_) | AppError::Validation(_) | AppError::Domain(_) => 2,
            AppError::Infra(InfraError::Database { .. }) | AppError::Repo(_) => 3,
            AppError::Publish(_) => 4,
            AppError::Infra(_) | AppError::Unexpected(_) => 1,
        }
    }

    /// The error followed by every source in its chain.
    pub fn chain(&self) -> Vec<String> {
        let mut messages = vec![self.to_string()];
        let mut current = StdError::source(self);
        while let Some(inner) = current {
            let message = inner.to_string();
            if messages.last() != Some(&message) {
                messages.push(message);
            }
            current = inner.source();
        }
        messages
    }
}
