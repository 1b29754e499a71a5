use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("domain validation failed: {message}")]
    Validation { message: String },
    #[error("unknown {kind} `{value}`")]
    Unknown { kind: &'static str, value: String },
}

impl DomainError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn unknown(kind: &'static str, value: impl Into<String>) -> Self {
        Self::Unknown {
            kind,
            value: value.into(),
        }
    }
}
