//! Errors shared by every domain crate.
//!
//! Business-rule failures are not here; each domain crate has its own typed
//! error (see `stockroom_inventory::InventoryError`).

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// An identifier failed to parse.
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// The stream revision did not match what the writer expected.
    #[error("conflict: {0}")]
    Conflict(String),
}

impl DomainError {
    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            DomainError::InvalidId(_) => "invalid_id",
            DomainError::Conflict(_) => "conflict",
        }
    }
}
