//! # DomainError
//!
//! Centralized error handling for the forum core.
//! Every port and service returns one of these kinds so collaborators can
//! translate them into user-facing responses without inspecting strings.

use thiserror::Error;

/// The primary error type for all core operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Aggregate (or reply parent) missing
    #[error("{0} not found: {1}")]
    NotFound(&'static str, String),

    /// Malformed or out-of-range field, self-referential relationship
    #[error("validation error: {0}")]
    Validation(String),

    /// Password mismatch, duplicate identifier on create
    #[error("conflict: {0}")]
    Conflict(String),

    /// Durable store or cache I/O fault
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// Token or captcha signature/expiry check failed
    #[error("forged credential: {0}")]
    Forged(String),
}

impl DomainError {
    pub fn validation<T: ToString>(msg: T) -> Self {
        Self::Validation(msg.to_string())
    }

    pub fn conflict<T: ToString>(msg: T) -> Self {
        Self::Conflict(msg.to_string())
    }

    pub fn unavailable<T: ToString>(msg: T) -> Self {
        Self::Unavailable(msg.to_string())
    }

    pub fn forged<T: ToString>(msg: T) -> Self {
        Self::Forged(msg.to_string())
    }

    /// Transient faults are the only kind worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        Self::Unavailable(format!("aggregate codec: {err}"))
    }
}

/// A specialized Result type for the forum core.
pub type Result<T> = std::result::Result<T, DomainError>;
