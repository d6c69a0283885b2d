//! Error types of the stock engine.
//!
//! - `StoreError`: what a persistence backend can report. Rule violations found
//!   while committing (insufficient stock, version mismatch, missing listing)
//!   travel as `Rejected(DomainError)`; everything else is infrastructure.
//! - `EngineError`: the caller-visible error of every engine operation.

use thiserror::Error;

use coopstock_core::{DomainError, ProductId};

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The commit was refused by a stock rule or a concurrency check.
    #[error(transparent)]
    Rejected(#[from] DomainError),

    #[error("database error in {operation}: {message}")]
    Database { operation: String, message: String },

    /// A stored row could not be decoded.
    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("store lock poisoned")]
    Poisoned,
}

impl StoreError {
    pub fn database(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Database {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Rejected(DomainError::Conflict(_)))
    }
}

#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error(
        "insufficient stock for product {product_id}: requested {requested}, available {available} (short by {})",
        short_by(.requested, .available)
    )]
    InsufficientStock {
        product_id: ProductId,
        requested: i64,
        available: i64,
    },

    #[error("invalid state: current status is {current}, required {required}")]
    InvalidState { current: String, required: String },

    #[error("invalid reference: {0}")]
    InvalidReference(String),

    /// Lost a race with a concurrent writer. The only retryable error.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("store failure: {0}")]
    Store(StoreError),
}

impl EngineError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Conflict(_))
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn invalid_reference(msg: impl Into<String>) -> Self {
        Self::InvalidReference(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Units missing for an `InsufficientStock` rejection.
    pub fn shortfall(&self) -> Option<i64> {
        match self {
            EngineError::InsufficientStock {
                requested,
                available,
                ..
            } => Some(short_by(requested, available)),
            _ => None,
        }
    }
}

impl From<DomainError> for EngineError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => EngineError::Validation(msg),
            DomainError::InvariantViolation(msg) => {
                EngineError::Validation(format!("invariant violated: {msg}"))
            }
            DomainError::NotFound(what) => EngineError::NotFound(what),
            DomainError::InsufficientStock {
                product_id,
                requested,
                available,
            } => EngineError::InsufficientStock {
                product_id,
                requested,
                available,
            },
            DomainError::InvalidState { current, required } => {
                EngineError::InvalidState { current, required }
            }
            DomainError::InvalidReference(msg) => EngineError::InvalidReference(msg),
            DomainError::Conflict(msg) => EngineError::Conflict(msg),
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Rejected(domain) => domain.into(),
            other => EngineError::Store(other),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

fn short_by(requested: &i64, available: &i64) -> i64 {
    requested.saturating_sub(*available)
}
