//! Domain error model.

use thiserror::Error;

use crate::id::ProductId;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic, business/domain failures (validation,
/// invariants, stock rules, state transitions). Infrastructure concerns belong
/// elsewhere.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A domain invariant was violated.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A requested resource was not found (or is not visible to the tenant).
    #[error("not found: {0}")]
    NotFound(String),

    /// Applying a movement would drive stock below zero.
    ///
    /// `requested` is the number of units the movement takes out, `available`
    /// the stock visible when the movement was evaluated.
    #[error(
        "insufficient stock for product {product_id}: requested {requested}, available {available} (short by {})",
        short_by(.requested, .available)
    )]
    InsufficientStock {
        product_id: ProductId,
        requested: i64,
        available: i64,
    },

    /// An action was attempted from a status that does not allow it.
    #[error("invalid state: current status is {current}, required {required}")]
    InvalidState { current: String, required: String },

    /// A reference points outside the operation's scope (wrong outlet,
    /// same source/destination, product not part of the document).
    #[error("invalid reference: {0}")]
    InvalidReference(String),

    /// A conflict occurred (e.g. stale version / optimistic concurrency).
    #[error("conflict: {0}")]
    Conflict(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn insufficient_stock(product_id: ProductId, requested: i64, available: i64) -> Self {
        Self::InsufficientStock {
            product_id,
            requested,
            available,
        }
    }

    pub fn invalid_state(current: impl core::fmt::Display, required: impl Into<String>) -> Self {
        Self::InvalidState {
            current: current.to_string(),
            required: required.into(),
        }
    }

    pub fn invalid_reference(msg: impl Into<String>) -> Self {
        Self::InvalidReference(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Units missing for an `InsufficientStock` rejection.
    pub fn shortfall(&self) -> Option<i64> {
        match self {
            Self::InsufficientStock {
                requested,
                available,
                ..
            } => Some(short_by(requested, available)),
            _ => None,
        }
    }
}

fn short_by(requested: &i64, available: &i64) -> i64 {
    requested.saturating_sub(*available)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_stock_message_names_product_and_shortfall() {
        let product_id = ProductId::new();
        let err = DomainError::insufficient_stock(product_id, 8, 7);
        let msg = err.to_string();
        assert!(msg.contains(&product_id.to_string()));
        assert!(msg.contains("short by 1"));
        assert_eq!(err.shortfall(), Some(1));
    }

    #[test]
    fn shortfall_saturates_at_the_extremes() {
        let err = DomainError::insufficient_stock(ProductId::new(), i64::MAX, -1);
        assert_eq!(err.shortfall(), Some(i64::MAX));
        assert!(err.to_string().contains(&format!("short by {}", i64::MAX)));
    }

    #[test]
    fn invalid_state_message_names_both_states() {
        let err = DomainError::invalid_state("received", "pending, approved or shipped");
        assert_eq!(
            err.to_string(),
            "invalid state: current status is received, required pending, approved or shipped"
        );
    }
}
