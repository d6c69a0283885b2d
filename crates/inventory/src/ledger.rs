//! Ledger replay: rebuild a stock figure from its movement chain.
//!
//! The cached `current_stock` is a projection of the ledger. Replaying every
//! movement of a stream in application order from zero must reproduce it, and
//! each movement's `stock_before` must equal the running total at that point.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::movement::{StockMovement, StockStream};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplayError {
    #[error("movement #{sequence} belongs to a different stock stream")]
    MixedStreams { sequence: u64 },

    #[error("non-monotonic sequence (last={last}, found={found})")]
    NonMonotonicSequence { last: u64, found: u64 },

    #[error("movement #{sequence} is inconsistent: before {stock_before} + {quantity} != after {stock_after}")]
    InconsistentMovement {
        sequence: u64,
        stock_before: i64,
        quantity: i64,
        stock_after: i64,
    },

    #[error("movement #{sequence} starts at {found}, running total is {expected}")]
    BrokenChain {
        sequence: u64,
        expected: i64,
        found: i64,
    },

    #[error("movement #{sequence} drives stock negative ({stock})")]
    NegativeStock { sequence: u64, stock: i64 },
}

/// Result of a successful replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayOutcome {
    pub movements: usize,
    pub final_stock: i64,
    pub last_sequence: Option<u64>,
}

/// Replay one stream's movements (any order; sorted by `sequence` here).
pub fn replay<'a>(
    movements: impl IntoIterator<Item = &'a StockMovement>,
) -> Result<ReplayOutcome, ReplayError> {
    let mut sorted: Vec<&StockMovement> = movements.into_iter().collect();
    sorted.sort_by_key(|m| m.sequence);

    let mut stream: Option<StockStream> = None;
    let mut last: Option<u64> = None;
    let mut running = 0i64;

    for m in &sorted {
        match stream {
            None => stream = Some(m.stream()),
            Some(s) if s != m.stream() => {
                return Err(ReplayError::MixedStreams {
                    sequence: m.sequence,
                });
            }
            Some(_) => {}
        }
        if let Some(prev) = last {
            if m.sequence <= prev {
                return Err(ReplayError::NonMonotonicSequence {
                    last: prev,
                    found: m.sequence,
                });
            }
        }
        if !m.is_consistent() {
            return Err(ReplayError::InconsistentMovement {
                sequence: m.sequence,
                stock_before: m.stock_before,
                quantity: m.quantity,
                stock_after: m.stock_after,
            });
        }
        if m.stock_before != running {
            return Err(ReplayError::BrokenChain {
                sequence: m.sequence,
                expected: running,
                found: m.stock_before,
            });
        }
        if m.stock_after < 0 {
            return Err(ReplayError::NegativeStock {
                sequence: m.sequence,
                stock: m.stock_after,
            });
        }
        running = m.stock_after;
        last = Some(m.sequence);
    }

    Ok(ReplayOutcome {
        movements: sorted.len(),
        final_stock: running,
        last_sequence: last,
    })
}
