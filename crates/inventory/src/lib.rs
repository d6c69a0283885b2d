//! Stock domain: the movement ledger, adjustment and transfer documents, and
//! warehouse sub-stock.
//!
//! Pure, deterministic rules only (no IO, no storage). The engine in
//! `coopstock-infra` loads state, calls into these types, and commits the
//! resulting movements and document snapshots atomically.

pub mod adjustment;
pub mod ledger;
pub mod movement;
pub mod product;
pub mod transfer;
pub mod warehouse;

use chrono::{DateTime, Utc};
use uuid::Uuid;

pub use adjustment::{
    AdjustmentApproved, AdjustmentCommand, AdjustmentCreated, AdjustmentEvent, AdjustmentId,
    AdjustmentItem, AdjustmentRejected, AdjustmentStatus, CreateAdjustment, DecideAdjustment,
    StockAdjustment,
};
pub use ledger::{ReplayError, ReplayOutcome, replay};
pub use movement::{
    MovementDraft, MovementReference, MovementType, ReferenceType, StockMovement, StockStream,
};
pub use product::{ProductListing, ProductStock, StockLevel};
pub use transfer::{
    CreateTransfer, ItemQuantity, ProcessTransfer, StockTransfer, TransferAction,
    TransferApproved, TransferCancelled, TransferCommand, TransferCreated, TransferEvent,
    TransferId, TransferItem, TransferReceived, TransferShipped, TransferStatus,
};
pub use warehouse::{
    StockPlacement, Warehouse, WarehouseStock, WarehouseStockKey, WarehouseStockUpdate,
    WarehouseType,
};

/// Human-readable document number, e.g. `ADJ-20261018-9f3a1c2e`.
///
/// The suffix is the tail of the (time-ordered) document id, so numbers are
/// unique wherever ids are.
pub fn document_number(prefix: &str, id: impl Into<Uuid>, at: DateTime<Utc>) -> String {
    let simple = id.into().simple().to_string();
    let suffix = &simple[simple.len() - 8..];
    format!("{prefix}-{}-{suffix}", at.format("%Y%m%d"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn document_number_has_date_and_id_suffix() {
        let id = Uuid::parse_str("0192f0c4-1d2e-7abc-8def-00112233aabb").unwrap();
        let at = Utc.with_ymd_and_hms(2026, 3, 9, 12, 0, 0).unwrap();
        assert_eq!(document_number("TRF", id, at), "TRF-20260309-2233aabb");
    }
}
