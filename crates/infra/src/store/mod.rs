//! Persistence boundary of the stock engine.
//!
//! Two implementations share one contract:
//! - `InMemoryStockStore`: tests/dev, every commit under a single write lock
//! - `PostgresStockStore`: one transaction per commit, conditional stock updates

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryStockStore;
pub use postgres::PostgresStockStore;
pub use r#trait::{
    DocumentWrite, LedgerCommit, StockDocument, StockStore, WarehouseStore, WarehouseUpsert,
};

use coopstock_core::{DomainError, ProductId, UserId};
use coopstock_inventory::{
    MovementDraft, MovementReference, MovementType, ReferenceType, Warehouse,
};

use crate::error::StoreError;

/// Commits only carry outlet-level movements with a sign matching their type.
pub(crate) fn check_outlet_draft(draft: &MovementDraft) -> Result<(), StoreError> {
    if draft.warehouse_id.is_some() {
        return Err(StoreError::Rejected(DomainError::validation(
            "warehouse-level movements are recorded through warehouse stock updates",
        )));
    }
    draft.validate()?;
    Ok(())
}

/// A warehouse's product total once the row holding `previous` units holds
/// `next` instead.
pub(crate) fn replaced_total(total_before: i64, previous: i64, next: i64) -> Result<i64, StoreError> {
    total_before
        .checked_sub(previous)
        .and_then(|t| t.checked_add(next))
        .ok_or_else(total_out_of_range)
}

pub(crate) fn total_out_of_range() -> StoreError {
    StoreError::Rejected(DomainError::validation("warehouse product total out of range"))
}

/// The movement recording a change of a warehouse's product total, if any.
pub(crate) fn warehouse_movement(
    warehouse: &Warehouse,
    product_id: ProductId,
    total_before: i64,
    total_after: i64,
    actor: UserId,
) -> Option<MovementDraft> {
    let delta = total_after - total_before;
    if delta == 0 {
        return None;
    }
    let movement_type = if delta > 0 {
        MovementType::AdjustmentIn
    } else {
        MovementType::AdjustmentOut
    };
    Some(
        MovementDraft::new(
            warehouse.tenant_id,
            warehouse.outlet_id,
            product_id,
            movement_type,
            delta,
            actor,
        )
        .at_warehouse(warehouse.id)
        .with_reference(MovementReference::new(
            ReferenceType::WarehouseStock,
            warehouse.id,
        )),
    )
}
