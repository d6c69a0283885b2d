//! Read-side filters and pagination for movements and documents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use coopstock_core::{OutletId, ProductId, WarehouseId};
use coopstock_inventory::{
    AdjustmentStatus, MovementReference, MovementType, StockAdjustment, StockMovement,
    StockTransfer, TransferStatus,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub limit: u32,
    /// 0-based.
    pub offset: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

impl Pagination {
    pub fn new(limit: Option<u32>, offset: Option<u32>) -> Self {
        Self {
            limit: limit.unwrap_or(50),
            offset: offset.unwrap_or(0),
        }
    }

    /// Slice one page out of an already filtered and ordered list.
    pub(crate) fn page_of<T>(self, items: Vec<T>) -> Page<T> {
        let total = items.len() as u64;
        let page: Vec<T> = items
            .into_iter()
            .skip(self.offset as usize)
            .take(self.limit as usize)
            .collect();
        let has_more = (self.offset as u64 + page.len() as u64) < total;
        Page {
            items: page,
            total,
            pagination: self,
            has_more,
        }
    }
}

/// One page of results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Matches across all pages.
    pub total: u64,
    pub pagination: Pagination,
    pub has_more: bool,
}

/// Movement history filter. Results are most recent first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementFilter {
    pub product_id: Option<ProductId>,
    pub outlet_id: Option<OutletId>,
    pub warehouse_id: Option<WarehouseId>,
    pub movement_type: Option<MovementType>,
    pub reference: Option<MovementReference>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

impl MovementFilter {
    pub fn matches(&self, m: &StockMovement) -> bool {
        self.product_id.is_none_or(|p| p == m.product_id)
            && self.outlet_id.is_none_or(|o| o == m.outlet_id)
            && self.warehouse_id.is_none_or(|w| Some(w) == m.warehouse_id)
            && self.movement_type.is_none_or(|t| t == m.movement_type)
            && self.reference.is_none_or(|r| Some(r) == m.reference)
            && self.created_after.is_none_or(|t| m.created_at >= t)
            && self.created_before.is_none_or(|t| m.created_at < t)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjustmentFilter {
    pub status: Option<AdjustmentStatus>,
    pub outlet_id: Option<OutletId>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

impl AdjustmentFilter {
    pub fn matches(&self, a: &StockAdjustment) -> bool {
        let created = a.created_at();
        self.status.is_none_or(|s| s == a.status())
            && self.outlet_id.is_none_or(|o| Some(o) == a.outlet_id())
            && self.created_after.is_none_or(|t| created.is_some_and(|c| c >= t))
            && self.created_before.is_none_or(|t| created.is_some_and(|c| c < t))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferFilter {
    pub status: Option<TransferStatus>,
    pub from_outlet_id: Option<OutletId>,
    pub to_outlet_id: Option<OutletId>,
    /// Either side of the transfer.
    pub outlet_id: Option<OutletId>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

impl TransferFilter {
    pub fn matches(&self, t: &StockTransfer) -> bool {
        let created = t.created_at();
        self.status.is_none_or(|s| s == t.status())
            && self.from_outlet_id.is_none_or(|o| Some(o) == t.from_outlet_id())
            && self.to_outlet_id.is_none_or(|o| Some(o) == t.to_outlet_id())
            && self
                .outlet_id
                .is_none_or(|o| Some(o) == t.from_outlet_id() || Some(o) == t.to_outlet_id())
            && self.created_after.is_none_or(|x| created.is_some_and(|c| c >= x))
            && self.created_before.is_none_or(|x| created.is_some_and(|c| c < x))
    }
}
