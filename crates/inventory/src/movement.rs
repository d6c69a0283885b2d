use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use coopstock_core::{
    DomainError, DomainResult, MovementId, OutletId, ProductId, TenantId, UserId, WarehouseId,
};

/// Kind of stock change recorded in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MovementType {
    Sale,
    Refund,
    AdjustmentIn,
    AdjustmentOut,
    TransferIn,
    TransferOut,
    Purchase,
}

impl MovementType {
    pub const ALL: [MovementType; 7] = [
        MovementType::Sale,
        MovementType::Refund,
        MovementType::AdjustmentIn,
        MovementType::AdjustmentOut,
        MovementType::TransferIn,
        MovementType::TransferOut,
        MovementType::Purchase,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MovementType::Sale => "SALE",
            MovementType::Refund => "REFUND",
            MovementType::AdjustmentIn => "ADJUSTMENT_IN",
            MovementType::AdjustmentOut => "ADJUSTMENT_OUT",
            MovementType::TransferIn => "TRANSFER_IN",
            MovementType::TransferOut => "TRANSFER_OUT",
            MovementType::Purchase => "PURCHASE",
        }
    }

    /// Inbound types add stock, outbound types remove it.
    pub fn is_inbound(self) -> bool {
        matches!(
            self,
            MovementType::Refund
                | MovementType::AdjustmentIn
                | MovementType::TransferIn
                | MovementType::Purchase
        )
    }

    /// The sign of a delta must agree with the movement type; zero is never valid.
    pub fn check_quantity(self, quantity: i64) -> DomainResult<()> {
        if quantity == 0 {
            return Err(DomainError::validation("movement quantity cannot be zero"));
        }
        if quantity == i64::MIN {
            return Err(DomainError::validation("movement quantity out of range"));
        }
        if self.is_inbound() && quantity < 0 {
            return Err(DomainError::validation(format!(
                "{} requires a positive quantity, got {quantity}",
                self.as_str()
            )));
        }
        if !self.is_inbound() && quantity > 0 {
            return Err(DomainError::validation(format!(
                "{} requires a negative quantity, got {quantity}",
                self.as_str()
            )));
        }
        Ok(())
    }
}

impl core::fmt::Display for MovementType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for MovementType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MovementType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| DomainError::validation(format!("unknown movement type: {s}")))
    }
}

/// Kind of entity that caused a movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceType {
    Transaction,
    Adjustment,
    Transfer,
    PurchaseOrder,
    WarehouseStock,
}

impl ReferenceType {
    pub const ALL: [ReferenceType; 5] = [
        ReferenceType::Transaction,
        ReferenceType::Adjustment,
        ReferenceType::Transfer,
        ReferenceType::PurchaseOrder,
        ReferenceType::WarehouseStock,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ReferenceType::Transaction => "transaction",
            ReferenceType::Adjustment => "adjustment",
            ReferenceType::Transfer => "transfer",
            ReferenceType::PurchaseOrder => "purchase_order",
            ReferenceType::WarehouseStock => "warehouse_stock",
        }
    }
}

impl core::str::FromStr for ReferenceType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ReferenceType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown reference type: {s}")))
    }
}

/// Opaque pointer to the entity that caused a movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MovementReference {
    pub reference_type: ReferenceType,
    pub reference_id: Uuid,
}

impl MovementReference {
    pub fn new(reference_type: ReferenceType, reference_id: impl Into<Uuid>) -> Self {
        Self {
            reference_type,
            reference_id: reference_id.into(),
        }
    }
}

/// An immutable, applied ledger entry.
///
/// Invariant: `stock_after == stock_before + quantity`. Movements are created
/// once by the store's commit and never updated or deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockMovement {
    pub id: MovementId,
    pub tenant_id: TenantId,
    pub outlet_id: OutletId,
    /// Set for warehouse-level movements; `None` is the outlet figure.
    pub warehouse_id: Option<WarehouseId>,
    pub product_id: ProductId,
    pub movement_type: MovementType,
    pub quantity: i64,
    pub reference: Option<MovementReference>,
    pub stock_before: i64,
    pub stock_after: i64,
    pub notes: Option<String>,
    pub recorded_by: UserId,
    /// Store-assigned application order (strictly increasing per store).
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
}

impl StockMovement {
    pub fn stream(&self) -> StockStream {
        StockStream {
            tenant_id: self.tenant_id,
            outlet_id: self.outlet_id,
            warehouse_id: self.warehouse_id,
            product_id: self.product_id,
        }
    }

    pub fn is_consistent(&self) -> bool {
        self.stock_before.checked_add(self.quantity) == Some(self.stock_after)
    }
}

/// The location a movement chain belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StockStream {
    pub tenant_id: TenantId,
    pub outlet_id: OutletId,
    pub warehouse_id: Option<WarehouseId>,
    pub product_id: ProductId,
}

/// A movement requested by a caller, not yet applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementDraft {
    pub tenant_id: TenantId,
    pub outlet_id: OutletId,
    pub warehouse_id: Option<WarehouseId>,
    pub product_id: ProductId,
    pub movement_type: MovementType,
    pub quantity: i64,
    pub reference: Option<MovementReference>,
    pub notes: Option<String>,
    pub recorded_by: UserId,
}

impl MovementDraft {
    pub fn new(
        tenant_id: TenantId,
        outlet_id: OutletId,
        product_id: ProductId,
        movement_type: MovementType,
        quantity: i64,
        recorded_by: UserId,
    ) -> Self {
        Self {
            tenant_id,
            outlet_id,
            warehouse_id: None,
            product_id,
            movement_type,
            quantity,
            reference: None,
            notes: None,
            recorded_by,
        }
    }

    pub fn with_reference(mut self, reference: MovementReference) -> Self {
        self.reference = Some(reference);
        self
    }

    pub fn with_notes(mut self, notes: Option<String>) -> Self {
        self.notes = notes.filter(|n| !n.trim().is_empty());
        self
    }

    pub fn at_warehouse(mut self, warehouse_id: WarehouseId) -> Self {
        self.warehouse_id = Some(warehouse_id);
        self
    }

    pub fn stream(&self) -> StockStream {
        StockStream {
            tenant_id: self.tenant_id,
            outlet_id: self.outlet_id,
            warehouse_id: self.warehouse_id,
            product_id: self.product_id,
        }
    }

    pub fn validate(&self) -> DomainResult<()> {
        self.movement_type.check_quantity(self.quantity)
    }

    /// Stock level after this draft is applied on top of `stock_before`.
    ///
    /// This is the single non-negativity rule of the ledger: every store calls
    /// it while holding the stream's write position.
    pub fn resulting_stock(&self, stock_before: i64) -> DomainResult<i64> {
        let stock_after = stock_before
            .checked_add(self.quantity)
            .ok_or_else(|| DomainError::validation("stock quantity overflow"))?;
        if stock_after < 0 {
            return Err(DomainError::insufficient_stock(
                self.product_id,
                self.quantity.saturating_neg(),
                stock_before,
            ));
        }
        Ok(stock_after)
    }

    /// Turn the draft into an applied movement at `sequence`.
    pub fn apply(
        self,
        id: MovementId,
        sequence: u64,
        stock_before: i64,
        created_at: DateTime<Utc>,
    ) -> DomainResult<StockMovement> {
        self.validate()?;
        let stock_after = self.resulting_stock(stock_before)?;
        Ok(StockMovement {
            id,
            tenant_id: self.tenant_id,
            outlet_id: self.outlet_id,
            warehouse_id: self.warehouse_id,
            product_id: self.product_id,
            movement_type: self.movement_type,
            quantity: self.quantity,
            reference: self.reference,
            stock_before,
            stock_after,
            notes: self.notes,
            recorded_by: self.recorded_by,
            sequence,
            created_at,
        })
    }
}
