use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use coopstock_core::{
    AggregateRoot, ExpectedVersion, OutletId, ProductId, TenantId, UserId, WarehouseId,
};
use coopstock_inventory::{
    AdjustmentId, MovementDraft, ProductListing, ProductStock, StockAdjustment, StockMovement,
    StockStream, StockTransfer, TransferId, Warehouse, WarehouseStock, WarehouseStockUpdate,
};

use crate::error::StoreError;
use crate::query::{AdjustmentFilter, MovementFilter, Page, Pagination, TransferFilter};

/// A versioned stock document snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "document_type", content = "body", rename_all = "snake_case")]
pub enum StockDocument {
    Adjustment(StockAdjustment),
    Transfer(StockTransfer),
}

impl StockDocument {
    pub fn id(&self) -> Uuid {
        match self {
            StockDocument::Adjustment(a) => a.id_typed().into(),
            StockDocument::Transfer(t) => t.id_typed().into(),
        }
    }

    pub fn document_type(&self) -> &'static str {
        match self {
            StockDocument::Adjustment(_) => "adjustment",
            StockDocument::Transfer(_) => "transfer",
        }
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        match self {
            StockDocument::Adjustment(a) => a.tenant_id(),
            StockDocument::Transfer(t) => t.tenant_id(),
        }
    }

    pub fn version(&self) -> u64 {
        match self {
            StockDocument::Adjustment(a) => a.version(),
            StockDocument::Transfer(t) => t.version(),
        }
    }

    pub fn number(&self) -> &str {
        match self {
            StockDocument::Adjustment(a) => a.adjustment_number(),
            StockDocument::Transfer(t) => t.transfer_number(),
        }
    }

    pub fn status(&self) -> &'static str {
        match self {
            StockDocument::Adjustment(a) => a.status().as_str(),
            StockDocument::Transfer(t) => t.status().as_str(),
        }
    }

    /// The adjustment's outlet, or the transfer's source.
    pub fn outlet_id(&self) -> Option<OutletId> {
        match self {
            StockDocument::Adjustment(a) => a.outlet_id(),
            StockDocument::Transfer(t) => t.from_outlet_id(),
        }
    }

    pub fn to_outlet_id(&self) -> Option<OutletId> {
        match self {
            StockDocument::Adjustment(_) => None,
            StockDocument::Transfer(t) => t.to_outlet_id(),
        }
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        match self {
            StockDocument::Adjustment(a) => a.created_at(),
            StockDocument::Transfer(t) => t.created_at(),
        }
    }
}

/// A document write guarded by the version the writer decided on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentWrite {
    pub document: StockDocument,
    /// `New` on create, `Exact(version before the decision)` afterwards.
    pub expected: ExpectedVersion,
}

/// Everything one engine operation changes, applied all-or-nothing.
///
/// Movements are outlet-level drafts; the store assigns `stock_before`,
/// `stock_after` and `sequence` while holding the stream's write position and
/// rejects the whole commit if any of them would drive stock negative.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerCommit {
    pub movements: Vec<MovementDraft>,
    pub documents: Vec<DocumentWrite>,
}

impl LedgerCommit {
    pub fn movement(draft: MovementDraft) -> Self {
        Self {
            movements: vec![draft],
            documents: Vec::new(),
        }
    }

    pub fn document(document: StockDocument, expected: ExpectedVersion) -> Self {
        Self {
            movements: Vec::new(),
            documents: vec![DocumentWrite { document, expected }],
        }
    }

    pub fn with_movements(mut self, drafts: impl IntoIterator<Item = MovementDraft>) -> Self {
        self.movements.extend(drafts);
        self
    }

    /// Every part of the commit must belong to `tenant_id`.
    pub fn check_tenant(&self, tenant_id: TenantId) -> Result<(), StoreError> {
        let foreign_movement = self.movements.iter().any(|m| m.tenant_id != tenant_id);
        let foreign_document = self
            .documents
            .iter()
            .any(|d| d.document.tenant_id() != Some(tenant_id));
        if foreign_movement || foreign_document {
            return Err(StoreError::Rejected(coopstock_core::DomainError::invariant(
                "commit mixes tenants",
            )));
        }
        Ok(())
    }
}

/// Outcome of a warehouse stock upsert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarehouseUpsert {
    pub previous: Option<WarehouseStock>,
    pub row: WarehouseStock,
    /// Set in ledgered mode when the warehouse's product total changed.
    pub movement: Option<StockMovement>,
}

/// Tenant-scoped persistence for the ledger, product stock and documents.
///
/// Implementations must apply a [`LedgerCommit`] atomically: either every
/// movement, stock update and document write lands, or none does. Movement
/// `sequence` numbers are strictly increasing in commit order.
#[async_trait]
pub trait StockStore: Send + Sync {
    async fn register_outlet(
        &self,
        tenant_id: TenantId,
        outlet_id: OutletId,
        name: &str,
    ) -> Result<(), StoreError>;

    async fn outlet_exists(&self, tenant_id: TenantId, outlet_id: OutletId) -> Result<bool, StoreError>;

    /// Create or refresh a listing. Existing stock is kept; a soft-deleted
    /// listing is restored.
    async fn register_product(&self, listing: &ProductListing) -> Result<ProductStock, StoreError>;

    async fn soft_delete_product(
        &self,
        tenant_id: TenantId,
        outlet_id: OutletId,
        product_id: ProductId,
    ) -> Result<(), StoreError>;

    /// Loads the row even when soft-deleted; callers check `is_active`.
    async fn load_product(
        &self,
        tenant_id: TenantId,
        outlet_id: OutletId,
        product_id: ProductId,
    ) -> Result<Option<ProductStock>, StoreError>;

    /// Active listings of one outlet.
    async fn list_products(
        &self,
        tenant_id: TenantId,
        outlet_id: OutletId,
    ) -> Result<Vec<ProductStock>, StoreError>;

    async fn commit(
        &self,
        tenant_id: TenantId,
        commit: LedgerCommit,
    ) -> Result<Vec<StockMovement>, StoreError>;

    async fn list_movements(
        &self,
        tenant_id: TenantId,
        filter: &MovementFilter,
        pagination: Pagination,
    ) -> Result<Page<StockMovement>, StoreError>;

    /// Every movement of one stream, in application order.
    async fn load_stream(&self, stream: StockStream) -> Result<Vec<StockMovement>, StoreError>;

    async fn load_adjustment(
        &self,
        tenant_id: TenantId,
        id: AdjustmentId,
    ) -> Result<Option<StockAdjustment>, StoreError>;

    async fn list_adjustments(
        &self,
        tenant_id: TenantId,
        filter: &AdjustmentFilter,
        pagination: Pagination,
    ) -> Result<Page<StockAdjustment>, StoreError>;

    async fn load_transfer(
        &self,
        tenant_id: TenantId,
        id: TransferId,
    ) -> Result<Option<StockTransfer>, StoreError>;

    async fn list_transfers(
        &self,
        tenant_id: TenantId,
        filter: &TransferFilter,
        pagination: Pagination,
    ) -> Result<Page<StockTransfer>, StoreError>;
}

/// Warehouse registry and sub-stock rows.
#[async_trait]
pub trait WarehouseStore: Send + Sync {
    /// `Conflict` when the code is taken within the tenant, `NotFound` when the
    /// outlet is unknown.
    async fn create_warehouse(&self, warehouse: &Warehouse) -> Result<(), StoreError>;

    async fn load_warehouse(
        &self,
        tenant_id: TenantId,
        warehouse_id: WarehouseId,
    ) -> Result<Option<Warehouse>, StoreError>;

    /// Apply an absolute update to one `(warehouse, product, batch)` row.
    ///
    /// With `ledger_actor` set, a change in the warehouse's total for the
    /// product is recorded as an `ADJUSTMENT_IN`/`ADJUSTMENT_OUT` movement with
    /// `warehouse_id` set, in the same atomic unit.
    async fn upsert_warehouse_stock(
        &self,
        warehouse: &Warehouse,
        update: &WarehouseStockUpdate,
        ledger_actor: Option<UserId>,
    ) -> Result<WarehouseUpsert, StoreError>;

    async fn list_warehouse_stock(
        &self,
        tenant_id: TenantId,
        warehouse_id: WarehouseId,
    ) -> Result<Vec<WarehouseStock>, StoreError>;

    /// Sum of `available` for the product over the outlet's warehouses.
    async fn warehouse_available(
        &self,
        tenant_id: TenantId,
        outlet_id: OutletId,
        product_id: ProductId,
    ) -> Result<i64, StoreError>;
}
