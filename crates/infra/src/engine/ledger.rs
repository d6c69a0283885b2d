use tracing::{info, instrument};

use coopstock_core::{OutletId, ProductId, TenantId};
use coopstock_events::EventBus;
use coopstock_inventory::{
    MovementDraft, ReplayError, ReplayOutcome, StockLevel, StockMovement, StockStream, replay,
};

use super::{StockEngine, single_movement};
use crate::audit::AuditEnvelope;
use crate::error::{EngineError, EngineResult};
use crate::query::{MovementFilter, Page, Pagination};
use crate::retry::with_retry;
use crate::store::{LedgerCommit, StockStore, WarehouseStore};

/// Outlet-level movement recording and the read side of the ledger.
pub struct MovementLedger<'a, S, B> {
    pub(super) engine: &'a StockEngine<S, B>,
}

/// Ledger replay of one stream compared with its cached figure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayReport {
    pub stream: StockStream,
    /// `current_stock` for outlet streams, the summed row quantity for
    /// warehouse streams.
    pub cached_stock: i64,
    pub result: Result<ReplayOutcome, ReplayError>,
}

impl ReplayReport {
    pub fn is_consistent(&self) -> bool {
        self.drift() == Some(0)
    }

    /// `cached - replayed`; `None` when the chain itself is broken.
    pub fn drift(&self) -> Option<i64> {
        self.result
            .as_ref()
            .ok()
            .map(|outcome| self.cached_stock - outcome.final_stock)
    }
}

impl<'a, S, B> MovementLedger<'a, S, B>
where
    S: StockStore + WarehouseStore,
    B: EventBus<AuditEnvelope>,
{
    /// Apply one signed movement to an outlet's stock.
    ///
    /// Fails with `InsufficientStock` (no effect) when the result would be
    /// negative and `NotFound` when the product is not listed or soft-deleted.
    #[instrument(
        skip(self, draft),
        fields(
            tenant_id = %draft.tenant_id,
            outlet_id = %draft.outlet_id,
            product_id = %draft.product_id,
            movement_type = %draft.movement_type,
            quantity = draft.quantity
        ),
        err
    )]
    pub async fn record_movement(&self, draft: MovementDraft) -> EngineResult<StockMovement> {
        draft.validate()?;
        let engine = self.engine;
        let tenant_id = draft.tenant_id;

        let applied = with_retry(&engine.config.retry, "record_movement", || {
            let commit = LedgerCommit::movement(draft.clone());
            async move { engine.store.commit(tenant_id, commit).await.map_err(EngineError::from) }
        })
        .await?;
        let movement = single_movement(applied)?;

        info!(
            sequence = movement.sequence,
            stock_before = movement.stock_before,
            stock_after = movement.stock_after,
            "movement recorded"
        );
        engine.audit_movements(std::slice::from_ref(&movement));
        Ok(movement)
    }

    pub async fn stock_level(
        &self,
        tenant_id: TenantId,
        outlet_id: OutletId,
        product_id: ProductId,
    ) -> EngineResult<StockLevel> {
        let store = &self.engine.store;
        let product = store
            .load_product(tenant_id, outlet_id, product_id)
            .await?
            .filter(|p| p.is_active())
            .ok_or_else(|| EngineError::not_found(format!("product {product_id} in outlet {outlet_id}")))?;
        let in_warehouses = store
            .warehouse_available(tenant_id, outlet_id, product_id)
            .await?;
        Ok(StockLevel::compute(&product, in_warehouses))
    }

    /// Active products of the outlet at or below their minimum.
    pub async fn low_stock(&self, tenant_id: TenantId, outlet_id: OutletId) -> EngineResult<Vec<StockLevel>> {
        self.engine.require_outlet(tenant_id, outlet_id).await?;
        let store = &self.engine.store;
        let mut low = Vec::new();
        for product in store.list_products(tenant_id, outlet_id).await? {
            if !product.is_low_stock() {
                continue;
            }
            let in_warehouses = store
                .warehouse_available(tenant_id, outlet_id, product.product_id)
                .await?;
            low.push(StockLevel::compute(&product, in_warehouses));
        }
        Ok(low)
    }

    /// Most recent first.
    pub async fn list_movements(
        &self,
        tenant_id: TenantId,
        filter: &MovementFilter,
        pagination: Option<Pagination>,
    ) -> EngineResult<Page<StockMovement>> {
        let pagination = self.engine.config.paginate(pagination);
        Ok(self
            .engine
            .store
            .list_movements(tenant_id, filter, pagination)
            .await?)
    }

    /// Re-fold the outlet-level ledger of one product and compare it with the
    /// cached `current_stock`. Soft-deleted listings are still replayable.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, product_id = %product_id), err)]
    pub async fn replay(
        &self,
        tenant_id: TenantId,
        outlet_id: OutletId,
        product_id: ProductId,
    ) -> EngineResult<ReplayReport> {
        let store = &self.engine.store;
        let product = store
            .load_product(tenant_id, outlet_id, product_id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("product {product_id} in outlet {outlet_id}")))?;
        let stream = StockStream {
            tenant_id,
            outlet_id,
            warehouse_id: None,
            product_id,
        };
        let movements = store.load_stream(stream).await?;
        Ok(ReplayReport {
            stream,
            cached_stock: product.current_stock,
            result: replay(&movements),
        })
    }

    /// Replay every active product of an outlet.
    pub async fn reconcile(&self, tenant_id: TenantId, outlet_id: OutletId) -> EngineResult<Vec<ReplayReport>> {
        self.engine.require_outlet(tenant_id, outlet_id).await?;
        let products = self.engine.store.list_products(tenant_id, outlet_id).await?;
        let mut reports = Vec::with_capacity(products.len());
        for product in products {
            reports.push(self.replay(tenant_id, outlet_id, product.product_id).await?);
        }
        let drifted = reports.iter().filter(|r| !r.is_consistent()).count();
        info!(
            tenant_id = %tenant_id,
            outlet_id = %outlet_id,
            products = reports.len(),
            drifted,
            "ledger reconciled"
        );
        Ok(reports)
    }
}
