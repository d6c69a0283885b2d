use chrono::Utc;
use tracing::{info, instrument};

use coopstock_core::{OutletId, ProductId, TenantId, UserId, WarehouseId};
use coopstock_events::{AuditAction, AuditEvent, EventBus};
use coopstock_inventory::{
    StockStream, Warehouse, WarehouseStock, WarehouseStockUpdate, WarehouseType, replay,
};

use super::{ReplayReport, StockEngine};
use crate::audit::AuditEnvelope;
use crate::config::WarehouseMode;
use crate::error::{EngineError, EngineResult};
use crate::retry::with_retry;
use crate::store::{StockStore, WarehouseStore, WarehouseUpsert};

/// Warehouse registry and per-batch sub-stock.
///
/// In `WarehouseMode::Independent` rows are written directly. In
/// `WarehouseMode::Ledgered` every change of a warehouse's product total is
/// also appended to the ledger as a warehouse-level adjustment movement.
pub struct WarehouseService<'a, S, B> {
    pub(super) engine: &'a StockEngine<S, B>,
}

impl<'a, S, B> WarehouseService<'a, S, B>
where
    S: StockStore + WarehouseStore,
    B: EventBus<AuditEnvelope>,
{
    #[instrument(skip(self, name), fields(tenant_id = %tenant_id, outlet_id = %outlet_id), err)]
    pub async fn create_warehouse(
        &self,
        tenant_id: TenantId,
        outlet_id: OutletId,
        code: &str,
        name: &str,
        warehouse_type: WarehouseType,
        actor: UserId,
    ) -> EngineResult<Warehouse> {
        let engine = self.engine;
        let warehouse = Warehouse::new(tenant_id, outlet_id, code, name, warehouse_type, Utc::now())?;
        engine.require_outlet(tenant_id, outlet_id).await?;
        engine.store.create_warehouse(&warehouse).await?;

        info!(warehouse_id = %warehouse.id, code = %warehouse.code, "warehouse created");
        let event = AuditEvent::new(
            tenant_id,
            actor,
            AuditAction::WarehouseCreated,
            "warehouse",
            warehouse.id.into(),
        )
        .with_after(&warehouse);
        engine.audit.emit(event, 1);
        Ok(warehouse)
    }

    /// Set the absolute quantity (and optionally reserved count, placement) of
    /// one `(warehouse, product, batch)` row. The product must be listed in
    /// the warehouse's outlet.
    #[instrument(
        skip(self, update),
        fields(
            tenant_id = %tenant_id,
            warehouse_id = %update.warehouse_id,
            product_id = %update.product_id,
            quantity = update.quantity
        ),
        err
    )]
    pub async fn upsert_warehouse_stock(
        &self,
        tenant_id: TenantId,
        update: WarehouseStockUpdate,
        actor: UserId,
    ) -> EngineResult<WarehouseStock> {
        update.validate()?;
        let engine = self.engine;
        let warehouse = self.load_warehouse(tenant_id, update.warehouse_id).await?;
        let listed = engine
            .store
            .load_product(tenant_id, warehouse.outlet_id, update.product_id)
            .await?
            .is_some_and(|p| p.is_active());
        if !listed {
            return Err(EngineError::invalid_reference(format!(
                "product {} is not listed in outlet {}",
                update.product_id, warehouse.outlet_id
            )));
        }
        let ledger_actor = match engine.config.warehouse_mode {
            WarehouseMode::Ledgered => Some(actor),
            WarehouseMode::Independent => None,
        };

        let WarehouseUpsert {
            previous,
            row,
            movement,
        } = with_retry(&engine.config.retry, "upsert_warehouse_stock", || async {
            engine
                .store
                .upsert_warehouse_stock(&warehouse, &update, ledger_actor)
                .await
                .map_err(EngineError::from)
        })
        .await?;

        info!(
            previous_quantity = previous.as_ref().map_or(0, |p| p.quantity),
            quantity = row.quantity,
            available = row.available,
            ledgered = movement.is_some(),
            "warehouse stock upserted"
        );
        let mut event = AuditEvent::new(
            tenant_id,
            actor,
            AuditAction::WarehouseStockUpserted,
            "warehouse_stock",
            warehouse.id.into(),
        )
        .with_after(&row);
        if let Some(previous) = &previous {
            event = event.with_before(previous);
        }
        engine.audit.emit(event, movement.as_ref().map_or(0, |m| m.sequence));
        if let Some(movement) = movement {
            engine.audit_movements(std::slice::from_ref(&movement));
        }
        Ok(row)
    }

    pub async fn get_warehouse_stock(
        &self,
        tenant_id: TenantId,
        warehouse_id: WarehouseId,
    ) -> EngineResult<Vec<WarehouseStock>> {
        self.load_warehouse(tenant_id, warehouse_id).await?;
        Ok(self
            .engine
            .store
            .list_warehouse_stock(tenant_id, warehouse_id)
            .await?)
    }

    /// Replay the warehouse-level ledger of one product against the summed
    /// row quantities. Only meaningful for history written in ledgered mode.
    pub async fn replay(
        &self,
        tenant_id: TenantId,
        warehouse_id: WarehouseId,
        product_id: ProductId,
    ) -> EngineResult<ReplayReport> {
        let warehouse = self.load_warehouse(tenant_id, warehouse_id).await?;
        let store = &self.engine.store;
        let cached_stock: i64 = store
            .list_warehouse_stock(tenant_id, warehouse_id)
            .await?
            .iter()
            .filter(|row| row.product_id == product_id)
            .map(|row| row.quantity)
            .sum();
        let stream = StockStream {
            tenant_id,
            outlet_id: warehouse.outlet_id,
            warehouse_id: Some(warehouse_id),
            product_id,
        };
        let movements = store.load_stream(stream).await?;
        Ok(ReplayReport {
            stream,
            cached_stock,
            result: replay(&movements),
        })
    }

    async fn load_warehouse(&self, tenant_id: TenantId, warehouse_id: WarehouseId) -> EngineResult<Warehouse> {
        self.engine
            .store
            .load_warehouse(tenant_id, warehouse_id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("warehouse {warehouse_id}")))
    }
}
