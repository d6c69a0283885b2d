//! Stock engine: the caller-facing operations.
//!
//! ```text
//! request
//!   ↓
//! 1. Load current state (tenant-scoped)
//!   ↓
//! 2. Decide (pure domain rules, `execute` on documents)
//!   ↓
//! 3. Commit movements + document snapshot as one `LedgerCommit`
//!   ↓
//! 4. Publish audit envelopes
//! ```
//!
//! Steps 1-3 run inside `with_retry`, so a `Conflict` re-reads state before
//! deciding again. A loser of a race on a document therefore ends up with the
//! state machine's `InvalidState`, not a stale overwrite.

mod adjustments;
mod ledger;
mod transfers;
mod warehouses;

pub use adjustments::AdjustmentService;
pub use ledger::{MovementLedger, ReplayReport};
pub use transfers::TransferService;
pub use warehouses::WarehouseService;

use std::sync::Arc;

use coopstock_core::TenantId;
use coopstock_events::{AuditAction, AuditEvent, EventBus};
use coopstock_inventory::StockMovement;

use crate::audit::{AuditEnvelope, AuditPublisher};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult, StoreError};
use crate::store::{StockStore, WarehouseStore};

pub struct StockEngine<S, B> {
    store: Arc<S>,
    audit: AuditPublisher<B>,
    config: EngineConfig,
}

impl<S, B> StockEngine<S, B>
where
    S: StockStore + WarehouseStore,
    B: EventBus<AuditEnvelope>,
{
    pub fn new(store: Arc<S>, bus: B, config: EngineConfig) -> Self {
        Self {
            store,
            audit: AuditPublisher::new(bus),
            config,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn audit(&self) -> &AuditPublisher<B> {
        &self.audit
    }

    pub fn ledger(&self) -> MovementLedger<'_, S, B> {
        MovementLedger { engine: self }
    }

    pub fn adjustments(&self) -> AdjustmentService<'_, S, B> {
        AdjustmentService { engine: self }
    }

    pub fn transfers(&self) -> TransferService<'_, S, B> {
        TransferService { engine: self }
    }

    pub fn warehouses(&self) -> WarehouseService<'_, S, B> {
        WarehouseService { engine: self }
    }

    /// One `stock.movement.recorded` audit record per applied movement.
    fn audit_movements(&self, movements: &[StockMovement]) {
        self.audit.emit_all(movements.iter().map(|m| {
            let event = AuditEvent::new(
                m.tenant_id,
                m.recorded_by,
                AuditAction::MovementRecorded,
                "stock_movement",
                m.id.into(),
            )
            .with_after(m);
            (event, m.sequence)
        }));
    }

    async fn require_outlet(
        &self,
        tenant_id: TenantId,
        outlet_id: coopstock_core::OutletId,
    ) -> EngineResult<()> {
        if self.store.outlet_exists(tenant_id, outlet_id).await? {
            Ok(())
        } else {
            Err(EngineError::not_found(format!("outlet {outlet_id}")))
        }
    }
}

/// A store that committed movements must hand back one per draft.
fn single_movement(mut applied: Vec<StockMovement>) -> EngineResult<StockMovement> {
    match (applied.pop(), applied.is_empty()) {
        (Some(m), true) => Ok(m),
        _ => Err(EngineError::Store(StoreError::Corrupt(
            "commit returned an unexpected number of movements".to_string(),
        ))),
    }
}
