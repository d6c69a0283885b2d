use chrono::Utc;
use tracing::{info, instrument, warn};

use coopstock_core::{AggregateId, AggregateRoot, DomainError, ExpectedVersion, OutletId, TenantId, UserId};
use coopstock_events::{AuditAction, AuditEvent, EventBus, execute};
use coopstock_inventory::{
    CreateTransfer, ItemQuantity, ProcessTransfer, StockMovement, StockTransfer, TransferAction,
    TransferCommand, TransferEvent, TransferId, TransferStatus, document_number,
};

use super::StockEngine;
use crate::audit::AuditEnvelope;
use crate::error::{EngineError, EngineResult};
use crate::query::{Page, Pagination, TransferFilter};
use crate::retry::with_retry;
use crate::store::{LedgerCommit, StockDocument, StockStore, WarehouseStore};

const RESOURCE: &str = "stock_transfer";

/// Multi-stage stock moves between two outlets.
///
/// | From | Action | To | Stock effect |
/// |---|---|---|---|
/// | PENDING | approve | APPROVED | none |
/// | APPROVED | ship | SHIPPED | `TRANSFER_OUT` at the source |
/// | SHIPPED | receive | RECEIVED | `TRANSFER_IN` at the destination |
/// | PENDING/APPROVED/SHIPPED | cancel | CANCELLED | none |
pub struct TransferService<'a, S, B> {
    pub(super) engine: &'a StockEngine<S, B>,
}

struct Processed {
    before: StockTransfer,
    after: StockTransfer,
    events: Vec<TransferEvent>,
    movements: Vec<StockMovement>,
}

impl<'a, S, B> TransferService<'a, S, B>
where
    S: StockStore + WarehouseStore,
    B: EventBus<AuditEnvelope>,
{
    /// Record a PENDING transfer.
    ///
    /// Both outlets must exist and list every product. Source stock is checked
    /// against the requested quantities as currently visible; nothing is held.
    #[instrument(
        skip(self, items, notes),
        fields(tenant_id = %tenant_id, from = %from_outlet_id, to = %to_outlet_id),
        err
    )]
    pub async fn create_transfer(
        &self,
        tenant_id: TenantId,
        from_outlet_id: OutletId,
        to_outlet_id: OutletId,
        items: Vec<ItemQuantity>,
        notes: Option<String>,
        actor: UserId,
    ) -> EngineResult<StockTransfer> {
        let engine = self.engine;
        let now = Utc::now();
        let id = TransferId::new(AggregateId::new());
        let mut transfer = StockTransfer::empty(id);
        execute(
            &mut transfer,
            &TransferCommand::Create(CreateTransfer {
                tenant_id,
                transfer_id: id,
                transfer_number: document_number("TRF", id, now),
                from_outlet_id,
                to_outlet_id,
                items,
                notes,
                requested_by: actor,
                occurred_at: now,
            }),
        )?;

        engine.require_outlet(tenant_id, from_outlet_id).await?;
        engine.require_outlet(tenant_id, to_outlet_id).await?;
        for item in transfer.items() {
            let source = engine
                .store
                .load_product(tenant_id, from_outlet_id, item.product_id)
                .await?
                .filter(|p| p.is_active());
            let destination_listed = engine
                .store
                .load_product(tenant_id, to_outlet_id, item.product_id)
                .await?
                .is_some_and(|p| p.is_active());
            let Some(source) = source.filter(|_| destination_listed) else {
                return Err(EngineError::invalid_reference(format!(
                    "product {} must be listed at both outlets",
                    item.product_id
                )));
            };
            if source.current_stock < item.quantity_requested {
                return Err(DomainError::insufficient_stock(
                    item.product_id,
                    item.quantity_requested,
                    source.current_stock,
                )
                .into());
            }
        }

        let commit = LedgerCommit::document(StockDocument::Transfer(transfer.clone()), ExpectedVersion::New);
        engine.store.commit(tenant_id, commit).await?;

        info!(
            transfer_id = %id,
            transfer_number = transfer.transfer_number(),
            items = transfer.items().len(),
            "transfer created"
        );
        let event = AuditEvent::new(tenant_id, actor, AuditAction::TransferCreated, RESOURCE, id.into())
            .with_after(&transfer);
        engine.audit.emit(event, transfer.version());
        Ok(transfer)
    }

    /// Advance a transfer by one action.
    ///
    /// Ship and receive commit their movements together with the header; an
    /// action from the wrong status fails with `InvalidState` and changes
    /// nothing.
    #[instrument(
        skip(self, action),
        fields(tenant_id = %tenant_id, transfer_id = %id, action = action.name()),
        err
    )]
    pub async fn process_transfer(
        &self,
        tenant_id: TenantId,
        id: TransferId,
        action: TransferAction,
        actor: UserId,
    ) -> EngineResult<StockTransfer> {
        let engine = self.engine;
        let processed = with_retry(&engine.config.retry, "process_transfer", || {
            self.process_once(tenant_id, id, action.clone(), actor)
        })
        .await?;
        let Processed {
            before,
            after,
            events,
            movements,
        } = processed;

        info!(
            transfer_id = %id,
            from = %before.status(),
            to = %after.status(),
            movements = movements.len(),
            "transfer transitioned"
        );
        for event in &events {
            if let TransferEvent::Cancelled(c) = event {
                if c.cancelled_from == TransferStatus::Shipped {
                    warn!(
                        transfer_id = %id,
                        units_in_transit = after.in_transit_loss(),
                        "shipped transfer cancelled, source outflow is not compensated"
                    );
                }
            }
            let audit = AuditEvent::new(tenant_id, actor, audit_action(event), RESOURCE, id.into())
                .with_before(&before)
                .with_after(&after);
            engine.audit.emit(audit, after.version());
        }
        engine.audit_movements(&movements);
        Ok(after)
    }

    async fn process_once(
        &self,
        tenant_id: TenantId,
        id: TransferId,
        action: TransferAction,
        actor: UserId,
    ) -> EngineResult<Processed> {
        let before = self.get_transfer(tenant_id, id).await?;
        let mut after = before.clone();
        let events = execute(
            &mut after,
            &TransferCommand::Process(ProcessTransfer {
                tenant_id,
                transfer_id: id,
                action,
                actor,
                occurred_at: Utc::now(),
            }),
        )?;

        let commit = LedgerCommit::document(
            StockDocument::Transfer(after.clone()),
            ExpectedVersion::Exact(before.version()),
        )
        .with_movements(events.iter().flat_map(TransferEvent::movement_drafts));
        let movements = self.engine.store.commit(tenant_id, commit).await?;
        Ok(Processed {
            before,
            after,
            events,
            movements,
        })
    }

    pub async fn get_transfer(&self, tenant_id: TenantId, id: TransferId) -> EngineResult<StockTransfer> {
        self.engine
            .store
            .load_transfer(tenant_id, id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("transfer {id}")))
    }

    /// Most recent first.
    pub async fn list_transfers(
        &self,
        tenant_id: TenantId,
        filter: &TransferFilter,
        pagination: Option<Pagination>,
    ) -> EngineResult<Page<StockTransfer>> {
        let pagination = self.engine.config.paginate(pagination);
        Ok(self
            .engine
            .store
            .list_transfers(tenant_id, filter, pagination)
            .await?)
    }
}

fn audit_action(event: &TransferEvent) -> AuditAction {
    match event {
        TransferEvent::Created(_) => AuditAction::TransferCreated,
        TransferEvent::Approved(_) => AuditAction::TransferApproved,
        TransferEvent::Shipped(_) => AuditAction::TransferShipped,
        TransferEvent::Received(_) => AuditAction::TransferReceived,
        TransferEvent::Cancelled(_) => AuditAction::TransferCancelled,
    }
}
