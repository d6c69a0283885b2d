use chrono::Utc;
use tracing::{info, instrument};

use coopstock_core::{AggregateId, AggregateRoot, ExpectedVersion, OutletId, TenantId, UserId};
use coopstock_events::{AuditAction, AuditEvent, EventBus, execute};
use coopstock_inventory::{
    AdjustmentCommand, AdjustmentEvent, AdjustmentId, AdjustmentItem, CreateAdjustment,
    DecideAdjustment, StockAdjustment, StockMovement, document_number,
};

use super::StockEngine;
use crate::audit::AuditEnvelope;
use crate::error::{EngineError, EngineResult};
use crate::query::{AdjustmentFilter, Page, Pagination};
use crate::retry::with_retry;
use crate::store::{LedgerCommit, StockDocument, StockStore, WarehouseStore};

const RESOURCE: &str = "stock_adjustment";

/// Approval-gated batches of manual corrections.
///
/// ```text
/// PENDING --approve(true)--> APPROVED   (all item movements, one commit)
/// PENDING --approve(false)-> REJECTED   (no movements)
/// ```
pub struct AdjustmentService<'a, S, B> {
    pub(super) engine: &'a StockEngine<S, B>,
}

impl<'a, S, B> AdjustmentService<'a, S, B>
where
    S: StockStore + WarehouseStore,
    B: EventBus<AuditEnvelope>,
{
    /// Record a PENDING adjustment. Stock is untouched until approval.
    #[instrument(skip(self, reason, items), fields(tenant_id = %tenant_id, outlet_id = %outlet_id), err)]
    pub async fn create_adjustment(
        &self,
        tenant_id: TenantId,
        outlet_id: OutletId,
        reason: &str,
        items: Vec<AdjustmentItem>,
        actor: UserId,
    ) -> EngineResult<StockAdjustment> {
        let engine = self.engine;
        let now = Utc::now();
        let id = AdjustmentId::new(AggregateId::new());
        let mut adjustment = StockAdjustment::empty(id);
        let command = AdjustmentCommand::Create(CreateAdjustment {
            tenant_id,
            adjustment_id: id,
            outlet_id,
            adjustment_number: document_number("ADJ", id, now),
            reason: reason.to_string(),
            items,
            requested_by: actor,
            occurred_at: now,
        });
        execute(&mut adjustment, &command)?;

        engine.require_outlet(tenant_id, outlet_id).await?;
        for item in adjustment.items() {
            let listed = engine
                .store
                .load_product(tenant_id, outlet_id, item.product_id)
                .await?
                .is_some_and(|p| p.is_active());
            if !listed {
                return Err(EngineError::invalid_reference(format!(
                    "product {} is not listed in outlet {outlet_id}",
                    item.product_id
                )));
            }
        }

        let commit = LedgerCommit::document(StockDocument::Adjustment(adjustment.clone()), ExpectedVersion::New);
        engine.store.commit(tenant_id, commit).await?;

        info!(
            adjustment_id = %id,
            adjustment_number = adjustment.adjustment_number(),
            items = adjustment.items().len(),
            "adjustment created"
        );
        let event = AuditEvent::new(tenant_id, actor, AuditAction::AdjustmentCreated, RESOURCE, id.into())
            .with_after(&adjustment);
        engine.audit.emit(event, adjustment.version());
        Ok(adjustment)
    }

    /// Approve or reject a PENDING adjustment.
    ///
    /// Approval commits every item movement and the header transition together:
    /// if any item would drive stock negative nothing is applied and the header
    /// stays PENDING.
    #[instrument(skip(self, notes), fields(tenant_id = %tenant_id, adjustment_id = %id), err)]
    pub async fn approve_adjustment(
        &self,
        tenant_id: TenantId,
        id: AdjustmentId,
        approved: bool,
        notes: Option<String>,
        actor: UserId,
    ) -> EngineResult<StockAdjustment> {
        let engine = self.engine;
        let (before, after, movements) = with_retry(&engine.config.retry, "approve_adjustment", || {
            self.decide_once(tenant_id, id, approved, notes.clone(), actor)
        })
        .await?;

        info!(
            adjustment_id = %id,
            from = %before.status(),
            to = %after.status(),
            movements = movements.len(),
            "adjustment decided"
        );
        let action = if approved {
            AuditAction::AdjustmentApproved
        } else {
            AuditAction::AdjustmentRejected
        };
        let event = AuditEvent::new(tenant_id, actor, action, RESOURCE, id.into())
            .with_before(&before)
            .with_after(&after);
        engine.audit.emit(event, after.version());
        engine.audit_movements(&movements);
        Ok(after)
    }

    async fn decide_once(
        &self,
        tenant_id: TenantId,
        id: AdjustmentId,
        approved: bool,
        notes: Option<String>,
        actor: UserId,
    ) -> EngineResult<(StockAdjustment, StockAdjustment, Vec<StockMovement>)> {
        let before = self.get_adjustment(tenant_id, id).await?;
        let mut after = before.clone();
        let events = execute(
            &mut after,
            &AdjustmentCommand::Decide(DecideAdjustment {
                tenant_id,
                adjustment_id: id,
                approved,
                decided_by: actor,
                notes,
                occurred_at: Utc::now(),
            }),
        )?;

        let drafts = events.iter().flat_map(|e| match e {
            AdjustmentEvent::Approved(approved) => approved.movement_drafts(),
            _ => Vec::new(),
        });
        let commit = LedgerCommit::document(
            StockDocument::Adjustment(after.clone()),
            ExpectedVersion::Exact(before.version()),
        )
        .with_movements(drafts);
        let movements = self.engine.store.commit(tenant_id, commit).await?;
        Ok((before, after, movements))
    }

    pub async fn get_adjustment(&self, tenant_id: TenantId, id: AdjustmentId) -> EngineResult<StockAdjustment> {
        self.engine
            .store
            .load_adjustment(tenant_id, id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("adjustment {id}")))
    }

    /// Most recent first.
    pub async fn list_adjustments(
        &self,
        tenant_id: TenantId,
        filter: &AdjustmentFilter,
        pagination: Option<Pagination>,
    ) -> EngineResult<Page<StockAdjustment>> {
        let pagination = self.engine.config.paginate(pagination);
        Ok(self
            .engine
            .store
            .list_adjustments(tenant_id, filter, pagination)
            .await?)
    }
}
