use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use coopstock_core::{
    Aggregate, AggregateId, AggregateRoot, DomainError, OutletId, ProductId, TenantId, UserId,
};
use coopstock_events::Event;

use crate::movement::{MovementDraft, MovementReference, MovementType, ReferenceType};

/// Stock adjustment identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AdjustmentId(pub AggregateId);

impl AdjustmentId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for AdjustmentId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl From<AdjustmentId> for uuid::Uuid {
    fn from(value: AdjustmentId) -> Self {
        value.0.into()
    }
}

/// Approval lifecycle. `Approved` and `Rejected` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdjustmentStatus {
    Pending,
    Approved,
    Rejected,
}

impl AdjustmentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AdjustmentStatus::Pending => "pending",
            AdjustmentStatus::Approved => "approved",
            AdjustmentStatus::Rejected => "rejected",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, AdjustmentStatus::Pending)
    }
}

impl core::fmt::Display for AdjustmentStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One proposed correction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjustmentItem {
    pub product_id: ProductId,
    /// Signed delta; the sign must agree with `movement_type`.
    pub quantity: i64,
    pub movement_type: MovementType,
    pub notes: Option<String>,
}

/// Aggregate root: StockAdjustment.
///
/// A batch of manual corrections held behind an approval gate. Items turn into
/// ledger movements exactly once, on the PENDING → APPROVED transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockAdjustment {
    id: AdjustmentId,
    tenant_id: Option<TenantId>,
    outlet_id: Option<OutletId>,
    adjustment_number: String,
    reason: String,
    status: AdjustmentStatus,
    items: Vec<AdjustmentItem>,
    requested_by: Option<UserId>,
    approved_by: Option<UserId>,
    approved_at: Option<DateTime<Utc>>,
    approval_notes: Option<String>,
    created_at: Option<DateTime<Utc>>,
    version: u64,
    created: bool,
}

impl StockAdjustment {
    /// Create an empty, not-yet-created aggregate instance.
    pub fn empty(id: AdjustmentId) -> Self {
        Self {
            id,
            tenant_id: None,
            outlet_id: None,
            adjustment_number: String::new(),
            reason: String::new(),
            status: AdjustmentStatus::Pending,
            items: Vec::new(),
            requested_by: None,
            approved_by: None,
            approved_at: None,
            approval_notes: None,
            created_at: None,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> AdjustmentId {
        self.id
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        self.tenant_id
    }

    pub fn outlet_id(&self) -> Option<OutletId> {
        self.outlet_id
    }

    pub fn adjustment_number(&self) -> &str {
        &self.adjustment_number
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn status(&self) -> AdjustmentStatus {
        self.status
    }

    pub fn items(&self) -> &[AdjustmentItem] {
        &self.items
    }

    pub fn requested_by(&self) -> Option<UserId> {
        self.requested_by
    }

    pub fn approved_by(&self) -> Option<UserId> {
        self.approved_by
    }

    pub fn approved_at(&self) -> Option<DateTime<Utc>> {
        self.approved_at
    }

    pub fn approval_notes(&self) -> Option<&str> {
        self.approval_notes.as_deref()
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    pub fn is_created(&self) -> bool {
        self.created
    }
}

impl AggregateRoot for StockAdjustment {
    type Id = AdjustmentId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreateAdjustment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateAdjustment {
    pub tenant_id: TenantId,
    pub adjustment_id: AdjustmentId,
    pub outlet_id: OutletId,
    pub adjustment_number: String,
    pub reason: String,
    pub items: Vec<AdjustmentItem>,
    pub requested_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: DecideAdjustment (approve or reject).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecideAdjustment {
    pub tenant_id: TenantId,
    pub adjustment_id: AdjustmentId,
    pub approved: bool,
    pub decided_by: UserId,
    pub notes: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdjustmentCommand {
    Create(CreateAdjustment),
    Decide(DecideAdjustment),
}

/// Event: AdjustmentCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjustmentCreated {
    pub tenant_id: TenantId,
    pub adjustment_id: AdjustmentId,
    pub outlet_id: OutletId,
    pub adjustment_number: String,
    pub reason: String,
    pub items: Vec<AdjustmentItem>,
    pub requested_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: AdjustmentApproved.
///
/// Carries the outlet and items so the ledger movements can be derived from the
/// event alone (see [`AdjustmentApproved::movement_drafts`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjustmentApproved {
    pub tenant_id: TenantId,
    pub adjustment_id: AdjustmentId,
    pub outlet_id: OutletId,
    pub items: Vec<AdjustmentItem>,
    pub approved_by: UserId,
    pub notes: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl AdjustmentApproved {
    /// One movement per item, referencing the adjustment.
    pub fn movement_drafts(&self) -> Vec<MovementDraft> {
        let reference = MovementReference::new(ReferenceType::Adjustment, self.adjustment_id);
        self.items
            .iter()
            .map(|item| {
                MovementDraft::new(
                    self.tenant_id,
                    self.outlet_id,
                    item.product_id,
                    item.movement_type,
                    item.quantity,
                    self.approved_by,
                )
                .with_reference(reference)
                .with_notes(item.notes.clone())
            })
            .collect()
    }
}

/// Event: AdjustmentRejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjustmentRejected {
    pub tenant_id: TenantId,
    pub adjustment_id: AdjustmentId,
    pub rejected_by: UserId,
    pub notes: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdjustmentEvent {
    Created(AdjustmentCreated),
    Approved(AdjustmentApproved),
    Rejected(AdjustmentRejected),
}

impl Event for AdjustmentEvent {
    fn event_type(&self) -> &'static str {
        match self {
            AdjustmentEvent::Created(_) => "stock.adjustment.created",
            AdjustmentEvent::Approved(_) => "stock.adjustment.approved",
            AdjustmentEvent::Rejected(_) => "stock.adjustment.rejected",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            AdjustmentEvent::Created(e) => e.occurred_at,
            AdjustmentEvent::Approved(e) => e.occurred_at,
            AdjustmentEvent::Rejected(e) => e.occurred_at,
        }
    }
}

impl Aggregate for StockAdjustment {
    type Command = AdjustmentCommand;
    type Event = AdjustmentEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            AdjustmentEvent::Created(e) => {
                self.id = e.adjustment_id;
                self.tenant_id = Some(e.tenant_id);
                self.outlet_id = Some(e.outlet_id);
                self.adjustment_number = e.adjustment_number.clone();
                self.reason = e.reason.clone();
                self.items = e.items.clone();
                self.requested_by = Some(e.requested_by);
                self.status = AdjustmentStatus::Pending;
                self.created_at = Some(e.occurred_at);
                self.created = true;
            }
            AdjustmentEvent::Approved(e) => {
                self.status = AdjustmentStatus::Approved;
                self.approved_by = Some(e.approved_by);
                self.approved_at = Some(e.occurred_at);
                self.approval_notes = e.notes.clone();
            }
            AdjustmentEvent::Rejected(e) => {
                self.status = AdjustmentStatus::Rejected;
                self.approved_by = Some(e.rejected_by);
                self.approved_at = Some(e.occurred_at);
                self.approval_notes = e.notes.clone();
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            AdjustmentCommand::Create(cmd) => self.handle_create(cmd),
            AdjustmentCommand::Decide(cmd) => self.handle_decide(cmd),
        }
    }
}

impl StockAdjustment {
    fn ensure_tenant(&self, tenant_id: TenantId) -> Result<(), DomainError> {
        if self.tenant_id != Some(tenant_id) {
            return Err(DomainError::not_found(format!("adjustment {}", self.id)));
        }
        Ok(())
    }

    fn ensure_adjustment_id(&self, adjustment_id: AdjustmentId) -> Result<(), DomainError> {
        if self.id != adjustment_id {
            return Err(DomainError::invariant("adjustment_id mismatch"));
        }
        Ok(())
    }

    fn handle_create(&self, cmd: &CreateAdjustment) -> Result<Vec<AdjustmentEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("adjustment already exists"));
        }
        self.ensure_adjustment_id(cmd.adjustment_id)?;
        if cmd.adjustment_number.trim().is_empty() {
            return Err(DomainError::validation("adjustment number cannot be empty"));
        }
        if cmd.reason.trim().is_empty() {
            return Err(DomainError::validation("reason cannot be empty"));
        }
        if cmd.items.is_empty() {
            return Err(DomainError::validation("adjustment needs at least one item"));
        }
        for (idx, item) in cmd.items.iter().enumerate() {
            item.movement_type
                .check_quantity(item.quantity)
                .map_err(|e| DomainError::validation(format!("item {idx}: {e}")))?;
        }

        Ok(vec![AdjustmentEvent::Created(AdjustmentCreated {
            tenant_id: cmd.tenant_id,
            adjustment_id: cmd.adjustment_id,
            outlet_id: cmd.outlet_id,
            adjustment_number: cmd.adjustment_number.trim().to_string(),
            reason: cmd.reason.trim().to_string(),
            items: cmd.items.clone(),
            requested_by: cmd.requested_by,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_decide(&self, cmd: &DecideAdjustment) -> Result<Vec<AdjustmentEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found(format!("adjustment {}", cmd.adjustment_id)));
        }
        self.ensure_tenant(cmd.tenant_id)?;
        self.ensure_adjustment_id(cmd.adjustment_id)?;

        if self.status != AdjustmentStatus::Pending {
            return Err(DomainError::invalid_state(self.status, AdjustmentStatus::Pending.as_str()));
        }

        let outlet_id = self
            .outlet_id
            .ok_or_else(|| DomainError::invariant("adjustment has no outlet"))?;

        let event = if cmd.approved {
            AdjustmentEvent::Approved(AdjustmentApproved {
                tenant_id: cmd.tenant_id,
                adjustment_id: cmd.adjustment_id,
                outlet_id,
                items: self.items.clone(),
                approved_by: cmd.decided_by,
                notes: cmd.notes.clone(),
                occurred_at: cmd.occurred_at,
            })
        } else {
            AdjustmentEvent::Rejected(AdjustmentRejected {
                tenant_id: cmd.tenant_id,
                adjustment_id: cmd.adjustment_id,
                rejected_by: cmd.decided_by,
                notes: cmd.notes.clone(),
                occurred_at: cmd.occurred_at,
            })
        };
        Ok(vec![event])
    }
}
