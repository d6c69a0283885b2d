use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use coopstock_core::{
    Aggregate, AggregateId, AggregateRoot, DomainError, DomainResult, OutletId, ProductId,
    TenantId, UserId,
};
use coopstock_events::Event;

use crate::movement::{MovementDraft, MovementReference, MovementType, ReferenceType};

/// Stock transfer identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(pub AggregateId);

impl TransferId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for TransferId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl From<TransferId> for uuid::Uuid {
    fn from(value: TransferId) -> Self {
        value.0.into()
    }
}

/// Transfer lifecycle (forward-only).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Pending,
    Approved,
    Shipped,
    Received,
    Cancelled,
}

impl TransferStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TransferStatus::Pending => "pending",
            TransferStatus::Approved => "approved",
            TransferStatus::Shipped => "shipped",
            TransferStatus::Received => "received",
            TransferStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TransferStatus::Received | TransferStatus::Cancelled)
    }
}

impl core::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A product and a non-negative unit count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemQuantity {
    pub product_id: ProductId,
    pub quantity: i64,
}

impl ItemQuantity {
    pub fn new(product_id: ProductId, quantity: i64) -> Self {
        Self {
            product_id,
            quantity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferItem {
    pub product_id: ProductId,
    pub quantity_requested: i64,
    /// `None` until shipped.
    pub quantity_shipped: Option<i64>,
    /// `None` until received.
    pub quantity_received: Option<i64>,
}

/// Actions on an existing transfer. Each one names exactly one legal
/// predecessor set; everything else is rejected with `InvalidState`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TransferAction {
    Approve,
    /// Overrides per product; omitted items ship the requested quantity.
    Ship { items: Vec<ItemQuantity> },
    /// Overrides per product; omitted items receive the shipped quantity.
    Receive { items: Vec<ItemQuantity> },
    Cancel { reason: Option<String> },
}

impl TransferAction {
    pub fn name(&self) -> &'static str {
        match self {
            TransferAction::Approve => "approve",
            TransferAction::Ship { .. } => "ship",
            TransferAction::Receive { .. } => "receive",
            TransferAction::Cancel { .. } => "cancel",
        }
    }

    fn allowed_from(&self, status: TransferStatus) -> bool {
        match self {
            TransferAction::Approve => status == TransferStatus::Pending,
            TransferAction::Ship { .. } => status == TransferStatus::Approved,
            TransferAction::Receive { .. } => status == TransferStatus::Shipped,
            TransferAction::Cancel { .. } => !status.is_terminal(),
        }
    }

    fn required_status(&self) -> &'static str {
        match self {
            TransferAction::Approve => "pending",
            TransferAction::Ship { .. } => "approved",
            TransferAction::Receive { .. } => "shipped",
            TransferAction::Cancel { .. } => "pending|approved|shipped",
        }
    }
}

/// Aggregate root: StockTransfer.
///
/// Stock leaves the source outlet at Ship and arrives at the destination at
/// Receive; nothing moves at create, approve or cancel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockTransfer {
    id: TransferId,
    tenant_id: Option<TenantId>,
    transfer_number: String,
    from_outlet_id: Option<OutletId>,
    to_outlet_id: Option<OutletId>,
    status: TransferStatus,
    items: Vec<TransferItem>,
    notes: Option<String>,
    requested_by: Option<UserId>,
    approved_by: Option<UserId>,
    shipped_date: Option<DateTime<Utc>>,
    received_date: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
    cancel_reason: Option<String>,
    created_at: Option<DateTime<Utc>>,
    version: u64,
    created: bool,
}

impl StockTransfer {
    pub fn empty(id: TransferId) -> Self {
        Self {
            id,
            tenant_id: None,
            transfer_number: String::new(),
            from_outlet_id: None,
            to_outlet_id: None,
            status: TransferStatus::Pending,
            items: Vec::new(),
            notes: None,
            requested_by: None,
            approved_by: None,
            shipped_date: None,
            received_date: None,
            cancelled_at: None,
            cancel_reason: None,
            created_at: None,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> TransferId {
        self.id
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        self.tenant_id
    }

    pub fn transfer_number(&self) -> &str {
        &self.transfer_number
    }

    pub fn from_outlet_id(&self) -> Option<OutletId> {
        self.from_outlet_id
    }

    pub fn to_outlet_id(&self) -> Option<OutletId> {
        self.to_outlet_id
    }

    pub fn status(&self) -> TransferStatus {
        self.status
    }

    pub fn items(&self) -> &[TransferItem] {
        &self.items
    }

    pub fn notes(&self) -> Option<&str> {
        self.notes.as_deref()
    }

    pub fn requested_by(&self) -> Option<UserId> {
        self.requested_by
    }

    pub fn approved_by(&self) -> Option<UserId> {
        self.approved_by
    }

    pub fn shipped_date(&self) -> Option<DateTime<Utc>> {
        self.shipped_date
    }

    pub fn received_date(&self) -> Option<DateTime<Utc>> {
        self.received_date
    }

    pub fn cancelled_at(&self) -> Option<DateTime<Utc>> {
        self.cancelled_at
    }

    pub fn cancel_reason(&self) -> Option<&str> {
        self.cancel_reason.as_deref()
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    /// Units shipped but not received (only meaningful once received).
    pub fn in_transit_loss(&self) -> i64 {
        self.items
            .iter()
            .map(|i| i.quantity_shipped.unwrap_or(0) - i.quantity_received.unwrap_or(0))
            .sum()
    }
}

impl AggregateRoot for StockTransfer {
    type Id = TransferId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreateTransfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTransfer {
    pub tenant_id: TenantId,
    pub transfer_id: TransferId,
    pub transfer_number: String,
    pub from_outlet_id: OutletId,
    pub to_outlet_id: OutletId,
    pub items: Vec<ItemQuantity>,
    pub notes: Option<String>,
    pub requested_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ProcessTransfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessTransfer {
    pub tenant_id: TenantId,
    pub transfer_id: TransferId,
    pub action: TransferAction,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferCommand {
    Create(CreateTransfer),
    Process(ProcessTransfer),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferCreated {
    pub tenant_id: TenantId,
    pub transfer_id: TransferId,
    pub transfer_number: String,
    pub from_outlet_id: OutletId,
    pub to_outlet_id: OutletId,
    pub items: Vec<ItemQuantity>,
    pub notes: Option<String>,
    pub requested_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferApproved {
    pub tenant_id: TenantId,
    pub transfer_id: TransferId,
    pub approved_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: TransferShipped. Lines hold the resolved shipped quantities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferShipped {
    pub tenant_id: TenantId,
    pub transfer_id: TransferId,
    pub from_outlet_id: OutletId,
    pub lines: Vec<ItemQuantity>,
    pub shipped_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

impl TransferShipped {
    /// `TRANSFER_OUT` at the source for every line with a nonzero quantity.
    pub fn movement_drafts(&self) -> Vec<MovementDraft> {
        transfer_drafts(
            self.tenant_id,
            self.transfer_id,
            self.from_outlet_id,
            &self.lines,
            MovementType::TransferOut,
            self.shipped_by,
        )
    }
}

/// Event: TransferReceived. Lines hold the resolved received quantities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferReceived {
    pub tenant_id: TenantId,
    pub transfer_id: TransferId,
    pub to_outlet_id: OutletId,
    pub lines: Vec<ItemQuantity>,
    pub received_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

impl TransferReceived {
    /// `TRANSFER_IN` at the destination for every line with a nonzero quantity.
    pub fn movement_drafts(&self) -> Vec<MovementDraft> {
        transfer_drafts(
            self.tenant_id,
            self.transfer_id,
            self.to_outlet_id,
            &self.lines,
            MovementType::TransferIn,
            self.received_by,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferCancelled {
    pub tenant_id: TenantId,
    pub transfer_id: TransferId,
    /// Status the transfer was cancelled from. `Shipped` means the source
    /// outflow stays recorded with no compensating inflow.
    pub cancelled_from: TransferStatus,
    pub reason: Option<String>,
    pub cancelled_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferEvent {
    Created(TransferCreated),
    Approved(TransferApproved),
    Shipped(TransferShipped),
    Received(TransferReceived),
    Cancelled(TransferCancelled),
}

impl TransferEvent {
    /// Ledger movements implied by this event (empty for non-stock transitions).
    pub fn movement_drafts(&self) -> Vec<MovementDraft> {
        match self {
            TransferEvent::Shipped(e) => e.movement_drafts(),
            TransferEvent::Received(e) => e.movement_drafts(),
            _ => Vec::new(),
        }
    }
}

impl Event for TransferEvent {
    fn event_type(&self) -> &'static str {
        match self {
            TransferEvent::Created(_) => "stock.transfer.created",
            TransferEvent::Approved(_) => "stock.transfer.approved",
            TransferEvent::Shipped(_) => "stock.transfer.shipped",
            TransferEvent::Received(_) => "stock.transfer.received",
            TransferEvent::Cancelled(_) => "stock.transfer.cancelled",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            TransferEvent::Created(e) => e.occurred_at,
            TransferEvent::Approved(e) => e.occurred_at,
            TransferEvent::Shipped(e) => e.occurred_at,
            TransferEvent::Received(e) => e.occurred_at,
            TransferEvent::Cancelled(e) => e.occurred_at,
        }
    }
}

fn transfer_drafts(
    tenant_id: TenantId,
    transfer_id: TransferId,
    outlet_id: OutletId,
    lines: &[ItemQuantity],
    movement_type: MovementType,
    actor: UserId,
) -> Vec<MovementDraft> {
    let reference = MovementReference::new(ReferenceType::Transfer, transfer_id);
    lines
        .iter()
        .filter(|l| l.quantity != 0)
        .map(|l| {
            let delta = if movement_type.is_inbound() {
                l.quantity
            } else {
                -l.quantity
            };
            MovementDraft::new(tenant_id, outlet_id, l.product_id, movement_type, delta, actor)
                .with_reference(reference)
        })
        .collect()
}

/// Resolve per-item quantities for Ship/Receive.
///
/// `limit` is the ceiling for each item (requested for Ship, shipped for
/// Receive) and also the default for items without an override.
fn resolve_quantities(
    items: &[TransferItem],
    overrides: &[ItemQuantity],
    limit: impl Fn(&TransferItem) -> i64,
) -> DomainResult<Vec<ItemQuantity>> {
    let mut seen = HashSet::new();
    for o in overrides {
        if !seen.insert(o.product_id) {
            return Err(DomainError::validation(format!(
                "product {} listed more than once",
                o.product_id
            )));
        }
        if !items.iter().any(|i| i.product_id == o.product_id) {
            return Err(DomainError::invalid_reference(format!(
                "product {} is not part of this transfer",
                o.product_id
            )));
        }
    }

    items
        .iter()
        .map(|item| {
            let max = limit(item);
            let quantity = overrides
                .iter()
                .find(|o| o.product_id == item.product_id)
                .map(|o| o.quantity)
                .unwrap_or(max);
            if quantity < 0 || quantity > max {
                return Err(DomainError::validation(format!(
                    "quantity {quantity} for product {} must be between 0 and {max}",
                    item.product_id
                )));
            }
            Ok(ItemQuantity::new(item.product_id, quantity))
        })
        .collect()
}

impl Aggregate for StockTransfer {
    type Command = TransferCommand;
    type Event = TransferEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            TransferEvent::Created(e) => {
                self.id = e.transfer_id;
                self.tenant_id = Some(e.tenant_id);
                self.transfer_number = e.transfer_number.clone();
                self.from_outlet_id = Some(e.from_outlet_id);
                self.to_outlet_id = Some(e.to_outlet_id);
                self.items = e
                    .items
                    .iter()
                    .map(|i| TransferItem {
                        product_id: i.product_id,
                        quantity_requested: i.quantity,
                        quantity_shipped: None,
                        quantity_received: None,
                    })
                    .collect();
                self.notes = e.notes.clone();
                self.requested_by = Some(e.requested_by);
                self.status = TransferStatus::Pending;
                self.created_at = Some(e.occurred_at);
                self.created = true;
            }
            TransferEvent::Approved(e) => {
                self.status = TransferStatus::Approved;
                self.approved_by = Some(e.approved_by);
            }
            TransferEvent::Shipped(e) => {
                for line in &e.lines {
                    if let Some(item) = self.items.iter_mut().find(|i| i.product_id == line.product_id) {
                        item.quantity_shipped = Some(line.quantity);
                    }
                }
                self.status = TransferStatus::Shipped;
                self.shipped_date = Some(e.occurred_at);
            }
            TransferEvent::Received(e) => {
                for line in &e.lines {
                    if let Some(item) = self.items.iter_mut().find(|i| i.product_id == line.product_id) {
                        item.quantity_received = Some(line.quantity);
                    }
                }
                self.status = TransferStatus::Received;
                self.received_date = Some(e.occurred_at);
            }
            TransferEvent::Cancelled(e) => {
                self.status = TransferStatus::Cancelled;
                self.cancelled_at = Some(e.occurred_at);
                self.cancel_reason = e.reason.clone();
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            TransferCommand::Create(cmd) => self.handle_create(cmd),
            TransferCommand::Process(cmd) => self.handle_process(cmd),
        }
    }
}

impl StockTransfer {
    fn ensure_tenant(&self, tenant_id: TenantId) -> Result<(), DomainError> {
        if self.tenant_id != Some(tenant_id) {
            return Err(DomainError::not_found(format!("transfer {}", self.id)));
        }
        Ok(())
    }

    fn handle_create(&self, cmd: &CreateTransfer) -> Result<Vec<TransferEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("transfer already exists"));
        }
        if self.id != cmd.transfer_id {
            return Err(DomainError::invariant("transfer_id mismatch"));
        }
        if cmd.transfer_number.trim().is_empty() {
            return Err(DomainError::validation("transfer number cannot be empty"));
        }
        if cmd.from_outlet_id == cmd.to_outlet_id {
            return Err(DomainError::invalid_reference(
                "source and destination outlet must differ",
            ));
        }
        if cmd.items.is_empty() {
            return Err(DomainError::validation("transfer needs at least one item"));
        }
        let mut seen = HashSet::new();
        for item in &cmd.items {
            if item.quantity <= 0 {
                return Err(DomainError::validation(format!(
                    "requested quantity for product {} must be positive",
                    item.product_id
                )));
            }
            if !seen.insert(item.product_id) {
                return Err(DomainError::validation(format!(
                    "product {} listed more than once",
                    item.product_id
                )));
            }
        }

        Ok(vec![TransferEvent::Created(TransferCreated {
            tenant_id: cmd.tenant_id,
            transfer_id: cmd.transfer_id,
            transfer_number: cmd.transfer_number.trim().to_string(),
            from_outlet_id: cmd.from_outlet_id,
            to_outlet_id: cmd.to_outlet_id,
            items: cmd.items.clone(),
            notes: cmd.notes.clone().filter(|n| !n.trim().is_empty()),
            requested_by: cmd.requested_by,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_process(&self, cmd: &ProcessTransfer) -> Result<Vec<TransferEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found(format!("transfer {}", cmd.transfer_id)));
        }
        self.ensure_tenant(cmd.tenant_id)?;
        if self.id != cmd.transfer_id {
            return Err(DomainError::invariant("transfer_id mismatch"));
        }
        if !cmd.action.allowed_from(self.status) {
            return Err(DomainError::invalid_state(self.status, cmd.action.required_status()));
        }

        let event = match &cmd.action {
            TransferAction::Approve => TransferEvent::Approved(TransferApproved {
                tenant_id: cmd.tenant_id,
                transfer_id: cmd.transfer_id,
                approved_by: cmd.actor,
                occurred_at: cmd.occurred_at,
            }),
            TransferAction::Ship { items } => {
                let lines = resolve_quantities(&self.items, items, |i| i.quantity_requested)?;
                if lines.iter().all(|l| l.quantity == 0) {
                    return Err(DomainError::validation("shipment contains no units"));
                }
                TransferEvent::Shipped(TransferShipped {
                    tenant_id: cmd.tenant_id,
                    transfer_id: cmd.transfer_id,
                    from_outlet_id: self
                        .from_outlet_id
                        .ok_or_else(|| DomainError::invariant("transfer has no source outlet"))?,
                    lines,
                    shipped_by: cmd.actor,
                    occurred_at: cmd.occurred_at,
                })
            }
            TransferAction::Receive { items } => {
                let lines =
                    resolve_quantities(&self.items, items, |i| i.quantity_shipped.unwrap_or(0))?;
                TransferEvent::Received(TransferReceived {
                    tenant_id: cmd.tenant_id,
                    transfer_id: cmd.transfer_id,
                    to_outlet_id: self
                        .to_outlet_id
                        .ok_or_else(|| DomainError::invariant("transfer has no destination outlet"))?,
                    lines,
                    received_by: cmd.actor,
                    occurred_at: cmd.occurred_at,
                })
            }
            TransferAction::Cancel { reason } => TransferEvent::Cancelled(TransferCancelled {
                tenant_id: cmd.tenant_id,
                transfer_id: cmd.transfer_id,
                cancelled_from: self.status,
                reason: reason.clone().filter(|r| !r.trim().is_empty()),
                cancelled_by: cmd.actor,
                occurred_at: cmd.occurred_at,
            }),
        };
        Ok(vec![event])
    }
}
