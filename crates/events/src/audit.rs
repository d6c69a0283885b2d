//! Audit events emitted by the stock engine.
//!
//! The audit store is an external collaborator; this crate only defines the
//! record shape and its event metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use coopstock_core::{TenantId, UserId};

use crate::Event;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    MovementRecorded,
    AdjustmentCreated,
    AdjustmentApproved,
    AdjustmentRejected,
    TransferCreated,
    TransferApproved,
    TransferShipped,
    TransferReceived,
    TransferCancelled,
    WarehouseCreated,
    WarehouseStockUpserted,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditAction::MovementRecorded => "stock.movement.recorded",
            AuditAction::AdjustmentCreated => "stock.adjustment.created",
            AuditAction::AdjustmentApproved => "stock.adjustment.approved",
            AuditAction::AdjustmentRejected => "stock.adjustment.rejected",
            AuditAction::TransferCreated => "stock.transfer.created",
            AuditAction::TransferApproved => "stock.transfer.approved",
            AuditAction::TransferShipped => "stock.transfer.shipped",
            AuditAction::TransferReceived => "stock.transfer.received",
            AuditAction::TransferCancelled => "stock.transfer.cancelled",
            AuditAction::WarehouseCreated => "stock.warehouse.created",
            AuditAction::WarehouseStockUpserted => "stock.warehouse.stock_upserted",
        }
    }
}

impl core::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured audit record: action, resource, before/after snapshots, actor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub tenant_id: TenantId,
    pub actor: UserId,
    pub action: AuditAction,
    pub resource_type: String,
    pub resource_id: Uuid,
    pub before: Option<JsonValue>,
    pub after: Option<JsonValue>,
    pub occurred_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        tenant_id: TenantId,
        actor: UserId,
        action: AuditAction,
        resource_type: impl Into<String>,
        resource_id: Uuid,
    ) -> Self {
        Self {
            tenant_id,
            actor,
            action,
            resource_type: resource_type.into(),
            resource_id,
            before: None,
            after: None,
            occurred_at: Utc::now(),
        }
    }

    /// Attach a before-snapshot. Serialization failures drop the snapshot.
    pub fn with_before<T: Serialize>(mut self, before: &T) -> Self {
        self.before = serde_json::to_value(before).ok();
        self
    }

    /// Attach an after-snapshot. Serialization failures drop the snapshot.
    pub fn with_after<T: Serialize>(mut self, after: &T) -> Self {
        self.after = serde_json::to_value(after).ok();
        self
    }
}

impl Event for AuditEvent {
    fn event_type(&self) -> &'static str {
        self.action.as_str()
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}
