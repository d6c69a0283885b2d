//! Audit emission after committed state transitions.
//!
//! Publishing happens after the store commit returned. A failed publish is
//! logged and swallowed: stock state is already durable and the audit consumer
//! is at-least-once anyway.

use tracing::warn;
use uuid::Uuid;

use coopstock_events::{AuditEvent, EventBus, EventEnvelope};

pub type AuditEnvelope = EventEnvelope<AuditEvent>;

#[derive(Debug, Clone)]
pub struct AuditPublisher<B> {
    bus: B,
}

impl<B> AuditPublisher<B>
where
    B: EventBus<AuditEnvelope>,
{
    pub fn new(bus: B) -> Self {
        Self { bus }
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    /// Wrap and publish one audit record. `sequence` is the resource's position
    /// after the transition (document version or ledger sequence).
    pub fn emit(&self, event: AuditEvent, sequence: u64) {
        let action = event.action;
        let resource_id = event.resource_id;
        let stream_type = event.resource_type.clone();
        let envelope = EventEnvelope::new(
            Uuid::now_v7(),
            event.tenant_id,
            resource_id,
            stream_type,
            sequence,
            event,
        );
        if let Err(err) = self.bus.publish(envelope) {
            warn!(
                action = %action,
                resource_id = %resource_id,
                error = ?err,
                "audit publish failed"
            );
        }
    }

    pub fn emit_all(&self, events: impl IntoIterator<Item = (AuditEvent, u64)>) {
        for (event, sequence) in events {
            self.emit(event, sequence);
        }
    }
}
