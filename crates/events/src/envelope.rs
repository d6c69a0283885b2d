use serde::{Deserialize, Serialize};
use uuid::Uuid;

use coopstock_core::TenantId;

use crate::Event;

/// Envelope for an event, containing multi-tenant + stream metadata.
///
/// Notes:
/// - **Multi-tenancy** is enforced here via `tenant_id`.
/// - `stream_id`/`stream_type` name the resource the event is about (a movement,
///   an adjustment, a transfer, a warehouse).
/// - `sequence_number` is the resource's position after the event: the document
///   version for adjustments/transfers, the ledger sequence for movements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    event_id: Uuid,
    tenant_id: TenantId,

    stream_id: Uuid,
    stream_type: String,

    sequence_number: u64,

    event_type: String,
    payload: E,
}

impl<E> EventEnvelope<E> {
    pub fn new(
        event_id: Uuid,
        tenant_id: TenantId,
        stream_id: Uuid,
        stream_type: impl Into<String>,
        sequence_number: u64,
        payload: E,
    ) -> Self
    where
        E: Event,
    {
        let event_type = payload.event_type().to_string();
        Self {
            event_id,
            tenant_id,
            stream_id,
            stream_type: stream_type.into(),
            sequence_number,
            event_type,
            payload,
        }
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn stream_id(&self) -> Uuid {
        self.stream_id
    }

    pub fn stream_type(&self) -> &str {
        &self.stream_type
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }
}
