//! Event mechanics shared by the stock engine.
//!
//! - `Event`: metadata contract for domain events (type, schema version, time)
//! - `EventEnvelope`: tenant/stream metadata around a payload
//! - `EventBus`: publish/subscribe transport (in-memory implementation included)
//! - `AuditEvent`: the structured record emitted on every stock state transition

pub mod audit;
pub mod bus;
pub mod envelope;
pub mod event;
pub mod handler;
pub mod in_memory_bus;

pub use audit::{AuditAction, AuditEvent};
pub use bus::{EventBus, Subscription};
pub use envelope::EventEnvelope;
pub use event::Event;
pub use handler::execute;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
