//! Infrastructure layer: persistence, the stock engine services, retry,
//! configuration and audit publishing.
//!
//! - `store`: `StockStore`/`WarehouseStore` with in-memory and Postgres backends
//! - `engine`: `StockEngine` and its ledger, adjustment, transfer and warehouse services
//! - `retry`: bounded backoff around `Conflict`
//! - `config`: `EngineConfig`/`DatabaseConfig` from the environment
//! - `audit`: audit envelopes onto an `EventBus`

pub mod audit;
pub mod config;
pub mod engine;
pub mod error;
pub mod query;
pub mod retry;
pub mod store;

pub use audit::{AuditEnvelope, AuditPublisher};
pub use config::{ConfigError, DatabaseConfig, EngineConfig, WarehouseMode};
pub use engine::{
    AdjustmentService, MovementLedger, ReplayReport, StockEngine, TransferService, WarehouseService,
};
pub use error::{EngineError, EngineResult, StoreError};
pub use query::{AdjustmentFilter, MovementFilter, Page, Pagination, TransferFilter};
pub use retry::{BackoffStrategy, RetryPolicy, with_retry};
pub use store::{
    InMemoryStockStore, LedgerCommit, PostgresStockStore, StockDocument, StockStore,
    WarehouseStore,
};

#[cfg(test)]
mod integration_tests;
