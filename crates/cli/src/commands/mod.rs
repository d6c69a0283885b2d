pub mod migrate;
pub mod reconcile;

use std::sync::Arc;

use coopstock_events::InMemoryEventBus;
use coopstock_infra::{AuditEnvelope, DatabaseConfig, EngineConfig, PostgresStockStore, StockEngine};

pub type CliEngine = StockEngine<PostgresStockStore, Arc<InMemoryEventBus<AuditEnvelope>>>;

pub async fn connect() -> anyhow::Result<PostgresStockStore> {
    let config = DatabaseConfig::from_env()?;
    tracing::info!(max_connections = config.max_connections, "connecting to database");
    let pool = config.connect().await?;
    Ok(PostgresStockStore::new(pool))
}

/// Engine over Postgres. The CLI only reads, so audit records go to a local
/// bus nobody subscribes to.
pub async fn engine() -> anyhow::Result<CliEngine> {
    let store = connect().await?;
    Ok(StockEngine::new(
        Arc::new(store),
        Arc::new(InMemoryEventBus::new()),
        EngineConfig::from_env(),
    ))
}
