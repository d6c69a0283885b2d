//! Ledger reconciliation and stock inspection.

use anyhow::bail;
use serde_json::json;

use coopstock_core::{OutletId, ProductId, TenantId};

pub async fn run(tenant_id: TenantId, outlet_id: OutletId, fail_on_drift: bool) -> anyhow::Result<()> {
    let engine = super::engine().await?;
    let reports = engine.ledger().reconcile(tenant_id, outlet_id).await?;

    let mut drifted = 0usize;
    for report in &reports {
        let line = match &report.result {
            Ok(outcome) => json!({
                "product_id": report.stream.product_id.to_string(),
                "cached_stock": report.cached_stock,
                "replayed_stock": outcome.final_stock,
                "movements": outcome.movements,
                "drift": report.drift(),
            }),
            Err(broken) => json!({
                "product_id": report.stream.product_id.to_string(),
                "cached_stock": report.cached_stock,
                "error": broken.to_string(),
            }),
        };
        if !report.is_consistent() {
            drifted += 1;
            tracing::warn!(product_id = %report.stream.product_id, "ledger drift");
        }
        println!("{line}");
    }

    tracing::info!(products = reports.len(), drifted, "reconciliation finished");
    if fail_on_drift && drifted > 0 {
        bail!("{drifted} of {} products drifted from their ledger", reports.len());
    }
    Ok(())
}

pub async fn stock_level(tenant_id: TenantId, outlet_id: OutletId, product_id: ProductId) -> anyhow::Result<()> {
    let engine = super::engine().await?;
    let level = engine.ledger().stock_level(tenant_id, outlet_id, product_id).await?;
    println!("{}", serde_json::to_string_pretty(&level)?);
    Ok(())
}
