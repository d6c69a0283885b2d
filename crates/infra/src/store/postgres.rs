//! Postgres-backed stock store.
//!
//! ## Atomicity
//!
//! Every `commit` runs in one transaction. Stock is changed with a conditional
//! update that both row-locks the product and enforces non-negativity:
//!
//! ```sql
//! UPDATE product_stock SET current_stock = current_stock + $delta
//! WHERE ... AND deleted_at IS NULL AND current_stock + $delta >= 0
//! RETURNING current_stock
//! ```
//!
//! so two concurrent sales can never both see the same `stock_before`. The
//! movement row is inserted in the same transaction. Any early return drops the
//! transaction, which rolls it back.
//!
//! ## Error Mapping
//!
//! | PostgreSQL code | StoreError |
//! |---|---|
//! | `40001` serialization failure | `Rejected(Conflict)` |
//! | `40P01` deadlock | `Rejected(Conflict)` |
//! | `23505` unique violation | `Rejected(Conflict)` |
//! | `23503` foreign key violation | `Rejected(NotFound)` |
//! | `22003` numeric value out of range | `Rejected(Validation)` |
//! | other | `Database` |

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder, Row};
use tracing::{debug, instrument};
use uuid::Uuid;

use coopstock_core::{
    DomainError, ExpectedVersion, MovementId, OutletId, ProductId, TenantId, UserId, WarehouseId,
};
use coopstock_inventory::{
    AdjustmentId, MovementDraft, MovementReference, ProductListing, ProductStock, StockAdjustment,
    StockMovement, StockPlacement, StockStream, StockTransfer, TransferId, Warehouse,
    WarehouseStock, WarehouseStockUpdate,
};

use super::r#trait::{
    DocumentWrite, LedgerCommit, StockDocument, StockStore, WarehouseStore, WarehouseUpsert,
};
use super::{check_outlet_draft, replaced_total, warehouse_movement};
use crate::error::StoreError;
use crate::query::{AdjustmentFilter, MovementFilter, Page, Pagination, TransferFilter};

const MOVEMENT_COLUMNS: &str = "sequence, movement_id, tenant_id, outlet_id, warehouse_id, product_id, \
     movement_type, quantity, reference_type, reference_id, stock_before, stock_after, notes, \
     recorded_by, created_at";

const PRODUCT_COLUMNS: &str =
    "tenant_id, outlet_id, product_id, current_stock, min_stock, max_stock, deleted_at, updated_at";

const WAREHOUSE_STOCK_COLUMNS: &str = "warehouse_id, product_id, batch_number, quantity, reserved, \
     available, expiry_date, zone, rack, bin, updated_at";

#[derive(Debug, Clone)]
pub struct PostgresStockStore {
    pool: PgPool,
}

impl PostgresStockStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema migrations.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::database("migrate", e.to_string()))
    }

    async fn load_document(
        &self,
        tenant_id: TenantId,
        document_id: Uuid,
        document_type: &str,
    ) -> Result<Option<JsonValue>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT body FROM stock_documents
            WHERE tenant_id = $1 AND document_id = $2 AND document_type = $3
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(document_id)
        .bind(document_type)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_document", e))?;

        row.map(|r| get::<JsonValue>(&r, "body")).transpose()
    }

    async fn count_and_fetch(
        &self,
        operation: &str,
        mut count: QueryBuilder<'_, Postgres>,
        mut select: QueryBuilder<'_, Postgres>,
    ) -> Result<(u64, Vec<PgRow>), StoreError> {
        let total: i64 = count
            .build()
            .fetch_one(&self.pool)
            .await
            .and_then(|r| r.try_get(0))
            .map_err(|e| map_sqlx_error(operation, e))?;
        let rows = select
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        Ok((total.max(0) as u64, rows))
    }
}

#[async_trait]
impl StockStore for PostgresStockStore {
    #[instrument(skip(self, name), fields(tenant_id = %tenant_id, outlet_id = %outlet_id), err)]
    async fn register_outlet(
        &self,
        tenant_id: TenantId,
        outlet_id: OutletId,
        name: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO outlets (tenant_id, outlet_id, name)
            VALUES ($1, $2, $3)
            ON CONFLICT (tenant_id, outlet_id) DO UPDATE SET name = EXCLUDED.name
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(outlet_id.as_uuid())
        .bind(name)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("register_outlet", e))?;
        Ok(())
    }

    async fn outlet_exists(&self, tenant_id: TenantId, outlet_id: OutletId) -> Result<bool, StoreError> {
        sqlx::query("SELECT EXISTS (SELECT 1 FROM outlets WHERE tenant_id = $1 AND outlet_id = $2)")
            .bind(tenant_id.as_uuid())
            .bind(outlet_id.as_uuid())
            .fetch_one(&self.pool)
            .await
            .and_then(|r| r.try_get(0))
            .map_err(|e| map_sqlx_error("outlet_exists", e))
    }

    #[instrument(
        skip(self, listing),
        fields(tenant_id = %listing.tenant_id, product_id = %listing.product_id),
        err
    )]
    async fn register_product(&self, listing: &ProductListing) -> Result<ProductStock, StoreError> {
        listing.validate()?;
        let sql = format!(
            r#"
            INSERT INTO product_stock (tenant_id, outlet_id, product_id, min_stock, max_stock)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (tenant_id, outlet_id, product_id) DO UPDATE
               SET min_stock = EXCLUDED.min_stock,
                   max_stock = EXCLUDED.max_stock,
                   deleted_at = NULL,
                   updated_at = now()
            RETURNING {PRODUCT_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(listing.tenant_id.as_uuid())
            .bind(listing.outlet_id.as_uuid())
            .bind(listing.product_id.as_uuid())
            .bind(listing.min_stock)
            .bind(listing.max_stock)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("register_product", e))?;
        product_from_row(&row)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, product_id = %product_id), err)]
    async fn soft_delete_product(
        &self,
        tenant_id: TenantId,
        outlet_id: OutletId,
        product_id: ProductId,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE product_stock
               SET deleted_at = COALESCE(deleted_at, now()), updated_at = now()
             WHERE tenant_id = $1 AND outlet_id = $2 AND product_id = $3
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(outlet_id.as_uuid())
        .bind(product_id.as_uuid())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("soft_delete_product", e))?;

        if result.rows_affected() == 0 {
            return Err(DomainError::not_found(format!("product {product_id} in outlet {outlet_id}")).into());
        }
        Ok(())
    }

    async fn load_product(
        &self,
        tenant_id: TenantId,
        outlet_id: OutletId,
        product_id: ProductId,
    ) -> Result<Option<ProductStock>, StoreError> {
        let sql = format!(
            "SELECT {PRODUCT_COLUMNS} FROM product_stock \
             WHERE tenant_id = $1 AND outlet_id = $2 AND product_id = $3"
        );
        let row = sqlx::query(&sql)
            .bind(tenant_id.as_uuid())
            .bind(outlet_id.as_uuid())
            .bind(product_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_product", e))?;
        row.as_ref().map(product_from_row).transpose()
    }

    async fn list_products(
        &self,
        tenant_id: TenantId,
        outlet_id: OutletId,
    ) -> Result<Vec<ProductStock>, StoreError> {
        let sql = format!(
            "SELECT {PRODUCT_COLUMNS} FROM product_stock \
             WHERE tenant_id = $1 AND outlet_id = $2 AND deleted_at IS NULL \
             ORDER BY product_id"
        );
        let rows = sqlx::query(&sql)
            .bind(tenant_id.as_uuid())
            .bind(outlet_id.as_uuid())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_products", e))?;
        rows.iter().map(product_from_row).collect()
    }

    #[instrument(
        skip(self, commit),
        fields(
            tenant_id = %tenant_id,
            movements = commit.movements.len(),
            documents = commit.documents.len()
        ),
        err
    )]
    async fn commit(
        &self,
        tenant_id: TenantId,
        commit: LedgerCommit,
    ) -> Result<Vec<StockMovement>, StoreError> {
        commit.check_tenant(tenant_id)?;
        for draft in &commit.movements {
            check_outlet_draft(draft)?;
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        // Documents first: a stale version aborts before any stock is locked.
        for write in &commit.documents {
            write_document(&mut tx, tenant_id, write).await?;
        }

        let mut applied = Vec::with_capacity(commit.movements.len());
        for draft in commit.movements {
            let stock_after = apply_stock_delta(&mut tx, &draft).await?;
            let stock_before = stock_after - draft.quantity;
            applied.push(insert_movement(&mut tx, draft, stock_before).await?);
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        debug!(applied = applied.len(), "ledger commit applied");
        Ok(applied)
    }

    #[instrument(skip(self, filter), fields(tenant_id = %tenant_id), err)]
    async fn list_movements(
        &self,
        tenant_id: TenantId,
        filter: &MovementFilter,
        pagination: Pagination,
    ) -> Result<Page<StockMovement>, StoreError> {
        let mut count = QueryBuilder::new("SELECT COUNT(*) FROM stock_movements WHERE tenant_id = ");
        count.push_bind(*tenant_id.as_uuid());
        push_movement_filter(&mut count, filter);

        let mut select = QueryBuilder::new(format!(
            "SELECT {MOVEMENT_COLUMNS} FROM stock_movements WHERE tenant_id = "
        ));
        select.push_bind(*tenant_id.as_uuid());
        push_movement_filter(&mut select, filter);
        select
            .push(" ORDER BY sequence DESC LIMIT ")
            .push_bind(pagination.limit as i64)
            .push(" OFFSET ")
            .push_bind(pagination.offset as i64);

        let (total, rows) = self.count_and_fetch("list_movements", count, select).await?;
        let items = rows.iter().map(movement_from_row).collect::<Result<Vec<_>, _>>()?;
        Ok(page(items, total, pagination))
    }

    async fn load_stream(&self, stream: StockStream) -> Result<Vec<StockMovement>, StoreError> {
        let sql = format!(
            "SELECT {MOVEMENT_COLUMNS} FROM stock_movements \
             WHERE tenant_id = $1 AND outlet_id = $2 AND product_id = $3 \
               AND warehouse_id IS NOT DISTINCT FROM $4 \
             ORDER BY sequence ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(stream.tenant_id.as_uuid())
            .bind(stream.outlet_id.as_uuid())
            .bind(stream.product_id.as_uuid())
            .bind(stream.warehouse_id.map(Uuid::from))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_stream", e))?;
        rows.iter().map(movement_from_row).collect()
    }

    async fn load_adjustment(
        &self,
        tenant_id: TenantId,
        id: AdjustmentId,
    ) -> Result<Option<StockAdjustment>, StoreError> {
        self.load_document(tenant_id, id.into(), "adjustment")
            .await?
            .map(decode_body)
            .transpose()
    }

    async fn list_adjustments(
        &self,
        tenant_id: TenantId,
        filter: &AdjustmentFilter,
        pagination: Pagination,
    ) -> Result<Page<StockAdjustment>, StoreError> {
        let build = |head: &str| {
            let mut qb = QueryBuilder::new(head.to_string());
            qb.push_bind(*tenant_id.as_uuid());
            qb.push(" AND document_type = 'adjustment'");
            if let Some(status) = filter.status {
                qb.push(" AND status = ").push_bind(status.as_str());
            }
            if let Some(outlet_id) = filter.outlet_id {
                qb.push(" AND outlet_id = ").push_bind(*outlet_id.as_uuid());
            }
            push_created_range(&mut qb, filter.created_after, filter.created_before);
            qb
        };
        let count = build("SELECT COUNT(*) FROM stock_documents WHERE tenant_id = ");
        let mut select = build("SELECT body FROM stock_documents WHERE tenant_id = ");
        push_document_page(&mut select, pagination);

        let (total, rows) = self.count_and_fetch("list_adjustments", count, select).await?;
        let items = rows
            .iter()
            .map(|r| get::<JsonValue>(r, "body").and_then(decode_body))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(page(items, total, pagination))
    }

    async fn load_transfer(
        &self,
        tenant_id: TenantId,
        id: TransferId,
    ) -> Result<Option<StockTransfer>, StoreError> {
        self.load_document(tenant_id, id.into(), "transfer")
            .await?
            .map(decode_body)
            .transpose()
    }

    async fn list_transfers(
        &self,
        tenant_id: TenantId,
        filter: &TransferFilter,
        pagination: Pagination,
    ) -> Result<Page<StockTransfer>, StoreError> {
        let build = |head: &str| {
            let mut qb = QueryBuilder::new(head.to_string());
            qb.push_bind(*tenant_id.as_uuid());
            qb.push(" AND document_type = 'transfer'");
            if let Some(status) = filter.status {
                qb.push(" AND status = ").push_bind(status.as_str());
            }
            if let Some(from) = filter.from_outlet_id {
                qb.push(" AND outlet_id = ").push_bind(*from.as_uuid());
            }
            if let Some(to) = filter.to_outlet_id {
                qb.push(" AND to_outlet_id = ").push_bind(*to.as_uuid());
            }
            if let Some(either) = filter.outlet_id {
                qb.push(" AND (outlet_id = ")
                    .push_bind(*either.as_uuid())
                    .push(" OR to_outlet_id = ")
                    .push_bind(*either.as_uuid())
                    .push(")");
            }
            push_created_range(&mut qb, filter.created_after, filter.created_before);
            qb
        };
        let count = build("SELECT COUNT(*) FROM stock_documents WHERE tenant_id = ");
        let mut select = build("SELECT body FROM stock_documents WHERE tenant_id = ");
        push_document_page(&mut select, pagination);

        let (total, rows) = self.count_and_fetch("list_transfers", count, select).await?;
        let items = rows
            .iter()
            .map(|r| get::<JsonValue>(r, "body").and_then(decode_body))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(page(items, total, pagination))
    }
}

#[async_trait]
impl WarehouseStore for PostgresStockStore {
    #[instrument(
        skip(self, warehouse),
        fields(tenant_id = %warehouse.tenant_id, code = %warehouse.code),
        err
    )]
    async fn create_warehouse(&self, warehouse: &Warehouse) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO warehouses (tenant_id, warehouse_id, outlet_id, code, name, warehouse_type, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(warehouse.tenant_id.as_uuid())
        .bind(warehouse.id.as_uuid())
        .bind(warehouse.outlet_id.as_uuid())
        .bind(&warehouse.code)
        .bind(&warehouse.name)
        .bind(warehouse.warehouse_type.as_str())
        .bind(warehouse.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match sqlstate(&e).as_deref() {
            Some("23505") => StoreError::Rejected(DomainError::conflict(format!(
                "warehouse code {} already exists",
                warehouse.code
            ))),
            Some("23503") => {
                StoreError::Rejected(DomainError::not_found(format!("outlet {}", warehouse.outlet_id)))
            }
            _ => map_sqlx_error("create_warehouse", e),
        })?;
        Ok(())
    }

    async fn load_warehouse(
        &self,
        tenant_id: TenantId,
        warehouse_id: WarehouseId,
    ) -> Result<Option<Warehouse>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT tenant_id, warehouse_id, outlet_id, code, name, warehouse_type, created_at
            FROM warehouses WHERE tenant_id = $1 AND warehouse_id = $2
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(warehouse_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_warehouse", e))?;
        row.as_ref().map(warehouse_from_row).transpose()
    }

    #[instrument(
        skip(self, warehouse, update),
        fields(
            tenant_id = %warehouse.tenant_id,
            warehouse_id = %warehouse.id,
            product_id = %update.product_id,
            ledgered = ledger_actor.is_some()
        ),
        err
    )]
    async fn upsert_warehouse_stock(
        &self,
        warehouse: &Warehouse,
        update: &WarehouseStockUpdate,
        ledger_actor: Option<UserId>,
    ) -> Result<WarehouseUpsert, StoreError> {
        if update.warehouse_id != warehouse.id {
            return Err(DomainError::invariant("warehouse_id mismatch").into());
        }
        let tenant_id = warehouse.tenant_id;
        let key = update.key();
        let batch = key.batch_number.clone().unwrap_or_default();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        // Serializes writers per warehouse so the product total read below is stable.
        let locked = sqlx::query(
            "SELECT 1 FROM warehouses WHERE tenant_id = $1 AND warehouse_id = $2 FOR UPDATE",
        )
        .bind(tenant_id.as_uuid())
        .bind(warehouse.id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("lock_warehouse", e))?;
        if locked.is_none() {
            return Err(DomainError::not_found(format!("warehouse {}", warehouse.id)).into());
        }

        let sql = format!(
            "SELECT {WAREHOUSE_STOCK_COLUMNS} FROM warehouse_stock \
             WHERE tenant_id = $1 AND warehouse_id = $2 AND product_id = $3 AND batch_number = $4"
        );
        let previous = sqlx::query(&sql)
            .bind(tenant_id.as_uuid())
            .bind(warehouse.id.as_uuid())
            .bind(update.product_id.as_uuid())
            .bind(&batch)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("load_warehouse_stock", e))?
            .as_ref()
            .map(warehouse_stock_from_row)
            .transpose()?;

        let row = update.apply(previous.as_ref(), Utc::now())?;

        let total_before: i64 = sqlx::query(
            r#"
            SELECT COALESCE(SUM(quantity), 0)::BIGINT FROM warehouse_stock
            WHERE tenant_id = $1 AND warehouse_id = $2 AND product_id = $3
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(warehouse.id.as_uuid())
        .bind(update.product_id.as_uuid())
        .fetch_one(&mut *tx)
        .await
        .and_then(|r| r.try_get(0))
        .map_err(|e| map_sqlx_error("warehouse_total", e))?;
        let total_after = replaced_total(total_before, previous.as_ref().map_or(0, |p| p.quantity), row.quantity)?;

        sqlx::query(
            r#"
            INSERT INTO warehouse_stock (
                tenant_id, warehouse_id, product_id, batch_number, quantity, reserved, available,
                expiry_date, zone, rack, bin, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (tenant_id, warehouse_id, product_id, batch_number) DO UPDATE
               SET quantity = EXCLUDED.quantity,
                   reserved = EXCLUDED.reserved,
                   available = EXCLUDED.available,
                   expiry_date = EXCLUDED.expiry_date,
                   zone = EXCLUDED.zone,
                   rack = EXCLUDED.rack,
                   bin = EXCLUDED.bin,
                   updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(row.warehouse_id.as_uuid())
        .bind(row.product_id.as_uuid())
        .bind(&batch)
        .bind(row.quantity)
        .bind(row.reserved)
        .bind(row.available)
        .bind(row.expiry_date)
        .bind(&row.placement.zone)
        .bind(&row.placement.rack)
        .bind(&row.placement.bin)
        .bind(row.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("upsert_warehouse_stock", e))?;

        let movement = match ledger_actor
            .and_then(|actor| warehouse_movement(warehouse, update.product_id, total_before, total_after, actor))
        {
            Some(draft) => Some(insert_movement(&mut tx, draft, total_before).await?),
            None => None,
        };

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Ok(WarehouseUpsert {
            previous,
            row,
            movement,
        })
    }

    async fn list_warehouse_stock(
        &self,
        tenant_id: TenantId,
        warehouse_id: WarehouseId,
    ) -> Result<Vec<WarehouseStock>, StoreError> {
        let sql = format!(
            "SELECT {WAREHOUSE_STOCK_COLUMNS} FROM warehouse_stock \
             WHERE tenant_id = $1 AND warehouse_id = $2 \
             ORDER BY product_id, batch_number"
        );
        let rows = sqlx::query(&sql)
            .bind(tenant_id.as_uuid())
            .bind(warehouse_id.as_uuid())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_warehouse_stock", e))?;
        rows.iter().map(warehouse_stock_from_row).collect()
    }

    async fn warehouse_available(
        &self,
        tenant_id: TenantId,
        outlet_id: OutletId,
        product_id: ProductId,
    ) -> Result<i64, StoreError> {
        sqlx::query(
            r#"
            SELECT COALESCE(SUM(ws.available), 0)::BIGINT
            FROM warehouse_stock ws
            JOIN warehouses w ON w.tenant_id = ws.tenant_id AND w.warehouse_id = ws.warehouse_id
            WHERE ws.tenant_id = $1 AND w.outlet_id = $2 AND ws.product_id = $3
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(outlet_id.as_uuid())
        .bind(product_id.as_uuid())
        .fetch_one(&self.pool)
        .await
        .and_then(|r| r.try_get(0))
        .map_err(|e| map_sqlx_error("warehouse_available", e))
    }
}

async fn write_document(
    conn: &mut PgConnection,
    tenant_id: TenantId,
    write: &DocumentWrite,
) -> Result<(), StoreError> {
    let doc = &write.document;
    let body = document_body(doc)?;
    let version = doc.version() as i64;

    match write.expected {
        ExpectedVersion::New => {
            let outlet_id = doc
                .outlet_id()
                .ok_or_else(|| DomainError::invariant("document has no outlet"))?;
            let created_at = doc.created_at().unwrap_or_else(Utc::now);
            sqlx::query(
                r#"
                INSERT INTO stock_documents (
                    tenant_id, document_id, document_type, document_number,
                    status, outlet_id, to_outlet_id, version, body, created_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(tenant_id.as_uuid())
            .bind(doc.id())
            .bind(doc.document_type())
            .bind(doc.number())
            .bind(doc.status())
            .bind(outlet_id.as_uuid())
            .bind(doc.to_outlet_id().map(Uuid::from))
            .bind(version)
            .bind(&body)
            .bind(created_at)
            .execute(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("insert_document", e))?;
        }
        ExpectedVersion::Exact(expected) => {
            let result = sqlx::query(
                r#"
                UPDATE stock_documents
                   SET status = $3, version = $4, body = $5, updated_at = now()
                 WHERE tenant_id = $1 AND document_id = $2 AND version = $6
                "#,
            )
            .bind(tenant_id.as_uuid())
            .bind(doc.id())
            .bind(doc.status())
            .bind(version)
            .bind(&body)
            .bind(expected as i64)
            .execute(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("update_document", e))?;

            if result.rows_affected() == 0 {
                return Err(DomainError::conflict(format!(
                    "{} {} is no longer at version {expected}",
                    doc.document_type(),
                    doc.id()
                ))
                .into());
            }
        }
    }
    Ok(())
}

/// Apply one draft's delta to the product row; returns the new stock.
async fn apply_stock_delta(conn: &mut PgConnection, draft: &MovementDraft) -> Result<i64, StoreError> {
    let updated = sqlx::query(
        r#"
        UPDATE product_stock
           SET current_stock = current_stock + $4, updated_at = now()
         WHERE tenant_id = $1 AND outlet_id = $2 AND product_id = $3
           AND deleted_at IS NULL
           AND current_stock + $4 >= 0
        RETURNING current_stock
        "#,
    )
    .bind(draft.tenant_id.as_uuid())
    .bind(draft.outlet_id.as_uuid())
    .bind(draft.product_id.as_uuid())
    .bind(draft.quantity)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("apply_stock_delta", e))?;

    if let Some(row) = updated {
        return get(&row, "current_stock");
    }

    // Tell a missing listing apart from a stock shortfall.
    let current = sqlx::query(
        r#"
        SELECT current_stock, deleted_at FROM product_stock
        WHERE tenant_id = $1 AND outlet_id = $2 AND product_id = $3
        "#,
    )
    .bind(draft.tenant_id.as_uuid())
    .bind(draft.outlet_id.as_uuid())
    .bind(draft.product_id.as_uuid())
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("explain_stock_delta", e))?;

    let not_found = || {
        StoreError::Rejected(DomainError::not_found(format!(
            "product {} in outlet {}",
            draft.product_id, draft.outlet_id
        )))
    };
    let Some(row) = current else {
        return Err(not_found());
    };
    if get::<Option<DateTime<Utc>>>(&row, "deleted_at")?.is_some() {
        return Err(not_found());
    }
    let stock: i64 = get(&row, "current_stock")?;
    Err(match draft.resulting_stock(stock) {
        Err(rejection) => rejection.into(),
        // The row changed between the two statements.
        Ok(_) => DomainError::conflict("stock changed concurrently").into(),
    })
}

async fn insert_movement(
    conn: &mut PgConnection,
    draft: MovementDraft,
    stock_before: i64,
) -> Result<StockMovement, StoreError> {
    let id = MovementId::new();
    let stock_after = draft.resulting_stock(stock_before)?;
    let row = sqlx::query(
        r#"
        INSERT INTO stock_movements (
            movement_id, tenant_id, outlet_id, warehouse_id, product_id, movement_type, quantity,
            reference_type, reference_id, stock_before, stock_after, notes, recorded_by
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        RETURNING sequence, created_at
        "#,
    )
    .bind(id.as_uuid())
    .bind(draft.tenant_id.as_uuid())
    .bind(draft.outlet_id.as_uuid())
    .bind(draft.warehouse_id.map(Uuid::from))
    .bind(draft.product_id.as_uuid())
    .bind(draft.movement_type.as_str())
    .bind(draft.quantity)
    .bind(draft.reference.map(|r| r.reference_type.as_str()))
    .bind(draft.reference.map(|r| r.reference_id))
    .bind(stock_before)
    .bind(stock_after)
    .bind(&draft.notes)
    .bind(draft.recorded_by.as_uuid())
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("insert_movement", e))?;

    let sequence: i64 = get(&row, "sequence")?;
    let created_at: DateTime<Utc> = get(&row, "created_at")?;
    Ok(draft.apply(id, sequence as u64, stock_before, created_at)?)
}

fn push_movement_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &MovementFilter) {
    if let Some(p) = filter.product_id {
        qb.push(" AND product_id = ").push_bind(*p.as_uuid());
    }
    if let Some(o) = filter.outlet_id {
        qb.push(" AND outlet_id = ").push_bind(*o.as_uuid());
    }
    if let Some(w) = filter.warehouse_id {
        qb.push(" AND warehouse_id = ").push_bind(*w.as_uuid());
    }
    if let Some(t) = filter.movement_type {
        qb.push(" AND movement_type = ").push_bind(t.as_str());
    }
    if let Some(r) = filter.reference {
        qb.push(" AND reference_type = ")
            .push_bind(r.reference_type.as_str())
            .push(" AND reference_id = ")
            .push_bind(r.reference_id);
    }
    push_created_range(qb, filter.created_after, filter.created_before);
}

fn push_created_range(
    qb: &mut QueryBuilder<'_, Postgres>,
    after: Option<DateTime<Utc>>,
    before: Option<DateTime<Utc>>,
) {
    if let Some(t) = after {
        qb.push(" AND created_at >= ").push_bind(t);
    }
    if let Some(t) = before {
        qb.push(" AND created_at < ").push_bind(t);
    }
}

fn push_document_page(qb: &mut QueryBuilder<'_, Postgres>, pagination: Pagination) {
    qb.push(" ORDER BY created_at DESC, document_id DESC LIMIT ")
        .push_bind(pagination.limit as i64)
        .push(" OFFSET ")
        .push_bind(pagination.offset as i64);
}

fn page<T>(items: Vec<T>, total: u64, pagination: Pagination) -> Page<T> {
    let has_more = (pagination.offset as u64 + items.len() as u64) < total;
    Page {
        items,
        total,
        pagination,
        has_more,
    }
}

fn document_body(doc: &StockDocument) -> Result<JsonValue, StoreError> {
    let body = match doc {
        StockDocument::Adjustment(a) => serde_json::to_value(a),
        StockDocument::Transfer(t) => serde_json::to_value(t),
    };
    body.map_err(|e| StoreError::Corrupt(format!("document serialization failed: {e}")))
}

fn decode_body<T: serde::de::DeserializeOwned>(body: JsonValue) -> Result<T, StoreError> {
    serde_json::from_value(body).map_err(|e| StoreError::Corrupt(format!("document body: {e}")))
}

// Row decoding

fn get<'r, T>(row: &'r PgRow, column: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(column)
        .map_err(|e| StoreError::Corrupt(format!("column {column}: {e}")))
}

fn parse<T>(raw: &str, what: &str) -> Result<T, StoreError>
where
    T: std::str::FromStr,
{
    raw.parse()
        .map_err(|_| StoreError::Corrupt(format!("unknown {what}: {raw}")))
}

fn movement_from_row(row: &PgRow) -> Result<StockMovement, StoreError> {
    let reference_type: Option<String> = get(row, "reference_type")?;
    let reference_id: Option<Uuid> = get(row, "reference_id")?;
    let reference = match (reference_type, reference_id) {
        (Some(t), Some(id)) => Some(MovementReference::new(parse(&t, "reference type")?, id)),
        _ => None,
    };
    let movement_type: String = get(row, "movement_type")?;
    let sequence: i64 = get(row, "sequence")?;

    Ok(StockMovement {
        id: MovementId::from_uuid(get(row, "movement_id")?),
        tenant_id: TenantId::from_uuid(get(row, "tenant_id")?),
        outlet_id: OutletId::from_uuid(get(row, "outlet_id")?),
        warehouse_id: get::<Option<Uuid>>(row, "warehouse_id")?.map(WarehouseId::from_uuid),
        product_id: ProductId::from_uuid(get(row, "product_id")?),
        movement_type: parse(&movement_type, "movement type")?,
        quantity: get(row, "quantity")?,
        reference,
        stock_before: get(row, "stock_before")?,
        stock_after: get(row, "stock_after")?,
        notes: get(row, "notes")?,
        recorded_by: UserId::from_uuid(get(row, "recorded_by")?),
        sequence: sequence as u64,
        created_at: get(row, "created_at")?,
    })
}

fn product_from_row(row: &PgRow) -> Result<ProductStock, StoreError> {
    Ok(ProductStock {
        tenant_id: TenantId::from_uuid(get(row, "tenant_id")?),
        outlet_id: OutletId::from_uuid(get(row, "outlet_id")?),
        product_id: ProductId::from_uuid(get(row, "product_id")?),
        current_stock: get(row, "current_stock")?,
        min_stock: get(row, "min_stock")?,
        max_stock: get(row, "max_stock")?,
        deleted_at: get(row, "deleted_at")?,
        updated_at: get(row, "updated_at")?,
    })
}

fn warehouse_from_row(row: &PgRow) -> Result<Warehouse, StoreError> {
    let warehouse_type: String = get(row, "warehouse_type")?;
    Ok(Warehouse {
        id: WarehouseId::from_uuid(get(row, "warehouse_id")?),
        tenant_id: TenantId::from_uuid(get(row, "tenant_id")?),
        outlet_id: OutletId::from_uuid(get(row, "outlet_id")?),
        code: get(row, "code")?,
        name: get(row, "name")?,
        warehouse_type: parse(&warehouse_type, "warehouse type")?,
        created_at: get(row, "created_at")?,
    })
}

fn warehouse_stock_from_row(row: &PgRow) -> Result<WarehouseStock, StoreError> {
    let batch: String = get(row, "batch_number")?;
    Ok(WarehouseStock {
        warehouse_id: WarehouseId::from_uuid(get(row, "warehouse_id")?),
        product_id: ProductId::from_uuid(get(row, "product_id")?),
        batch_number: Some(batch).filter(|b| !b.is_empty()),
        quantity: get(row, "quantity")?,
        reserved: get(row, "reserved")?,
        available: get(row, "available")?,
        expiry_date: get::<Option<NaiveDate>>(row, "expiry_date")?,
        placement: StockPlacement {
            zone: get(row, "zone")?,
            rack: get(row, "rack")?,
            bin: get(row, "bin")?,
        },
        updated_at: get(row, "updated_at")?,
    })
}

// Error mapping

fn sqlstate(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().map(|c| c.into_owned()),
        _ => None,
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match sqlstate(&err).as_deref() {
        Some("40001") | Some("40P01") => StoreError::Rejected(DomainError::conflict(format!(
            "transaction aborted in {operation}, retry"
        ))),
        Some("23505") => StoreError::Rejected(DomainError::conflict(format!(
            "concurrent write detected in {operation}"
        ))),
        Some("23503") => StoreError::Rejected(DomainError::not_found(format!(
            "{operation}: referenced record does not exist"
        ))),
        Some("22003") => StoreError::Rejected(DomainError::validation(format!(
            "{operation}: numeric value out of range"
        ))),
        _ => StoreError::database(operation, err.to_string()),
    }
}

/// These run against a live database and are skipped unless `DATABASE_URL`
/// is set: `cargo test -p coopstock-infra -- --ignored`.
#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::DatabaseConfig;
    use coopstock_core::AggregateId;
    use coopstock_events::execute;
    use coopstock_inventory::{
        AdjustmentCommand, AdjustmentItem, CreateAdjustment, MovementType, replay,
    };

    async fn store() -> Option<PostgresStockStore> {
        let config = DatabaseConfig::from_env().ok()?;
        let store = PostgresStockStore::new(config.connect().await.unwrap());
        store.migrate().await.unwrap();
        Some(store)
    }

    async fn listed(store: &PostgresStockStore, stock: i64) -> (TenantId, OutletId, ProductId) {
        let (tenant_id, outlet_id, product_id) = (TenantId::new(), OutletId::new(), ProductId::new());
        store.register_outlet(tenant_id, outlet_id, "Main").await.unwrap();
        store
            .register_product(&ProductListing {
                tenant_id,
                outlet_id,
                product_id,
                min_stock: 0,
                max_stock: None,
            })
            .await
            .unwrap();
        if stock > 0 {
            store
                .commit(
                    tenant_id,
                    LedgerCommit::movement(draft(tenant_id, outlet_id, product_id, MovementType::Purchase, stock)),
                )
                .await
                .unwrap();
        }
        (tenant_id, outlet_id, product_id)
    }

    fn draft(
        tenant_id: TenantId,
        outlet_id: OutletId,
        product_id: ProductId,
        movement_type: MovementType,
        quantity: i64,
    ) -> MovementDraft {
        MovementDraft::new(tenant_id, outlet_id, product_id, movement_type, quantity, UserId::new())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    #[ignore = "needs DATABASE_URL"]
    async fn conditional_update_never_oversells() {
        let Some(store) = store().await else { return };
        let store = Arc::new(store);
        let (tenant_id, outlet_id, product_id) = listed(&store, 50).await;

        let mut tasks = Vec::with_capacity(100);
        for _ in 0..100 {
            let store = Arc::clone(&store);
            tasks.push(tokio::spawn(async move {
                store
                    .commit(
                        tenant_id,
                        LedgerCommit::movement(draft(tenant_id, outlet_id, product_id, MovementType::Sale, -1)),
                    )
                    .await
            }));
        }
        let (mut ok, mut short) = (0, 0);
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => ok += 1,
                Err(StoreError::Rejected(DomainError::InsufficientStock { .. })) => short += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!((ok, short), (50, 50));

        let row = store.load_product(tenant_id, outlet_id, product_id).await.unwrap().unwrap();
        assert_eq!(row.current_stock, 0);
        let stream = StockStream {
            tenant_id,
            outlet_id,
            warehouse_id: None,
            product_id,
        };
        let movements = store.load_stream(stream).await.unwrap();
        assert_eq!(movements.len(), 51);
        assert_eq!(replay(&movements).unwrap().final_stock, 0);
    }

    #[tokio::test]
    #[ignore = "needs DATABASE_URL"]
    async fn missing_listing_and_shortfall_are_told_apart() {
        let Some(store) = store().await else { return };
        let (tenant_id, outlet_id, product_id) = listed(&store, 2).await;

        let unlisted = store
            .commit(
                tenant_id,
                LedgerCommit::movement(draft(tenant_id, outlet_id, ProductId::new(), MovementType::Sale, -1)),
            )
            .await
            .unwrap_err();
        assert!(matches!(unlisted, StoreError::Rejected(DomainError::NotFound(_))));

        let short = store
            .commit(
                tenant_id,
                LedgerCommit::movement(draft(tenant_id, outlet_id, product_id, MovementType::Sale, -3)),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            short,
            StoreError::Rejected(DomainError::InsufficientStock { requested: 3, available: 2, .. })
        ));
        let row = store.load_product(tenant_id, outlet_id, product_id).await.unwrap().unwrap();
        assert_eq!(row.current_stock, 2);
    }

    #[tokio::test]
    #[ignore = "needs DATABASE_URL"]
    async fn duplicate_and_stale_document_writes_conflict() {
        let Some(store) = store().await else { return };
        let (tenant_id, outlet_id, product_id) = listed(&store, 0).await;

        let id = AdjustmentId::new(AggregateId::new());
        let mut adj = StockAdjustment::empty(id);
        execute(
            &mut adj,
            &AdjustmentCommand::Create(CreateAdjustment {
                tenant_id,
                adjustment_id: id,
                outlet_id,
                adjustment_number: format!("ADJ-{id}"),
                reason: "count".into(),
                items: vec![AdjustmentItem {
                    product_id,
                    quantity: 1,
                    movement_type: MovementType::AdjustmentIn,
                    notes: None,
                }],
                requested_by: UserId::new(),
                occurred_at: Utc::now(),
            }),
        )
        .unwrap();
        let doc = StockDocument::Adjustment(adj);

        store
            .commit(tenant_id, LedgerCommit::document(doc.clone(), ExpectedVersion::New))
            .await
            .unwrap();
        let duplicate = store
            .commit(tenant_id, LedgerCommit::document(doc.clone(), ExpectedVersion::New))
            .await
            .unwrap_err();
        assert!(duplicate.is_conflict(), "{duplicate}");

        let stale = store
            .commit(tenant_id, LedgerCommit::document(doc, ExpectedVersion::Exact(7)))
            .await
            .unwrap_err();
        assert!(stale.is_conflict(), "{stale}");
    }
}
