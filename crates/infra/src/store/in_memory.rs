use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use coopstock_core::{
    DomainError, MovementId, OutletId, ProductId, TenantId, UserId, WarehouseId,
};
use coopstock_inventory::{
    AdjustmentId, MovementDraft, ProductListing, ProductStock, StockAdjustment, StockMovement,
    StockStream, StockTransfer, TransferId, Warehouse, WarehouseStock, WarehouseStockKey,
    WarehouseStockUpdate,
};

use super::r#trait::{LedgerCommit, StockDocument, StockStore, WarehouseStore, WarehouseUpsert};
use super::{check_outlet_draft, replaced_total, total_out_of_range, warehouse_movement};
use crate::error::StoreError;
use crate::query::{AdjustmentFilter, MovementFilter, Page, Pagination, TransferFilter};

type ProductKey = (TenantId, OutletId, ProductId);

#[derive(Debug, Default)]
struct State {
    outlets: HashMap<(TenantId, OutletId), String>,
    products: HashMap<ProductKey, ProductStock>,
    movements: Vec<StockMovement>,
    last_sequence: u64,
    documents: HashMap<(TenantId, Uuid), StockDocument>,
    warehouses: HashMap<(TenantId, WarehouseId), Warehouse>,
    warehouse_stock: HashMap<(TenantId, WarehouseStockKey), WarehouseStock>,
}

impl State {
    fn warehouse_total(
        &self,
        tenant_id: TenantId,
        warehouse_id: WarehouseId,
        product_id: ProductId,
    ) -> Result<i64, StoreError> {
        self.warehouse_stock
            .iter()
            .filter(|((t, k), _)| *t == tenant_id && k.warehouse_id == warehouse_id && k.product_id == product_id)
            .try_fold(0i64, |total, (_, row)| total.checked_add(row.quantity))
            .ok_or_else(total_out_of_range)
    }

    fn append_movement(&mut self, draft: MovementDraft, stock_before: i64) -> Result<StockMovement, StoreError> {
        let movement = draft.apply(MovementId::new(), self.last_sequence + 1, stock_before, Utc::now())?;
        self.last_sequence = movement.sequence;
        self.movements.push(movement.clone());
        Ok(movement)
    }
}

/// In-memory stock store.
///
/// Intended for tests/dev. Each commit is validated and applied under one
/// write lock, which makes it atomic and serializes all writers.
#[derive(Debug, Default)]
pub struct InMemoryStockStore {
    state: RwLock<State>,
}

impl InMemoryStockStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, State>, StoreError> {
        self.state.read().map_err(|_| StoreError::Poisoned)
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, State>, StoreError> {
        self.state.write().map_err(|_| StoreError::Poisoned)
    }

    fn documents_of<T>(
        &self,
        tenant_id: TenantId,
        pick: impl Fn(&StockDocument) -> Option<&T>,
    ) -> Result<Vec<T>, StoreError>
    where
        T: Clone,
    {
        let state = self.read()?;
        Ok(state
            .documents
            .iter()
            .filter(|((t, _), _)| *t == tenant_id)
            .filter_map(|(_, doc)| pick(doc).cloned())
            .collect())
    }
}

#[async_trait]
impl StockStore for InMemoryStockStore {
    async fn register_outlet(
        &self,
        tenant_id: TenantId,
        outlet_id: OutletId,
        name: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.write()?;
        state.outlets.insert((tenant_id, outlet_id), name.to_string());
        Ok(())
    }

    async fn outlet_exists(&self, tenant_id: TenantId, outlet_id: OutletId) -> Result<bool, StoreError> {
        Ok(self.read()?.outlets.contains_key(&(tenant_id, outlet_id)))
    }

    async fn register_product(&self, listing: &ProductListing) -> Result<ProductStock, StoreError> {
        listing.validate()?;
        let mut state = self.write()?;
        if !state.outlets.contains_key(&(listing.tenant_id, listing.outlet_id)) {
            return Err(DomainError::not_found(format!("outlet {}", listing.outlet_id)).into());
        }
        let now = Utc::now();
        let key = (listing.tenant_id, listing.outlet_id, listing.product_id);
        let row = state
            .products
            .entry(key)
            .and_modify(|p| {
                p.min_stock = listing.min_stock;
                p.max_stock = listing.max_stock;
                p.deleted_at = None;
                p.updated_at = now;
            })
            .or_insert_with(|| ProductStock::from_listing(listing, now));
        Ok(row.clone())
    }

    async fn soft_delete_product(
        &self,
        tenant_id: TenantId,
        outlet_id: OutletId,
        product_id: ProductId,
    ) -> Result<(), StoreError> {
        let mut state = self.write()?;
        let row = state
            .products
            .get_mut(&(tenant_id, outlet_id, product_id))
            .ok_or_else(|| DomainError::not_found(format!("product {product_id} in outlet {outlet_id}")))?;
        let now = Utc::now();
        row.deleted_at.get_or_insert(now);
        row.updated_at = now;
        Ok(())
    }

    async fn load_product(
        &self,
        tenant_id: TenantId,
        outlet_id: OutletId,
        product_id: ProductId,
    ) -> Result<Option<ProductStock>, StoreError> {
        Ok(self.read()?.products.get(&(tenant_id, outlet_id, product_id)).cloned())
    }

    async fn list_products(
        &self,
        tenant_id: TenantId,
        outlet_id: OutletId,
    ) -> Result<Vec<ProductStock>, StoreError> {
        let state = self.read()?;
        let mut rows: Vec<ProductStock> = state
            .products
            .values()
            .filter(|p| p.tenant_id == tenant_id && p.outlet_id == outlet_id && p.is_active())
            .cloned()
            .collect();
        rows.sort_by_key(|p| p.product_id);
        Ok(rows)
    }

    async fn commit(
        &self,
        tenant_id: TenantId,
        commit: LedgerCommit,
    ) -> Result<Vec<StockMovement>, StoreError> {
        commit.check_tenant(tenant_id)?;
        let mut state = self.write()?;

        // Validate everything against a staged view before touching state.
        for write in &commit.documents {
            let key = (tenant_id, write.document.id());
            let current = state.documents.get(&key).map(|d| d.version());
            write.expected.check(current)?;
        }

        let mut staged: HashMap<ProductKey, i64> = HashMap::new();
        let mut befores = Vec::with_capacity(commit.movements.len());
        for draft in &commit.movements {
            check_outlet_draft(draft)?;
            let key = (draft.tenant_id, draft.outlet_id, draft.product_id);
            let before = match staged.get(&key) {
                Some(stock) => *stock,
                None => match state.products.get(&key) {
                    Some(p) if p.is_active() => p.current_stock,
                    _ => {
                        return Err(DomainError::not_found(format!(
                            "product {} in outlet {}",
                            draft.product_id, draft.outlet_id
                        ))
                        .into());
                    }
                },
            };
            let after = draft.resulting_stock(before)?;
            staged.insert(key, after);
            befores.push(before);
        }

        // Apply.
        let now = Utc::now();
        let mut applied = Vec::with_capacity(commit.movements.len());
        for (draft, before) in commit.movements.into_iter().zip(befores) {
            let key = (draft.tenant_id, draft.outlet_id, draft.product_id);
            let movement = state.append_movement(draft, before)?;
            if let Some(row) = state.products.get_mut(&key) {
                row.current_stock = movement.stock_after;
                row.updated_at = now;
            }
            applied.push(movement);
        }
        for write in commit.documents {
            state
                .documents
                .insert((tenant_id, write.document.id()), write.document);
        }

        Ok(applied)
    }

    async fn list_movements(
        &self,
        tenant_id: TenantId,
        filter: &MovementFilter,
        pagination: Pagination,
    ) -> Result<Page<StockMovement>, StoreError> {
        let state = self.read()?;
        let matching: Vec<StockMovement> = state
            .movements
            .iter()
            .rev()
            .filter(|m| m.tenant_id == tenant_id && filter.matches(m))
            .cloned()
            .collect();
        Ok(pagination.page_of(matching))
    }

    async fn load_stream(&self, stream: StockStream) -> Result<Vec<StockMovement>, StoreError> {
        let state = self.read()?;
        Ok(state
            .movements
            .iter()
            .filter(|m| m.stream() == stream)
            .cloned()
            .collect())
    }

    async fn load_adjustment(
        &self,
        tenant_id: TenantId,
        id: AdjustmentId,
    ) -> Result<Option<StockAdjustment>, StoreError> {
        let state = self.read()?;
        Ok(match state.documents.get(&(tenant_id, id.into())) {
            Some(StockDocument::Adjustment(a)) => Some(a.clone()),
            _ => None,
        })
    }

    async fn list_adjustments(
        &self,
        tenant_id: TenantId,
        filter: &AdjustmentFilter,
        pagination: Pagination,
    ) -> Result<Page<StockAdjustment>, StoreError> {
        let mut all = self.documents_of(tenant_id, |d| match d {
            StockDocument::Adjustment(a) => Some(a),
            _ => None,
        })?;
        all.retain(|a| filter.matches(a));
        all.sort_by(|a, b| b.created_at().cmp(&a.created_at()));
        Ok(pagination.page_of(all))
    }

    async fn load_transfer(
        &self,
        tenant_id: TenantId,
        id: TransferId,
    ) -> Result<Option<StockTransfer>, StoreError> {
        let state = self.read()?;
        Ok(match state.documents.get(&(tenant_id, id.into())) {
            Some(StockDocument::Transfer(t)) => Some(t.clone()),
            _ => None,
        })
    }

    async fn list_transfers(
        &self,
        tenant_id: TenantId,
        filter: &TransferFilter,
        pagination: Pagination,
    ) -> Result<Page<StockTransfer>, StoreError> {
        let mut all = self.documents_of(tenant_id, |d| match d {
            StockDocument::Transfer(t) => Some(t),
            _ => None,
        })?;
        all.retain(|t| filter.matches(t));
        all.sort_by(|a, b| b.created_at().cmp(&a.created_at()));
        Ok(pagination.page_of(all))
    }
}

#[async_trait]
impl WarehouseStore for InMemoryStockStore {
    async fn create_warehouse(&self, warehouse: &Warehouse) -> Result<(), StoreError> {
        let mut state = self.write()?;
        if !state.outlets.contains_key(&(warehouse.tenant_id, warehouse.outlet_id)) {
            return Err(DomainError::not_found(format!("outlet {}", warehouse.outlet_id)).into());
        }
        let taken = state
            .warehouses
            .values()
            .any(|w| w.tenant_id == warehouse.tenant_id && w.code == warehouse.code);
        if taken {
            return Err(DomainError::conflict(format!("warehouse code {} already exists", warehouse.code)).into());
        }
        state
            .warehouses
            .insert((warehouse.tenant_id, warehouse.id), warehouse.clone());
        Ok(())
    }

    async fn load_warehouse(
        &self,
        tenant_id: TenantId,
        warehouse_id: WarehouseId,
    ) -> Result<Option<Warehouse>, StoreError> {
        Ok(self.read()?.warehouses.get(&(tenant_id, warehouse_id)).cloned())
    }

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
        let mut state = self.write()?;
        if !state.warehouses.contains_key(&(tenant_id, warehouse.id)) {
            return Err(DomainError::not_found(format!("warehouse {}", warehouse.id)).into());
        }

        let key = (tenant_id, update.key());
        let previous = state.warehouse_stock.get(&key).cloned();
        let row = update.apply(previous.as_ref(), Utc::now())?;

        let total_before = state.warehouse_total(tenant_id, warehouse.id, update.product_id)?;
        let total_after = replaced_total(total_before, previous.as_ref().map_or(0, |p| p.quantity), row.quantity)?;
        let draft = ledger_actor
            .and_then(|actor| warehouse_movement(warehouse, update.product_id, total_before, total_after, actor));

        // The movement is the only fallible step, so it goes first.
        let movement = match draft {
            Some(d) => Some(state.append_movement(d, total_before)?),
            None => None,
        };
        state.warehouse_stock.insert(key, row.clone());

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
        let state = self.read()?;
        let mut rows: Vec<WarehouseStock> = state
            .warehouse_stock
            .iter()
            .filter(|((t, k), _)| *t == tenant_id && k.warehouse_id == warehouse_id)
            .map(|(_, row)| row.clone())
            .collect();
        rows.sort_by(|a, b| {
            (a.product_id, &a.batch_number).cmp(&(b.product_id, &b.batch_number))
        });
        Ok(rows)
    }

    async fn warehouse_available(
        &self,
        tenant_id: TenantId,
        outlet_id: OutletId,
        product_id: ProductId,
    ) -> Result<i64, StoreError> {
        let state = self.read()?;
        Ok(state
            .warehouse_stock
            .iter()
            .filter(|((t, k), _)| *t == tenant_id && k.product_id == product_id)
            .filter(|((t, k), _)| {
                state
                    .warehouses
                    .get(&(*t, k.warehouse_id))
                    .is_some_and(|w| w.outlet_id == outlet_id)
            })
            .map(|(_, row)| row.available)
            .sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coopstock_core::ExpectedVersion;
    use coopstock_inventory::{MovementType, WarehouseType};

    async fn store_with_product(stock: i64) -> (InMemoryStockStore, TenantId, OutletId, ProductId) {
        let store = InMemoryStockStore::new();
        let tenant_id = TenantId::new();
        let outlet_id = OutletId::new();
        let product_id = ProductId::new();
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
        (store, tenant_id, outlet_id, product_id)
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

    #[tokio::test]
    async fn failing_movement_rolls_back_the_whole_commit() {
        let (store, tenant_id, outlet_id, product_id) = store_with_product(5).await;
        let commit = LedgerCommit::default().with_movements([
            draft(tenant_id, outlet_id, product_id, MovementType::Sale, -3),
            draft(tenant_id, outlet_id, product_id, MovementType::Sale, -3),
        ]);

        let err = store.commit(tenant_id, commit).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Rejected(DomainError::InsufficientStock { requested: 3, available: 2, .. })
        ));

        let row = store.load_product(tenant_id, outlet_id, product_id).await.unwrap().unwrap();
        assert_eq!(row.current_stock, 5);
        let page = store
            .list_movements(tenant_id, &MovementFilter::default(), Pagination::default())
            .await
            .unwrap();
        assert_eq!(page.total, 1);
    }

    #[tokio::test]
    async fn movements_chain_within_one_commit() {
        let (store, tenant_id, outlet_id, product_id) = store_with_product(5).await;
        let applied = store
            .commit(
                tenant_id,
                LedgerCommit::default().with_movements([
                    draft(tenant_id, outlet_id, product_id, MovementType::Sale, -2),
                    draft(tenant_id, outlet_id, product_id, MovementType::Refund, 1),
                ]),
            )
            .await
            .unwrap();
        assert_eq!((applied[0].stock_before, applied[0].stock_after), (5, 3));
        assert_eq!((applied[1].stock_before, applied[1].stock_after), (3, 4));
        assert!(applied[1].sequence > applied[0].sequence);
    }

    #[tokio::test]
    async fn soft_deleted_products_reject_movements() {
        let (store, tenant_id, outlet_id, product_id) = store_with_product(5).await;
        store.soft_delete_product(tenant_id, outlet_id, product_id).await.unwrap();
        let err = store
            .commit(
                tenant_id,
                LedgerCommit::movement(draft(tenant_id, outlet_id, product_id, MovementType::Sale, -1)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Rejected(DomainError::NotFound(_))));
    }

    #[tokio::test]
    async fn stale_document_versions_conflict() {
        use coopstock_core::AggregateId;
        use coopstock_inventory::{AdjustmentCommand, AdjustmentItem, CreateAdjustment};

        let (store, tenant_id, outlet_id, product_id) = store_with_product(0).await;
        let id = AdjustmentId::new(AggregateId::new());
        let mut adj = StockAdjustment::empty(id);
        coopstock_events::execute(
            &mut adj,
            &AdjustmentCommand::Create(CreateAdjustment {
                tenant_id,
                adjustment_id: id,
                outlet_id,
                adjustment_number: "ADJ-1".into(),
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
        let err = store
            .commit(tenant_id, LedgerCommit::document(doc, ExpectedVersion::New))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn warehouse_codes_are_unique_per_tenant() {
        let (store, tenant_id, outlet_id, _) = store_with_product(0).await;
        let a = Warehouse::new(tenant_id, outlet_id, "wh-1", "A", WarehouseType::Main, Utc::now()).unwrap();
        let b = Warehouse::new(tenant_id, outlet_id, "WH-1", "B", WarehouseType::Storage, Utc::now()).unwrap();
        store.create_warehouse(&a).await.unwrap();
        assert!(store.create_warehouse(&b).await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn warehouse_totals_that_overflow_are_rejected() {
        let (store, tenant_id, outlet_id, product_id) = store_with_product(0).await;
        let wh = Warehouse::new(tenant_id, outlet_id, "bulk", "Bulk", WarehouseType::Storage, Utc::now()).unwrap();
        store.create_warehouse(&wh).await.unwrap();
        let batch = |name: &str| WarehouseStockUpdate {
            batch_number: Some(name.to_string()),
            ..WarehouseStockUpdate::new(wh.id, product_id, i64::MAX)
        };

        store
            .upsert_warehouse_stock(&wh, &batch("B1"), Some(UserId::new()))
            .await
            .unwrap();
        let err = store
            .upsert_warehouse_stock(&wh, &batch("B2"), Some(UserId::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Rejected(DomainError::Validation(_))));
        assert_eq!(store.list_warehouse_stock(tenant_id, wh.id).await.unwrap().len(), 1);
    }
}
