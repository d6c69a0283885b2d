//! Engine tests against the in-memory store.
//!
//! Verifies:
//! - every stock change is a ledger movement and replays to the cached figure
//! - multi-item operations are all-or-nothing
//! - transfer and adjustment state machines reject out-of-order actions
//! - concurrent sales never oversell
//! - audit envelopes follow committed transitions only

use std::sync::Arc;
use std::time::Duration;

use coopstock_core::{AggregateRoot, OutletId, ProductId, TenantId, UserId, WarehouseId};
use coopstock_events::{AuditAction, EventBus, InMemoryEventBus};
use coopstock_inventory::{
    AdjustmentItem, AdjustmentStatus, ItemQuantity, MovementDraft, MovementReference,
    MovementType, ProductListing, ReferenceType, TransferAction, TransferStatus,
    WarehouseStockUpdate, WarehouseType,
};

use crate::audit::AuditEnvelope;
use crate::config::{EngineConfig, WarehouseMode};
use crate::engine::StockEngine;
use crate::error::EngineError;
use crate::query::{AdjustmentFilter, MovementFilter, Pagination, TransferFilter};
use crate::retry::RetryPolicy;
use crate::store::{InMemoryStockStore, StockStore};

type Bus = Arc<InMemoryEventBus<AuditEnvelope>>;
type Engine = StockEngine<InMemoryStockStore, Bus>;

struct Harness {
    engine: Arc<Engine>,
    bus: Bus,
    tenant_id: TenantId,
    actor: UserId,
}

impl Harness {
    fn new() -> Self {
        Self::with_mode(WarehouseMode::Independent)
    }

    fn with_mode(warehouse_mode: WarehouseMode) -> Self {
        let bus: Bus = Arc::new(InMemoryEventBus::new());
        let config = EngineConfig {
            retry: RetryPolicy::fixed(5, Duration::from_millis(1)),
            warehouse_mode,
            ..EngineConfig::default()
        };
        let engine = StockEngine::new(Arc::new(InMemoryStockStore::new()), bus.clone(), config);
        Self {
            engine: Arc::new(engine),
            bus,
            tenant_id: TenantId::new(),
            actor: UserId::new(),
        }
    }

    async fn outlet(&self, name: &str) -> OutletId {
        let outlet_id = OutletId::new();
        self.engine
            .store()
            .register_outlet(self.tenant_id, outlet_id, name)
            .await
            .unwrap();
        outlet_id
    }

    /// List `product_id` at `outlet_id` and bring it to `stock` with a purchase.
    async fn list(&self, outlet_id: OutletId, product_id: ProductId, stock: i64, min_stock: i64) {
        self.engine
            .store()
            .register_product(&ProductListing {
                tenant_id: self.tenant_id,
                outlet_id,
                product_id,
                min_stock,
                max_stock: None,
            })
            .await
            .unwrap();
        if stock > 0 {
            self.engine
                .ledger()
                .record_movement(self.draft(outlet_id, product_id, MovementType::Purchase, stock))
                .await
                .unwrap();
        }
    }

    async fn product(&self, outlet_id: OutletId, stock: i64) -> ProductId {
        let product_id = ProductId::new();
        self.list(outlet_id, product_id, stock, 0).await;
        product_id
    }

    fn draft(&self, outlet_id: OutletId, product_id: ProductId, t: MovementType, qty: i64) -> MovementDraft {
        MovementDraft::new(self.tenant_id, outlet_id, product_id, t, qty, self.actor)
    }

    async fn stock(&self, outlet_id: OutletId, product_id: ProductId) -> i64 {
        self.engine
            .ledger()
            .stock_level(self.tenant_id, outlet_id, product_id)
            .await
            .unwrap()
            .outlet_stock
    }

    async fn assert_replays(&self, outlet_id: OutletId, product_id: ProductId) {
        let report = self
            .engine
            .ledger()
            .replay(self.tenant_id, outlet_id, product_id)
            .await
            .unwrap();
        assert!(report.is_consistent(), "ledger drift: {report:?}");
    }

    async fn movements_referencing(&self, reference: MovementReference) -> u64 {
        self.engine
            .ledger()
            .list_movements(
                self.tenant_id,
                &MovementFilter {
                    reference: Some(reference),
                    ..MovementFilter::default()
                },
                None,
            )
            .await
            .unwrap()
            .total
    }
}

fn adjust(product_id: ProductId, quantity: i64) -> AdjustmentItem {
    let movement_type = if quantity > 0 {
        MovementType::AdjustmentIn
    } else {
        MovementType::AdjustmentOut
    };
    AdjustmentItem {
        product_id,
        quantity,
        movement_type,
        notes: None,
    }
}

#[tokio::test]
async fn sale_decrements_stock_and_records_before_and_after() {
    let h = Harness::new();
    let outlet = h.outlet("Main").await;
    let p = h.product(outlet, 10).await;

    let movement = h
        .engine
        .ledger()
        .record_movement(h.draft(outlet, p, MovementType::Sale, -3))
        .await
        .unwrap();

    assert_eq!(movement.stock_before, 10);
    assert_eq!(movement.stock_after, 7);
    assert_eq!(h.stock(outlet, p).await, 7);
    h.assert_replays(outlet, p).await;
}

#[tokio::test]
async fn oversell_is_rejected_with_shortfall_and_no_effect() {
    let h = Harness::new();
    let outlet = h.outlet("Main").await;
    let p = h.product(outlet, 7).await;

    let err = h
        .engine
        .ledger()
        .record_movement(h.draft(outlet, p, MovementType::Sale, -8))
        .await
        .unwrap_err();

    match &err {
        EngineError::InsufficientStock {
            product_id,
            requested,
            available,
        } => {
            assert_eq!(*product_id, p);
            assert_eq!((*requested, *available), (8, 7));
        }
        other => panic!("expected InsufficientStock, got {other:?}"),
    }
    assert_eq!(err.shortfall(), Some(1));
    assert!(err.to_string().contains("short by 1"));
    assert_eq!(h.stock(outlet, p).await, 7);
    h.assert_replays(outlet, p).await;
}

#[tokio::test]
async fn movement_sign_must_match_type() {
    let h = Harness::new();
    let outlet = h.outlet("Main").await;
    let p = h.product(outlet, 5).await;

    let err = h
        .engine
        .ledger()
        .record_movement(h.draft(outlet, p, MovementType::Sale, 2))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
    assert_eq!(h.stock(outlet, p).await, 5);
}

#[tokio::test]
async fn most_negative_sale_is_a_validation_error() {
    let h = Harness::new();
    let outlet = h.outlet("Main").await;
    let p = h.product(outlet, 10).await;

    let engine = Arc::clone(&h.engine);
    let draft = h.draft(outlet, p, MovementType::Sale, i64::MIN);
    let err = tokio::spawn(async move { engine.ledger().record_movement(draft).await })
        .await
        .expect("record_movement must not panic")
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
    assert_eq!(h.stock(outlet, p).await, 10);
    h.assert_replays(outlet, p).await;
}

#[tokio::test]
async fn unlisted_or_deleted_products_are_not_found() {
    let h = Harness::new();
    let outlet = h.outlet("Main").await;
    let p = h.product(outlet, 4).await;

    let unknown = h
        .engine
        .ledger()
        .record_movement(h.draft(outlet, ProductId::new(), MovementType::Purchase, 1))
        .await
        .unwrap_err();
    assert!(matches!(unknown, EngineError::NotFound(_)));

    h.engine
        .store()
        .soft_delete_product(h.tenant_id, outlet, p)
        .await
        .unwrap();
    let deleted = h
        .engine
        .ledger()
        .record_movement(h.draft(outlet, p, MovementType::Sale, -1))
        .await
        .unwrap_err();
    assert!(matches!(deleted, EngineError::NotFound(_)));
    assert!(matches!(
        h.engine.ledger().stock_level(h.tenant_id, outlet, p).await,
        Err(EngineError::NotFound(_))
    ));

    // History stays replayable after delisting.
    h.assert_replays(outlet, p).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_sales_never_oversell() {
    let h = Arc::new(Harness::new());
    let outlet = h.outlet("Main").await;
    let p = h.product(outlet, 50).await;

    let mut tasks = Vec::with_capacity(100);
    for _ in 0..100 {
        let h = h.clone();
        tasks.push(tokio::spawn(async move {
            h.engine
                .ledger()
                .record_movement(h.draft(outlet, p, MovementType::Sale, -1))
                .await
        }));
    }

    let (mut ok, mut short) = (0, 0);
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => ok += 1,
            Err(EngineError::InsufficientStock { .. }) => short += 1,
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    assert_eq!((ok, short), (50, 50));
    assert_eq!(h.stock(outlet, p).await, 0);
    h.assert_replays(outlet, p).await;
}

#[tokio::test]
async fn approval_with_one_failing_item_applies_nothing() {
    let h = Harness::new();
    let outlet = h.outlet("Main").await;
    let p = h.product(outlet, 3).await;
    let q = h.product(outlet, 10).await;
    let adjustments = h.engine.adjustments();

    let adjustment = adjustments
        .create_adjustment(h.tenant_id, outlet, "stock count", vec![adjust(p, 5), adjust(q, -100)], h.actor)
        .await
        .unwrap();
    let id = adjustment.id_typed();

    let err = adjustments
        .approve_adjustment(h.tenant_id, id, true, None, h.actor)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InsufficientStock { .. }));

    assert_eq!(h.stock(outlet, p).await, 3);
    assert_eq!(h.stock(outlet, q).await, 10);
    let reloaded = adjustments.get_adjustment(h.tenant_id, id).await.unwrap();
    assert_eq!(reloaded.status(), AdjustmentStatus::Pending);
    assert_eq!(
        h.movements_referencing(MovementReference::new(ReferenceType::Adjustment, id)).await,
        0
    );
}

#[tokio::test]
async fn approved_adjustment_moves_every_item_once() {
    let h = Harness::new();
    let outlet = h.outlet("Main").await;
    let p = h.product(outlet, 3).await;
    let q = h.product(outlet, 10).await;
    let adjustments = h.engine.adjustments();

    let adjustment = adjustments
        .create_adjustment(h.tenant_id, outlet, "damaged shelf", vec![adjust(p, 5), adjust(q, -4)], h.actor)
        .await
        .unwrap();
    assert_eq!(adjustment.status(), AdjustmentStatus::Pending);
    assert!(adjustment.adjustment_number().starts_with("ADJ-"));
    assert_eq!(h.stock(outlet, p).await, 3, "creation must not move stock");

    let approved = adjustments
        .approve_adjustment(h.tenant_id, adjustment.id_typed(), true, Some("checked".into()), h.actor)
        .await
        .unwrap();
    assert_eq!(approved.status(), AdjustmentStatus::Approved);
    assert_eq!(approved.approved_by(), Some(h.actor));
    assert_eq!(approved.approval_notes(), Some("checked"));
    assert_eq!(h.stock(outlet, p).await, 8);
    assert_eq!(h.stock(outlet, q).await, 6);

    let again = adjustments
        .approve_adjustment(h.tenant_id, adjustment.id_typed(), false, None, h.actor)
        .await
        .unwrap_err();
    match again {
        EngineError::InvalidState { current, required } => {
            assert_eq!(current, "approved");
            assert_eq!(required, "pending");
        }
        other => panic!("expected InvalidState, got {other:?}"),
    }
    assert_eq!(h.stock(outlet, p).await, 8);
    h.assert_replays(outlet, p).await;
    h.assert_replays(outlet, q).await;
}

#[tokio::test]
async fn rejected_adjustment_creates_no_movements() {
    let h = Harness::new();
    let outlet = h.outlet("Main").await;
    let p = h.product(outlet, 3).await;
    let adjustments = h.engine.adjustments();

    let adjustment = adjustments
        .create_adjustment(h.tenant_id, outlet, "miscount", vec![adjust(p, 2)], h.actor)
        .await
        .unwrap();
    let rejected = adjustments
        .approve_adjustment(h.tenant_id, adjustment.id_typed(), false, None, h.actor)
        .await
        .unwrap();

    assert_eq!(rejected.status(), AdjustmentStatus::Rejected);
    assert_eq!(h.stock(outlet, p).await, 3);

    let page = adjustments
        .list_adjustments(
            h.tenant_id,
            &AdjustmentFilter {
                status: Some(AdjustmentStatus::Rejected),
                ..AdjustmentFilter::default()
            },
            None,
        )
        .await
        .unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.items[0].id_typed(), adjustment.id_typed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_approvers_apply_an_adjustment_once() {
    let h = Arc::new(Harness::new());
    let outlet = h.outlet("Main").await;
    let p = h.product(outlet, 0).await;
    let id = h
        .engine
        .adjustments()
        .create_adjustment(h.tenant_id, outlet, "found stock", vec![adjust(p, 5)], h.actor)
        .await
        .unwrap()
        .id_typed();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let h = h.clone();
        tasks.push(tokio::spawn(async move {
            h.engine
                .adjustments()
                .approve_adjustment(h.tenant_id, id, true, None, UserId::new())
                .await
        }));
    }

    let mut approved = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => approved += 1,
            Err(EngineError::InvalidState { .. }) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    assert_eq!(approved, 1);
    assert_eq!(h.stock(outlet, p).await, 5);
    h.assert_replays(outlet, p).await;
}

#[tokio::test]
async fn adjustment_creation_checks_outlet_and_listings() {
    let h = Harness::new();
    let outlet = h.outlet("Main").await;
    let adjustments = h.engine.adjustments();

    let unknown_outlet = adjustments
        .create_adjustment(h.tenant_id, OutletId::new(), "count", vec![adjust(ProductId::new(), 1)], h.actor)
        .await
        .unwrap_err();
    assert!(matches!(unknown_outlet, EngineError::NotFound(_)));

    let unlisted = adjustments
        .create_adjustment(h.tenant_id, outlet, "count", vec![adjust(ProductId::new(), 1)], h.actor)
        .await
        .unwrap_err();
    assert!(matches!(unlisted, EngineError::InvalidReference(_)));

    let empty = adjustments
        .create_adjustment(h.tenant_id, outlet, "count", Vec::new(), h.actor)
        .await
        .unwrap_err();
    assert!(matches!(empty, EngineError::Validation(_)));
}

#[tokio::test]
async fn documents_are_tenant_scoped() {
    let h = Harness::new();
    let outlet = h.outlet("Main").await;
    let p = h.product(outlet, 1).await;
    let id = h
        .engine
        .adjustments()
        .create_adjustment(h.tenant_id, outlet, "count", vec![adjust(p, 1)], h.actor)
        .await
        .unwrap()
        .id_typed();

    let other_tenant = TenantId::new();
    assert!(matches!(
        h.engine.adjustments().get_adjustment(other_tenant, id).await,
        Err(EngineError::NotFound(_))
    ));
    assert!(matches!(
        h.engine
            .adjustments()
            .approve_adjustment(other_tenant, id, true, None, h.actor)
            .await,
        Err(EngineError::NotFound(_))
    ));
    assert_eq!(h.stock(outlet, p).await, 1);
}

/// Two outlets listing the same product.
async fn transfer_setup(h: &Harness, source_stock: i64) -> (OutletId, OutletId, ProductId) {
    let from = h.outlet("North").await;
    let to = h.outlet("South").await;
    let p = h.product(from, source_stock).await;
    h.list(to, p, 0, 0).await;
    (from, to, p)
}

#[tokio::test]
async fn transfer_with_damaged_units_on_receipt() {
    let h = Harness::new();
    let (from, to, p) = transfer_setup(&h, 50).await;
    let transfers = h.engine.transfers();

    let transfer = transfers
        .create_transfer(h.tenant_id, from, to, vec![ItemQuantity::new(p, 20)], None, h.actor)
        .await
        .unwrap();
    let id = transfer.id_typed();
    assert_eq!(transfer.status(), TransferStatus::Pending);
    assert!(transfer.transfer_number().starts_with("TRF-"));

    transfers
        .process_transfer(h.tenant_id, id, TransferAction::Approve, h.actor)
        .await
        .unwrap();
    assert_eq!(h.stock(from, p).await, 50, "approval moves nothing");

    let shipped = transfers
        .process_transfer(h.tenant_id, id, TransferAction::Ship { items: Vec::new() }, h.actor)
        .await
        .unwrap();
    assert_eq!(shipped.status(), TransferStatus::Shipped);
    assert!(shipped.shipped_date().is_some());
    assert_eq!(h.stock(from, p).await, 30);
    assert_eq!(h.stock(to, p).await, 0);

    let received = transfers
        .process_transfer(
            h.tenant_id,
            id,
            TransferAction::Receive {
                items: vec![ItemQuantity::new(p, 18)],
            },
            h.actor,
        )
        .await
        .unwrap();
    assert_eq!(received.status(), TransferStatus::Received);
    assert_eq!(h.stock(to, p).await, 18);

    let item = &received.items()[0];
    assert_eq!(item.quantity_shipped, Some(20));
    assert_eq!(item.quantity_received, Some(18));
    assert_eq!(received.in_transit_loss(), 2);
    h.assert_replays(from, p).await;
    h.assert_replays(to, p).await;
}

#[tokio::test]
async fn completed_transfer_conserves_units() {
    let h = Harness::new();
    let (from, to, p) = transfer_setup(&h, 12).await;
    let q = h.product(from, 9).await;
    h.list(to, q, 1, 0).await;
    let transfers = h.engine.transfers();

    let id = transfers
        .create_transfer(
            h.tenant_id,
            from,
            to,
            vec![ItemQuantity::new(p, 7), ItemQuantity::new(q, 9)],
            Some("weekly restock".into()),
            h.actor,
        )
        .await
        .unwrap()
        .id_typed();
    for action in [
        TransferAction::Approve,
        TransferAction::Ship { items: Vec::new() },
        TransferAction::Receive { items: Vec::new() },
    ] {
        transfers.process_transfer(h.tenant_id, id, action, h.actor).await.unwrap();
    }

    let history = h
        .engine
        .ledger()
        .list_movements(
            h.tenant_id,
            &MovementFilter {
                reference: Some(MovementReference::new(ReferenceType::Transfer, id)),
                ..MovementFilter::default()
            },
            None,
        )
        .await
        .unwrap();
    let out: i64 = history
        .items
        .iter()
        .filter(|m| m.movement_type == MovementType::TransferOut)
        .map(|m| m.quantity)
        .sum();
    let inbound: i64 = history
        .items
        .iter()
        .filter(|m| m.movement_type == MovementType::TransferIn)
        .map(|m| m.quantity)
        .sum();
    assert_eq!(history.total, 4);
    assert_eq!(out, -16);
    assert_eq!(out, -inbound);
    assert_eq!(h.stock(to, q).await, 10);
}

#[tokio::test]
async fn cancel_after_receipt_is_invalid_state() {
    let h = Harness::new();
    let (from, to, p) = transfer_setup(&h, 5).await;
    let transfers = h.engine.transfers();
    let id = transfers
        .create_transfer(h.tenant_id, from, to, vec![ItemQuantity::new(p, 5)], None, h.actor)
        .await
        .unwrap()
        .id_typed();
    for action in [
        TransferAction::Approve,
        TransferAction::Ship { items: Vec::new() },
        TransferAction::Receive { items: Vec::new() },
    ] {
        transfers.process_transfer(h.tenant_id, id, action, h.actor).await.unwrap();
    }

    let err = transfers
        .process_transfer(h.tenant_id, id, TransferAction::Cancel { reason: None }, h.actor)
        .await
        .unwrap_err();
    match err {
        EngineError::InvalidState { current, .. } => assert_eq!(current, "received"),
        other => panic!("expected InvalidState, got {other:?}"),
    }
    let transfer = transfers.get_transfer(h.tenant_id, id).await.unwrap();
    assert_eq!(transfer.status(), TransferStatus::Received);
}

#[tokio::test]
async fn out_of_order_actions_change_nothing() {
    let h = Harness::new();
    let (from, to, p) = transfer_setup(&h, 10).await;
    let transfers = h.engine.transfers();
    let id = transfers
        .create_transfer(h.tenant_id, from, to, vec![ItemQuantity::new(p, 4)], None, h.actor)
        .await
        .unwrap()
        .id_typed();

    for action in [
        TransferAction::Ship { items: Vec::new() },
        TransferAction::Receive { items: Vec::new() },
    ] {
        let err = transfers
            .process_transfer(h.tenant_id, id, action, h.actor)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidState { .. }));
    }
    transfers
        .process_transfer(h.tenant_id, id, TransferAction::Approve, h.actor)
        .await
        .unwrap();
    let twice = transfers
        .process_transfer(h.tenant_id, id, TransferAction::Approve, h.actor)
        .await
        .unwrap_err();
    assert!(matches!(twice, EngineError::InvalidState { .. }));

    let transfer = transfers.get_transfer(h.tenant_id, id).await.unwrap();
    assert_eq!(transfer.status(), TransferStatus::Approved);
    assert_eq!(transfer.version(), 2);
    assert_eq!(h.stock(from, p).await, 10);
    assert_eq!(h.stock(to, p).await, 0);
}

#[tokio::test]
async fn cancelling_a_shipped_transfer_leaves_the_outflow() {
    let h = Harness::new();
    let (from, to, p) = transfer_setup(&h, 10).await;
    let transfers = h.engine.transfers();
    let id = transfers
        .create_transfer(h.tenant_id, from, to, vec![ItemQuantity::new(p, 6)], None, h.actor)
        .await
        .unwrap()
        .id_typed();
    transfers
        .process_transfer(h.tenant_id, id, TransferAction::Approve, h.actor)
        .await
        .unwrap();
    transfers
        .process_transfer(
            h.tenant_id,
            id,
            TransferAction::Ship {
                items: vec![ItemQuantity::new(p, 5)],
            },
            h.actor,
        )
        .await
        .unwrap();

    let cancelled = transfers
        .process_transfer(
            h.tenant_id,
            id,
            TransferAction::Cancel {
                reason: Some("truck lost".into()),
            },
            h.actor,
        )
        .await
        .unwrap();

    assert_eq!(cancelled.status(), TransferStatus::Cancelled);
    assert_eq!(cancelled.cancel_reason(), Some("truck lost"));
    assert_eq!(h.stock(from, p).await, 5);
    assert_eq!(h.stock(to, p).await, 0);
    h.assert_replays(from, p).await;
}

#[tokio::test]
async fn transfer_creation_validates_outlets_listings_and_visible_stock() {
    let h = Harness::new();
    let (from, to, p) = transfer_setup(&h, 3).await;
    let only_at_source = h.product(from, 10).await;
    let transfers = h.engine.transfers();

    let same = transfers
        .create_transfer(h.tenant_id, from, from, vec![ItemQuantity::new(p, 1)], None, h.actor)
        .await
        .unwrap_err();
    assert!(matches!(same, EngineError::InvalidReference(_)));

    let unknown = transfers
        .create_transfer(h.tenant_id, from, OutletId::new(), vec![ItemQuantity::new(p, 1)], None, h.actor)
        .await
        .unwrap_err();
    assert!(matches!(unknown, EngineError::NotFound(_)));

    let unlisted = transfers
        .create_transfer(h.tenant_id, from, to, vec![ItemQuantity::new(only_at_source, 1)], None, h.actor)
        .await
        .unwrap_err();
    assert!(matches!(unlisted, EngineError::InvalidReference(_)));

    let too_many = transfers
        .create_transfer(h.tenant_id, from, to, vec![ItemQuantity::new(p, 4)], None, h.actor)
        .await
        .unwrap_err();
    assert_eq!(too_many.shortfall(), Some(1));

    let page = transfers
        .list_transfers(h.tenant_id, &TransferFilter::default(), None)
        .await
        .unwrap();
    assert_eq!(page.total, 0, "rejected creations leave no document");
}

#[tokio::test]
async fn transfers_filter_by_either_outlet() {
    let h = Harness::new();
    let (from, to, p) = transfer_setup(&h, 10).await;
    let transfers = h.engine.transfers();
    transfers
        .create_transfer(h.tenant_id, from, to, vec![ItemQuantity::new(p, 1)], None, h.actor)
        .await
        .unwrap();

    let by_destination = transfers
        .list_transfers(
            h.tenant_id,
            &TransferFilter {
                outlet_id: Some(to),
                ..TransferFilter::default()
            },
            None,
        )
        .await
        .unwrap();
    assert_eq!(by_destination.total, 1);

    let shipped_only = transfers
        .list_transfers(
            h.tenant_id,
            &TransferFilter {
                status: Some(TransferStatus::Shipped),
                ..TransferFilter::default()
            },
            None,
        )
        .await
        .unwrap();
    assert_eq!(shipped_only.total, 0);
}

#[tokio::test]
async fn movement_history_is_most_recent_first_and_paginated() {
    let h = Harness::new();
    let outlet = h.outlet("Main").await;
    let p = h.product(outlet, 10).await;
    for _ in 0..4 {
        h.engine
            .ledger()
            .record_movement(h.draft(outlet, p, MovementType::Sale, -1))
            .await
            .unwrap();
    }

    let filter = MovementFilter {
        product_id: Some(p),
        ..MovementFilter::default()
    };
    let first = h
        .engine
        .ledger()
        .list_movements(h.tenant_id, &filter, Some(Pagination::new(Some(2), None)))
        .await
        .unwrap();
    assert_eq!(first.total, 5);
    assert!(first.has_more);
    assert!(first.items[0].sequence > first.items[1].sequence);
    assert_eq!(first.items[0].stock_after, 6);

    let sales = h
        .engine
        .ledger()
        .list_movements(
            h.tenant_id,
            &MovementFilter {
                movement_type: Some(MovementType::Purchase),
                ..filter
            },
            None,
        )
        .await
        .unwrap();
    assert_eq!(sales.total, 1);
}

#[tokio::test]
async fn low_stock_lists_products_at_or_below_minimum() {
    let h = Harness::new();
    let outlet = h.outlet("Main").await;
    let low = ProductId::new();
    let fine = ProductId::new();
    h.list(outlet, low, 5, 5).await;
    h.list(outlet, fine, 6, 5).await;

    let levels = h.engine.ledger().low_stock(h.tenant_id, outlet).await.unwrap();
    assert_eq!(levels.len(), 1);
    assert_eq!(levels[0].product_id, low);
    assert!(levels[0].is_low_stock);
}

#[tokio::test]
async fn independent_warehouse_writes_stay_off_the_ledger() {
    let h = Harness::new();
    let outlet = h.outlet("Main").await;
    let p = h.product(outlet, 4).await;
    let warehouses = h.engine.warehouses();

    let wh = warehouses
        .create_warehouse(h.tenant_id, outlet, "back-1", "Back room", WarehouseType::Storage, h.actor)
        .await
        .unwrap();
    assert_eq!(wh.code, "BACK-1");

    let duplicate = warehouses
        .create_warehouse(h.tenant_id, outlet, "BACK-1", "Other", WarehouseType::Storage, h.actor)
        .await
        .unwrap_err();
    assert!(matches!(duplicate, EngineError::Conflict(_)));

    let row = warehouses
        .upsert_warehouse_stock(
            h.tenant_id,
            WarehouseStockUpdate {
                reserved: Some(3),
                ..WarehouseStockUpdate::new(wh.id, p, 10)
            },
            h.actor,
        )
        .await
        .unwrap();
    assert_eq!(row.available, 7);

    let level = h.engine.ledger().stock_level(h.tenant_id, outlet, p).await.unwrap();
    assert_eq!(level.outlet_stock, 4);
    assert_eq!(level.warehouse_stock, 7);
    assert_eq!(level.total_stock, 11);

    let wh_movements = h
        .engine
        .ledger()
        .list_movements(
            h.tenant_id,
            &MovementFilter {
                warehouse_id: Some(wh.id),
                ..MovementFilter::default()
            },
            None,
        )
        .await
        .unwrap();
    assert_eq!(wh_movements.total, 0);

    let negative = warehouses
        .upsert_warehouse_stock(h.tenant_id, WarehouseStockUpdate::new(wh.id, p, -1), h.actor)
        .await
        .unwrap_err();
    assert!(matches!(negative, EngineError::Validation(_)));

    let unknown = warehouses
        .get_warehouse_stock(h.tenant_id, WarehouseId::new())
        .await
        .unwrap_err();
    assert!(matches!(unknown, EngineError::NotFound(_)));
}

#[tokio::test]
async fn warehouse_rows_require_a_listing_in_the_warehouse_outlet() {
    let h = Harness::with_mode(WarehouseMode::Ledgered);
    let main = h.outlet("Main").await;
    let branch = h.outlet("Branch").await;
    let listed = h.product(main, 0).await;
    let elsewhere = h.product(branch, 0).await;
    let warehouses = h.engine.warehouses();
    let wh = warehouses
        .create_warehouse(h.tenant_id, main, "WH-1", "Main store", WarehouseType::Storage, h.actor)
        .await
        .unwrap();

    for product_id in [ProductId::new(), elsewhere] {
        let err = warehouses
            .upsert_warehouse_stock(h.tenant_id, WarehouseStockUpdate::new(wh.id, product_id, 40), h.actor)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidReference(_)), "{err:?}");
    }

    h.engine
        .store()
        .soft_delete_product(h.tenant_id, main, listed)
        .await
        .unwrap();
    let deleted = warehouses
        .upsert_warehouse_stock(h.tenant_id, WarehouseStockUpdate::new(wh.id, listed, 5), h.actor)
        .await
        .unwrap_err();
    assert!(matches!(deleted, EngineError::InvalidReference(_)));

    assert!(warehouses.get_warehouse_stock(h.tenant_id, wh.id).await.unwrap().is_empty());
    let history = h
        .engine
        .ledger()
        .list_movements(
            h.tenant_id,
            &MovementFilter {
                warehouse_id: Some(wh.id),
                ..MovementFilter::default()
            },
            None,
        )
        .await
        .unwrap();
    assert_eq!(history.total, 0);
}

#[tokio::test]
async fn ledgered_warehouse_totals_are_replayable() {
    let h = Harness::with_mode(WarehouseMode::Ledgered);
    let outlet = h.outlet("Main").await;
    let p = h.product(outlet, 0).await;
    let warehouses = h.engine.warehouses();
    let wh = warehouses
        .create_warehouse(h.tenant_id, outlet, "COLD", "Cold store", WarehouseType::ColdStorage, h.actor)
        .await
        .unwrap();

    let batch = |qty: i64, batch: &str| WarehouseStockUpdate {
        batch_number: Some(batch.to_string()),
        ..WarehouseStockUpdate::new(wh.id, p, qty)
    };
    for update in [batch(10, "B1"), batch(4, "B1"), batch(3, "B2"), batch(3, "B2")] {
        warehouses
            .upsert_warehouse_stock(h.tenant_id, update, h.actor)
            .await
            .unwrap();
    }

    let history = h
        .engine
        .ledger()
        .list_movements(
            h.tenant_id,
            &MovementFilter {
                warehouse_id: Some(wh.id),
                ..MovementFilter::default()
            },
            None,
        )
        .await
        .unwrap();
    // The last upsert left the total unchanged.
    assert_eq!(history.total, 3);
    let types: Vec<MovementType> = history.items.iter().rev().map(|m| m.movement_type).collect();
    assert_eq!(
        types,
        vec![MovementType::AdjustmentIn, MovementType::AdjustmentOut, MovementType::AdjustmentIn]
    );

    let report = warehouses.replay(h.tenant_id, wh.id, p).await.unwrap();
    assert_eq!(report.cached_stock, 7);
    assert!(report.is_consistent(), "{report:?}");

    // Outlet stock is a separate stream.
    assert_eq!(h.stock(outlet, p).await, 0);
    h.assert_replays(outlet, p).await;

    let rows = warehouses.get_warehouse_stock(h.tenant_id, wh.id).await.unwrap();
    assert_eq!(rows.len(), 2);
}

#[tokio::test]
async fn audit_follows_committed_transitions_only() {
    let h = Harness::new();
    let outlet = h.outlet("Main").await;
    let p = h.product(outlet, 2).await;
    let sub = h.bus.subscribe();

    let _ = h
        .engine
        .ledger()
        .record_movement(h.draft(outlet, p, MovementType::Sale, -5))
        .await
        .unwrap_err();
    assert!(sub.drain().is_empty(), "rejected movement must not be audited");

    let adjustments = h.engine.adjustments();
    let id = adjustments
        .create_adjustment(h.tenant_id, outlet, "recount", vec![adjust(p, 1)], h.actor)
        .await
        .unwrap()
        .id_typed();
    adjustments
        .approve_adjustment(h.tenant_id, id, true, None, h.actor)
        .await
        .unwrap();

    let envelopes = sub.drain();
    let actions: Vec<AuditAction> = envelopes.iter().map(|e| e.payload().action).collect();
    assert_eq!(
        actions,
        vec![
            AuditAction::AdjustmentCreated,
            AuditAction::AdjustmentApproved,
            AuditAction::MovementRecorded,
        ]
    );

    let approval = &envelopes[1];
    assert_eq!(approval.event_type(), "stock.adjustment.approved");
    assert_eq!(approval.tenant_id(), h.tenant_id);
    assert_eq!(approval.sequence_number(), 2);
    let payload = approval.payload();
    assert_eq!(payload.actor, h.actor);
    assert_eq!(payload.before.as_ref().unwrap()["status"], "pending");
    assert_eq!(payload.after.as_ref().unwrap()["status"], "approved");
}
