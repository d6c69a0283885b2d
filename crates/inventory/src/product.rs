use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use coopstock_core::{DomainError, DomainResult, OutletId, ProductId, TenantId};

/// Catalog listing of a product in an outlet (supplied by the catalog service).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductListing {
    pub tenant_id: TenantId,
    pub outlet_id: OutletId,
    pub product_id: ProductId,
    pub min_stock: i64,
    pub max_stock: Option<i64>,
}

impl ProductListing {
    pub fn validate(&self) -> DomainResult<()> {
        if self.min_stock < 0 {
            return Err(DomainError::validation("min_stock cannot be negative"));
        }
        if let Some(max) = self.max_stock {
            if max < self.min_stock {
                return Err(DomainError::validation("max_stock cannot be below min_stock"));
            }
        }
        Ok(())
    }
}

/// Ledger-owned stock figure for one product in one outlet.
///
/// `current_stock` is only ever written by the store's commit, alongside the
/// movement that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductStock {
    pub tenant_id: TenantId,
    pub outlet_id: OutletId,
    pub product_id: ProductId,
    pub current_stock: i64,
    pub min_stock: i64,
    pub max_stock: Option<i64>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl ProductStock {
    /// A fresh listing starts at zero; opening stock arrives as a movement.
    pub fn from_listing(listing: &ProductListing, now: DateTime<Utc>) -> Self {
        Self {
            tenant_id: listing.tenant_id,
            outlet_id: listing.outlet_id,
            product_id: listing.product_id,
            current_stock: 0,
            min_stock: listing.min_stock,
            max_stock: listing.max_stock,
            deleted_at: None,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }

    pub fn is_low_stock(&self) -> bool {
        self.current_stock <= self.min_stock
    }
}

/// Aggregate stock view for one product in one outlet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLevel {
    pub outlet_id: OutletId,
    pub product_id: ProductId,
    pub outlet_stock: i64,
    /// Sum of `available` across the outlet's warehouses holding the product.
    pub warehouse_stock: i64,
    pub total_stock: i64,
    pub min_stock: i64,
    pub is_low_stock: bool,
}

impl StockLevel {
    pub fn compute(product: &ProductStock, warehouse_available: i64) -> Self {
        Self {
            outlet_id: product.outlet_id,
            product_id: product.product_id,
            outlet_stock: product.current_stock,
            warehouse_stock: warehouse_available,
            total_stock: product.current_stock + warehouse_available,
            min_stock: product.min_stock,
            is_low_stock: product.is_low_stock(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing(min_stock: i64) -> ProductListing {
        ProductListing {
            tenant_id: TenantId::new(),
            outlet_id: OutletId::new(),
            product_id: ProductId::new(),
            min_stock,
            max_stock: None,
        }
    }

    #[test]
    fn low_stock_is_inclusive_of_minimum() {
        let mut p = ProductStock::from_listing(&listing(5), Utc::now());
        p.current_stock = 5;
        assert!(StockLevel::compute(&p, 100).is_low_stock);
        p.current_stock = 6;
        assert!(!StockLevel::compute(&p, 0).is_low_stock);
    }

    #[test]
    fn total_adds_warehouse_available() {
        let mut p = ProductStock::from_listing(&listing(0), Utc::now());
        p.current_stock = 12;
        let level = StockLevel::compute(&p, 30);
        assert_eq!(level.total_stock, 42);
        assert_eq!(level.warehouse_stock, 30);
    }

    #[test]
    fn listing_bounds_are_validated() {
        let mut l = listing(10);
        l.max_stock = Some(5);
        assert!(l.validate().is_err());
        l.max_stock = Some(10);
        assert!(l.validate().is_ok());
        assert!(listing(-1).validate().is_err());
    }
}
