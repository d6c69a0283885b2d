//! Warehouse sub-stock: batch/expiry, physical placement and reservations
//! below the outlet level.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use coopstock_core::{DomainError, DomainResult, OutletId, ProductId, TenantId, WarehouseId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WarehouseType {
    Main,
    Storage,
    ColdStorage,
    Transit,
    Display,
}

impl WarehouseType {
    pub fn as_str(self) -> &'static str {
        match self {
            WarehouseType::Main => "MAIN",
            WarehouseType::Storage => "STORAGE",
            WarehouseType::ColdStorage => "COLD_STORAGE",
            WarehouseType::Transit => "TRANSIT",
            WarehouseType::Display => "DISPLAY",
        }
    }
}

impl core::str::FromStr for WarehouseType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            WarehouseType::Main,
            WarehouseType::Storage,
            WarehouseType::ColdStorage,
            WarehouseType::Transit,
            WarehouseType::Display,
        ]
        .into_iter()
        .find(|t| t.as_str().eq_ignore_ascii_case(s))
        .ok_or_else(|| DomainError::validation(format!("unknown warehouse type: {s}")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warehouse {
    pub id: WarehouseId,
    pub tenant_id: TenantId,
    pub outlet_id: OutletId,
    /// Unique per tenant, stored upper-cased.
    pub code: String,
    pub name: String,
    pub warehouse_type: WarehouseType,
    pub created_at: DateTime<Utc>,
}

impl Warehouse {
    pub fn new(
        tenant_id: TenantId,
        outlet_id: OutletId,
        code: &str,
        name: &str,
        warehouse_type: WarehouseType,
        now: DateTime<Utc>,
    ) -> DomainResult<Self> {
        let code = code.trim();
        if code.is_empty() {
            return Err(DomainError::validation("warehouse code cannot be empty"));
        }
        if name.trim().is_empty() {
            return Err(DomainError::validation("warehouse name cannot be empty"));
        }
        Ok(Self {
            id: WarehouseId::new(),
            tenant_id,
            outlet_id,
            code: code.to_uppercase(),
            name: name.trim().to_string(),
            warehouse_type,
            created_at: now,
        })
    }
}

/// Physical placement inside a warehouse.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockPlacement {
    pub zone: Option<String>,
    pub rack: Option<String>,
    pub bin: Option<String>,
}

/// Stock of one product (and batch) in one warehouse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarehouseStock {
    pub warehouse_id: WarehouseId,
    pub product_id: ProductId,
    pub batch_number: Option<String>,
    pub quantity: i64,
    pub reserved: i64,
    /// `max(quantity - reserved, 0)`.
    pub available: i64,
    pub expiry_date: Option<NaiveDate>,
    pub placement: StockPlacement,
    pub updated_at: DateTime<Utc>,
}

impl WarehouseStock {
    pub fn key(&self) -> WarehouseStockKey {
        WarehouseStockKey {
            warehouse_id: self.warehouse_id,
            product_id: self.product_id,
            batch_number: self.batch_number.clone(),
        }
    }
}

/// Identity of a warehouse stock row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WarehouseStockKey {
    pub warehouse_id: WarehouseId,
    pub product_id: ProductId,
    pub batch_number: Option<String>,
}

/// Absolute (not delta) upsert of a warehouse stock row.
///
/// Omitted optional attributes keep their stored value; a new row starts with
/// nothing reserved and no placement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarehouseStockUpdate {
    pub warehouse_id: WarehouseId,
    pub product_id: ProductId,
    pub quantity: i64,
    pub reserved: Option<i64>,
    pub batch_number: Option<String>,
    pub expiry_date: Option<NaiveDate>,
    pub zone: Option<String>,
    pub rack: Option<String>,
    pub bin: Option<String>,
}

impl WarehouseStockUpdate {
    pub fn new(warehouse_id: WarehouseId, product_id: ProductId, quantity: i64) -> Self {
        Self {
            warehouse_id,
            product_id,
            quantity,
            reserved: None,
            batch_number: None,
            expiry_date: None,
            zone: None,
            rack: None,
            bin: None,
        }
    }

    pub fn key(&self) -> WarehouseStockKey {
        WarehouseStockKey {
            warehouse_id: self.warehouse_id,
            product_id: self.product_id,
            batch_number: self
                .batch_number
                .as_ref()
                .map(|b| b.trim().to_string())
                .filter(|b| !b.is_empty()),
        }
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.quantity < 0 {
            return Err(DomainError::validation("warehouse quantity cannot be negative"));
        }
        if matches!(self.reserved, Some(r) if r < 0) {
            return Err(DomainError::validation("reserved quantity cannot be negative"));
        }
        Ok(())
    }

    pub fn apply(&self, existing: Option<&WarehouseStock>, now: DateTime<Utc>) -> DomainResult<WarehouseStock> {
        self.validate()?;
        let key = self.key();
        let reserved = self
            .reserved
            .or(existing.map(|e| e.reserved))
            .unwrap_or(0);
        let keep = |new: &Option<String>, old: Option<&Option<String>>| {
            new.clone().or_else(|| old.cloned().flatten())
        };
        let placement = StockPlacement {
            zone: keep(&self.zone, existing.map(|e| &e.placement.zone)),
            rack: keep(&self.rack, existing.map(|e| &e.placement.rack)),
            bin: keep(&self.bin, existing.map(|e| &e.placement.bin)),
        };

        Ok(WarehouseStock {
            warehouse_id: key.warehouse_id,
            product_id: key.product_id,
            batch_number: key.batch_number,
            quantity: self.quantity,
            reserved,
            available: (self.quantity - reserved).max(0),
            expiry_date: self.expiry_date.or(existing.and_then(|e| e.expiry_date)),
            placement,
            updated_at: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(quantity: i64) -> WarehouseStockUpdate {
        WarehouseStockUpdate::new(WarehouseId::new(), ProductId::new(), quantity)
    }

    #[test]
    fn available_is_quantity_minus_reserved_clamped_at_zero() {
        let mut u = update(10);
        u.reserved = Some(4);
        assert_eq!(u.apply(None, Utc::now()).unwrap().available, 6);

        u.reserved = Some(15);
        let row = u.apply(None, Utc::now()).unwrap();
        assert_eq!(row.available, 0);
        assert_eq!(row.reserved, 15);
    }

    #[test]
    fn omitted_attributes_keep_existing_values() {
        let mut first = update(10);
        first.reserved = Some(2);
        first.zone = Some("A".to_string());
        first.expiry_date = NaiveDate::from_ymd_opt(2027, 1, 31);
        let existing = first.apply(None, Utc::now()).unwrap();

        let mut second = first.clone();
        second.quantity = 7;
        second.reserved = None;
        second.zone = None;
        second.expiry_date = None;
        second.bin = Some("B-4".to_string());
        let row = second.apply(Some(&existing), Utc::now()).unwrap();

        assert_eq!(row.quantity, 7);
        assert_eq!(row.reserved, 2);
        assert_eq!(row.available, 5);
        assert_eq!(row.placement.zone.as_deref(), Some("A"));
        assert_eq!(row.placement.bin.as_deref(), Some("B-4"));
        assert_eq!(row.expiry_date, NaiveDate::from_ymd_opt(2027, 1, 31));
    }

    #[test]
    fn negative_values_are_rejected() {
        assert!(update(-1).validate().is_err());
        let mut u = update(1);
        u.reserved = Some(-1);
        assert!(u.validate().is_err());
    }

    #[test]
    fn blank_batch_number_is_the_unbatched_row() {
        let mut u = update(1);
        u.batch_number = Some("  ".to_string());
        assert_eq!(u.key().batch_number, None);
    }

    #[test]
    fn warehouse_code_is_normalized() {
        let w = Warehouse::new(
            TenantId::new(),
            OutletId::new(),
            " wh-01 ",
            "Back room",
            WarehouseType::Storage,
            Utc::now(),
        )
        .unwrap();
        assert_eq!(w.code, "WH-01");
        assert!(Warehouse::new(TenantId::new(), OutletId::new(), " ", "x", WarehouseType::Main, Utc::now()).is_err());
    }
}
