use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};

use crate::snapshot::SnapshotError;

/// Price block as carried on the bus and stored in `products.price_info`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceBlock {
    pub original_price: f64,
    #[serde(alias = "price")]
    pub discounted_price: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
}

impl PriceBlock {
    /// The price a shopper pays right now.
    pub fn current(&self) -> f64 {
        self.discounted_price
    }

    /// True when either numeric price field differs.
    pub fn differs_from(&self, other: &PriceBlock) -> bool {
        self.original_price != other.original_price
            || self.discounted_price != other.discounted_price
    }

    pub fn parse_str(raw: &str) -> Result<Self, SnapshotError> {
        serde_json::from_str(raw).map_err(SnapshotError::Price)
    }

    pub fn parse_value(raw: serde_json::Value) -> Result<Self, SnapshotError> {
        serde_json::from_value(raw).map_err(SnapshotError::Price)
    }
}

/// Stock block as carried on the bus and stored in `products.stock_info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockBlock {
    #[serde(deserialize_with = "whole_number")]
    pub stock: i64,
    #[serde(default)]
    pub disabled: bool,
}

impl StockBlock {
    pub fn is_empty(&self) -> bool {
        self.stock == 0
    }

    pub fn parse_str(raw: &str) -> Result<Self, SnapshotError> {
        serde_json::from_str(raw).map_err(SnapshotError::Stock)
    }

    pub fn parse_value(raw: serde_json::Value) -> Result<Self, SnapshotError> {
        serde_json::from_value(raw).map_err(SnapshotError::Stock)
    }
}

/// Crawlers report stock as any JSON number; `3.0` is fine, `2.5` is not.
fn whole_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    let n = serde_json::Number::deserialize(deserializer)?;
    if let Some(v) = n.as_i64() {
        return Ok(v);
    }
    match n.as_f64() {
        Some(v) if v.fract() == 0.0 && v >= i64::MIN as f64 && v < i64::MAX as f64 => Ok(v as i64),
        _ => Err(D::Error::custom(format!("expected a whole number of items, got {n}"))),
    }
}

/// The store's current view of a product, with its blocks already parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedProduct {
    pub id: u32,
    pub name: String,
    pub category_path: String,
    pub price: PriceBlock,
    pub stock: StockBlock,
    pub is_active: bool,
    pub is_favorite: bool,
}

/// Before/after values of one detected change.
///
/// `old_price`/`new_price` are effective prices; the original (list) prices
/// ride along so a list-price-only change still shows its delta.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeSet {
    pub product_id: u32,
    pub old_price: f64,
    pub new_price: f64,
    pub old_original_price: f64,
    pub new_original_price: f64,
    pub old_stock: i64,
    pub new_stock: i64,
}

impl ChangeSet {
    pub fn is_price_drop(&self) -> bool {
        self.new_price < self.old_price
    }
}

/// One row of the append-only audit trail.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeRecord {
    pub id: i64,
    pub product_id: u32,
    pub old_price: f64,
    pub new_price: f64,
    pub old_original_price: f64,
    pub new_original_price: f64,
    pub old_stock: i64,
    pub new_stock: i64,
    pub changed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FavoriteRelation {
    pub user_id: i64,
    pub product_id: u32,
    pub added_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub username: Option<String>,
    pub name: Option<String>,
    pub is_active: bool,
}
