//! Row shapes returned by repositories.
//!
//! Price and stock blocks are stored as JSON text; turning a row into a
//! [`PersistedProduct`] is where they get parsed.

use crate::model::{PersistedProduct, PriceBlock, StockBlock};
use crate::snapshot::SnapshotError;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredProduct {
    pub id: i64,
    pub name: String,
    pub category_path: String,
    pub price_info: String,
    pub stock_info: String,
    pub is_active: bool,
    pub is_favorite: bool,
}

impl TryFrom<StoredProduct> for PersistedProduct {
    type Error = SnapshotError;

    fn try_from(row: StoredProduct) -> Result<Self, Self::Error> {
        Ok(PersistedProduct {
            id: u32::try_from(row.id).map_err(|_| SnapshotError::IdOutOfRange(row.id))?,
            name: row.name,
            category_path: row.category_path,
            price: PriceBlock::parse_str(&row.price_info)?,
            stock: StockBlock::parse_str(&row.stock_info)?,
            is_active: row.is_active,
            is_favorite: row.is_favorite,
        })
    }
}

/// Column values written when a change is applied to a product.
#[derive(Debug, Clone)]
pub struct ProductFields {
    pub price_info: String,
    pub stock_info: String,
    pub is_active: bool,
}
