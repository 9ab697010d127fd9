//! Typed boundary for inbound product snapshots.
//!
//! A bus message is a JSON array. The array itself must decode or the whole
//! delivery is dropped; each element is then parsed on its own so one bad item
//! never costs the rest of the batch.
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::model::{PriceBlock, StockBlock};

/// The delivery could not be read as a batch at all.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed batch payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("batch payload is not a JSON array (found {0})")]
    NotAnArray(&'static str),
}

/// A single snapshot (or stored product) could not be parsed.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("price block: {0}")]
    Price(#[source] serde_json::Error),
    #[error("stock block: {0}")]
    Stock(#[source] serde_json::Error),
    #[error("missing {0} block")]
    MissingBlock(&'static str),
    #[error("snapshot: {0}")]
    Shape(#[source] serde_json::Error),
    #[error("snapshot is not a JSON object")]
    NotAnObject,
    #[error("product id {0} is out of range")]
    IdOutOfRange(i64),
}

/// One product's state as reported by a crawl. Never mutated after parsing
/// except for the activity flag when the product is out of stock.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductSnapshot {
    pub id: u32,
    pub name: String,
    pub category_path: String,
    pub price: PriceBlock,
    pub stock: StockBlock,
    pub is_active: bool,
    pub is_favorite: bool,
    /// Images, seller, ratings, attributes and the like, passed through as-is.
    #[serde(flatten)]
    pub aux: Map<String, Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Header {
    id: u32,
    name: String,
    #[serde(default)]
    category_path: String,
    #[serde(default = "default_active")]
    is_active: bool,
    #[serde(default)]
    is_favorite: bool,
    #[serde(flatten)]
    aux: Map<String, Value>,
}

fn default_active() -> bool {
    true
}

impl ProductSnapshot {
    pub fn from_value(value: Value) -> Result<Self, SnapshotError> {
        let Value::Object(mut obj) = value else {
            return Err(SnapshotError::NotAnObject);
        };
        let price = take_block(&mut obj, "price", "priceInfo")
            .ok_or(SnapshotError::MissingBlock("price"))?;
        let stock = take_block(&mut obj, "stock", "stockInfo")
            .ok_or(SnapshotError::MissingBlock("stock"))?;
        let price = PriceBlock::parse_value(price)?;
        let stock = StockBlock::parse_value(stock)?;

        let header: Header =
            serde_json::from_value(Value::Object(obj)).map_err(SnapshotError::Shape)?;
        Ok(Self {
            id: header.id,
            name: header.name,
            category_path: header.category_path,
            price,
            stock,
            is_active: header.is_active,
            is_favorite: header.is_favorite,
            aux: header.aux,
        })
    }

    pub fn aux_json(&self) -> String {
        Value::Object(self.aux.clone()).to_string()
    }
}

// Both keys are removed so a leftover alias never lands in `aux`.
fn take_block(obj: &mut Map<String, Value>, key: &str, alias: &str) -> Option<Value> {
    let primary = obj.remove(key);
    let secondary = obj.remove(alias);
    primary.or(secondary)
}

/// Decode one bus payload into its raw items.
pub fn decode_batch(payload: &[u8]) -> Result<Vec<Value>, DecodeError> {
    match serde_json::from_slice::<Value>(payload)? {
        Value::Array(items) => Ok(items),
        Value::Object(_) => Err(DecodeError::NotAnArray("object")),
        Value::String(_) => Err(DecodeError::NotAnArray("string")),
        Value::Number(_) => Err(DecodeError::NotAnArray("number")),
        Value::Bool(_) => Err(DecodeError::NotAnArray("bool")),
        Value::Null => Err(DecodeError::NotAnArray("null")),
    }
}

/// Best-effort id of a raw item, for log correlation before it is parsed.
pub fn raw_id(value: &Value) -> Option<u32> {
    value
        .get("id")
        .and_then(Value::as_u64)
        .and_then(|id| u32::try_from(id).ok())
}
