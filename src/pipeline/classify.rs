use crate::model::{ChangeSet, PersistedProduct};
use crate::snapshot::ProductSnapshot;

#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    /// No stored record for this id.
    New,
    Unchanged,
    Changed(ChangeSet),
    /// A change that leaves the product with zero stock; the snapshot has
    /// already been marked inactive.
    OutOfStock(ChangeSet),
}

impl Classification {
    pub fn change(&self) -> Option<&ChangeSet> {
        match self {
            Classification::Changed(c) | Classification::OutOfStock(c) => Some(c),
            Classification::New | Classification::Unchanged => None,
        }
    }
}

/// Compare an incoming snapshot against the stored product.
///
/// Both sides arrive with their price and stock blocks already parsed, so
/// this step cannot fail. When the incoming stock is zero the snapshot's
/// activity flag is cleared regardless of what the store holds, including
/// for products seen for the first time.
pub fn classify(
    snapshot: &mut ProductSnapshot,
    persisted: Option<&PersistedProduct>,
) -> Classification {
    if snapshot.stock.is_empty() {
        snapshot.is_active = false;
    }

    let Some(existing) = persisted else {
        return Classification::New;
    };

    let price_changed = snapshot.price.differs_from(&existing.price);
    let stock_changed = snapshot.stock.stock != existing.stock.stock;
    if !price_changed && !stock_changed {
        return Classification::Unchanged;
    }

    let change = ChangeSet {
        product_id: snapshot.id,
        old_price: existing.price.current(),
        new_price: snapshot.price.current(),
        old_original_price: existing.price.original_price,
        new_original_price: snapshot.price.original_price,
        old_stock: existing.stock.stock,
        new_stock: snapshot.stock.stock,
    };
    if snapshot.stock.is_empty() {
        Classification::OutOfStock(change)
    } else {
        Classification::Changed(change)
    }
}
