use anyhow::Result;
use tracing::info;

use crate::db::ChangeStore;
use crate::model::ChangeSet;
use crate::snapshot::ProductSnapshot;

/// Append the audit row and move the live product to the incoming values.
///
/// Runs for every detected change, whether or not it is later fanned out,
/// and always before any favorites are read for the same product.
pub async fn persist_change(
    store: &dyn ChangeStore,
    change: &ChangeSet,
    snapshot: &ProductSnapshot,
) -> Result<i64> {
    let record_id = store.apply_change(change, snapshot).await?;
    info!(
        product_id = change.product_id,
        record_id,
        old_price = change.old_price,
        new_price = change.new_price,
        old_original_price = change.old_original_price,
        new_original_price = change.new_original_price,
        old_stock = change.old_stock,
        new_stock = change.new_stock,
        active = snapshot.is_active,
        "change recorded"
    );
    Ok(record_id)
}
