use super::model::{ProductFields, StoredProduct};
use crate::model::{ChangeRecord, ChangeSet, FavoriteRelation, User};
use crate::snapshot::ProductSnapshot;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized)
        .await
        .with_context(|| format!("failed to open database {normalized}"))?;
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. In-memory and non-sqlite URLs are returned unchanged.
fn prepare_sqlite_url(url: &str) -> String {
    let Some(rest) = url.strip_prefix("sqlite:") else {
        return url.to_string();
    };
    if rest.starts_with(":memory") {
        return url.to_string();
    }

    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(tail), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), tail),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = format!("sqlite://{expanded_path}");
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[instrument(skip_all, fields(product_id = id))]
pub async fn find_product(pool: &Pool, id: u32) -> Result<Option<StoredProduct>> {
    let row = sqlx::query_as::<_, StoredProduct>(
        "SELECT id, name, category_path, price_info, stock_info, is_active, is_favorite \
         FROM products WHERE id = ?",
    )
    .bind(i64::from(id))
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

#[instrument(skip_all, fields(product_id = snapshot.id))]
pub async fn create_product(pool: &Pool, snapshot: &ProductSnapshot) -> Result<()> {
    let price_info = serde_json::to_string(&snapshot.price).context("encode price block")?;
    let stock_info = serde_json::to_string(&snapshot.stock).context("encode stock block")?;
    sqlx::query(
        "INSERT INTO products (id, name, category_path, price_info, stock_info, extra, is_active, is_favorite) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(i64::from(snapshot.id))
    .bind(&snapshot.name)
    .bind(&snapshot.category_path)
    .bind(price_info)
    .bind(stock_info)
    .bind(snapshot.aux_json())
    .bind(snapshot.is_active)
    .bind(snapshot.is_favorite)
    .execute(pool)
    .await
    .context("failed to insert product")?;
    Ok(())
}

#[instrument(skip_all, fields(product_id = id))]
pub async fn update_product_fields(pool: &Pool, id: u32, fields: &ProductFields) -> Result<()> {
    let mut tx = pool.begin().await?;
    update_product_fields_tx(&mut tx, id, fields).await?;
    tx.commit().await?;
    Ok(())
}

async fn update_product_fields_tx(
    tx: &mut Transaction<'_, Sqlite>,
    id: u32,
    fields: &ProductFields,
) -> Result<()> {
    let res = sqlx::query(
        "UPDATE products SET price_info = ?, stock_info = ?, is_active = ?, updated_at = CURRENT_TIMESTAMP \
         WHERE id = ?",
    )
    .bind(&fields.price_info)
    .bind(&fields.stock_info)
    .bind(fields.is_active)
    .bind(i64::from(id))
    .execute(&mut **tx)
    .await?;
    if res.rows_affected() == 0 {
        return Err(anyhow!("product {} not found", id));
    }
    Ok(())
}

#[instrument(skip_all, fields(product_id = change.product_id))]
pub async fn create_change_record(
    pool: &Pool,
    change: &ChangeSet,
    at: DateTime<Utc>,
) -> Result<i64> {
    let mut tx = pool.begin().await?;
    let id = create_change_record_tx(&mut tx, change, at).await?;
    tx.commit().await?;
    Ok(id)
}

async fn create_change_record_tx(
    tx: &mut Transaction<'_, Sqlite>,
    change: &ChangeSet,
    at: DateTime<Utc>,
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO change_records \
         (product_id, old_price, new_price, old_original_price, new_original_price, old_stock, new_stock, changed_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(i64::from(change.product_id))
    .bind(change.old_price)
    .bind(change.new_price)
    .bind(change.old_original_price)
    .bind(change.new_original_price)
    .bind(change.old_stock)
    .bind(change.new_stock)
    .bind(at)
    .fetch_one(&mut **tx)
    .await?;
    Ok(rec.get("id"))
}

/// Write the audit row and move the live product to the snapshot's values.
/// Both writes commit together or not at all.
#[instrument(skip_all, fields(product_id = change.product_id))]
pub async fn apply_change(
    pool: &Pool,
    change: &ChangeSet,
    snapshot: &ProductSnapshot,
) -> Result<i64> {
    let fields = ProductFields {
        price_info: serde_json::to_string(&snapshot.price).context("encode price block")?,
        stock_info: serde_json::to_string(&snapshot.stock).context("encode stock block")?,
        is_active: snapshot.is_active,
    };
    let mut tx = pool.begin().await?;
    let record_id = create_change_record_tx(&mut tx, change, Utc::now()).await?;
    update_product_fields_tx(&mut tx, change.product_id, &fields).await?;
    tx.commit().await?;
    Ok(record_id)
}

#[instrument(skip_all, fields(product_id = product_id))]
pub async fn find_favorites_by_product(
    pool: &Pool,
    product_id: u32,
) -> Result<Vec<FavoriteRelation>> {
    let rows: Vec<(i64, DateTime<Utc>)> = sqlx::query_as(
        "SELECT user_id, added_at FROM user_favorites WHERE product_id = ? ORDER BY id ASC",
    )
    .bind(i64::from(product_id))
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|(user_id, added_at)| FavoriteRelation {
            user_id,
            product_id,
            added_at,
        })
        .collect())
}

#[instrument(skip_all, fields(product_id = product_id))]
pub async fn count_favorites_by_product(pool: &Pool, product_id: u32) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM user_favorites WHERE product_id = ?")
        .bind(i64::from(product_id))
        .fetch_one(pool)
        .await?;
    Ok(count)
}

#[instrument(skip_all, fields(user_id = user_id))]
pub async fn find_user(pool: &Pool, user_id: i64) -> Result<Option<User>> {
    let row = sqlx::query("SELECT id, email, username, name, is_active FROM users WHERE id = ?")
        .bind(user_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|row| User {
        id: row.get("id"),
        email: row.get("email"),
        username: row.get("username"),
        name: row.get("name"),
        is_active: row.get("is_active"),
    }))
}

/// Products the poller should refresh: active, favorite-flagged, and favorited
/// by at least one user.
#[instrument(skip_all)]
pub async fn active_favorited_product_ids(pool: &Pool) -> Result<Vec<u32>> {
    let ids: Vec<i64> = sqlx::query_scalar(
        "SELECT DISTINCT p.id FROM products p \
         JOIN user_favorites f ON f.product_id = p.id \
         WHERE p.is_active = 1 AND p.is_favorite = 1 \
         ORDER BY p.id",
    )
    .fetch_all(pool)
    .await?;
    ids.into_iter()
        .map(|id| u32::try_from(id).with_context(|| format!("product id {id} is out of range")))
        .collect()
}

#[instrument(skip_all)]
pub async fn get_or_create_user(
    pool: &Pool,
    email: &str,
    username: Option<&str>,
    name: Option<&str>,
) -> Result<i64> {
    if let Some(id) = sqlx::query_scalar::<_, i64>("SELECT id FROM users WHERE email = ?")
        .bind(email)
        .fetch_optional(pool)
        .await?
    {
        return Ok(id);
    }

    let rec = sqlx::query("INSERT INTO users (email, username, name) VALUES (?, ?, ?) RETURNING id")
        .bind(email)
        .bind(username)
        .bind(name)
        .fetch_one(pool)
        .await?;
    Ok(rec.get::<i64, _>("id"))
}

/// Returns false when the pair already existed.
#[instrument(skip_all, fields(user_id = user_id, product_id = product_id))]
pub async fn add_favorite(pool: &Pool, user_id: i64, product_id: u32) -> Result<bool> {
    let res = sqlx::query(
        "INSERT OR IGNORE INTO user_favorites (user_id, product_id, added_at) VALUES (?, ?, ?)",
    )
    .bind(user_id)
    .bind(i64::from(product_id))
    .bind(Utc::now())
    .execute(pool)
    .await
    .context("failed to add favorite")?;
    Ok(res.rows_affected() > 0)
}

#[instrument(skip_all, fields(user_id = user_id, product_id = product_id))]
pub async fn remove_favorite(pool: &Pool, user_id: i64, product_id: u32) -> Result<bool> {
    let res = sqlx::query("DELETE FROM user_favorites WHERE user_id = ? AND product_id = ?")
        .bind(user_id)
        .bind(i64::from(product_id))
        .execute(pool)
        .await
        .context("failed to remove favorite")?;
    Ok(res.rows_affected() > 0)
}

/// Audit trail for one product, oldest first.
#[instrument(skip_all, fields(product_id = product_id))]
pub async fn change_history(pool: &Pool, product_id: u32) -> Result<Vec<ChangeRecord>> {
    let rows = sqlx::query(
        "SELECT id, product_id, old_price, new_price, old_original_price, new_original_price, \
         old_stock, new_stock, changed_at \
         FROM change_records WHERE product_id = ? ORDER BY id ASC",
    )
    .bind(i64::from(product_id))
    .fetch_all(pool)
    .await?;
    rows.into_iter()
        .map(|row| -> Result<ChangeRecord> {
            Ok(ChangeRecord {
                id: row.try_get("id")?,
                product_id: u32::try_from(row.try_get::<i64, _>("product_id")?)
                    .context("product id is out of range")?,
                old_price: row.try_get("old_price")?,
                new_price: row.try_get("new_price")?,
                old_original_price: row.try_get("old_original_price")?,
                new_original_price: row.try_get("new_original_price")?,
                old_stock: row.try_get("old_stock")?,
                new_stock: row.try_get("new_stock")?,
                changed_at: row.try_get("changed_at")?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::model::StoredProduct;
    use crate::model::PersistedProduct;
    use serde_json::json;

    async fn setup_pool() -> Pool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    fn snapshot(id: u32, price: f64, stock: i64) -> ProductSnapshot {
        ProductSnapshot::from_value(json!({
            "id": id,
            "name": format!("product-{id}"),
            "price": {"originalPrice": price, "discountedPrice": price},
            "stock": {"stock": stock},
            "isFavorite": true,
            "images": ["x.jpg"]
        }))
        .unwrap()
    }

    #[test]
    fn prepare_url_passthrough() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(prepare_sqlite_url("postgres://x"), "postgres://x");
    }

    #[test]
    fn prepare_url_creates_parent_dir() {
        let td = tempfile::tempdir().unwrap();
        let db = td.path().join("nested").join("pw.db");
        let url = format!("sqlite://{}?mode=rwc", db.display());
        let out = prepare_sqlite_url(&url);
        assert_eq!(out, url);
        assert!(td.path().join("nested").exists());
    }

    #[tokio::test]
    async fn create_then_find_round_trips_blocks() {
        let pool = setup_pool().await;
        create_product(&pool, &snapshot(7, 10.0, 3)).await.unwrap();
        let row: StoredProduct = find_product(&pool, 7).await.unwrap().unwrap();
        let product = PersistedProduct::try_from(row).unwrap();
        assert_eq!(product.price.current(), 10.0);
        assert_eq!(product.stock.stock, 3);
        assert!(product.is_active);
        assert!(find_product(&pool, 8).await.unwrap().is_none());

        let extra: String = sqlx::query_scalar("SELECT extra FROM products WHERE id = 7")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert!(extra.contains("x.jpg"));
    }

    #[tokio::test]
    async fn apply_change_writes_audit_and_product() {
        let pool = setup_pool().await;
        create_product(&pool, &snapshot(1, 100.0, 5)).await.unwrap();
        let mut next = snapshot(1, 80.0, 0);
        next.is_active = false;
        let change = ChangeSet {
            product_id: 1,
            old_price: 100.0,
            new_price: 80.0,
            old_original_price: 100.0,
            new_original_price: 80.0,
            old_stock: 5,
            new_stock: 0,
        };
        apply_change(&pool, &change, &next).await.unwrap();

        let product =
            PersistedProduct::try_from(find_product(&pool, 1).await.unwrap().unwrap()).unwrap();
        assert_eq!(product.price.current(), 80.0);
        assert_eq!(product.stock.stock, 0);
        assert!(!product.is_active);

        let history = change_history(&pool, 1).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].old_price, 100.0);
        assert_eq!(history[0].new_stock, 0);
    }

    #[tokio::test]
    async fn apply_change_on_missing_product_leaves_no_audit_row() {
        let pool = setup_pool().await;
        create_product(&pool, &snapshot(1, 1.0, 1)).await.unwrap();
        let change = ChangeSet {
            product_id: 2,
            old_price: 1.0,
            new_price: 2.0,
            old_original_price: 1.0,
            new_original_price: 2.0,
            old_stock: 1,
            new_stock: 1,
        };
        assert!(apply_change(&pool, &change, &snapshot(2, 2.0, 1)).await.is_err());
        let cnt: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM change_records")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(cnt, 0);
    }

    #[tokio::test]
    async fn favorites_are_unique_and_ordered() {
        let pool = setup_pool().await;
        let a = get_or_create_user(&pool, "a@example.com", Some("a"), None).await.unwrap();
        let b = get_or_create_user(&pool, "b@example.com", None, None).await.unwrap();
        assert_eq!(
            get_or_create_user(&pool, "a@example.com", None, None).await.unwrap(),
            a
        );

        assert!(add_favorite(&pool, b, 9).await.unwrap());
        assert!(add_favorite(&pool, a, 9).await.unwrap());
        assert!(!add_favorite(&pool, a, 9).await.unwrap());
        assert_eq!(count_favorites_by_product(&pool, 9).await.unwrap(), 2);

        let favs = find_favorites_by_product(&pool, 9).await.unwrap();
        let users: Vec<i64> = favs.iter().map(|f| f.user_id).collect();
        assert_eq!(users, vec![b, a]);

        assert!(remove_favorite(&pool, b, 9).await.unwrap());
        assert_eq!(count_favorites_by_product(&pool, 9).await.unwrap(), 1);

        let user = find_user(&pool, a).await.unwrap().unwrap();
        assert_eq!(user.email, "a@example.com");
        assert!(find_user(&pool, 999).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn active_favorited_requires_flag_activity_and_a_fan() {
        let pool = setup_pool().await;
        let u = get_or_create_user(&pool, "u@example.com", None, None).await.unwrap();
        create_product(&pool, &snapshot(1, 1.0, 1)).await.unwrap();
        create_product(&pool, &snapshot(2, 1.0, 1)).await.unwrap();
        let mut unflagged = snapshot(3, 1.0, 1);
        unflagged.is_favorite = false;
        create_product(&pool, &unflagged).await.unwrap();

        add_favorite(&pool, u, 1).await.unwrap();
        add_favorite(&pool, u, 3).await.unwrap();
        assert_eq!(active_favorited_product_ids(&pool).await.unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn foreign_row_with_oversized_id_is_an_error() {
        let pool = setup_pool().await;
        let u = get_or_create_user(&pool, "u@example.com", None, None).await.unwrap();
        sqlx::query(
            "INSERT INTO products (id, name, price_info, stock_info, is_favorite) \
             VALUES (5000000000, 'Imported', '{}', '{}', 1)",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query("INSERT INTO user_favorites (user_id, product_id, added_at) VALUES (?, 5000000000, ?)")
            .bind(u)
            .bind(Utc::now())
            .execute(&pool)
            .await
            .unwrap();

        let err = active_favorited_product_ids(&pool).await.unwrap_err();
        assert!(err.to_string().contains("5000000000"));
    }
}
