//! Database module: row models and SQL repositories.
//!
//! - `model`: row shapes returned by queries.
//! - `repo`: SQL-only functions over a SQLite pool.
//!
//! The pipeline talks to the database through the [`ChangeStore`] trait;
//! [`SqliteStore`] is the production implementation and simply delegates to
//! the repository functions.

pub mod model;
pub mod repo;

use anyhow::Result;
use async_trait::async_trait;

use crate::model::{ChangeSet, FavoriteRelation, User};
use crate::snapshot::ProductSnapshot;

pub use model::{ProductFields, StoredProduct};
pub use repo::*;

#[async_trait]
pub trait ChangeStore: Send + Sync {
    async fn find_product(&self, id: u32) -> Result<Option<StoredProduct>>;

    async fn create_product(&self, snapshot: &ProductSnapshot) -> Result<()>;

    /// Append the audit row and update the live product in one transaction.
    async fn apply_change(&self, change: &ChangeSet, snapshot: &ProductSnapshot) -> Result<i64>;

    async fn find_favorites_by_product(&self, product_id: u32) -> Result<Vec<FavoriteRelation>>;

    async fn find_user(&self, user_id: i64) -> Result<Option<User>>;

    async fn count_favorites_by_product(&self, product_id: u32) -> Result<i64>;

    async fn active_favorited_product_ids(&self) -> Result<Vec<u32>>;
}

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: Pool,
}

impl SqliteStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

#[async_trait]
impl ChangeStore for SqliteStore {
    async fn find_product(&self, id: u32) -> Result<Option<StoredProduct>> {
        repo::find_product(&self.pool, id).await
    }

    async fn create_product(&self, snapshot: &ProductSnapshot) -> Result<()> {
        repo::create_product(&self.pool, snapshot).await
    }

    async fn apply_change(&self, change: &ChangeSet, snapshot: &ProductSnapshot) -> Result<i64> {
        repo::apply_change(&self.pool, change, snapshot).await
    }

    async fn find_favorites_by_product(&self, product_id: u32) -> Result<Vec<FavoriteRelation>> {
        repo::find_favorites_by_product(&self.pool, product_id).await
    }

    async fn find_user(&self, user_id: i64) -> Result<Option<User>> {
        repo::find_user(&self.pool, user_id).await
    }

    async fn count_favorites_by_product(&self, product_id: u32) -> Result<i64> {
        repo::count_favorites_by_product(&self.pool, product_id).await
    }

    async fn active_favorited_product_ids(&self) -> Result<Vec<u32>> {
        repo::active_favorited_product_ids(&self.pool).await
    }
}
