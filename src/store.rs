//! SQLite-backed preference store.
//!
//! Owns the connection pool and a writer lock. Every logical write runs
//! inside one transaction taken through [`PreferenceStore::begin_write`],
//! so two resolutions touching the same grocery item can never interleave
//! their rank shifts.
//!
//! # Rank density
//!
//! Each grocery item's preferred products carry ranks `1..=n` with no gaps
//! and no duplicates, and `(grocery_item_id, rank)` is `UNIQUE`. SQLite
//! checks that constraint row by row, so a plain `rank = rank + 1` over a
//! range fails halfway. Rank changes therefore always run as three steps:
//!
//! 1. **vacate**: park the moving rows on out-of-range values (`0` for a
//!    single row, negatives for a range),
//! 2. **move**: write the rows that now have a free slot,
//! 3. **restore**: flip the parked rows back to their final positive rank.
//!
//! No statement ever leaves two rows on the same `(item, rank)`.

use anyhow::Result;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool, Transaction};
use tokio::sync::{Mutex, MutexGuard};

use crate::config::Config;
use crate::db;
use crate::error::StoreError;
use crate::migrate;
use crate::models::{Alias, GroceryItem, GroceryItemDetail, PreferredProduct};

pub(crate) const PRODUCT_COLUMNS: &str = "id, grocery_item_id, rank, product_name, product_url, brand, image_url, size, last_seen_in_stock";

/// The durable preference store shared by every session.
pub struct PreferenceStore {
    pool: SqlitePool,
    writer: Mutex<()>,
}

/// An open write transaction holding the store's writer lock.
///
/// Dropping it without [`commit`](WriteTx::commit) rolls back.
pub struct WriteTx<'a> {
    tx: Transaction<'static, Sqlite>,
    _guard: MutexGuard<'a, ()>,
}

impl WriteTx<'_> {
    pub fn conn(&mut self) -> &mut SqliteConnection {
        &mut *self.tx
    }

    pub async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

impl PreferenceStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            writer: Mutex::new(()),
        }
    }

    /// Connect to the configured database and make sure the schema exists.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::apply_schema(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Wait for the writer lock and open a transaction.
    pub async fn begin_write(&self) -> Result<WriteTx<'_>> {
        let guard = self.writer.lock().await;
        let tx = self.pool.begin().await?;
        Ok(WriteTx { tx, _guard: guard })
    }

    pub async fn list_grocery_items(&self) -> Result<Vec<GroceryItemDetail>> {
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query(
            "SELECT id, name, created_at, updated_at FROM grocery_items ORDER BY name ASC",
        )
        .fetch_all(&mut *conn)
        .await?;

        let mut details = Vec::with_capacity(rows.len());
        for row in &rows {
            let item = item_from_row(row);
            let aliases = aliases_for_item(&mut conn, item.id).await?;
            let products = products_for_item(&mut conn, item.id).await?;
            details.push(GroceryItemDetail {
                item,
                aliases,
                products,
            });
        }
        Ok(details)
    }

    pub async fn get_grocery_item(&self, id: i64) -> Result<Option<GroceryItemDetail>> {
        let mut conn = self.pool.acquire().await?;
        let Some(item) = item_by_id(&mut conn, id).await? else {
            return Ok(None);
        };
        let aliases = aliases_for_item(&mut conn, id).await?;
        let products = products_for_item(&mut conn, id).await?;
        Ok(Some(GroceryItemDetail {
            item,
            aliases,
            products,
        }))
    }

    pub async fn get_product(&self, id: i64) -> Result<Option<PreferredProduct>> {
        let mut conn = self.pool.acquire().await?;
        product_by_id(&mut conn, id).await
    }

    /// Ranks of an item's products in ascending order.
    pub async fn product_ranks(&self, grocery_item_id: i64) -> Result<Vec<i64>> {
        let ranks: Vec<i64> = sqlx::query_scalar(
            "SELECT rank FROM preferred_products WHERE grocery_item_id = ? ORDER BY rank ASC",
        )
        .bind(grocery_item_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ranks)
    }

    /// Delete an item; aliases and preferred products cascade.
    pub async fn delete_grocery_item(&self, id: i64) -> Result<bool> {
        let mut w = self.begin_write().await?;
        let result = sqlx::query("DELETE FROM grocery_items WHERE id = ?")
            .bind(id)
            .execute(w.conn())
            .await?;
        w.commit().await?;
        if result.rows_affected() > 0 {
            tracing::info!(grocery_item_id = id, "Deleted grocery item");
        }
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_alias(&self, alias_id: i64) -> Result<bool> {
        let mut w = self.begin_write().await?;
        let result = sqlx::query("DELETE FROM aliases WHERE id = ?")
            .bind(alias_id)
            .execute(w.conn())
            .await?;
        w.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete a preferred product and close the gap it leaves in the ranking.
    pub async fn delete_preferred_product(&self, product_id: i64) -> Result<bool> {
        let mut w = self.begin_write().await?;
        let Some(product) = product_by_id(w.conn(), product_id).await? else {
            return Ok(false);
        };

        sqlx::query("DELETE FROM preferred_products WHERE id = ?")
            .bind(product_id)
            .execute(w.conn())
            .await?;
        renumber(w.conn(), product.grocery_item_id).await?;
        touch_item(w.conn(), product.grocery_item_id).await?;
        w.commit().await?;
        Ok(true)
    }

    /// Fold `source_id` into `target_id`.
    ///
    /// Aliases move over. Source products are appended after the target's
    /// last rank unless the target already has them (same URL, else same
    /// name). The source item is deleted.
    pub async fn merge_grocery_items(
        &self,
        source_id: i64,
        target_id: i64,
    ) -> Result<GroceryItemDetail> {
        if source_id == target_id {
            return Err(StoreError::Invalid("cannot merge an item with itself".into()).into());
        }

        let mut w = self.begin_write().await?;
        if item_by_id(w.conn(), source_id).await?.is_none() {
            return Err(StoreError::NotFound(format!("grocery item {}", source_id)).into());
        }
        if item_by_id(w.conn(), target_id).await?.is_none() {
            return Err(StoreError::NotFound(format!("grocery item {}", target_id)).into());
        }

        sqlx::query("UPDATE aliases SET grocery_item_id = ? WHERE grocery_item_id = ?")
            .bind(target_id)
            .bind(source_id)
            .execute(w.conn())
            .await?;

        let target_products = products_for_item(w.conn(), target_id).await?;
        let mut next_rank = max_rank(w.conn(), target_id).await? + 1;

        for product in products_for_item(w.conn(), source_id).await? {
            let duplicate = target_products.iter().any(|t| {
                match (&t.product_url, &product.product_url) {
                    (Some(a), Some(b)) if a == b => true,
                    _ => t.product_name == product.product_name,
                }
            });
            if duplicate {
                sqlx::query("DELETE FROM preferred_products WHERE id = ?")
                    .bind(product.id)
                    .execute(w.conn())
                    .await?;
                continue;
            }
            sqlx::query("UPDATE preferred_products SET grocery_item_id = ?, rank = ? WHERE id = ?")
                .bind(target_id)
                .bind(next_rank)
                .bind(product.id)
                .execute(w.conn())
                .await?;
            next_rank += 1;
        }

        sqlx::query("DELETE FROM grocery_items WHERE id = ?")
            .bind(source_id)
            .execute(w.conn())
            .await?;
        touch_item(w.conn(), target_id).await?;
        w.commit().await?;

        tracing::info!(source_id, target_id, "Merged grocery items");

        self.get_grocery_item(target_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("grocery item {}", target_id)).into())
    }

    /// Record that a preferred product was seen in stock at `at` (unix seconds).
    pub async fn mark_seen_in_stock(&self, product_id: i64, at: i64) -> Result<()> {
        let mut w = self.begin_write().await?;
        sqlx::query("UPDATE preferred_products SET last_seen_in_stock = ? WHERE id = ?")
            .bind(at)
            .bind(product_id)
            .execute(w.conn())
            .await?;
        w.commit().await?;
        Ok(())
    }
}

pub(crate) fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

pub(crate) fn item_from_row(row: &SqliteRow) -> GroceryItem {
    GroceryItem {
        id: row.get("id"),
        name: row.get("name"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

pub(crate) fn alias_from_row(row: &SqliteRow) -> Alias {
    Alias {
        id: row.get("id"),
        grocery_item_id: row.get("grocery_item_id"),
        alias: row.get("alias"),
    }
}

pub(crate) fn product_from_row(row: &SqliteRow) -> PreferredProduct {
    PreferredProduct {
        id: row.get("id"),
        grocery_item_id: row.get("grocery_item_id"),
        rank: row.get("rank"),
        product_name: row.get("product_name"),
        product_url: row.get("product_url"),
        brand: row.get("brand"),
        image_url: row.get("image_url"),
        size: row.get("size"),
        last_seen_in_stock: row.get("last_seen_in_stock"),
    }
}

pub(crate) async fn item_by_id(conn: &mut SqliteConnection, id: i64) -> Result<Option<GroceryItem>> {
    let row = sqlx::query("SELECT id, name, created_at, updated_at FROM grocery_items WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.as_ref().map(item_from_row))
}

pub(crate) async fn item_by_name(
    conn: &mut SqliteConnection,
    name: &str,
) -> Result<Option<GroceryItem>> {
    let row =
        sqlx::query("SELECT id, name, created_at, updated_at FROM grocery_items WHERE name = ?")
            .bind(name)
            .fetch_optional(&mut *conn)
            .await?;
    Ok(row.as_ref().map(item_from_row))
}

pub(crate) async fn alias_by_text(
    conn: &mut SqliteConnection,
    alias: &str,
) -> Result<Option<Alias>> {
    let row = sqlx::query("SELECT id, grocery_item_id, alias FROM aliases WHERE alias = ?")
        .bind(alias)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.as_ref().map(alias_from_row))
}

pub(crate) async fn aliases_for_item(
    conn: &mut SqliteConnection,
    grocery_item_id: i64,
) -> Result<Vec<Alias>> {
    let rows = sqlx::query(
        "SELECT id, grocery_item_id, alias FROM aliases WHERE grocery_item_id = ? ORDER BY alias ASC",
    )
    .bind(grocery_item_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows.iter().map(alias_from_row).collect())
}

/// Products for an item in ascending rank order.
pub(crate) async fn products_for_item(
    conn: &mut SqliteConnection,
    grocery_item_id: i64,
) -> Result<Vec<PreferredProduct>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM preferred_products WHERE grocery_item_id = ? ORDER BY rank ASC",
        PRODUCT_COLUMNS
    ))
    .bind(grocery_item_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows.iter().map(product_from_row).collect())
}

pub(crate) async fn product_by_id(
    conn: &mut SqliteConnection,
    id: i64,
) -> Result<Option<PreferredProduct>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM preferred_products WHERE id = ?",
        PRODUCT_COLUMNS
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row.as_ref().map(product_from_row))
}

pub(crate) async fn max_rank(conn: &mut SqliteConnection, grocery_item_id: i64) -> Result<i64> {
    let max: Option<i64> =
        sqlx::query_scalar("SELECT MAX(rank) FROM preferred_products WHERE grocery_item_id = ?")
            .bind(grocery_item_id)
            .fetch_one(&mut *conn)
            .await?;
    Ok(max.unwrap_or(0))
}

pub(crate) async fn touch_item(conn: &mut SqliteConnection, grocery_item_id: i64) -> Result<()> {
    sqlx::query("UPDATE grocery_items SET updated_at = ? WHERE id = ?")
        .bind(now_ts())
        .bind(grocery_item_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Shift every rank in `from..=to` by `delta` (+1 or -1).
///
/// Rows are parked on negatives first, then flipped back, so the
/// `(item, rank)` constraint holds after every statement. Any row parked
/// on `0` by the caller is left alone.
pub(crate) async fn shift_ranks(
    conn: &mut SqliteConnection,
    grocery_item_id: i64,
    from: i64,
    to: i64,
    delta: i64,
) -> Result<()> {
    if from > to {
        return Ok(());
    }
    sqlx::query(
        "UPDATE preferred_products SET rank = -(rank + ?) WHERE grocery_item_id = ? AND rank >= ? AND rank <= ?",
    )
    .bind(delta)
    .bind(grocery_item_id)
    .bind(from.max(1))
    .bind(to)
    .execute(&mut *conn)
    .await?;
    sqlx::query("UPDATE preferred_products SET rank = -rank WHERE grocery_item_id = ? AND rank < 0")
        .bind(grocery_item_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub(crate) async fn set_rank(conn: &mut SqliteConnection, product_id: i64, rank: i64) -> Result<()> {
    sqlx::query("UPDATE preferred_products SET rank = ? WHERE id = ?")
        .bind(rank)
        .bind(product_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Move one product to `target`, shifting the rows in between by one.
///
/// `target` is clamped to `1..=max_rank`.
pub(crate) async fn move_to_rank(
    conn: &mut SqliteConnection,
    product: &PreferredProduct,
    target: i64,
) -> Result<()> {
    let max = max_rank(conn, product.grocery_item_id).await?;
    let target = target.clamp(1, max.max(1));
    let current = product.rank;
    if target == current {
        return Ok(());
    }

    set_rank(conn, product.id, 0).await?;
    if target < current {
        shift_ranks(conn, product.grocery_item_id, target, current - 1, 1).await?;
    } else {
        shift_ranks(conn, product.grocery_item_id, current + 1, target, -1).await?;
    }
    set_rank(conn, product.id, target).await?;
    Ok(())
}

/// Rewrite an item's ranks as `1..=n`, keeping their relative order.
pub(crate) async fn renumber(conn: &mut SqliteConnection, grocery_item_id: i64) -> Result<()> {
    let ids: Vec<i64> = sqlx::query_scalar(
        "SELECT id FROM preferred_products WHERE grocery_item_id = ? ORDER BY rank ASC",
    )
    .bind(grocery_item_id)
    .fetch_all(&mut *conn)
    .await?;

    for (position, id) in ids.iter().enumerate() {
        set_rank(conn, *id, -(position as i64 + 1)).await?;
    }
    sqlx::query("UPDATE preferred_products SET rank = -rank WHERE grocery_item_id = ? AND rank < 0")
        .bind(grocery_item_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use tempfile::TempDir;

    pub(crate) fn temp_config(tmp: &TempDir) -> Config {
        let path = tmp.path().join("aisle.sqlite");
        toml::from_str(&format!("[db]\npath = \"{}\"\n", path.display())).unwrap()
    }

    /// A migrated store in a throwaway directory. Keep the `TempDir` alive.
    pub(crate) async fn temp_store() -> (TempDir, PreferenceStore) {
        let tmp = TempDir::new().unwrap();
        let store = PreferenceStore::open(&temp_config(&tmp)).await.unwrap();
        (tmp, store)
    }
}
