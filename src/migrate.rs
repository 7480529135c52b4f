use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index. Safe to run repeatedly.
pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS grocery_items (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS aliases (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            grocery_item_id INTEGER NOT NULL,
            alias TEXT NOT NULL UNIQUE,
            FOREIGN KEY (grocery_item_id) REFERENCES grocery_items(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    // (grocery_item_id, rank) uniqueness is checked per row, so rank shifts
    // must park rows on out-of-range values first.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS preferred_products (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            grocery_item_id INTEGER NOT NULL,
            rank INTEGER NOT NULL,
            product_name TEXT NOT NULL,
            product_url TEXT,
            brand TEXT,
            image_url TEXT,
            size TEXT,
            last_seen_in_stock INTEGER,
            UNIQUE(grocery_item_id, rank),
            FOREIGN KEY (grocery_item_id) REFERENCES grocery_items(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS order_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id TEXT NOT NULL,
            list_text TEXT NOT NULL,
            matched_grocery_item_id INTEGER,
            proposed_product TEXT,
            final_product TEXT,
            was_corrected INTEGER NOT NULL DEFAULT 0,
            added_to_cart INTEGER NOT NULL DEFAULT 0,
            skipped INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (matched_grocery_item_id) REFERENCES grocery_items(id) ON DELETE SET NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_aliases_item ON aliases(grocery_item_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_products_item ON preferred_products(grocery_item_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_order_log_session ON order_log(session_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_order_log_created_at ON order_log(created_at DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
