//! Free-text → grocery item matching and preference mutation.
//!
//! Lookups are exact: list text is normalized (trimmed, lowercased) and
//! compared against the alias table. There is no fuzzy matching; new
//! phrasings are learned as aliases when the user confirms a choice.
//!
//! Every mutation here runs in one write transaction on the
//! [`PreferenceStore`] and preserves rank density (see [`crate::store`]).

use anyhow::Result;
use serde::Serialize;
use sqlx::SqliteConnection;

use crate::error::StoreError;
use crate::models::{Alias, GroceryItem, PreferredProduct, ProductInfo};
use crate::store::{
    self, alias_by_text, item_by_id, item_by_name, max_rank, move_to_rank, product_by_id,
    products_for_item, set_rank, shift_ranks, touch_item, PreferenceStore,
};

/// Canonical lookup form of a piece of list text.
pub fn normalize(text: &str) -> String {
    text.trim().to_lowercase()
}

/// Outcome of matching one piece of list text.
#[derive(Debug, Clone, Serialize)]
pub struct MatchResult {
    pub text: String,
    pub grocery_item: Option<GroceryItem>,
    /// Rank-ordered; empty when the item is unknown.
    pub preferred_products: Vec<PreferredProduct>,
    pub is_known: bool,
}

/// Look up `text` through the alias table.
pub async fn find_match(store: &PreferenceStore, text: &str) -> Result<MatchResult> {
    let normalized = normalize(text);
    let mut conn = store.pool().acquire().await?;

    let Some(alias) = alias_by_text(&mut conn, &normalized).await? else {
        return Ok(MatchResult {
            text: text.to_string(),
            grocery_item: None,
            preferred_products: Vec::new(),
            is_known: false,
        });
    };

    let item = item_by_id(&mut conn, alias.grocery_item_id).await?;
    let products = match &item {
        Some(item) => products_for_item(&mut conn, item.id).await?,
        None => Vec::new(),
    };

    Ok(MatchResult {
        text: text.to_string(),
        is_known: item.is_some(),
        grocery_item: item,
        preferred_products: products,
    })
}

/// Create a grocery item named by the normalized `name`, plus its
/// self-alias. Returns the existing item if the name is taken.
pub async fn create_grocery_item(store: &PreferenceStore, name: &str) -> Result<GroceryItem> {
    let normalized = normalize(name);
    if normalized.is_empty() {
        return Err(StoreError::Invalid("grocery item name must not be empty".into()).into());
    }

    let mut w = store.begin_write().await?;
    if let Some(existing) = item_by_name(w.conn(), &normalized).await? {
        return Ok(existing);
    }

    let now = store::now_ts();
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO grocery_items (name, created_at, updated_at) VALUES (?, ?, ?) RETURNING id",
    )
    .bind(&normalized)
    .bind(now)
    .bind(now)
    .fetch_one(w.conn())
    .await?;

    insert_alias(w.conn(), id, &normalized).await?;
    w.commit().await?;

    tracing::info!(grocery_item_id = id, name = %normalized, "Created grocery item");

    Ok(GroceryItem {
        id,
        name: normalized,
        created_at: now,
        updated_at: now,
    })
}

/// Map `text` to `grocery_item_id`.
///
/// Returns the existing alias when it already maps to this item; a
/// [`StoreError::Conflict`] when it maps elsewhere.
pub async fn add_alias(store: &PreferenceStore, grocery_item_id: i64, text: &str) -> Result<Alias> {
    let normalized = normalize(text);
    if normalized.is_empty() {
        return Err(StoreError::Invalid("alias must not be empty".into()).into());
    }

    let mut w = store.begin_write().await?;
    if item_by_id(w.conn(), grocery_item_id).await?.is_none() {
        return Err(StoreError::NotFound(format!("grocery item {}", grocery_item_id)).into());
    }

    match alias_by_text(w.conn(), &normalized).await? {
        Some(existing) if existing.grocery_item_id == grocery_item_id => return Ok(existing),
        Some(existing) => {
            return Err(StoreError::Conflict {
                alias: normalized,
                existing_item_id: existing.grocery_item_id,
            }
            .into())
        }
        None => {}
    }

    let id = insert_alias(w.conn(), grocery_item_id, &normalized).await?;
    touch_item(w.conn(), grocery_item_id).await?;
    w.commit().await?;
    Ok(Alias {
        id,
        grocery_item_id,
        alias: normalized,
    })
}

async fn insert_alias(conn: &mut SqliteConnection, grocery_item_id: i64, alias: &str) -> Result<i64> {
    let result: Result<i64, sqlx::Error> =
        sqlx::query_scalar("INSERT INTO aliases (grocery_item_id, alias) VALUES (?, ?) RETURNING id")
            .bind(grocery_item_id)
            .bind(alias)
            .fetch_one(&mut *conn)
            .await;

    match result {
        Ok(id) => Ok(id),
        Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
            let existing_item_id = alias_by_text(conn, alias)
                .await?
                .map(|a| a.grocery_item_id)
                .unwrap_or_default();
            Err(StoreError::Conflict {
                alias: alias.to_string(),
                existing_item_id,
            }
            .into())
        }
        Err(e) => Err(e.into()),
    }
}

/// Add or refresh a preferred product for an item.
///
/// An existing product (same URL, else same exact name) has its metadata
/// refreshed and, when `rank` is given, is moved there. A new product is
/// appended at the bottom or inserted at `rank` with the products from
/// that rank down shifted by one. Explicit ranks are clamped into range.
pub async fn add_preferred_product(
    store: &PreferenceStore,
    grocery_item_id: i64,
    info: &ProductInfo,
    rank: Option<i64>,
) -> Result<PreferredProduct> {
    let info = clean(info)?;

    let mut w = store.begin_write().await?;
    if item_by_id(w.conn(), grocery_item_id).await?.is_none() {
        return Err(StoreError::NotFound(format!("grocery item {}", grocery_item_id)).into());
    }

    let product_id = match find_existing(w.conn(), grocery_item_id, &info).await? {
        Some(existing) => {
            refresh_metadata(w.conn(), existing.id, &info).await?;
            if let Some(rank) = rank {
                move_to_rank(w.conn(), &existing, rank).await?;
            }
            existing.id
        }
        None => insert_product(w.conn(), grocery_item_id, &info, rank).await?,
    };

    touch_item(w.conn(), grocery_item_id).await?;
    let product = product_by_id(w.conn(), product_id)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("preferred product {}", product_id)))?;
    w.commit().await?;
    Ok(product)
}

/// Swap a product with the one directly above it. No-op at rank 1.
pub async fn promote_product(store: &PreferenceStore, product_id: i64) -> Result<PreferredProduct> {
    let mut w = store.begin_write().await?;
    let product = product_by_id(w.conn(), product_id)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("preferred product {}", product_id)))?;

    if product.rank <= 1 {
        return Ok(product);
    }

    let above = product.rank - 1;
    set_rank(w.conn(), product.id, 0).await?;
    sqlx::query("UPDATE preferred_products SET rank = ? WHERE grocery_item_id = ? AND rank = ?")
        .bind(product.rank)
        .bind(product.grocery_item_id)
        .bind(above)
        .execute(w.conn())
        .await?;
    set_rank(w.conn(), product.id, above).await?;
    touch_item(w.conn(), product.grocery_item_id).await?;
    w.commit().await?;

    tracing::debug!(product_id, rank = above, "Promoted preferred product");

    Ok(PreferredProduct {
        rank: above,
        ..product
    })
}

/// Make `info` the rank-1 product for an item, pushing the others down.
pub async fn make_top_choice(
    store: &PreferenceStore,
    grocery_item_id: i64,
    info: &ProductInfo,
) -> Result<PreferredProduct> {
    add_preferred_product(store, grocery_item_id, info, Some(1)).await
}

fn clean(info: &ProductInfo) -> Result<ProductInfo> {
    let name = info.name.trim();
    if name.is_empty() {
        return Err(StoreError::Invalid("product name must not be empty".into()).into());
    }
    let opt = |v: &Option<String>| {
        v.as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    Ok(ProductInfo {
        name: name.to_string(),
        url: opt(&info.url),
        brand: opt(&info.brand),
        image_url: opt(&info.image_url),
        size: opt(&info.size),
    })
}

async fn find_existing(
    conn: &mut SqliteConnection,
    grocery_item_id: i64,
    info: &ProductInfo,
) -> Result<Option<PreferredProduct>> {
    let products = products_for_item(conn, grocery_item_id).await?;
    if let Some(url) = &info.url {
        if let Some(p) = products
            .iter()
            .find(|p| p.product_url.as_deref() == Some(url.as_str()))
        {
            return Ok(Some(p.clone()));
        }
    }
    Ok(products.into_iter().find(|p| p.product_name == info.name))
}

async fn refresh_metadata(conn: &mut SqliteConnection, product_id: i64, info: &ProductInfo) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE preferred_products
        SET product_name = ?,
            product_url = COALESCE(?, product_url),
            brand = COALESCE(?, brand),
            image_url = COALESCE(?, image_url),
            size = COALESCE(?, size)
        WHERE id = ?
        "#,
    )
    .bind(&info.name)
    .bind(&info.url)
    .bind(&info.brand)
    .bind(&info.image_url)
    .bind(&info.size)
    .bind(product_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn insert_product(
    conn: &mut SqliteConnection,
    grocery_item_id: i64,
    info: &ProductInfo,
    rank: Option<i64>,
) -> Result<i64> {
    let max = max_rank(conn, grocery_item_id).await?;
    let rank = match rank {
        Some(r) => r.clamp(1, max + 1),
        None => max + 1,
    };
    shift_ranks(conn, grocery_item_id, rank, max, 1).await?;

    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO preferred_products
            (grocery_item_id, rank, product_name, product_url, brand, image_url, size)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        RETURNING id
        "#,
    )
    .bind(grocery_item_id)
    .bind(rank)
    .bind(&info.name)
    .bind(&info.url)
    .bind(&info.brand)
    .bind(&info.image_url)
    .bind(&info.size)
    .fetch_one(&mut *conn)
    .await?;
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::temp_store;
    use std::sync::Arc;

    fn names(products: &[PreferredProduct]) -> Vec<&str> {
        products.iter().map(|p| p.product_name.as_str()).collect()
    }

    async fn assert_dense(store: &PreferenceStore, item_id: i64) {
        let ranks = store.product_ranks(item_id).await.unwrap();
        let expected: Vec<i64> = (1..=ranks.len() as i64).collect();
        assert_eq!(ranks, expected);
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("  Whole MILK \n"), "whole milk");
        assert_eq!(normalize("2% Milk"), "2% milk");
        assert_eq!(normalize("   "), "");
        for text in ["  Whole MILK \n", "2% Milk", "ÉCLAIRS", "   ", "a\tb"] {
            let once = normalize(text);
            assert_eq!(normalize(&once), once);
        }
    }

    #[tokio::test]
    async fn test_unknown_text_is_not_known() {
        let (_tmp, store) = temp_store().await;
        let m = find_match(&store, "quinoa").await.unwrap();
        assert!(!m.is_known);
        assert!(m.grocery_item.is_none());
        assert!(m.preferred_products.is_empty());
        assert_eq!(m.text, "quinoa");
    }

    #[tokio::test]
    async fn test_create_is_idempotent_and_self_aliased() {
        let (_tmp, store) = temp_store().await;
        let a = create_grocery_item(&store, " Milk ").await.unwrap();
        let b = create_grocery_item(&store, "milk").await.unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.name, "milk");

        let m = find_match(&store, "MILK").await.unwrap();
        assert!(m.is_known);
        assert_eq!(m.grocery_item.unwrap().id, a.id);
    }

    #[tokio::test]
    async fn test_create_rejects_blank_name() {
        let (_tmp, store) = temp_store().await;
        let err = create_grocery_item(&store, "  ").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn test_alias_maps_to_one_item() {
        let (_tmp, store) = temp_store().await;
        let milk = create_grocery_item(&store, "milk").await.unwrap();
        let cream = create_grocery_item(&store, "cream").await.unwrap();

        let first = add_alias(&store, milk.id, "2% Milk").await.unwrap();
        assert_eq!(first.alias, "2% milk");
        // same item again returns the existing row
        let again = add_alias(&store, milk.id, "2% milk").await.unwrap();
        assert_eq!(again.id, first.id);

        let err = add_alias(&store, cream.id, "2% milk").await.unwrap_err();
        match err.downcast_ref::<StoreError>() {
            Some(StoreError::Conflict {
                alias,
                existing_item_id,
            }) => {
                assert_eq!(alias, "2% milk");
                assert_eq!(*existing_item_id, milk.id);
            }
            other => panic!("expected conflict, got {:?}", other),
        }

        let m = find_match(&store, "2% milk").await.unwrap();
        assert_eq!(m.grocery_item.unwrap().id, milk.id);
    }

    #[tokio::test]
    async fn test_add_alias_unknown_item() {
        let (_tmp, store) = temp_store().await;
        let err = add_alias(&store, 999, "anything").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_append_and_insert_keep_ranks_dense() {
        let (_tmp, store) = temp_store().await;
        let item = create_grocery_item(&store, "milk").await.unwrap();

        for name in ["A", "B", "C"] {
            add_preferred_product(&store, item.id, &ProductInfo::named(name), None)
                .await
                .unwrap();
        }
        let d = add_preferred_product(&store, item.id, &ProductInfo::named("D"), Some(2))
            .await
            .unwrap();
        assert_eq!(d.rank, 2);

        // out-of-range ranks clamp
        let e = add_preferred_product(&store, item.id, &ProductInfo::named("E"), Some(99))
            .await
            .unwrap();
        assert_eq!(e.rank, 5);
        let f = add_preferred_product(&store, item.id, &ProductInfo::named("F"), Some(-3))
            .await
            .unwrap();
        assert_eq!(f.rank, 1);

        let m = find_match(&store, "milk").await.unwrap();
        assert_eq!(names(&m.preferred_products), vec!["F", "A", "D", "B", "C", "E"]);
        assert_dense(&store, item.id).await;
    }

    #[tokio::test]
    async fn test_existing_product_is_refreshed_not_duplicated() {
        let (_tmp, store) = temp_store().await;
        let item = create_grocery_item(&store, "milk").await.unwrap();
        let info = ProductInfo::named("Brand X Milk").with_url("https://shop.example/p/1");
        let first = add_preferred_product(&store, item.id, &info, None).await.unwrap();

        let renamed = ProductInfo {
            name: "Brand X Whole Milk".into(),
            url: Some("https://shop.example/p/1".into()),
            brand: Some("Brand X".into()),
            ..Default::default()
        };
        let second = add_preferred_product(&store, item.id, &renamed, None)
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.product_name, "Brand X Whole Milk");
        assert_eq!(second.brand.as_deref(), Some("Brand X"));
        assert_eq!(store.product_ranks(item.id).await.unwrap(), vec![1]);

        // absent optional fields do not clear stored ones
        let bare = ProductInfo::named("Brand X Whole Milk");
        let third = add_preferred_product(&store, item.id, &bare, None).await.unwrap();
        assert_eq!(third.product_url.as_deref(), Some("https://shop.example/p/1"));
        assert_eq!(third.brand.as_deref(), Some("Brand X"));
    }

    #[tokio::test]
    async fn test_existing_product_moves_to_explicit_rank() {
        let (_tmp, store) = temp_store().await;
        let item = create_grocery_item(&store, "milk").await.unwrap();
        for name in ["A", "B", "C", "D"] {
            add_preferred_product(&store, item.id, &ProductInfo::named(name), None)
                .await
                .unwrap();
        }

        add_preferred_product(&store, item.id, &ProductInfo::named("A"), Some(3))
            .await
            .unwrap();
        let m = find_match(&store, "milk").await.unwrap();
        assert_eq!(names(&m.preferred_products), vec!["B", "C", "A", "D"]);

        add_preferred_product(&store, item.id, &ProductInfo::named("D"), Some(1))
            .await
            .unwrap();
        let m = find_match(&store, "milk").await.unwrap();
        assert_eq!(names(&m.preferred_products), vec!["D", "B", "C", "A"]);
        assert_dense(&store, item.id).await;
    }

    #[tokio::test]
    async fn test_promote_swaps_with_neighbour() {
        let (_tmp, store) = temp_store().await;
        let item = create_grocery_item(&store, "milk").await.unwrap();
        let mut ids = Vec::new();
        for name in ["A", "B", "C"] {
            let p = add_preferred_product(&store, item.id, &ProductInfo::named(name), None)
                .await
                .unwrap();
            ids.push(p.id);
        }

        let promoted = promote_product(&store, ids[2]).await.unwrap();
        assert_eq!(promoted.rank, 2);
        let m = find_match(&store, "milk").await.unwrap();
        assert_eq!(names(&m.preferred_products), vec!["A", "C", "B"]);

        let top = promote_product(&store, ids[0]).await.unwrap();
        assert_eq!(top.rank, 1);
        assert_dense(&store, item.id).await;
    }

    #[tokio::test]
    async fn test_make_top_choice() {
        let (_tmp, store) = temp_store().await;
        let item = create_grocery_item(&store, "milk").await.unwrap();
        for name in ["X", "Y", "Z"] {
            add_preferred_product(&store, item.id, &ProductInfo::named(name), None)
                .await
                .unwrap();
        }

        make_top_choice(&store, item.id, &ProductInfo::named("Z"))
            .await
            .unwrap();
        let m = find_match(&store, "milk").await.unwrap();
        assert_eq!(names(&m.preferred_products), vec!["Z", "X", "Y"]);

        make_top_choice(&store, item.id, &ProductInfo::named("W"))
            .await
            .unwrap();
        let m = find_match(&store, "milk").await.unwrap();
        assert_eq!(names(&m.preferred_products), vec!["W", "Z", "X", "Y"]);
        assert_dense(&store, item.id).await;
    }

    #[tokio::test]
    async fn test_top_choice_already_first_is_unchanged() {
        let (_tmp, store) = temp_store().await;
        let item = create_grocery_item(&store, "milk").await.unwrap();
        for name in ["A", "B", "C"] {
            add_preferred_product(&store, item.id, &ProductInfo::named(name), None)
                .await
                .unwrap();
        }
        let before = find_match(&store, "milk").await.unwrap().preferred_products;

        let top = make_top_choice(&store, item.id, &ProductInfo::named("A"))
            .await
            .unwrap();
        assert_eq!(top.id, before[0].id);
        assert_eq!(top.rank, 1);

        let after = find_match(&store, "milk").await.unwrap().preferred_products;
        let ranked = |ps: &[PreferredProduct]| -> Vec<(i64, i64)> {
            ps.iter().map(|p| (p.id, p.rank)).collect()
        };
        assert_eq!(ranked(&after), ranked(&before));
        assert_eq!(names(&after), vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn test_concurrent_mutations_keep_ranks_dense() {
        let (_tmp, store) = temp_store().await;
        let store = Arc::new(store);
        let item = create_grocery_item(&store, "milk").await.unwrap();

        let mut handles = Vec::new();
        for i in 0..12 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let info = ProductInfo::named(format!("P{}", i % 6));
                if i % 2 == 0 {
                    make_top_choice(&store, item.id, &info).await.unwrap();
                } else {
                    add_preferred_product(&store, item.id, &info, Some(2))
                        .await
                        .unwrap();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let ranks = store.product_ranks(item.id).await.unwrap();
        assert_eq!(ranks.len(), 6);
        assert_dense(&store, item.id).await;
    }
}
