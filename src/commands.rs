//! CLI command implementations.
//!
//! Each `run_*` function opens the store, performs one operation and
//! prints a human-readable result to stdout. Errors propagate to `main`.

use anyhow::Result;

use crate::config::Config;
use crate::history::{clear_history, delete_session_history, list_history};
use crate::matcher::{
    add_alias, add_preferred_product, create_grocery_item, find_match, make_top_choice,
    promote_product,
};
use crate::models::{GroceryItemDetail, PreferredProduct, ProductInfo};
use crate::store::PreferenceStore;

async fn open_store(config: &Config) -> Result<PreferenceStore> {
    PreferenceStore::open(config).await
}

pub async fn run_items(config: &Config) -> Result<()> {
    let store = open_store(config).await?;
    let items = store.list_grocery_items().await?;
    if items.is_empty() {
        println!("No grocery items.");
        return Ok(());
    }
    for detail in &items {
        print_item(detail);
    }
    Ok(())
}

pub async fn run_item_add(config: &Config, name: &str) -> Result<()> {
    let store = open_store(config).await?;
    let item = create_grocery_item(&store, name).await?;
    println!("Grocery item {} '{}'", item.id, item.name);
    Ok(())
}

pub async fn run_item_delete(config: &Config, id: i64) -> Result<()> {
    let store = open_store(config).await?;
    if store.delete_grocery_item(id).await? {
        println!("Deleted grocery item {}.", id);
    } else {
        println!("Grocery item {} not found.", id);
    }
    Ok(())
}

pub async fn run_item_merge(config: &Config, source_id: i64, target_id: i64) -> Result<()> {
    let store = open_store(config).await?;
    let merged = store.merge_grocery_items(source_id, target_id).await?;
    println!("Merged grocery item {} into {}:", source_id, target_id);
    print_item(&merged);
    Ok(())
}

pub async fn run_alias_add(config: &Config, item_id: i64, text: &str) -> Result<()> {
    let store = open_store(config).await?;
    let alias = add_alias(&store, item_id, text).await?;
    println!(
        "Alias {} '{}' -> grocery item {}",
        alias.id, alias.alias, alias.grocery_item_id
    );
    Ok(())
}

pub async fn run_alias_delete(config: &Config, alias_id: i64) -> Result<()> {
    let store = open_store(config).await?;
    if store.delete_alias(alias_id).await? {
        println!("Deleted alias {}.", alias_id);
    } else {
        println!("Alias {} not found.", alias_id);
    }
    Ok(())
}

pub async fn run_product_add(
    config: &Config,
    item_id: i64,
    product: &ProductInfo,
    rank: Option<i64>,
) -> Result<()> {
    let store = open_store(config).await?;
    let saved = add_preferred_product(&store, item_id, product, rank).await?;
    print_saved_product(&saved);
    Ok(())
}

pub async fn run_product_top(config: &Config, item_id: i64, product: &ProductInfo) -> Result<()> {
    let store = open_store(config).await?;
    let saved = make_top_choice(&store, item_id, product).await?;
    print_saved_product(&saved);
    Ok(())
}

pub async fn run_product_promote(config: &Config, product_id: i64) -> Result<()> {
    let store = open_store(config).await?;
    let saved = promote_product(&store, product_id).await?;
    print_saved_product(&saved);
    Ok(())
}

pub async fn run_product_delete(config: &Config, product_id: i64) -> Result<()> {
    let store = open_store(config).await?;
    if store.delete_preferred_product(product_id).await? {
        println!("Deleted preferred product {}.", product_id);
    } else {
        println!("Preferred product {} not found.", product_id);
    }
    Ok(())
}

pub async fn run_match(config: &Config, text: &str) -> Result<()> {
    let store = open_store(config).await?;
    let result = find_match(&store, text).await?;
    match &result.grocery_item {
        Some(item) => println!("'{}' -> grocery item {} '{}'", result.text, item.id, item.name),
        None => {
            println!("'{}' is not a known grocery item.", result.text);
            return Ok(());
        }
    }
    if result.preferred_products.is_empty() {
        println!("  no preferred products");
    }
    for product in &result.preferred_products {
        print_product(product);
    }
    Ok(())
}

pub async fn run_history(config: &Config, limit: i64) -> Result<()> {
    let store = open_store(config).await?;
    let sessions = list_history(&store, limit.max(1)).await?;
    if sessions.is_empty() {
        println!("No order history.");
        return Ok(());
    }
    for session in &sessions {
        println!(
            "Session {} ({})",
            session.session_id,
            format_ts_iso(session.created_at)
        );
        for entry in &session.entries {
            let outcome = if entry.skipped {
                "skipped"
            } else if entry.added_to_cart {
                "added"
            } else {
                "failed"
            };
            let corrected = if entry.was_corrected { " (corrected)" } else { "" };
            println!(
                "  [{}] {} -> {}{}",
                outcome,
                entry.list_text,
                entry.final_product.as_deref().unwrap_or("-"),
                corrected
            );
        }
        println!();
    }
    Ok(())
}

pub async fn run_history_clear(config: &Config) -> Result<()> {
    let store = open_store(config).await?;
    let deleted = clear_history(&store).await?;
    println!("Deleted {} order log entries.", deleted);
    Ok(())
}

pub async fn run_history_delete(config: &Config, session_id: &str) -> Result<()> {
    let store = open_store(config).await?;
    let deleted = delete_session_history(&store, session_id).await?;
    println!(
        "Deleted {} order log entries for session {}.",
        deleted, session_id
    );
    Ok(())
}

fn print_item(detail: &GroceryItemDetail) {
    println!("[{}] {}", detail.item.id, detail.item.name);
    let aliases: Vec<&str> = detail.aliases.iter().map(|a| a.alias.as_str()).collect();
    println!("    aliases: {}", aliases.join(", "));
    for product in &detail.products {
        print_product(product);
    }
}

fn print_product(product: &PreferredProduct) {
    let mut line = format!("  {}. {}", product.rank, product.product_name);
    if let Some(brand) = &product.brand {
        line.push_str(&format!(" ({})", brand));
    }
    if let Some(size) = &product.size {
        line.push_str(&format!(" [{}]", size));
    }
    line.push_str(&format!("  id: {}", product.id));
    println!("{}", line);
    if let Some(url) = &product.product_url {
        println!("       url: {}", url);
    }
    if let Some(ts) = product.last_seen_in_stock {
        println!("       last in stock: {}", format_ts_iso(ts));
    }
}

fn print_saved_product(product: &PreferredProduct) {
    println!(
        "Product {} '{}' is rank {} for grocery item {}",
        product.id, product.product_name, product.rank, product.grocery_item_id
    );
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ts.to_string())
}
