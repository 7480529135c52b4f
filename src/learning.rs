//! Write-back of a committed choice into the preference store.
//!
//! Runs exactly once per successfully added item:
//!
//! | Situation | Effect |
//! |-----------|--------|
//! | unknown item | create the item (self-aliased) with the product at rank 1 |
//! | known, user changed the proposal | [`make_top_choice`]: product becomes rank 1 |
//! | known, proposal accepted | [`add_preferred_product`] without rank: refresh or append |

use anyhow::Result;

use crate::matcher::{add_preferred_product, create_grocery_item, make_top_choice};
use crate::models::{CatalogProduct, PreferredProduct, ProductInfo};
use crate::store::PreferenceStore;

pub async fn learn_from_choice(
    store: &PreferenceStore,
    text: &str,
    grocery_item_id: Option<i64>,
    product: &ProductInfo,
    was_corrected: bool,
) -> Result<PreferredProduct> {
    let learned = match grocery_item_id {
        None => {
            let item = create_grocery_item(store, text).await?;
            make_top_choice(store, item.id, product).await?
        }
        Some(id) if was_corrected => make_top_choice(store, id, product).await?,
        Some(id) => add_preferred_product(store, id, product, None).await?,
    };

    tracing::info!(
        text,
        grocery_item_id = learned.grocery_item_id,
        product = %learned.product_name,
        rank = learned.rank,
        was_corrected,
        "Learned preference"
    );
    Ok(learned)
}

/// Whether `chosen` is a different product than `proposed`.
///
/// Compared by identifier/URL when both sides have one, else by name.
/// Choosing anything when nothing was proposed counts as a correction.
pub fn is_correction(proposed: Option<&CatalogProduct>, chosen: &CatalogProduct) -> bool {
    let Some(proposed) = proposed else {
        return true;
    };
    let mut proposed_keys = proposed.identity_keys().peekable();
    if proposed_keys.peek().is_some() && chosen.identity_keys().next().is_some() {
        let keys: Vec<&str> = proposed_keys.collect();
        return !chosen.identity_keys().any(|k| keys.contains(&k));
    }
    proposed.name.trim() != chosen.name.trim()
}
