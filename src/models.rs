//! Core data models used throughout aisle.
//!
//! Persisted rows (grocery items, aliases, preferred products, order log)
//! and the fixed record shapes that external collaborators are normalized
//! into at the boundary (see [`crate::normalize`]).

use serde::{Deserialize, Serialize};

/// A canonical grocery concept such as "milk".
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroceryItem {
    pub id: i64,
    pub name: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A normalized free-text string mapped to exactly one grocery item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Alias {
    pub id: i64,
    pub grocery_item_id: i64,
    pub alias: String,
}

/// A concrete, ranked product choice for a grocery item. Rank 1 is most preferred.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreferredProduct {
    pub id: i64,
    pub grocery_item_id: i64,
    pub rank: i64,
    pub product_name: String,
    pub product_url: Option<String>,
    pub brand: Option<String>,
    pub image_url: Option<String>,
    pub size: Option<String>,
    pub last_seen_in_stock: Option<i64>,
}

/// A grocery item together with its aliases and rank-ordered products.
#[derive(Debug, Clone, Serialize)]
pub struct GroceryItemDetail {
    #[serde(flatten)]
    pub item: GroceryItem,
    pub aliases: Vec<Alias>,
    pub products: Vec<PreferredProduct>,
}

/// Product fields supplied when adding or promoting a preference.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductInfo {
    pub name: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub size: Option<String>,
}

impl ProductInfo {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }
}

/// A product as reported by the external catalog, after normalization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogProduct {
    pub name: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub price: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub identifier: Option<String>,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default = "default_in_stock")]
    pub in_stock: bool,
}

fn default_in_stock() -> bool {
    true
}

impl CatalogProduct {
    /// Every value that identifies this product for de-duplication.
    pub fn identity_keys(&self) -> impl Iterator<Item = &str> {
        self.identifier
            .as_deref()
            .into_iter()
            .chain(self.url.as_deref())
            .filter(|k| !k.is_empty())
    }

    /// The reference the catalog accepts for detail lookups and cart adds.
    pub fn reference(&self) -> Option<&str> {
        self.identifier
            .as_deref()
            .or(self.url.as_deref())
            .filter(|r| !r.is_empty())
    }

    pub fn to_product_info(&self) -> ProductInfo {
        ProductInfo {
            name: self.name.clone(),
            url: self.url.clone(),
            brand: self.brand.clone(),
            image_url: self.image_url.clone(),
            size: self.size.clone(),
        }
    }
}

/// One entry on the external shopping list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListItem {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub list_id: String,
    #[serde(default = "default_version")]
    pub version: i64,
    /// The record exactly as the list service sent it; echoed back on updates.
    #[serde(default, skip_serializing)]
    pub raw: serde_json::Value,
}

fn default_version() -> i64 {
    1
}

/// Immutable audit record of one list item's outcome within a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderLog {
    pub id: i64,
    pub session_id: String,
    pub list_text: String,
    pub matched_grocery_item_id: Option<i64>,
    pub proposed_product: Option<String>,
    pub final_product: Option<String>,
    pub was_corrected: bool,
    pub added_to_cart: bool,
    pub skipped: bool,
    pub created_at: i64,
}

/// Fields for a new [`OrderLog`] row.
#[derive(Debug, Clone, Default)]
pub struct NewOrderLog {
    pub session_id: String,
    pub list_text: String,
    pub matched_grocery_item_id: Option<i64>,
    pub proposed_product: Option<String>,
    pub final_product: Option<String>,
    pub was_corrected: bool,
    pub added_to_cart: bool,
    pub skipped: bool,
}
