//! Boundary normalization of collaborator payloads.
//!
//! The catalog and list bridges return loosely-shaped JSON whose key names
//! drift between upstream versions. Everything is mapped onto the fixed
//! [`CatalogProduct`] and [`ListItem`] shapes here, once, so the rest of
//! the crate never touches a raw map.

use serde_json::Value;

use crate::models::{CatalogProduct, ListItem};

const NAME_KEYS: &[&str] = &["name", "product_name", "title"];
const URL_KEYS: &[&str] = &["url", "product_url", "productUrl", "evergreenUrl"];
const BRAND_KEYS: &[&str] = &["brand", "brandName", "brand_name"];
const PRICE_KEYS: &[&str] = &["price", "priceString", "price.viewSection.priceString"];
const IMAGE_KEYS: &[&str] = &[
    "image_url",
    "imageUrl",
    "image",
    "viewSection.itemImage.url",
];
const IDENTIFIER_KEYS: &[&str] = &["identifier", "item_id", "itemId", "id", "productId"];
const SIZE_KEYS: &[&str] = &["size", "package_size"];
const STOCK_KEYS: &[&str] = &["in_stock", "inStock", "available", "availability.available"];

const LIST_ID_KEYS: &[&str] = &["id", "item_id", "itemId"];
const LIST_TEXT_KEYS: &[&str] = &["text", "value", "name"];
const LIST_LIST_KEYS: &[&str] = &["list_id", "listId"];

/// Normalize one catalog record. `None` when it has no usable name.
pub fn catalog_product(value: &Value) -> Option<CatalogProduct> {
    if !value.is_object() {
        return None;
    }
    let name = first_text(value, NAME_KEYS)?;
    Some(CatalogProduct {
        name,
        url: first_text(value, URL_KEYS),
        brand: first_text(value, BRAND_KEYS),
        price: first_text(value, PRICE_KEYS),
        image_url: first_text(value, IMAGE_KEYS),
        identifier: first_text(value, IDENTIFIER_KEYS),
        size: first_text(value, SIZE_KEYS),
        in_stock: first_bool(value, STOCK_KEYS).unwrap_or(true),
    })
}

/// Normalize a search response: a bare array, or an object wrapping one.
pub fn catalog_products(value: &Value) -> Vec<CatalogProduct> {
    records(value, &["products", "items", "results", "data"])
        .iter()
        .filter_map(catalog_product)
        .collect()
}

/// Normalize one list record, including completed ones.
pub fn list_item(value: &Value) -> Option<ListItem> {
    if !value.is_object() {
        return None;
    }
    let id = first_text(value, LIST_ID_KEYS)?;
    let text = first_text(value, LIST_TEXT_KEYS)?;
    Some(ListItem {
        id,
        text,
        list_id: first_text(value, LIST_LIST_KEYS).unwrap_or_default(),
        version: lookup(value, "version")
            .and_then(Value::as_i64)
            .unwrap_or(1),
        raw: value.clone(),
    })
}

/// Normalize a list response, dropping completed entries.
pub fn active_list_items(value: &Value) -> Vec<ListItem> {
    records(value, &["items", "listItems"])
        .iter()
        .filter(|v| !is_completed(v))
        .filter_map(list_item)
        .collect()
}

fn is_completed(value: &Value) -> bool {
    first_bool(value, &["completed", "checked", "done"]).unwrap_or(false)
}

/// Find the record array in a response. Looks at the value itself, then
/// the wrapper keys, then one level of nesting (`{"list": {"listItems": []}}`).
fn records<'a>(value: &'a Value, wrappers: &[&str]) -> &'a [Value] {
    if let Some(array) = value.as_array() {
        return array;
    }
    let Some(object) = value.as_object() else {
        return &[];
    };
    for key in wrappers {
        if let Some(array) = object.get(*key).and_then(Value::as_array) {
            return array;
        }
    }
    for nested in object.values().filter(|v| v.is_object()) {
        for key in wrappers {
            if let Some(array) = nested.get(*key).and_then(Value::as_array) {
                return array;
            }
        }
    }
    &[]
}

/// Resolve a dotted path such as `availability.available`.
fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |v, key| v.get(key))
}

fn first_text(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| lookup(value, k))
        .find_map(as_text)
}

fn first_bool(value: &Value, keys: &[&str]) -> Option<bool> {
    keys.iter()
        .filter_map(|k| lookup(value, k))
        .find_map(|v| match v {
            Value::Bool(b) => Some(*b),
            Value::String(s) => match s.to_ascii_lowercase().as_str() {
                "true" | "yes" | "in_stock" | "available" => Some(true),
                "false" | "no" | "out_of_stock" | "unavailable" => Some(false),
                _ => None,
            },
            _ => None,
        })
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
