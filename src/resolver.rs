//! Catalog resolution: one grocery concept → ranked, in-stock candidates.
//!
//! For a known item every preference lookup and the general keyword
//! search go out at once. Results are combined deterministically no
//! matter which call returns first:
//!
//! 1. in-stock preference lookups, in rank order,
//! 2. in-stock search results whose identifier/URL is not already present.
//!
//! `candidates[0]` is always the best choice. Individual lookup failures
//! only remove that candidate; an authorization failure, or a general
//! search failure that leaves nothing to offer, fails the whole
//! resolution so it is never mistaken for "no results".

use anyhow::Result;
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::error::ServiceError;
use crate::matcher::MatchResult;
use crate::models::{CatalogProduct, PreferredProduct};
use crate::services::ProductCatalog;
use crate::store::{self, PreferenceStore};

/// Outcome classification for one resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MatchStatus {
    /// At least one preferred product is in stock.
    Matched,
    /// Known item, but only general search results are in stock.
    Substituted,
    /// Unknown item (or known with no preferences) with search results.
    #[serde(rename = "New item")]
    NewItem,
    #[serde(rename = "No results")]
    NoResults,
}

impl fmt::Display for MatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MatchStatus::Matched => "Matched",
            MatchStatus::Substituted => "Substituted",
            MatchStatus::NewItem => "New item",
            MatchStatus::NoResults => "No results",
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Resolution {
    pub status: MatchStatus,
    pub candidates: Vec<CatalogProduct>,
    /// How many leading candidates came from preferences.
    pub preference_matches: usize,
    /// Rank of the preference behind `candidates[0]`, if any.
    pub matched_rank: Option<i64>,
}

impl Resolution {
    pub fn best(&self) -> Option<&CatalogProduct> {
        self.candidates.first()
    }
}

pub struct CatalogResolver {
    catalog: Arc<dyn ProductCatalog>,
    store: Arc<PreferenceStore>,
    search_limit: usize,
}

impl CatalogResolver {
    pub fn new(
        catalog: Arc<dyn ProductCatalog>,
        store: Arc<PreferenceStore>,
        search_limit: usize,
    ) -> Self {
        Self {
            catalog,
            store,
            search_limit,
        }
    }

    /// Resolve list text given its match result.
    pub async fn resolve(&self, text: &str, matched: &MatchResult) -> Result<Resolution> {
        let preferences: &[PreferredProduct] = if matched.is_known {
            &matched.preferred_products
        } else {
            &[]
        };

        let lookups = join_all(preferences.iter().map(|p| self.lookup_preference(p)));
        let search = self.catalog.search(text.trim(), self.search_limit);
        let (lookups, search) = tokio::join!(lookups, search);

        let mut candidates = Vec::new();
        let mut represented: HashSet<String> = HashSet::new();
        let mut matched_rank = None;
        let mut seen_in_stock = Vec::new();

        for (preference, outcome) in preferences.iter().zip(lookups) {
            match outcome {
                Ok(Some(product)) if product.in_stock => {
                    seen_in_stock.push(preference.id);
                    if is_represented(&represented, &product) {
                        continue;
                    }
                    represent(&mut represented, &product);
                    matched_rank.get_or_insert(preference.rank);
                    candidates.push(product);
                }
                Ok(Some(_)) => {
                    tracing::debug!(text, product = %preference.product_name, "Preferred product out of stock");
                }
                Ok(None) => {
                    tracing::debug!(text, product = %preference.product_name, "Preferred product not found");
                }
                Err(e) if e.is_auth() => return Err(e.into()),
                Err(e) => {
                    tracing::warn!(text, product = %preference.product_name, error = %e, "Preference lookup failed");
                }
            }
        }
        let preference_matches = candidates.len();

        match search {
            Ok(results) => {
                for product in results {
                    if !product.in_stock || is_represented(&represented, &product) {
                        continue;
                    }
                    represent(&mut represented, &product);
                    candidates.push(product);
                }
            }
            Err(e) if e.is_auth() => return Err(e.into()),
            Err(e) if candidates.is_empty() => return Err(e.into()),
            Err(e) => {
                tracing::warn!(text, error = %e, "General search failed, using preferences only");
            }
        }

        self.record_in_stock(&seen_in_stock).await;

        let status = if candidates.is_empty() {
            MatchStatus::NoResults
        } else if preference_matches > 0 {
            MatchStatus::Matched
        } else if preferences.is_empty() {
            MatchStatus::NewItem
        } else {
            MatchStatus::Substituted
        };

        Ok(Resolution {
            status,
            candidates,
            preference_matches,
            matched_rank,
        })
    }

    /// Look up one preference by its stored URL, else by a one-result
    /// name search.
    async fn lookup_preference(
        &self,
        preference: &PreferredProduct,
    ) -> Result<Option<CatalogProduct>, ServiceError> {
        match preference.product_url.as_deref().filter(|u| !u.is_empty()) {
            Some(url) => self.catalog.get_details(url).await,
            None => Ok(self
                .catalog
                .search(&preference.product_name, 1)
                .await?
                .into_iter()
                .next()),
        }
    }

    async fn record_in_stock(&self, product_ids: &[i64]) {
        let now = store::now_ts();
        for id in product_ids {
            if let Err(e) = self.store.mark_seen_in_stock(*id, now).await {
                tracing::warn!(product_id = id, error = %e, "Failed to record in-stock timestamp");
            }
        }
    }
}

fn is_represented(represented: &HashSet<String>, product: &CatalogProduct) -> bool {
    product.identity_keys().any(|k| represented.contains(k))
}

fn represent(represented: &mut HashSet<String>, product: &CatalogProduct) {
    represented.extend(product.identity_keys().map(str::to_string));
}


#[cfg(test)]
mod tests {
    use super::test_support::{product, FakeCatalog};
    use super::*;
    use crate::matcher::{add_preferred_product, create_grocery_item, find_match};
    use crate::models::ProductInfo;
    use crate::store::test_support::temp_store;

    fn url_of(p: &CatalogProduct) -> String {
        p.url.clone().unwrap()
    }

    fn info_for(p: &CatalogProduct) -> ProductInfo {
        p.to_product_info()
    }

    fn http_500() -> ServiceError {
        ServiceError::Http {
            service: "fake catalog".into(),
            status: 500,
            body: "boom".into(),
        }
    }

    fn expired() -> ServiceError {
        ServiceError::Unauthorized {
            service: "fake catalog".into(),
            message: "HTTP 401".into(),
        }
    }

    #[tokio::test]
    async fn test_preferences_first_then_deduplicated_search() {
        let (_tmp, store) = temp_store().await;
        let store = Arc::new(store);
        let item = create_grocery_item(&store, "milk").await.unwrap();

        let pref1 = product("Brand X Milk", "x", true);
        let pref2 = product("Brand Y Milk", "y", true);
        add_preferred_product(&store, item.id, &info_for(&pref1), None).await.unwrap();
        add_preferred_product(&store, item.id, &info_for(&pref2), None).await.unwrap();

        let mut catalog = FakeCatalog::default();
        catalog.details.insert(url_of(&pref1), pref1.clone());
        catalog.details.insert(url_of(&pref2), pref2.clone());
        catalog.searches.insert(
            "milk".into(),
            vec![
                product("Brand X Milk 2", "x", true),
                product("Store Milk", "s", true),
                product("Organic Milk", "o", true),
            ],
        );

        let resolver = CatalogResolver::new(Arc::new(catalog), store.clone(), 10);
        let matched = find_match(&store, "milk").await.unwrap();
        let resolution = resolver.resolve("milk", &matched).await.unwrap();

        let names: Vec<&str> = resolution.candidates.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Brand X Milk", "Brand Y Milk", "Store Milk", "Organic Milk"]);
        assert_eq!(resolution.status, MatchStatus::Matched);
        assert_eq!(resolution.preference_matches, 2);
        assert_eq!(resolution.matched_rank, Some(1));

        let seen = store.get_product(matched.preferred_products[0].id).await.unwrap().unwrap();
        assert!(seen.last_seen_in_stock.is_some());
    }

    #[tokio::test]
    async fn test_out_of_stock_preference_substituted() {
        let (_tmp, store) = temp_store().await;
        let store = Arc::new(store);
        let item = create_grocery_item(&store, "bread").await.unwrap();
        let pref = product("Sourdough", "sd", false);
        add_preferred_product(&store, item.id, &info_for(&pref), None).await.unwrap();

        let mut catalog = FakeCatalog::default();
        catalog.details.insert(url_of(&pref), pref.clone());
        catalog.searches.insert(
            "bread".into(),
            vec![product("Sourdough", "sd", false), product("Rye", "rye", true)],
        );

        let resolver = CatalogResolver::new(Arc::new(catalog), store.clone(), 10);
        let matched = find_match(&store, "bread").await.unwrap();
        let resolution = resolver.resolve("bread", &matched).await.unwrap();

        assert_eq!(resolution.status, MatchStatus::Substituted);
        assert_eq!(resolution.candidates.len(), 1);
        assert_eq!(resolution.best().unwrap().name, "Rye");
        assert_eq!(resolution.matched_rank, None);

        let unseen = store.get_product(matched.preferred_products[0].id).await.unwrap().unwrap();
        assert!(unseen.last_seen_in_stock.is_none());
    }

    #[tokio::test]
    async fn test_unknown_item() {
        let (_tmp, store) = temp_store().await;
        let store = Arc::new(store);
        let mut catalog = FakeCatalog::default();
        catalog
            .searches
            .insert("quinoa".into(), vec![product("Tri-Color Quinoa", "q", true)]);
        let resolver = CatalogResolver::new(Arc::new(catalog), store.clone(), 10);

        let matched = find_match(&store, "quinoa").await.unwrap();
        let resolution = resolver.resolve("quinoa", &matched).await.unwrap();
        assert_eq!(resolution.status, MatchStatus::NewItem);
        assert_eq!(resolution.candidates.len(), 1);

        let matched = find_match(&store, "saffron").await.unwrap();
        let resolution = resolver.resolve("saffron", &matched).await.unwrap();
        assert_eq!(resolution.status, MatchStatus::NoResults);
        assert!(resolution.candidates.is_empty());
    }

    #[tokio::test]
    async fn test_failed_lookup_is_just_unavailable() {
        let (_tmp, store) = temp_store().await;
        let store = Arc::new(store);
        let item = create_grocery_item(&store, "eggs").await.unwrap();
        let broken = product("Farm Eggs", "fe", true);
        let fine = product("Cage Free Eggs", "cf", true);
        add_preferred_product(&store, item.id, &info_for(&broken), None).await.unwrap();
        add_preferred_product(&store, item.id, &info_for(&fine), None).await.unwrap();

        let mut catalog = FakeCatalog::default();
        catalog.failing.insert(url_of(&broken), http_500);
        catalog.details.insert(url_of(&fine), fine.clone());

        let resolver = CatalogResolver::new(Arc::new(catalog), store.clone(), 10);
        let matched = find_match(&store, "eggs").await.unwrap();
        let resolution = resolver.resolve("eggs", &matched).await.unwrap();
        assert_eq!(resolution.status, MatchStatus::Matched);
        assert_eq!(resolution.best().unwrap().name, "Cage Free Eggs");
        assert_eq!(resolution.matched_rank, Some(2));
    }

    #[tokio::test]
    async fn test_total_failure_is_an_error_not_no_results() {
        let (_tmp, store) = temp_store().await;
        let store = Arc::new(store);
        let mut catalog = FakeCatalog::default();
        catalog.failing.insert("rice".into(), http_500);
        catalog.failing.insert("beans".into(), expired);
        let resolver = CatalogResolver::new(Arc::new(catalog), store.clone(), 10);

        let matched = find_match(&store, "rice").await.unwrap();
        assert!(resolver.resolve("rice", &matched).await.is_err());

        let matched = find_match(&store, "beans").await.unwrap();
        let err = resolver.resolve("beans", &matched).await.unwrap_err();
        assert!(err.downcast_ref::<ServiceError>().unwrap().is_auth());
    }

    #[tokio::test]
    async fn test_name_only_preference_uses_single_result_search() {
        let (_tmp, store) = temp_store().await;
        let store = Arc::new(store);
        let item = create_grocery_item(&store, "butter").await.unwrap();
        add_preferred_product(&store, item.id, &ProductInfo::named("Kerrygold"), None)
            .await
            .unwrap();

        let mut catalog = FakeCatalog::default();
        catalog.searches.insert(
            "Kerrygold".into(),
            vec![product("Kerrygold Salted", "k1", true), product("Kerrygold Unsalted", "k2", true)],
        );
        let resolver = CatalogResolver::new(Arc::new(catalog), store.clone(), 10);

        let matched = find_match(&store, "butter").await.unwrap();
        let resolution = resolver.resolve("butter", &matched).await.unwrap();
        assert_eq!(resolution.status, MatchStatus::Matched);
        assert_eq!(resolution.candidates.len(), 1);
        assert_eq!(resolution.best().unwrap().name, "Kerrygold Salted");
    }
}
