//! Collaborator seams: the product catalog and the shopping list.
//!
//! The order pipeline never talks HTTP directly. It holds an
//! `Arc<dyn ProductCatalog>` and an `Arc<dyn ShoppingList>`, so the
//! production bridges ([`crate::http_services`]) and in-memory fakes used
//! by tests are interchangeable.
//!
//! ```text
//! ┌──────────────┐      ┌──────────────────────┐      ┌────────────┐
//! │ OrderPipeline│─────▶│ Resilient{Catalog,   │─────▶│ Http*/Fake │
//! │              │      │ List} (retry policy) │      │            │
//! └──────────────┘      └──────────────────────┘      └────────────┘
//! ```
//!
//! Every method returns [`ServiceError`] so callers can tell an expired
//! session (re-authenticate) from a rate limit (back off) from a hard
//! failure.

use async_trait::async_trait;

use crate::error::ServiceError;
use crate::models::{CatalogProduct, ListItem};

// ═══════════════════════════════════════════════════════════════════════
// Product Catalog
// ═══════════════════════════════════════════════════════════════════════

/// The external product catalog and cart.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use aisle::error::ServiceError;
/// use aisle::models::CatalogProduct;
/// use aisle::services::ProductCatalog;
///
/// pub struct EmptyCatalog;
///
/// #[async_trait]
/// impl ProductCatalog for EmptyCatalog {
///     fn name(&self) -> &str { "empty" }
///
///     async fn authenticate(&self) -> Result<(), ServiceError> { Ok(()) }
///
///     async fn search(&self, _query: &str, _limit: usize)
///         -> Result<Vec<CatalogProduct>, ServiceError> {
///         Ok(vec![])
///     }
///
///     async fn get_details(&self, _reference: &str)
///         -> Result<Option<CatalogProduct>, ServiceError> {
///         Ok(None)
///     }
///
///     async fn add_to_cart(&self, _reference: &str, _quantity: u32)
///         -> Result<(), ServiceError> {
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait ProductCatalog: Send + Sync {
    /// Short label used in logs and error messages.
    fn name(&self) -> &str;

    /// Establish or refresh the session. Called once at session start and
    /// again whenever a call fails with [`ServiceError::Unauthorized`].
    async fn authenticate(&self) -> Result<(), ServiceError>;

    /// Search by free text. Results are in catalog relevance order.
    async fn search(&self, query: &str, limit: usize)
        -> Result<Vec<CatalogProduct>, ServiceError>;

    /// Look up one product by identifier or URL.
    ///
    /// `Ok(None)` means the catalog no longer knows the product.
    async fn get_details(&self, reference: &str)
        -> Result<Option<CatalogProduct>, ServiceError>;

    /// Add a product to the cart.
    async fn add_to_cart(&self, reference: &str, quantity: u32) -> Result<(), ServiceError>;
}

// ═══════════════════════════════════════════════════════════════════════
// Shopping List
// ═══════════════════════════════════════════════════════════════════════

/// The external shopping list the order starts from.
#[async_trait]
pub trait ShoppingList: Send + Sync {
    fn name(&self) -> &str;

    async fn authenticate(&self) -> Result<(), ServiceError>;

    /// Active (not yet completed) entries.
    async fn fetch_items(&self) -> Result<Vec<ListItem>, ServiceError>;

    /// Check an entry off the list.
    async fn mark_complete(&self, item: &ListItem) -> Result<(), ServiceError>;
}
