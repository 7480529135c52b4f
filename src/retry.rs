//! Retry policy for collaborator calls.
//!
//! - [`ServiceError::Unauthorized`] → re-authenticate once, retry once.
//! - [`ServiceError::Unavailable`] (429/502/503) → exponential backoff,
//!   `base_delay * 2^attempt`, up to `max_retries` extra attempts.
//! - Anything else → fail immediately. Timeouts are not retried because a
//!   cart add that timed out may still have landed.
//!
//! [`ResilientCatalog`] and [`ResilientList`] apply the policy around any
//! [`ProductCatalog`] / [`ShoppingList`] implementation.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::config::RetryConfig;
use crate::error::ServiceError;
use crate::models::{CatalogProduct, ListItem};
use crate::services::{ProductCatalog, ShoppingList};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
        }
    }

    /// Backoff before retry number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1u32 << attempt.min(16))
    }

    /// Run `op`, refreshing credentials with `refresh` on the first
    /// authorization failure and backing off on transient ones.
    pub async fn run<T, Op, OpFut, Refresh, RefreshFut>(
        &self,
        service: &str,
        mut op: Op,
        refresh: Refresh,
    ) -> Result<T, ServiceError>
    where
        Op: FnMut() -> OpFut,
        OpFut: Future<Output = Result<T, ServiceError>>,
        Refresh: Fn() -> RefreshFut,
        RefreshFut: Future<Output = Result<(), ServiceError>>,
    {
        let mut reauthenticated = false;
        let mut attempt = 0;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_auth() && !reauthenticated => {
                    tracing::warn!(service, error = %e, "Authorization failed, refreshing credentials");
                    reauthenticated = true;
                    refresh().await?;
                }
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    let delay = self.delay_for(attempt);
                    attempt += 1;
                    tracing::warn!(
                        service,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// A [`ProductCatalog`] with the retry policy applied to every call.
pub struct ResilientCatalog {
    inner: Arc<dyn ProductCatalog>,
    policy: RetryPolicy,
}

impl ResilientCatalog {
    pub fn new(inner: Arc<dyn ProductCatalog>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl ProductCatalog for ResilientCatalog {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn authenticate(&self) -> Result<(), ServiceError> {
        self.inner.authenticate().await
    }

    async fn search(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<CatalogProduct>, ServiceError> {
        self.policy
            .run(
                self.inner.name(),
                || self.inner.search(query, limit),
                || self.inner.authenticate(),
            )
            .await
    }

    async fn get_details(&self, reference: &str) -> Result<Option<CatalogProduct>, ServiceError> {
        self.policy
            .run(
                self.inner.name(),
                || self.inner.get_details(reference),
                || self.inner.authenticate(),
            )
            .await
    }

    async fn add_to_cart(&self, reference: &str, quantity: u32) -> Result<(), ServiceError> {
        self.policy
            .run(
                self.inner.name(),
                || self.inner.add_to_cart(reference, quantity),
                || self.inner.authenticate(),
            )
            .await
    }
}

/// A [`ShoppingList`] with the retry policy applied to every call.
pub struct ResilientList {
    inner: Arc<dyn ShoppingList>,
    policy: RetryPolicy,
}

impl ResilientList {
    pub fn new(inner: Arc<dyn ShoppingList>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl ShoppingList for ResilientList {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn authenticate(&self) -> Result<(), ServiceError> {
        self.inner.authenticate().await
    }

    async fn fetch_items(&self) -> Result<Vec<ListItem>, ServiceError> {
        self.policy
            .run(
                self.inner.name(),
                || self.inner.fetch_items(),
                || self.inner.authenticate(),
            )
            .await
    }

    async fn mark_complete(&self, item: &ListItem) -> Result<(), ServiceError> {
        self.policy
            .run(
                self.inner.name(),
                || self.inner.mark_complete(item),
                || self.inner.authenticate(),
            )
            .await
    }
}
