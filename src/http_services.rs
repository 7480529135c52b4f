//! HTTP bridges for the catalog and shopping list.
//!
//! Both collaborators sit behind a small JSON bridge process that owns the
//! browser session. Credentials are an opaque JSON object of request
//! headers written by an external login helper; [`authenticate`] re-reads
//! that file and asks the bridge to validate it.
//!
//! # Catalog endpoints
//!
//! | Call | Request |
//! |------|---------|
//! | authenticate | `GET {base}/session` |
//! | search | `GET {base}/search?query=..&limit=..[&store=..]` |
//! | get_details | `GET {base}/product?ref=..` (404 → not found) |
//! | add_to_cart | `POST {base}/cart/items` `{reference, quantity, store}` |
//!
//! # List endpoints
//!
//! | Call | Request |
//! |------|---------|
//! | authenticate | `GET {base}/session` |
//! | fetch_items | `GET {base}/items?list=..` |
//! | mark_complete | `PUT {base}/items/{id}` (the raw record with `completed: true`) |
//!
//! Responses are normalized through [`crate::normalize`].
//!
//! [`authenticate`]: crate::services::ProductCatalog::authenticate

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::RwLock;

use crate::config::{CatalogConfig, ShoppingListConfig};
use crate::error::ServiceError;
use crate::models::{CatalogProduct, ListItem};
use crate::normalize;
use crate::services::{ProductCatalog, ShoppingList};

/// Header map loaded from a credentials file.
struct Credentials {
    service: &'static str,
    path: PathBuf,
    headers: RwLock<HeaderMap>,
}

impl Credentials {
    fn new(service: &'static str, path: &Path) -> Self {
        Self {
            service,
            path: path.to_path_buf(),
            headers: RwLock::new(HeaderMap::new()),
        }
    }

    async fn reload(&self) -> Result<(), ServiceError> {
        let unauthorized = |message: String| ServiceError::Unauthorized {
            service: self.service.to_string(),
            message,
        };

        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            unauthorized(format!(
                "cannot read credentials {}: {}",
                self.path.display(),
                e
            ))
        })?;
        let headers = parse_headers(&content).map_err(unauthorized)?;

        tracing::debug!(service = self.service, count = headers.len(), "Loaded credentials");
        *self.headers.write().await = headers;
        Ok(())
    }

    async fn current(&self) -> HeaderMap {
        self.headers.read().await.clone()
    }
}

/// Parse `{"Header-Name": "value", ...}`. Non-string values are skipped.
fn parse_headers(content: &str) -> Result<HeaderMap, String> {
    let value: Value =
        serde_json::from_str(content).map_err(|e| format!("invalid credentials file: {}", e))?;
    let object = value
        .as_object()
        .ok_or_else(|| "credentials file must be a JSON object".to_string())?;

    let mut headers = HeaderMap::new();
    for (key, value) in object {
        let Some(text) = value.as_str() else {
            continue;
        };
        let name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|_| format!("invalid header name '{}'", key))?;
        let value = HeaderValue::from_str(text)
            .map_err(|_| format!("invalid value for header '{}'", key))?;
        headers.insert(name, value);
    }
    Ok(headers)
}

/// Shared request plumbing for both bridges.
struct Bridge {
    service: &'static str,
    client: reqwest::Client,
    base_url: String,
    credentials: Credentials,
}

impl Bridge {
    fn new(
        service: &'static str,
        base_url: &str,
        credentials: &Path,
        timeout_secs: u64,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            service,
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials: Credentials::new(service, credentials),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn authenticate(&self) -> Result<(), ServiceError> {
        self.credentials.reload().await?;
        self.send(self.client.get(self.url("/session"))).await?;
        tracing::info!(service = self.service, "Authenticated");
        Ok(())
    }

    /// Send with the current credentials and map the outcome onto
    /// [`ServiceError`]. Empty bodies come back as `Value::Null`.
    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Value, ServiceError> {
        let response = request
            .headers(self.credentials.current().await)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| self.transport_error(e))?;

        if let Some(err) = ServiceError::from_status(self.service, status, truncate(&body)) {
            return Err(err);
        }
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body).map_err(|e| ServiceError::Malformed {
            service: self.service.to_string(),
            message: e.to_string(),
        })
    }

    fn transport_error(&self, e: reqwest::Error) -> ServiceError {
        if e.is_timeout() {
            ServiceError::Timeout {
                service: self.service.to_string(),
            }
        } else {
            ServiceError::Transport {
                service: self.service.to_string(),
                message: e.to_string(),
            }
        }
    }
}

fn truncate(body: &str) -> String {
    body.chars().take(200).collect()
}

// ═══════════════════════════════════════════════════════════════════════
// Catalog
// ═══════════════════════════════════════════════════════════════════════

pub struct HttpCatalog {
    bridge: Bridge,
    store: Option<String>,
}

impl HttpCatalog {
    pub fn new(config: &CatalogConfig) -> anyhow::Result<Self> {
        Ok(Self {
            bridge: Bridge::new(
                "catalog",
                &config.base_url,
                &config.credentials,
                config.timeout_secs,
            )?,
            store: config.store.clone(),
        })
    }
}

#[async_trait]
impl ProductCatalog for HttpCatalog {
    fn name(&self) -> &str {
        self.bridge.service
    }

    async fn authenticate(&self) -> Result<(), ServiceError> {
        self.bridge.authenticate().await
    }

    async fn search(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<CatalogProduct>, ServiceError> {
        let mut params = vec![
            ("query", query.to_string()),
            ("limit", limit.to_string()),
        ];
        if let Some(store) = &self.store {
            params.push(("store", store.clone()));
        }

        let body = self
            .bridge
            .send(self.bridge.client.get(self.bridge.url("/search")).query(&params))
            .await?;
        let mut products = normalize::catalog_products(&body);
        products.truncate(limit);
        Ok(products)
    }

    async fn get_details(&self, reference: &str) -> Result<Option<CatalogProduct>, ServiceError> {
        let request = self
            .bridge
            .client
            .get(self.bridge.url("/product"))
            .query(&[("ref", reference)]);

        match self.bridge.send(request).await {
            Ok(body) => {
                let record = body.get("product").unwrap_or(&body);
                Ok(normalize::catalog_product(record))
            }
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn add_to_cart(&self, reference: &str, quantity: u32) -> Result<(), ServiceError> {
        let body = json!({
            "reference": reference,
            "quantity": quantity,
            "store": self.store,
        });
        let response = self
            .bridge
            .send(self.bridge.client.post(self.bridge.url("/cart/items")).json(&body))
            .await?;

        // The bridge may answer 200 with {"ok": false, "error": ".."}.
        if response.get("ok").and_then(Value::as_bool) == Some(false) {
            let message = response
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("cart add rejected")
                .to_string();
            return Err(ServiceError::Malformed {
                service: self.bridge.service.to_string(),
                message,
            });
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Shopping list
// ═══════════════════════════════════════════════════════════════════════

pub struct HttpShoppingList {
    bridge: Bridge,
    list_name: String,
}

impl HttpShoppingList {
    pub fn new(config: &ShoppingListConfig) -> anyhow::Result<Self> {
        Ok(Self {
            bridge: Bridge::new(
                "shopping list",
                &config.base_url,
                &config.credentials,
                config.timeout_secs,
            )?,
            list_name: config.list_name.clone(),
        })
    }
}

#[async_trait]
impl ShoppingList for HttpShoppingList {
    fn name(&self) -> &str {
        self.bridge.service
    }

    async fn authenticate(&self) -> Result<(), ServiceError> {
        self.bridge.authenticate().await
    }

    async fn fetch_items(&self) -> Result<Vec<ListItem>, ServiceError> {
        let request = self
            .bridge
            .client
            .get(self.bridge.url("/items"))
            .query(&[("list", self.list_name.as_str())]);
        let body = self.bridge.send(request).await?;
        let items = normalize::active_list_items(&body);
        tracing::info!(list = %self.list_name, count = items.len(), "Fetched active list items");
        Ok(items)
    }

    async fn mark_complete(&self, item: &ListItem) -> Result<(), ServiceError> {
        let mut payload = match &item.raw {
            Value::Object(map) if !map.is_empty() => Value::Object(map.clone()),
            _ => json!({
                "id": item.id,
                "value": item.text,
                "listId": item.list_id,
                "version": item.version,
            }),
        };
        payload["completed"] = Value::Bool(true);

        let url = self.bridge.url(&format!("/items/{}", item.id));
        self.bridge
            .send(self.bridge.client.put(url).json(&payload))
            .await?;
        tracing::info!(text = %item.text, "Checked off list item");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_headers() {
        let headers = parse_headers(r#"{"Cookie": "a=1; b=2", "X-Csrf": "tok", "ttl": 5}"#).unwrap();
        assert_eq!(headers.len(), 2);
        assert_eq!(headers.get("cookie").unwrap(), "a=1; b=2");
        assert_eq!(headers.get("x-csrf").unwrap(), "tok");
    }

    #[test]
    fn test_parse_headers_rejects_non_object() {
        assert!(parse_headers("[1, 2]").is_err());
        assert!(parse_headers("not json").is_err());
        assert!(parse_headers(r#"{"bad header": "x"}"#).is_err());
    }

    #[tokio::test]
    async fn test_missing_credentials_is_unauthorized() {
        let tmp = tempfile::TempDir::new().unwrap();
        let creds = Credentials::new("catalog", &tmp.path().join("missing.json"));
        let err = creds.reload().await.unwrap_err();
        assert!(err.is_auth());
    }

    #[tokio::test]
    async fn test_reload_picks_up_new_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("session.json");
        std::fs::write(&path, r#"{"Cookie": "v=1"}"#).unwrap();
        let creds = Credentials::new("catalog", &path);
        creds.reload().await.unwrap();
        assert_eq!(creds.current().await.get("cookie").unwrap(), "v=1");

        std::fs::write(&path, r#"{"Cookie": "v=2"}"#).unwrap();
        creds.reload().await.unwrap();
        assert_eq!(creds.current().await.get("cookie").unwrap(), "v=2");
    }
}
