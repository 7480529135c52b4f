use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub order: OrderConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub catalog: Option<CatalogConfig>,
    #[serde(default)]
    pub shopping_list: Option<ShoppingListConfig>,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    /// Pool size. Writes are serialized by the store regardless.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

/// Knobs for the order session pipeline.
#[derive(Debug, Deserialize, Clone)]
pub struct OrderConfig {
    #[serde(default = "default_search_concurrency")]
    pub search_concurrency: usize,
    #[serde(default = "default_search_limit")]
    pub search_limit: usize,
    #[serde(default = "default_login_timeout_secs")]
    pub login_timeout_secs: u64,
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
}

impl Default for OrderConfig {
    fn default() -> Self {
        Self {
            search_concurrency: default_search_concurrency(),
            search_limit: default_search_limit(),
            login_timeout_secs: default_login_timeout_secs(),
            stale_after_secs: default_stale_after_secs(),
            session_ttl_secs: default_session_ttl_secs(),
        }
    }
}

impl OrderConfig {
    pub fn login_timeout(&self) -> Duration {
        Duration::from_secs(self.login_timeout_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }
}

fn default_search_concurrency() -> usize {
    4
}
fn default_search_limit() -> usize {
    10
}
fn default_login_timeout_secs() -> u64 {
    180
}
fn default_stale_after_secs() -> u64 {
    600
}
fn default_session_ttl_secs() -> u64 {
    3600
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    1000
}

/// Product catalog bridge.
#[derive(Debug, Deserialize, Clone)]
pub struct CatalogConfig {
    pub base_url: String,
    #[serde(default)]
    pub store: Option<String>,
    pub credentials: PathBuf,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

/// Shopping list bridge.
#[derive(Debug, Deserialize, Clone)]
pub struct ShoppingListConfig {
    pub base_url: String,
    #[serde(default = "default_list_name")]
    pub list_name: String,
    pub credentials: PathBuf,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub skip_checkoff: bool,
}

fn default_timeout_secs() -> u64 {
    30
}
fn default_list_name() -> String {
    "Grocery List".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.db.max_connections == 0 {
        anyhow::bail!("db.max_connections must be >= 1");
    }
    if config.order.search_concurrency == 0 {
        anyhow::bail!("order.search_concurrency must be >= 1");
    }
    if config.order.search_limit == 0 {
        anyhow::bail!("order.search_limit must be >= 1");
    }
    if config.order.login_timeout_secs == 0 {
        anyhow::bail!("order.login_timeout_secs must be >= 1");
    }
    if config.order.stale_after_secs == 0 {
        anyhow::bail!("order.stale_after_secs must be >= 1");
    }
    if config.order.session_ttl_secs == 0 {
        anyhow::bail!("order.session_ttl_secs must be >= 1");
    }
    if config.order.login_timeout_secs >= config.order.stale_after_secs {
        anyhow::bail!(
            "order.login_timeout_secs ({}) must be less than order.stale_after_secs ({})",
            config.order.login_timeout_secs,
            config.order.stale_after_secs
        );
    }

    if let Some(catalog) = &config.catalog {
        if catalog.base_url.trim().is_empty() {
            anyhow::bail!("catalog.base_url must not be empty");
        }
        if catalog.timeout_secs == 0 {
            anyhow::bail!("catalog.timeout_secs must be >= 1");
        }
    }

    if let Some(list) = &config.shopping_list {
        if list.base_url.trim().is_empty() {
            anyhow::bail!("shopping_list.base_url must not be empty");
        }
        if list.timeout_secs == 0 {
            anyhow::bail!("shopping_list.timeout_secs must be >= 1");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
[db]
path = "/tmp/aisle.sqlite"
"#,
        )
        .unwrap();
        validate(&config).unwrap();
        assert_eq!(config.order.search_concurrency, 4);
        assert_eq!(config.order.search_limit, 10);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.server.bind, "127.0.0.1:8000");
        assert!(config.catalog.is_none());
        assert!(config.shopping_list.is_none());
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let config: Config = toml::from_str(
            r#"
[db]
path = "/tmp/aisle.sqlite"

[order]
search_concurrency = 0
"#,
        )
        .unwrap();
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("search_concurrency"));
    }

    #[test]
    fn test_zero_session_ttl_rejected() {
        let config: Config = toml::from_str(
            r#"
[db]
path = "/tmp/aisle.sqlite"

[order]
session_ttl_secs = 0
"#,
        )
        .unwrap();
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("session_ttl_secs"));
    }

    #[test]
    fn test_login_timeout_must_undercut_stale_window() {
        let config: Config = toml::from_str(
            r#"
[db]
path = "/tmp/aisle.sqlite"

[order]
login_timeout_secs = 600
stale_after_secs = 600
"#,
        )
        .unwrap();
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("login_timeout_secs (600)"));
    }

    #[test]
    fn test_collaborator_sections() {
        let config: Config = toml::from_str(
            r#"
[db]
path = "/tmp/aisle.sqlite"

[catalog]
base_url = "http://127.0.0.1:8700/catalog"
store = "wegmans"
credentials = "/tmp/catalog.json"

[shopping_list]
base_url = "http://127.0.0.1:8700/list"
credentials = "/tmp/list.json"
skip_checkoff = true
"#,
        )
        .unwrap();
        validate(&config).unwrap();
        let catalog = config.catalog.unwrap();
        assert_eq!(catalog.timeout_secs, 30);
        assert_eq!(catalog.store.as_deref(), Some("wegmans"));
        let list = config.shopping_list.unwrap();
        assert_eq!(list.list_name, "Grocery List");
        assert!(list.skip_checkoff);
    }
}
