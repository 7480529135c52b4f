//! # aisle CLI
//!
//! The `aisle` binary manages grocery preferences, inspects order history
//! and starts the HTTP server that drives order sessions.
//!
//! ## Usage
//!
//! ```bash
//! aisle --config ./config/aisle.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `aisle init` | Create the SQLite database and schema |
//! | `aisle items` | List grocery items with aliases and ranked products |
//! | `aisle item add/delete/merge` | Manage grocery items |
//! | `aisle alias add/delete` | Manage aliases |
//! | `aisle product add/top/promote/delete` | Manage preferred products |
//! | `aisle match "<text>"` | Show what a list entry resolves to |
//! | `aisle history` | Show, clear or delete order history |
//! | `aisle serve` | Start the HTTP server |
//!
//! ## Examples
//!
//! ```bash
//! aisle init
//! aisle item add milk
//! aisle alias add 1 "2% milk"
//! aisle product add 1 "Brand Y Milk" --url https://store.example/p/y --rank 1
//! aisle match "2% Milk"
//! aisle serve
//! ```

use aisle::{commands, config, migrate, models::ProductInfo, server};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// aisle: a grocery reorder engine that learns your product preferences.
#[derive(Parser)]
#[command(
    name = "aisle",
    about = "aisle: turn a shared shopping list into a reviewed grocery cart",
    version,
    long_about = "aisle matches free-text shopping list entries to known grocery items, \
    resolves them against a retailer catalog using ranked product preferences, and \
    learns from every committed order."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/aisle.toml`.
    #[arg(long, global = true, default_value = "./config/aisle.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// List grocery items with their aliases and ranked products.
    Items,

    /// Manage grocery items.
    Item {
        #[command(subcommand)]
        action: ItemAction,
    },

    /// Manage aliases (alternate list texts for a grocery item).
    Alias {
        #[command(subcommand)]
        action: AliasAction,
    },

    /// Manage preferred products.
    Product {
        #[command(subcommand)]
        action: ProductAction,
    },

    /// Show the grocery item and preferred products a list entry matches.
    Match {
        /// Free list text, e.g. "2% Milk".
        text: String,
    },

    /// Show order history, newest session first.
    History {
        #[command(subcommand)]
        action: Option<HistoryAction>,

        /// Maximum number of log entries to show.
        #[arg(long, default_value_t = 200)]
        limit: i64,
    },

    /// Start the HTTP server.
    ///
    /// Binds to `[server].bind`. Requires `[catalog]` and `[shopping_list]`.
    Serve,
}

#[derive(Subcommand)]
enum ItemAction {
    /// Create a grocery item (idempotent).
    Add { name: String },
    /// Delete a grocery item with its aliases and products.
    Delete { id: i64 },
    /// Merge SOURCE into TARGET and delete SOURCE.
    Merge { source: i64, target: i64 },
}

#[derive(Subcommand)]
enum AliasAction {
    /// Map TEXT to a grocery item.
    Add { item_id: i64, text: String },
    /// Delete an alias by id.
    Delete { alias_id: i64 },
}

#[derive(Args)]
struct ProductArgs {
    /// Grocery item id.
    item_id: i64,
    /// Product display name.
    name: String,
    #[arg(long)]
    url: Option<String>,
    #[arg(long)]
    brand: Option<String>,
    #[arg(long)]
    image: Option<String>,
    #[arg(long)]
    size: Option<String>,
}

impl ProductArgs {
    fn info(&self) -> ProductInfo {
        ProductInfo {
            name: self.name.clone(),
            url: self.url.clone(),
            brand: self.brand.clone(),
            image_url: self.image.clone(),
            size: self.size.clone(),
        }
    }
}

#[derive(Subcommand)]
enum ProductAction {
    /// Add (or refresh) a preferred product, optionally at a rank.
    Add {
        #[command(flatten)]
        product: ProductArgs,
        /// Insert at this rank; later products shift down.
        #[arg(long)]
        rank: Option<i64>,
    },
    /// Make a product the rank 1 choice for an item.
    Top {
        #[command(flatten)]
        product: ProductArgs,
    },
    /// Swap a product with the one ranked directly above it.
    Promote { product_id: i64 },
    /// Delete a preferred product and renumber the rest.
    Delete { product_id: i64 },
}

#[derive(Subcommand)]
enum HistoryAction {
    /// Delete all order history.
    Clear,
    /// Delete the history of one session.
    Delete { session_id: String },
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Items => {
            commands::run_items(&cfg).await?;
        }
        Commands::Item { action } => match action {
            ItemAction::Add { name } => commands::run_item_add(&cfg, &name).await?,
            ItemAction::Delete { id } => commands::run_item_delete(&cfg, id).await?,
            ItemAction::Merge { source, target } => {
                commands::run_item_merge(&cfg, source, target).await?
            }
        },
        Commands::Alias { action } => match action {
            AliasAction::Add { item_id, text } => {
                commands::run_alias_add(&cfg, item_id, &text).await?
            }
            AliasAction::Delete { alias_id } => commands::run_alias_delete(&cfg, alias_id).await?,
        },
        Commands::Product { action } => match action {
            ProductAction::Add { product, rank } => {
                commands::run_product_add(&cfg, product.item_id, &product.info(), rank).await?
            }
            ProductAction::Top { product } => {
                commands::run_product_top(&cfg, product.item_id, &product.info()).await?
            }
            ProductAction::Promote { product_id } => {
                commands::run_product_promote(&cfg, product_id).await?
            }
            ProductAction::Delete { product_id } => {
                commands::run_product_delete(&cfg, product_id).await?
            }
        },
        Commands::Match { text } => {
            commands::run_match(&cfg, &text).await?;
        }
        Commands::History { action, limit } => match action {
            None => commands::run_history(&cfg, limit).await?,
            Some(HistoryAction::Clear) => commands::run_history_clear(&cfg).await?,
            Some(HistoryAction::Delete { session_id }) => {
                commands::run_history_delete(&cfg, &session_id).await?
            }
        },
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
