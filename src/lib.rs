//! # aisle
//!
//! A grocery reorder engine. It reads free-text entries from a shared
//! shopping list, matches them to known grocery items, resolves each one
//! against a retailer catalog using ranked product preferences, lets the
//! user review the proposals, and learns from what was finally ordered.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ Shopping list │──▶│   Pipeline   │──▶│   Catalog    │
//! │  (external)   │   │ match+resolve│   │  (external)  │
//! └───────────────┘   └──────┬───────┘   └──────────────┘
//!                            │
//!                ┌───────────┼────────────┐
//!                ▼           ▼            ▼
//!          ┌──────────┐ ┌──────────┐ ┌──────────┐
//!          │  SQLite  │ │   CLI    │ │   HTTP   │
//!          │  prefs   │ │ (aisle)  │ │ JSON+SSE │
//!          └──────────┘ └──────────┘ └──────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema creation |
//! | [`models`] | Core data types |
//! | [`error`] | Typed error conditions |
//! | [`store`] | Preference store and rank helpers |
//! | [`matcher`] | Text matching and preference writes |
//! | [`normalize`] | Collaborator record normalization |
//! | [`services`] | Catalog and shopping-list traits |
//! | [`http_services`] | HTTP implementations of the service traits |
//! | [`retry`] | Credential refresh and backoff |
//! | [`resolver`] | Per-entry catalog resolution |
//! | [`session`] | In-memory order sessions |
//! | [`pipeline`] | Order session lifecycle |
//! | [`learning`] | Preference learning on commit |
//! | [`history`] | Order log |
//! | [`commands`] | CLI command implementations |
//! | [`server`] | HTTP server |

pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod history;
pub mod http_services;
pub mod learning;
pub mod matcher;
pub mod migrate;
pub mod models;
pub mod normalize;
pub mod pipeline;
pub mod resolver;
pub mod retry;
pub mod server;
pub mod services;
pub mod session;
pub mod store;
