//! # Content Harvester
//!
//! Profile-driven content harvesting into a deduplicated registry.
//!
//! A harvest walks one source's hierarchy top-down. Connectors fetch and
//! parse remote pages and report what they find through registration
//! callbacks. The orchestrator writes every discovery into the registry and
//! queues it for the next level. Files are stored content-addressed and
//! registered by SHA-256.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │  Connectors  │──▶│ Orchestrator │──▶│   Registry   │
//! │profile/plugin│   │ feed→…→file  │   │ SQLite / mem │
//! └──────────────┘   └──────┬───────┘   └──────────────┘
//!                           │
//!                           ▼
//!                    ┌──────────────┐
//!                    │  Downloader  │
//!                    │ <sha256>.ext │
//!                    └──────────────┘
//! ```
//!
//! ## Hierarchy
//!
//! `Source → Feed → Channel → Asset → File`. Channels are optional: a feed
//! may report assets directly.
//!
//! ## Quick Start
//!
//! ```bash
//! harvester init                          # create database
//! harvester sources --check               # list sources, probe liveness
//! harvester harvest all                   # harvest every source
//! harvester probe https://x.test/feed     # dry-run one scrape
//! harvester stats
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error taxonomy |
//! | [`models`] | Entities, descriptors, request metadata |
//! | [`traits`] | Connector and registration callback contracts |
//! | [`response`] | JSON-first, HTML-fallback body interpretation |
//! | [`policies`] | Named extraction policies |
//! | [`lua_runtime`] | Sandboxed Lua expressions |
//! | [`profile`] | Profile definition and resolution |
//! | [`connector_profile`] | Profile-driven connector |
//! | [`registry`] | Entity store with idempotent upsert |
//! | [`downloader`] | Content-addressed file downloads |
//! | [`harvest`] | Orchestrator state machine |
//! | [`plugins`] | Plugin manifest loader |
//! | [`sources`] | Source resolution and listing |
//! | [`stats`] | Registry statistics |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod config;
pub mod connector_profile;
pub mod db;
pub mod downloader;
pub mod error;
pub mod harvest;
pub mod lua_runtime;
pub mod migrate;
pub mod models;
pub mod plugins;
pub mod policies;
pub mod profile;
pub mod registry;
pub mod response;
pub mod sources;
pub mod stats;
pub mod traits;
