//! The connector capability contract and its registries.
//!
//! A [`Connector`] is one source integration. The orchestrator drives it
//! through the `scrape_*` methods and hands it [`Register`] callbacks that
//! feed discovered children back into the registry.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │           ConnectorRegistry              │
//! │  ┌──────────────┐   ┌─────────────────┐  │
//! │  │   Profile    │   │  Plugin-loaded  │  │
//! │  │ (config.toml)│   │ (plugin.toml)   │  │
//! │  └──────────────┘   └─────────────────┘  │
//! └──────────────┬───────────────────────────┘
//!                ▼  route(url) / get(name)
//!          Harvester::harvest() → Registry
//! ```
//!
//! # Usage
//!
//! ```rust
//! use content_harvester::traits::{Collect, ConnectorRegistry};
//! use content_harvester::models::ChannelDescriptor;
//!
//! let connectors = ConnectorRegistry::new();
//! assert!(connectors.route("https://example.test/feed").is_none());
//!
//! // Read-only probes pass a collector instead of a registrar.
//! let channels: Collect<ChannelDescriptor> = Collect::new();
//! assert!(channels.into_inner().is_empty());
//! ```

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::{ExtractionError, RegistryError};
use crate::models::{
    AssetDescriptor, AssetInfo, ChannelDescriptor, ChannelInfo, FeedInfo, FileDescriptor,
    ScrapingMetadata,
};

// ═══════════════════════════════════════════════════════════════════════
// Registration callbacks
// ═══════════════════════════════════════════════════════════════════════

/// A registration callback, invoked once per discovered child.
///
/// Connectors receive `Option<&dyn Register<D>>`; `None` means the call is a
/// read-only probe and discovered children are not recorded anywhere.
#[async_trait]
pub trait Register<D: Send + 'static>: Send + Sync {
    async fn register(&self, descriptor: D) -> Result<(), RegistryError>;
}

/// A callback that only collects descriptors, in the order reported.
pub struct Collect<D> {
    items: Mutex<Vec<D>>,
}

impl<D> Collect<D> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(Vec::new()),
        }
    }

    pub fn into_inner(self) -> Vec<D> {
        self.items.into_inner().unwrap_or_else(|e| e.into_inner())
    }
}

impl<D> Default for Collect<D> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<D: Send + 'static> Register<D> for Collect<D> {
    async fn register(&self, descriptor: D) -> Result<(), RegistryError> {
        self.items
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(descriptor);
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Connector Trait
// ═══════════════════════════════════════════════════════════════════════

/// A source integration.
///
/// # Contract
///
/// - Every `scrape_*` call invokes its callbacks zero or more times, once per
///   discovered child, in the order the source reports them, then returns
///   the entity's own metadata.
/// - Extraction failures are returned as errors. "Found nothing" is an empty
///   list, never a swallowed error.
/// - Calls are safe to repeat with identical arguments; the only side
///   effects are the callbacks.
/// - [`download_asset`](Connector::download_asset) is the one operation that
///   absorbs failure: it logs and returns `None`.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Stable identifier for the source.
    fn get_source_name(&self) -> &str;

    /// Root URL of the source. Used as the Source entity's natural key.
    fn source_url(&self) -> &str;

    /// Cheap liveness probe. Gates the whole traversal.
    async fn check_connection(&self, metadata: &ScrapingMetadata) -> bool;

    /// True iff `url` belongs to this connector's authority.
    fn validate_url_responsibility(&self, url: &str) -> bool;

    async fn scrape_feed(
        &self,
        feed_url: &str,
        metadata: &ScrapingMetadata,
        channel_cb: Option<&dyn Register<ChannelDescriptor>>,
        asset_cb: Option<&dyn Register<AssetDescriptor>>,
    ) -> Result<FeedInfo, ExtractionError>;

    async fn scrape_channel(
        &self,
        channel_url: &str,
        metadata: &ScrapingMetadata,
        asset_cb: Option<&dyn Register<AssetDescriptor>>,
    ) -> Result<ChannelInfo, ExtractionError>;

    async fn scrape_asset(
        &self,
        asset_url: &str,
        metadata: &ScrapingMetadata,
        file_cb: Option<&dyn Register<FileDescriptor>>,
    ) -> Result<AssetInfo, ExtractionError>;

    /// Fetch `asset_url` and write it to `output_path`.
    ///
    /// Returns the path actually written (it may carry a detected extension),
    /// or `None` if anything went wrong. Never leaves a partial file behind.
    async fn download_asset(
        &self,
        output_path: &Path,
        asset_url: &str,
        metadata: &ScrapingMetadata,
    ) -> Option<PathBuf>;
}

// ═══════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════

/// Connectors by source name, with URL dispatch.
#[derive(Default, Clone)]
pub struct ConnectorRegistry {
    connectors: Vec<Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self {
            connectors: Vec::new(),
        }
    }

    /// Register a connector. A connector with the same source name is replaced.
    pub fn register(&mut self, connector: Arc<dyn Connector>) {
        let name = connector.get_source_name().to_string();
        self.connectors.retain(|c| c.get_source_name() != name);
        self.connectors.push(connector);
    }

    pub fn get(&self, source_name: &str) -> Option<Arc<dyn Connector>> {
        self.connectors
            .iter()
            .find(|c| c.get_source_name() == source_name)
            .cloned()
    }

    /// The first connector that claims responsibility for `url`.
    pub fn route(&self, url: &str) -> Option<Arc<dyn Connector>> {
        self.connectors
            .iter()
            .find(|c| c.validate_url_responsibility(url))
            .cloned()
    }

    pub fn connectors(&self) -> &[Arc<dyn Connector>] {
        &self.connectors
    }

    pub fn len(&self) -> usize {
        self.connectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }
}
