//! Core data models used throughout the harvester.
//!
//! Entities are the rows the registry owns; descriptors are what connectors
//! report about discovered children; [`ScrapingMetadata`] shapes the HTTP
//! request issued for an entity.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::expand_env_vars;

/// Metadata returned by `scrape_feed`.
pub type FeedInfo = Map<String, Value>;
/// Metadata returned by `scrape_channel`.
pub type ChannelInfo = Map<String, Value>;
/// Metadata returned by `scrape_asset`.
pub type AssetInfo = Map<String, Value>;

/// Level of the content hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Source,
    Feed,
    Channel,
    Asset,
    File,
}

impl EntityKind {
    pub const ALL: [EntityKind; 5] = [
        EntityKind::Source,
        EntityKind::Feed,
        EntityKind::Channel,
        EntityKind::Asset,
        EntityKind::File,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Source => "source",
            EntityKind::Feed => "feed",
            EntityKind::Channel => "channel",
            EntityKind::Asset => "asset",
            EntityKind::File => "file",
        }
    }

    /// Column holding the natural key: the content hash for files, the URL
    /// for everything else.
    pub fn key_column(&self) -> &'static str {
        match self {
            EntityKind::File => "sha256",
            _ => "url",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// A registry row. Columns that do not apply to a kind stay `None`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Entity {
    pub id: i64,
    pub kind: EntityKind,
    pub url: Option<String>,
    pub name: Option<String>,
    pub scraping_metadata: Option<Value>,
    pub info: Option<Value>,
    pub source_id: Option<i64>,
    pub feed_id: Option<i64>,
    pub channel_id: Option<i64>,
    pub asset_id: Option<i64>,
    pub path: Option<String>,
    pub encoding: Option<String>,
    pub extension: Option<String>,
    pub sha256: Option<String>,
    pub created: i64,
    pub updated: i64,
    pub inactive: bool,
}

/// Fields supplied with an upsert. `None` means "leave as is".
#[derive(Debug, Clone, Default)]
pub struct EntityFields {
    pub url: Option<String>,
    pub name: Option<String>,
    pub scraping_metadata: Option<Value>,
    pub info: Option<Value>,
    pub source_id: Option<i64>,
    pub feed_id: Option<i64>,
    pub channel_id: Option<i64>,
    pub asset_id: Option<i64>,
    pub path: Option<String>,
    pub encoding: Option<String>,
    pub extension: Option<String>,
}

/// Parent filter for [`crate::registry::Registry::children`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentRef {
    Source(i64),
    Feed(i64),
    Channel(i64),
    Asset(i64),
}

impl ParentRef {
    pub fn column(&self) -> &'static str {
        match self {
            ParentRef::Source(_) => "source_id",
            ParentRef::Feed(_) => "feed_id",
            ParentRef::Channel(_) => "channel_id",
            ParentRef::Asset(_) => "asset_id",
        }
    }

    pub fn id(&self) -> i64 {
        match self {
            ParentRef::Source(id)
            | ParentRef::Feed(id)
            | ParentRef::Channel(id)
            | ParentRef::Asset(id) => *id,
        }
    }

    pub fn matches(&self, entity: &Entity) -> bool {
        let value = match self {
            ParentRef::Source(_) => entity.source_id,
            ParentRef::Feed(_) => entity.feed_id,
            ParentRef::Channel(_) => entity.channel_id,
            ParentRef::Asset(_) => entity.asset_id,
        };
        value == Some(self.id())
    }
}

/// Per-request options forwarded to the HTTP layer.
///
/// Stored verbatim as an entity's `scraping_metadata`. Unknown keys are kept
/// in `extra` so profiles can carry connector-specific hints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScrapingMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
    /// Scheme (`http`, `https`, `all`) to proxy URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxies: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookies: Option<BTreeMap<String, String>>,
    /// Write response bodies chunk by chunk instead of buffering them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    /// TLS certificate verification; `Some(false)` disables it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify: Option<bool>,
    /// PEM file holding a client certificate and its private key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert: Option<PathBuf>,
    /// Append a detected extension to download paths.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub add_extension: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ScrapingMetadata {
    /// Layer `self` over `base`: scalar options in `self` win, header and
    /// cookie maps are merged key by key.
    pub fn layered_over(&self, base: &ScrapingMetadata) -> ScrapingMetadata {
        fn merge_maps(
            top: &Option<BTreeMap<String, String>>,
            base: &Option<BTreeMap<String, String>>,
        ) -> Option<BTreeMap<String, String>> {
            match (top, base) {
                (None, None) => None,
                (Some(t), None) => Some(t.clone()),
                (None, Some(b)) => Some(b.clone()),
                (Some(t), Some(b)) => {
                    let mut merged = b.clone();
                    merged.extend(t.iter().map(|(k, v)| (k.clone(), v.clone())));
                    Some(merged)
                }
            }
        }

        let mut extra = base.extra.clone();
        extra.extend(self.extra.iter().map(|(k, v)| (k.clone(), v.clone())));

        ScrapingMetadata {
            headers: merge_maps(&self.headers, &base.headers),
            proxies: merge_maps(&self.proxies, &base.proxies),
            cookies: merge_maps(&self.cookies, &base.cookies),
            stream: self.stream.or(base.stream),
            verify: self.verify.or(base.verify),
            cert: self.cert.clone().or_else(|| base.cert.clone()),
            add_extension: self.add_extension.or(base.add_extension),
            extra,
        }
    }

    /// Expand `${VAR}` references in header, cookie and proxy values.
    pub fn expanded(&self) -> ScrapingMetadata {
        let expand = |map: &Option<BTreeMap<String, String>>| {
            map.as_ref().map(|m| {
                m.iter()
                    .map(|(k, v)| (k.clone(), expand_env_vars(v)))
                    .collect::<BTreeMap<_, _>>()
            })
        };
        ScrapingMetadata {
            headers: expand(&self.headers),
            proxies: expand(&self.proxies),
            cookies: expand(&self.cookies),
            ..self.clone()
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn is_empty(&self) -> bool {
        *self == ScrapingMetadata::default()
    }
}

/// A child entity reported by a connector.
pub trait Descriptor: DeserializeOwned + Send + Sync + 'static {
    /// Human-readable stage name used in error messages.
    const STAGE: &'static str;

    fn url(&self) -> &str;
    fn set_url(&mut self, url: String);
}

/// A channel discovered while scraping a feed.
///
/// Keys other than the named fields are kept in `extra` and stored with the
/// channel's info (see [`ChannelDescriptor::take_info`]).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelDescriptor {
    pub url: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub info: Option<Value>,
    #[serde(default)]
    pub scraping_metadata: Option<ScrapingMetadata>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

/// An asset discovered while scraping a feed or a channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssetDescriptor {
    pub url: String,
    #[serde(default)]
    pub info: Option<Value>,
    #[serde(default)]
    pub scraping_metadata: Option<ScrapingMetadata>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl ChannelDescriptor {
    /// Info to store for this channel: `info` plus any unrecognised keys.
    pub fn take_info(&mut self) -> Option<Value> {
        fold_info(self.info.take(), std::mem::take(&mut self.extra))
    }
}

impl AssetDescriptor {
    /// Info to store for this asset: `info` plus any unrecognised keys.
    pub fn take_info(&mut self) -> Option<Value> {
        fold_info(self.info.take(), std::mem::take(&mut self.extra))
    }
}

/// Keys set in `info` win over extra keys of the same name. A non-object
/// `info` is kept under the `info` key.
fn fold_info(info: Option<Value>, mut extra: Map<String, Value>) -> Option<Value> {
    if extra.is_empty() {
        return info;
    }
    match info {
        Some(Value::Object(own)) => extra.extend(own),
        Some(other) => {
            extra.insert("info".to_string(), other);
        }
        None => {}
    }
    Some(Value::Object(extra))
}

/// A downloadable file discovered while scraping an asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub url: String,
    #[serde(default)]
    pub encoding: Option<String>,
    #[serde(default)]
    pub extension: Option<String>,
    #[serde(default)]
    pub scraping_metadata: Option<ScrapingMetadata>,
}

macro_rules! impl_descriptor {
    ($ty:ty, $stage:literal) => {
        impl Descriptor for $ty {
            const STAGE: &'static str = $stage;

            fn url(&self) -> &str {
                &self.url
            }

            fn set_url(&mut self, url: String) {
                self.url = url;
            }
        }
    };
}

impl_descriptor!(ChannelDescriptor, "channel_extractor");
impl_descriptor!(AssetDescriptor, "asset_extractor");
impl_descriptor!(FileDescriptor, "file_extractor");
