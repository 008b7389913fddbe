//! Plugin loader.
//!
//! A plugin is a directory holding a `plugin.toml` manifest and the profile
//! it drives. Plugins never ship code: the manifest names one of the
//! connector factories compiled into this crate, and the loader checks the
//! whole contract before handing back a connector, so a bad plugin fails at
//! load rather than at its first call.
//!
//! ```toml
//! [plugin]
//! name = "example"
//! connector = "profile"
//! abi = 1
//! capabilities = ["get_source_name", "check_connection", "scrape_feed",
//!                 "scrape_channel", "scrape_asset", "download_asset"]
//! profile = "profile.toml"
//! security_hash = "<sha256 of profile.toml>"   # optional
//! ```
//!
//! Load order: manifest → ABI → factory → capabilities → provenance →
//! profile → connector.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::connector_profile::ProfileConnector;
use crate::error::{ConfigurationError, PluginError};
use crate::harvest::HarvestTarget;
use crate::policies::PolicyRegistry;
use crate::profile::{ProfileConfig, ProfileDefinition};
use crate::traits::Connector;

/// Manifest ABI this build understands.
pub const PLUGIN_ABI_VERSION: u32 = 1;

pub const MANIFEST_FILE: &str = "plugin.toml";

/// Capabilities every plugin must declare and its factory must provide.
pub const REQUIRED_CAPABILITIES: &[&str] = &[
    "get_source_name",
    "check_connection",
    "scrape_channel",
    "scrape_asset",
    "download_asset",
];

const PROFILE_CAPABILITIES: &[&str] = &[
    "get_source_name",
    "check_connection",
    "validate_url_responsibility",
    "scrape_feed",
    "scrape_channel",
    "scrape_asset",
    "download_asset",
];

type BuildFn = fn(&ProfileConfig, &PolicyRegistry) -> Result<Arc<dyn Connector>, ConfigurationError>;

/// A connector implementation known at compile time.
#[derive(Clone)]
pub struct ConnectorFactory {
    pub name: &'static str,
    pub capabilities: &'static [&'static str],
    pub build: BuildFn,
}

fn build_profile(
    config: &ProfileConfig,
    policies: &PolicyRegistry,
) -> Result<Arc<dyn Connector>, ConfigurationError> {
    let connector = ProfileConnector::new(ProfileDefinition::from(config), policies)?;
    Ok(Arc::new(connector))
}

#[derive(Debug, Deserialize)]
struct ManifestFile {
    plugin: Manifest,
}

/// The `[plugin]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    pub name: String,
    pub connector: String,
    pub abi: u32,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub profile: PathBuf,
    #[serde(default)]
    pub security_hash: Option<String>,
}

/// A plugin that passed every check.
pub struct LoadedPlugin {
    pub name: String,
    pub manifest_path: PathBuf,
    pub connector: Arc<dyn Connector>,
    pub target: HarvestTarget,
}

/// Resolves plugin manifests against the static factory table.
pub struct PluginLoader {
    factories: Vec<ConnectorFactory>,
    policies: PolicyRegistry,
}

impl PluginLoader {
    pub fn new(policies: PolicyRegistry) -> Self {
        Self {
            factories: vec![ConnectorFactory {
                name: "profile",
                capabilities: PROFILE_CAPABILITIES,
                build: build_profile,
            }],
            policies,
        }
    }

    /// Add or replace a factory.
    pub fn register_factory(&mut self, factory: ConnectorFactory) {
        self.factories.retain(|f| f.name != factory.name);
        self.factories.push(factory);
    }

    pub fn factory(&self, name: &str) -> Option<&ConnectorFactory> {
        self.factories.iter().find(|f| f.name == name)
    }

    /// Load and verify the plugin described by `manifest_path`.
    pub fn load(&self, manifest_path: &Path) -> Result<LoadedPlugin, PluginError> {
        let manifest = read_manifest(manifest_path)?;

        if manifest.abi != PLUGIN_ABI_VERSION {
            return Err(PluginError::AbiMismatch {
                plugin: manifest.name,
                found: manifest.abi,
                expected: PLUGIN_ABI_VERSION,
            });
        }

        let factory =
            self.factory(&manifest.connector)
                .ok_or_else(|| PluginError::UnknownConnector {
                    plugin: manifest.name.clone(),
                    connector: manifest.connector.clone(),
                })?;

        for capability in REQUIRED_CAPABILITIES {
            let declared = manifest.capabilities.iter().any(|c| c == capability);
            if !declared || !factory.capabilities.contains(capability) {
                return Err(PluginError::MissingCapability {
                    plugin: manifest.name,
                    capability: capability.to_string(),
                });
            }
        }
        if let Some(extra) = manifest
            .capabilities
            .iter()
            .find(|c| !factory.capabilities.contains(&c.as_str()))
        {
            return Err(PluginError::MissingCapability {
                plugin: manifest.name.clone(),
                capability: extra.clone(),
            });
        }

        let base = manifest_path.parent().unwrap_or_else(|| Path::new("."));
        let profile_path = base.join(&manifest.profile);
        let bytes = std::fs::read(&profile_path).map_err(|source| PluginError::Io {
            path: profile_path.clone(),
            source,
        })?;

        if let Some(expected) = &manifest.security_hash {
            let found = hex::encode(Sha256::digest(&bytes));
            if !found.eq_ignore_ascii_case(expected.trim()) {
                return Err(PluginError::ProvenanceMismatch {
                    plugin: manifest.name,
                    expected: expected.clone(),
                    found,
                });
            }
        }

        let text = String::from_utf8_lossy(&bytes);
        let profile: ProfileConfig = toml::from_str(&text).map_err(|source| PluginError::Parse {
            path: profile_path.clone(),
            source,
        })?;

        let connector =
            (factory.build)(&profile, &self.policies).map_err(|source| PluginError::Configuration {
                plugin: manifest.name.clone(),
                source,
            })?;

        tracing::info!(
            plugin = %manifest.name,
            connector = %manifest.connector,
            source = %connector.get_source_name(),
            "plugin loaded"
        );

        Ok(LoadedPlugin {
            name: manifest.name,
            manifest_path: manifest_path.to_path_buf(),
            connector,
            target: HarvestTarget::from_profile(&profile),
        })
    }

    /// Load every plugin under `dir`. Each result stands alone; one bad
    /// plugin does not stop the others.
    pub fn load_dir(&self, dir: &Path) -> Vec<(PathBuf, Result<LoadedPlugin, PluginError>)> {
        discover(dir)
            .into_iter()
            .map(|path| {
                let result = self.load(&path);
                if let Err(e) = &result {
                    tracing::warn!(path = %path.display(), error = %e, "plugin rejected");
                }
                (path, result)
            })
            .collect()
    }
}

fn read_manifest(path: &Path) -> Result<Manifest, PluginError> {
    let content = std::fs::read_to_string(path).map_err(|source| PluginError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let file: ManifestFile = toml::from_str(&content).map_err(|source| PluginError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(file.plugin)
}

/// Manifest paths under `dir`, sorted. A missing directory yields nothing.
pub fn discover(dir: &Path) -> Vec<PathBuf> {
    let mut found: Vec<PathBuf> = WalkDir::new(dir)
        .max_depth(2)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && e.file_name() == MANIFEST_FILE)
        .map(|e| e.into_path())
        .collect();
    found.sort();
    found
}
