//! Source resolution and listing.
//!
//! Sources come from two places: `[profiles.<name>]` tables in the config
//! file, and plugin manifests under `[plugins].dir`. Both end up as a
//! connector plus the feeds to harvest.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::Config;
use crate::connector_profile::ProfileConnector;
use crate::harvest::HarvestTarget;
use crate::plugins::PluginLoader;
use crate::policies::PolicyRegistry;
use crate::profile::ProfileDefinition;
use crate::traits::Connector;

/// Where a source was defined.
#[derive(Debug, Clone)]
pub enum Origin {
    Profile,
    Plugin(PathBuf),
}

/// A ready-to-harvest source.
pub struct SourceEntry {
    pub name: String,
    pub origin: Origin,
    pub connector: Arc<dyn Connector>,
    pub target: HarvestTarget,
}

/// Build every configured source.
///
/// Invalid profiles are fatal. Rejected plugins are logged and skipped,
/// since they live outside the config file.
pub fn load_sources(config: &Config) -> Result<Vec<SourceEntry>> {
    let mut entries = Vec::new();

    for (name, profile) in &config.profiles {
        let connector = ProfileConnector::new(
            ProfileDefinition::from(profile),
            &PolicyRegistry::with_builtins(),
        )
        .with_context(|| format!("profiles.{}", name))?;
        entries.push(SourceEntry {
            name: name.clone(),
            origin: Origin::Profile,
            connector: Arc::new(connector),
            target: HarvestTarget::from_profile(profile),
        });
    }

    if let Some(dir) = &config.plugins.dir {
        let loader = PluginLoader::new(PolicyRegistry::with_builtins());
        for (_, result) in loader.load_dir(dir) {
            let Ok(plugin) = result else { continue };
            if entries.iter().any(|e| e.name == plugin.name) {
                tracing::warn!(plugin = %plugin.name, "plugin shadows a profile, ignoring");
                continue;
            }
            entries.push(SourceEntry {
                name: plugin.name,
                origin: Origin::Plugin(plugin.manifest_path),
                connector: plugin.connector,
                target: plugin.target,
            });
        }
    }

    Ok(entries)
}

/// Pick sources by name, or all of them for `"all"`.
pub fn select(entries: Vec<SourceEntry>, name: &str) -> Result<Vec<SourceEntry>> {
    if name == "all" {
        return Ok(entries);
    }
    let picked: Vec<SourceEntry> = entries.into_iter().filter(|e| e.name == name).collect();
    if picked.is_empty() {
        anyhow::bail!("No source named '{}'. Run `harvester sources` to list them.", name);
    }
    Ok(picked)
}

pub async fn list_sources(config: &Config, check: bool) -> Result<()> {
    let entries = load_sources(config)?;

    if entries.is_empty() {
        println!("No sources configured.");
        return Ok(());
    }

    println!(
        "{:<20} {:<10} {:>6}  {:<32} {}",
        "SOURCE", "ORIGIN", "FEEDS", "BASE URL", if check { "REACHABLE" } else { "" }
    );
    for entry in &entries {
        let origin = match &entry.origin {
            Origin::Profile => "profile",
            Origin::Plugin(_) => "plugin",
        };
        let reachable = if check {
            let ok = entry.connector.check_connection(&entry.target.metadata).await;
            if ok { "yes" } else { "no" }
        } else {
            ""
        };
        println!(
            "{:<20} {:<10} {:>6}  {:<32} {}",
            entry.name,
            origin,
            entry.target.feeds.len(),
            entry.connector.source_url(),
            reachable
        );
    }

    Ok(())
}
