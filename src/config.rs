use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::models::ScrapingMetadata;
use crate::profile::ProfileConfig;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub harvest: HarvestConfig,
    #[serde(default)]
    pub plugins: PluginsConfig,
    #[serde(default)]
    pub profiles: BTreeMap<String, ProfileConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// What the orchestrator does when a scrape call keeps failing.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionErrorPolicy {
    /// Record the failure and keep traversing siblings.
    #[default]
    Skip,
    /// Stop harvesting the source and return the error.
    Abort,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HarvestConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub on_extraction_error: ExtractionErrorPolicy,
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    #[serde(default = "default_download")]
    pub download: bool,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            request_timeout_secs: default_request_timeout_secs(),
            max_retries: default_max_retries(),
            on_extraction_error: ExtractionErrorPolicy::default(),
            download_dir: default_download_dir(),
            download: default_download(),
        }
    }
}

fn default_concurrency() -> usize {
    4
}
fn default_request_timeout_secs() -> u64 {
    60
}
fn default_max_retries() -> u32 {
    1
}
fn default_download_dir() -> PathBuf {
    PathBuf::from("./data/files")
}
fn default_download() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct PluginsConfig {
    /// Directory scanned for `*/plugin.toml` manifests.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

/// A feed entry in a profile: either a bare URL or a table.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum FeedConfig {
    Url(String),
    Detailed {
        url: String,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        metadata: Option<ScrapingMetadata>,
    },
}

impl FeedConfig {
    pub fn url(&self) -> &str {
        match self {
            FeedConfig::Url(url) => url,
            FeedConfig::Detailed { url, .. } => url,
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            FeedConfig::Url(_) => None,
            FeedConfig::Detailed { name, .. } => name.as_deref(),
        }
    }

    pub fn metadata(&self) -> Option<&ScrapingMetadata> {
        match self {
            FeedConfig::Url(_) => None,
            FeedConfig::Detailed { metadata, .. } => metadata.as_ref(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read {}", path.display()))?;

    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    if config.harvest.concurrency == 0 {
        anyhow::bail!("harvest.concurrency must be > 0");
    }

    if config.harvest.request_timeout_secs == 0 {
        anyhow::bail!("harvest.request_timeout_secs must be > 0");
    }

    for (name, profile) in &config.profiles {
        for feed in &profile.feeds {
            if url::Url::parse(feed.url()).is_err() {
                anyhow::bail!("profiles.{}: feed '{}' is not a valid URL", name, feed.url());
            }
        }
    }

    Ok(config)
}

/// Replace `${NAME}` with the value of the environment variable `NAME`,
/// or nothing when it is unset. Substituted values are not rescanned and an
/// unterminated `${` is kept as written.
pub(crate) fn expand_env_vars(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(open) = rest.find("${") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let Some(close) = after.find('}') else {
            out.push_str(&rest[open..]);
            return out;
        };
        out.push_str(&std::env::var(&after[..close]).unwrap_or_default());
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    out
}
