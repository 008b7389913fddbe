//! Error taxonomy for the harvesting pipeline.
//!
//! Each layer owns one error type so callers can tell apart a broken
//! profile, an extraction that went wrong, a registry refusal, and a
//! source that could not be reached.
//!
//! | Type | Raised by | Policy |
//! |------|-----------|--------|
//! | [`ConfigurationError`] | profile / connector construction | fatal, nothing is built |
//! | [`ExtractionError`] | `scrape_*` | propagated to the orchestrator |
//! | [`DownloadError`] | `download_asset` internals | absorbed, logged, surfaced as `None` |
//! | [`RegistryError`] | registry backends | propagated |
//! | [`PluginError`] | plugin loader | load-time failure |
//! | [`HarvestError`] | orchestrator | returned to the caller |

use std::path::PathBuf;

use thiserror::Error;

use crate::models::EntityKind;

/// A profile or connector definition that cannot be turned into a connector.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("profile is missing required field '{0}'")]
    MissingField(&'static str),

    #[error("profile field '{field}' is invalid: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("unknown extraction policy '{name}' for field '{field}'")]
    UnknownPolicy { field: &'static str, name: String },

    #[error("Lua expression for '{field}' does not compile: {reason}")]
    InvalidExpression { field: &'static str, reason: String },

    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

/// A scrape call that could not produce a trustworthy result.
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("request to {url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("response from {url} is neither JSON nor HTML")]
    UnparseableResponse { url: String },

    #[error("{stage} failed: {message}")]
    Transform { stage: String, message: String },

    #[error("{stage} produced an invalid descriptor: {message}")]
    InvalidDescriptor { stage: String, message: String },

    #[error("invalid request metadata: {0}")]
    Metadata(String),

    #[error("registration callback failed: {0}")]
    Registration(#[from] RegistryError),
}

impl ExtractionError {
    pub fn transform(stage: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Transform {
            stage: stage.into(),
            message: message.to_string(),
        }
    }
}

/// Failure while fetching or writing asset bytes.
///
/// Never crosses the connector boundary: `download_asset` logs it and
/// reports `None`.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("request to {url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid request metadata: {0}")]
    Metadata(String),
}

/// The registry refused or failed an operation.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{kind} requires a '{field}' parent reference")]
    MissingParentRef { kind: EntityKind, field: &'static str },

    #[error("{kind} {id} does not exist or is inactive")]
    MissingParent { kind: EntityKind, id: i64 },

    #[error("{kind} natural key must not be empty")]
    EmptyKey { kind: EntityKind },

    #[error("{kind} requires field '{field}'")]
    MissingField { kind: EntityKind, field: &'static str },

    #[error("stored JSON is malformed: {0}")]
    Json(#[from] serde_json::Error),
}

/// A plugin that fails the loader contract.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("plugin '{plugin}' targets ABI {found}, expected {expected}")]
    AbiMismatch {
        plugin: String,
        found: u32,
        expected: u32,
    },

    #[error("plugin '{plugin}' does not implement '{capability}'")]
    MissingCapability { plugin: String, capability: String },

    #[error("plugin '{plugin}' failed provenance check: expected {expected}, found {found}")]
    ProvenanceMismatch {
        plugin: String,
        expected: String,
        found: String,
    },

    #[error("plugin '{plugin}' names unknown connector '{connector}'")]
    UnknownConnector { plugin: String, connector: String },

    #[error("plugin '{plugin}' has an invalid profile: {source}")]
    Configuration {
        plugin: String,
        #[source]
        source: ConfigurationError,
    },
}

/// Outcome of a harvest that could not run to completion.
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("source '{source_name}' is unreachable")]
    Connectivity { source_name: String },

    #[error("extraction of {url} failed: {source}")]
    Extraction {
        url: String,
        #[source]
        source: ExtractionError,
    },

    #[error("{url} did not finish within {secs}s")]
    Timeout { url: String, secs: u64 },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}
