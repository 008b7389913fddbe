//! Declarative connector profiles.
//!
//! A profile fully determines how a [`ProfileConnector`](crate::connector_profile::ProfileConnector)
//! talks to one source: where it lives, which credential to send, and how
//! each response is turned into child descriptors and entity metadata.
//!
//! Each of the six transformation fields is either a function supplied in
//! code ([`ProfileField::Function`]) or a serialized spec resolved at
//! construction ([`ExtractionSpec`]): a named compiled policy or a sandboxed
//! Lua expression. Resolution is all-or-nothing; a missing or invalid field
//! fails construction with a [`ConfigurationError`].

use std::fmt;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::config::FeedConfig;
use crate::error::{ConfigurationError, ExtractionError};
use crate::lua_runtime::LuaExpression;
use crate::models::ScrapingMetadata;
use crate::policies::{PolicyRegistry, Transform};
use crate::response::Page;

/// Serialized form of a parser or extractor.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ExtractionSpec {
    /// Bare policy name: `channel_info_parser = "document"`.
    Named(String),
    /// Sandboxed Lua chunk: `{ lua = "return doc.json.items" }`.
    Lua { lua: String },
    /// Policy with arguments: `{ policy = "json_list", pointer = "/items" }`.
    Policy {
        policy: String,
        #[serde(flatten)]
        args: Map<String, Value>,
    },
}

/// A transformation field before resolution.
#[derive(Clone)]
pub enum ProfileField {
    Function(Transform),
    Spec(ExtractionSpec),
}

impl ProfileField {
    /// Wrap a plain function.
    pub fn function<F>(f: F) -> Self
    where
        F: Fn(&Page) -> Result<Value, ExtractionError> + Send + Sync + 'static,
    {
        ProfileField::Function(Arc::new(f))
    }

    fn resolve(
        self,
        field: &'static str,
        policies: &PolicyRegistry,
    ) -> Result<Transform, ConfigurationError> {
        let (name, args) = match self {
            ProfileField::Function(f) => return Ok(f),
            ProfileField::Spec(ExtractionSpec::Lua { lua }) => {
                return Ok(LuaExpression::compile(field, &lua)?.into_transform())
            }
            ProfileField::Spec(ExtractionSpec::Named(name)) => (name, Map::new()),
            ProfileField::Spec(ExtractionSpec::Policy { policy, args }) => (policy, args),
        };

        match policies.build(&name, &args) {
            Some(Ok(transform)) => Ok(transform),
            Some(Err(reason)) => Err(ConfigurationError::InvalidField { field, reason }),
            None => Err(ConfigurationError::UnknownPolicy { field, name }),
        }
    }
}

impl fmt::Debug for ProfileField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProfileField::Function(_) => f.write_str("Function(..)"),
            ProfileField::Spec(spec) => write!(f, "Spec({:?})", spec),
        }
    }
}

impl From<ExtractionSpec> for ProfileField {
    fn from(spec: ExtractionSpec) -> Self {
        ProfileField::Spec(spec)
    }
}

/// `[profiles.<name>]` table in the configuration file.
///
/// Every field is optional at the serde level so that a missing field is
/// reported by name through [`ConfigurationError::MissingField`].
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ProfileConfig {
    pub source: Option<String>,
    pub base_url: Option<String>,
    pub authorization: Option<String>,
    pub feed_info_parser: Option<ExtractionSpec>,
    pub channel_info_parser: Option<ExtractionSpec>,
    pub asset_info_parser: Option<ExtractionSpec>,
    pub channel_extractor: Option<ExtractionSpec>,
    pub asset_extractor: Option<ExtractionSpec>,
    pub file_extractor: Option<ExtractionSpec>,
    #[serde(default)]
    pub feeds: Vec<FeedConfig>,
    /// Default request metadata for every call made for this source.
    #[serde(default)]
    pub metadata: ScrapingMetadata,
}

/// Profile fields before resolution. Built from a [`ProfileConfig`] or in code.
#[derive(Debug, Clone, Default)]
pub struct ProfileDefinition {
    pub source: Option<String>,
    pub base_url: Option<String>,
    pub authorization: Option<String>,
    pub feed_info_parser: Option<ProfileField>,
    pub channel_info_parser: Option<ProfileField>,
    pub asset_info_parser: Option<ProfileField>,
    pub channel_extractor: Option<ProfileField>,
    pub asset_extractor: Option<ProfileField>,
    pub file_extractor: Option<ProfileField>,
}

impl From<&ProfileConfig> for ProfileDefinition {
    fn from(cfg: &ProfileConfig) -> Self {
        Self {
            source: cfg.source.clone(),
            base_url: cfg.base_url.clone(),
            authorization: cfg.authorization.clone(),
            feed_info_parser: cfg.feed_info_parser.clone().map(Into::into),
            channel_info_parser: cfg.channel_info_parser.clone().map(Into::into),
            asset_info_parser: cfg.asset_info_parser.clone().map(Into::into),
            channel_extractor: cfg.channel_extractor.clone().map(Into::into),
            asset_extractor: cfg.asset_extractor.clone().map(Into::into),
            file_extractor: cfg.file_extractor.clone().map(Into::into),
        }
    }
}

/// A fully resolved profile.
#[derive(Clone)]
pub struct Profile {
    pub source: String,
    pub base_url: url::Url,
    /// Resolved credential; empty when the source needs none.
    pub authorization: String,
    pub feed_info_parser: Transform,
    pub channel_info_parser: Transform,
    pub asset_info_parser: Transform,
    pub channel_extractor: Transform,
    pub asset_extractor: Transform,
    pub file_extractor: Transform,
}

impl fmt::Debug for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Profile")
            .field("source", &self.source)
            .field("base_url", &self.base_url.as_str())
            .field("authorization", &if self.authorization.is_empty() { "" } else { "<set>" })
            .finish_non_exhaustive()
    }
}

impl ProfileDefinition {
    /// Resolve every field. Fails on the first missing or invalid one.
    pub fn resolve(self, policies: &PolicyRegistry) -> Result<Profile, ConfigurationError> {
        fn required<T>(value: Option<T>, field: &'static str) -> Result<T, ConfigurationError> {
            value.ok_or(ConfigurationError::MissingField(field))
        }

        let source = required(self.source, "source")?;
        if source.trim().is_empty() {
            return Err(ConfigurationError::InvalidField {
                field: "source",
                reason: "must not be empty".into(),
            });
        }

        let raw_base = required(self.base_url, "base_url")?;
        let base_url = url::Url::parse(&raw_base).map_err(|e| ConfigurationError::InvalidField {
            field: "base_url",
            reason: e.to_string(),
        })?;
        if base_url.host_str().is_none() {
            return Err(ConfigurationError::InvalidField {
                field: "base_url",
                reason: "must include a host".into(),
            });
        }

        let authorization = resolve_authorization(&required(self.authorization, "authorization")?);

        Ok(Profile {
            source,
            base_url,
            authorization,
            feed_info_parser: required(self.feed_info_parser, "feed_info_parser")?
                .resolve("feed_info_parser", policies)?,
            channel_info_parser: required(self.channel_info_parser, "channel_info_parser")?
                .resolve("channel_info_parser", policies)?,
            asset_info_parser: required(self.asset_info_parser, "asset_info_parser")?
                .resolve("asset_info_parser", policies)?,
            channel_extractor: required(self.channel_extractor, "channel_extractor")?
                .resolve("channel_extractor", policies)?,
            asset_extractor: required(self.asset_extractor, "asset_extractor")?
                .resolve("asset_extractor", policies)?,
            file_extractor: required(self.file_extractor, "file_extractor")?
                .resolve("file_extractor", policies)?,
        })
    }
}

/// Treat `value` as an environment variable name first, falling back to the
/// literal value.
pub fn resolve_authorization(value: &str) -> String {
    if value.is_empty() {
        return String::new();
    }
    std::env::var(value).unwrap_or_else(|_| value.to_string())
}
