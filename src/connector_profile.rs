//! Profile-driven connector.
//!
//! Behavior comes entirely from a resolved [`Profile`]: requests are shaped
//! from per-call [`ScrapingMetadata`], responses are interpreted as JSON with
//! an HTML fallback, and the profile's extractors and info parsers turn each
//! page into child descriptors and entity metadata.
//!
//! Extractors and parsers run on a blocking thread (they may be Lua chunks)
//! and all of them finish before any callback fires, so a failing parser
//! never leaves half of a page's children registered.
//!
//! # Request shaping
//!
//! | Metadata key | Effect |
//! |--------------|--------|
//! | `headers` | added to the request; an `Authorization` here wins over the profile credential |
//! | `cookies` | joined into one `Cookie` header |
//! | `proxies` | `http` / `https` / `all` proxy URLs |
//! | `verify` | `false` disables TLS certificate checks |
//! | `cert` | PEM client identity |
//! | `stream` | downloads write chunk by chunk (default `true`) |
//! | `add_extension` | downloads get a detected extension appended |

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, COOKIE};
use serde_json::{Map, Value};
use tokio::io::AsyncWriteExt;

use crate::error::{ConfigurationError, DownloadError, ExtractionError};
use crate::models::{
    AssetDescriptor, AssetInfo, ChannelDescriptor, ChannelInfo, Descriptor, FeedInfo,
    FileDescriptor, ScrapingMetadata,
};
use crate::policies::{PolicyRegistry, Transform};
use crate::profile::{Profile, ProfileDefinition};
use crate::response::{interpret, resolve_url, Page};
use crate::traits::{Connector, Register};

/// A connector whose behavior is fully determined by a [`Profile`].
pub struct ProfileConnector {
    profile: Profile,
    client: reqwest::Client,
}

impl ProfileConnector {
    /// Resolve `definition` and build the connector. Fails on the first
    /// missing or invalid field; nothing is constructed in that case.
    pub fn new(
        definition: ProfileDefinition,
        policies: &PolicyRegistry,
    ) -> Result<Self, ConfigurationError> {
        Self::from_profile(definition.resolve(policies)?)
    }

    pub fn from_profile(profile: Profile) -> Result<Self, ConfigurationError> {
        let client = client_builder().build()?;
        Ok(Self { profile, client })
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    /// Build a GET request for `url` shaped by `meta`.
    fn request(
        &self,
        url: &str,
        meta: &ScrapingMetadata,
    ) -> Result<reqwest::RequestBuilder, String> {
        let client = if needs_dedicated_client(meta) {
            dedicated_client(meta)?
        } else {
            self.client.clone()
        };

        let mut request = client.get(url);
        let mut has_authorization = false;

        if let Some(headers) = &meta.headers {
            for (name, value) in headers {
                has_authorization |= name.eq_ignore_ascii_case(AUTHORIZATION.as_str());
                request = request.header(name.as_str(), value.as_str());
            }
        }
        if !has_authorization && !self.profile.authorization.is_empty() {
            request = request.header(AUTHORIZATION, self.profile.authorization.as_str());
        }
        if let Some(cookies) = meta.cookies.as_ref().filter(|c| !c.is_empty()) {
            let joined = cookies
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join("; ");
            request = request.header(COOKIE, joined);
        }

        Ok(request)
    }

    async fn fetch(&self, url: &str, metadata: &ScrapingMetadata) -> Result<Page, ExtractionError> {
        let meta = metadata.expanded();
        let request = self.request(url, &meta).map_err(ExtractionError::Metadata)?;
        let response = request
            .send()
            .await
            .map_err(|source| ExtractionError::Request {
                url: url.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ExtractionError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let final_url = response.url().to_string();
        let body = response
            .bytes()
            .await
            .map_err(|source| ExtractionError::Request {
                url: url.to_string(),
                source,
            })?;

        interpret(&final_url, &body)
    }

    async fn try_download(
        &self,
        output_path: &Path,
        asset_url: &str,
        metadata: &ScrapingMetadata,
    ) -> Result<PathBuf, DownloadError> {
        let meta = metadata.expanded();
        let request = self
            .request(asset_url, &meta)
            .map_err(DownloadError::Metadata)?;
        let response = request
            .send()
            .await
            .map_err(|source| DownloadError::Request {
                url: asset_url.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::Status {
                url: asset_url.to_string(),
                status: status.as_u16(),
            });
        }

        let mut path = output_path.to_path_buf();
        if meta.add_extension == Some(true) {
            let content_type = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok());
            if let Some(ext) = detect_extension(content_type, response.url()) {
                path = with_extension_appended(&path, &ext);
            }
        }

        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source: std::io::Error| DownloadError::Io { path, source }
        };

        tokio::fs::create_dir_all(&dir).await.map_err(io_err(&dir))?;
        let staged = tempfile::NamedTempFile::new_in(&dir).map_err(io_err(&dir))?;
        let (std_file, temp_path) = staged.into_parts();
        let mut file = tokio::fs::File::from_std(std_file);

        if meta.stream.unwrap_or(true) {
            let mut body = response.bytes_stream();
            while let Some(chunk) = body.next().await {
                let chunk = chunk.map_err(|source| DownloadError::Request {
                    url: asset_url.to_string(),
                    source,
                })?;
                file.write_all(&chunk).await.map_err(io_err(&path))?;
            }
        } else {
            let bytes = response
                .bytes()
                .await
                .map_err(|source| DownloadError::Request {
                    url: asset_url.to_string(),
                    source,
                })?;
            file.write_all(&bytes).await.map_err(io_err(&path))?;
        }

        file.flush().await.map_err(io_err(&path))?;
        file.sync_all().await.map_err(io_err(&path))?;
        drop(file);

        temp_path
            .persist(&path)
            .map_err(|e| DownloadError::Io {
                path: path.clone(),
                source: e.error,
            })?;

        Ok(path)
    }
}

fn client_builder() -> reqwest::ClientBuilder {
    reqwest::Client::builder().user_agent(concat!(
        env!("CARGO_PKG_NAME"),
        "/",
        env!("CARGO_PKG_VERSION")
    ))
}

fn needs_dedicated_client(meta: &ScrapingMetadata) -> bool {
    meta.verify == Some(false)
        || meta.cert.is_some()
        || meta.proxies.as_ref().is_some_and(|p| !p.is_empty())
}

fn dedicated_client(meta: &ScrapingMetadata) -> Result<reqwest::Client, String> {
    let mut builder = client_builder();

    if meta.verify == Some(false) {
        builder = builder.danger_accept_invalid_certs(true);
    }
    if let Some(proxies) = &meta.proxies {
        for (scheme, target) in proxies {
            let proxy = match scheme.as_str() {
                "http" => reqwest::Proxy::http(target.as_str()),
                "https" => reqwest::Proxy::https(target.as_str()),
                _ => reqwest::Proxy::all(target.as_str()),
            }
            .map_err(|e| format!("invalid proxy '{}': {}", target, e))?;
            builder = builder.proxy(proxy);
        }
    }
    if let Some(cert) = &meta.cert {
        let pem = std::fs::read(cert)
            .map_err(|e| format!("cannot read certificate {}: {}", cert.display(), e))?;
        let identity = reqwest::Identity::from_pem(&pem)
            .map_err(|e| format!("invalid certificate {}: {}", cert.display(), e))?;
        builder = builder.identity(identity);
    }

    builder.build().map_err(|e| e.to_string())
}

/// Pick an extension for a download: the URL's own extension when it agrees
/// with `Content-Type`, else the first extension registered for the MIME
/// type, else the URL's extension.
fn detect_extension(content_type: Option<&str>, url: &url::Url) -> Option<String> {
    let url_ext = Path::new(url.path())
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);

    let mime = content_type
        .and_then(|ct| ct.split(';').next())
        .map(|m| m.trim().to_ascii_lowercase())
        .filter(|m| !m.is_empty() && m != "application/octet-stream");

    if let Some(mime) = mime {
        if let Some(ext) = &url_ext {
            if mime_guess::from_ext(ext)
                .iter()
                .any(|m| m.essence_str() == mime)
            {
                return url_ext;
            }
        }
        if let Some(first) = mime_guess::get_mime_extensions_str(&mime).and_then(|e| e.first()) {
            return Some(first.to_string());
        }
    }

    url_ext
}

fn with_extension_appended(path: &Path, ext: &str) -> PathBuf {
    if path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(ext))
    {
        return path.to_path_buf();
    }
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(ext);
    path.with_file_name(name)
}

/// Run transforms off the async runtime.
async fn run_blocking<T, F>(f: F) -> Result<T, ExtractionError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ExtractionError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ExtractionError::transform("extraction", e))?
}

/// Turn an extractor's output into typed descriptors, resolving relative URLs
/// against the page they came from.
fn descriptors<D: Descriptor>(
    transform: &Transform,
    page: &Page,
) -> Result<Vec<D>, ExtractionError> {
    let invalid = |message: String| ExtractionError::InvalidDescriptor {
        stage: D::STAGE.to_string(),
        message,
    };

    let items = match transform(page)? {
        Value::Array(items) => items,
        // An empty Lua table converts to `{}`.
        Value::Object(map) if map.is_empty() => Vec::new(),
        Value::Null => return Err(invalid("extractor returned nothing".into())),
        other => return Err(invalid(format!("expected a list, got {}", other))),
    };

    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| {
            let mut descriptor: D = serde_json::from_value(item)
                .map_err(|e| invalid(format!("entry {}: {}", i, e)))?;
            if descriptor.url().trim().is_empty() {
                return Err(invalid(format!("entry {}: url is empty", i)));
            }
            let resolved = resolve_url(&page.url, descriptor.url());
            descriptor.set_url(resolved);
            Ok(descriptor)
        })
        .collect()
}

fn info(
    parser: &Transform,
    page: &Page,
    stage: &'static str,
) -> Result<Map<String, Value>, ExtractionError> {
    match parser(page)? {
        Value::Object(map) => Ok(map),
        other => Err(ExtractionError::transform(
            stage,
            format!("expected an object, got {}", other),
        )),
    }
}

async fn register_all<D: Send + 'static>(
    callback: Option<&dyn Register<D>>,
    descriptors: Vec<D>,
) -> Result<(), ExtractionError> {
    if let Some(cb) = callback {
        for descriptor in descriptors {
            cb.register(descriptor).await?;
        }
    }
    Ok(())
}

#[async_trait]
impl Connector for ProfileConnector {
    fn get_source_name(&self) -> &str {
        &self.profile.source
    }

    fn source_url(&self) -> &str {
        self.profile.base_url.as_str()
    }

    async fn check_connection(&self, metadata: &ScrapingMetadata) -> bool {
        let meta = metadata.expanded();
        let request = match self.request(self.profile.base_url.as_str(), &meta) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(source = %self.profile.source, error = %e, "invalid connection metadata");
                return false;
            }
        };
        match request.send().await {
            Ok(resp) => resp.status() == reqwest::StatusCode::OK,
            Err(e) => {
                tracing::warn!(source = %self.profile.source, error = %e, "connection check failed");
                false
            }
        }
    }

    fn validate_url_responsibility(&self, url: &str) -> bool {
        let Ok(candidate) = url::Url::parse(url) else {
            return false;
        };
        let base = &self.profile.base_url;
        match (candidate.host_str(), base.host_str()) {
            (Some(a), Some(b)) => {
                a.eq_ignore_ascii_case(b)
                    && candidate.port_or_known_default() == base.port_or_known_default()
            }
            _ => false,
        }
    }

    async fn scrape_feed(
        &self,
        feed_url: &str,
        metadata: &ScrapingMetadata,
        channel_cb: Option<&dyn Register<ChannelDescriptor>>,
        asset_cb: Option<&dyn Register<AssetDescriptor>>,
    ) -> Result<FeedInfo, ExtractionError> {
        let page = self.fetch(feed_url, metadata).await?;
        let channel_extractor = self.profile.channel_extractor.clone();
        let asset_extractor = self.profile.asset_extractor.clone();
        let parser = self.profile.feed_info_parser.clone();

        let (channels, assets, feed_info) = run_blocking(move || {
            let channels = descriptors::<ChannelDescriptor>(&channel_extractor, &page)?;
            let assets = descriptors::<AssetDescriptor>(&asset_extractor, &page)?;
            let feed_info = info(&parser, &page, "feed_info_parser")?;
            Ok((channels, assets, feed_info))
        })
        .await?;

        tracing::debug!(
            url = feed_url,
            channels = channels.len(),
            assets = assets.len(),
            "scraped feed"
        );
        register_all(channel_cb, channels).await?;
        register_all(asset_cb, assets).await?;
        Ok(feed_info)
    }

    async fn scrape_channel(
        &self,
        channel_url: &str,
        metadata: &ScrapingMetadata,
        asset_cb: Option<&dyn Register<AssetDescriptor>>,
    ) -> Result<ChannelInfo, ExtractionError> {
        let page = self.fetch(channel_url, metadata).await?;
        let extractor = self.profile.asset_extractor.clone();
        let parser = self.profile.channel_info_parser.clone();

        let (assets, channel_info) = run_blocking(move || {
            let assets = descriptors::<AssetDescriptor>(&extractor, &page)?;
            let channel_info = info(&parser, &page, "channel_info_parser")?;
            Ok((assets, channel_info))
        })
        .await?;

        tracing::debug!(url = channel_url, assets = assets.len(), "scraped channel");
        register_all(asset_cb, assets).await?;
        Ok(channel_info)
    }

    async fn scrape_asset(
        &self,
        asset_url: &str,
        metadata: &ScrapingMetadata,
        file_cb: Option<&dyn Register<FileDescriptor>>,
    ) -> Result<AssetInfo, ExtractionError> {
        let page = self.fetch(asset_url, metadata).await?;
        let extractor = self.profile.file_extractor.clone();
        let parser = self.profile.asset_info_parser.clone();

        let (files, asset_info) = run_blocking(move || {
            let files = descriptors::<FileDescriptor>(&extractor, &page)?;
            let asset_info = info(&parser, &page, "asset_info_parser")?;
            Ok((files, asset_info))
        })
        .await?;

        tracing::debug!(url = asset_url, files = files.len(), "scraped asset");
        register_all(file_cb, files).await?;
        Ok(asset_info)
    }

    async fn download_asset(
        &self,
        output_path: &Path,
        asset_url: &str,
        metadata: &ScrapingMetadata,
    ) -> Option<PathBuf> {
        match self.try_download(output_path, asset_url, metadata).await {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::warn!(
                    source = %self.profile.source,
                    url = asset_url,
                    error = %format!("{:#}", anyhow::Error::new(e)),
                    "download failed"
                );
                None
            }
        }
    }
}
