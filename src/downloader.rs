//! Content-addressed asset downloader.
//!
//! Wraps [`Connector::download_asset`]: the connector writes the bytes to a
//! staging path, the downloader hashes them, moves them to
//! `<dir>/<source>/<sha256>[.<ext>]` and registers the File row keyed by the
//! hash. When a File with that hash already exists at another path, the new
//! copy is removed and the stored path is kept, so identical bytes always
//! resolve to one row and one file on disk.
//!
//! ```text
//! download_dir/
//! └── <source>/
//!     ├── .incoming/<url-digest>-<asset>-<n>   (staging, short-lived)
//!     └── <sha256>.<ext>             (registered files)
//! ```

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use crate::error::RegistryError;
use crate::models::{Entity, EntityFields, EntityKind, FileDescriptor, ScrapingMetadata};
use crate::registry::Registry;
use crate::traits::Connector;

const STAGING_DIR: &str = ".incoming";
const DEFAULT_ENCODING: &str = "binary";

/// Downloads files for registered assets and records them in the registry.
pub struct AssetDownloader {
    registry: Arc<dyn Registry>,
    root: PathBuf,
    /// Makes staging names unique when several assets share a file URL.
    staged: AtomicU64,
}

impl AssetDownloader {
    pub fn new(registry: Arc<dyn Registry>, root: impl Into<PathBuf>) -> Self {
        Self {
            registry,
            root: root.into(),
            staged: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Fetch one file for the asset `asset_id`.
    ///
    /// `Ok(None)` means the download failed and was logged; siblings are
    /// unaffected. Only registry failures are returned as errors.
    pub async fn download(
        &self,
        connector: &dyn Connector,
        asset_id: i64,
        file: &FileDescriptor,
        metadata: &ScrapingMetadata,
    ) -> Result<Option<Entity>, RegistryError> {
        let source_dir = self.root.join(sanitize(connector.get_source_name()));
        let mut staging = source_dir.join(STAGING_DIR).join(self.staging_name(asset_id, &file.url));
        if let Some(ext) = file.extension.as_deref().filter(|e| !e.is_empty()) {
            staging.set_extension(ext);
        }

        let Some(written) = connector.download_asset(&staging, &file.url, metadata).await else {
            return Ok(None);
        };

        let hash = match hash_file(&written).await {
            Ok(h) => h,
            Err(e) => {
                tracing::warn!(path = %written.display(), error = %e, "cannot hash download");
                remove_quietly(&written).await;
                return Ok(None);
            }
        };

        let extension = file
            .extension
            .clone()
            .filter(|e| !e.is_empty())
            .or_else(|| {
                written
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(str::to_string)
            })
            .unwrap_or_default();

        let mut target = source_dir.join(&hash);
        if !extension.is_empty() {
            target.set_extension(&extension);
        }
        if let Err(e) = tokio::fs::rename(&written, &target).await {
            tracing::warn!(path = %target.display(), error = %e, "cannot move download into place");
            remove_quietly(&written).await;
            return Ok(None);
        }
        let target_str = target.to_string_lossy().into_owned();

        let fields = EntityFields {
            url: Some(file.url.clone()),
            path: Some(target_str.clone()),
            encoding: Some(
                file.encoding
                    .clone()
                    .unwrap_or_else(|| DEFAULT_ENCODING.to_string()),
            ),
            extension: Some(extension),
            asset_id: Some(asset_id),
            ..Default::default()
        };

        let upserted = match self.registry.upsert(EntityKind::File, &hash, fields).await {
            Ok(u) => u,
            Err(e) => {
                remove_quietly(&target).await;
                return Err(e);
            }
        };

        if upserted.entity.path.as_deref() != Some(target_str.as_str()) {
            tracing::debug!(
                sha256 = %hash,
                kept = ?upserted.entity.path,
                "duplicate content, removing new copy"
            );
            remove_quietly(&target).await;
        }

        Ok(Some(upserted.entity))
    }
}

impl AssetDownloader {
    fn staging_name(&self, asset_id: i64, url: &str) -> String {
        let n = self.staged.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}-{}", url_digest(url), asset_id, n)
    }
}

/// SHA-256 of a file, read in chunks.
pub async fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn url_digest(url: &str) -> String {
    hex::encode(Sha256::digest(url.as_bytes()))[..16].to_string()
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "cannot remove file");
        }
    }
}
