//! Harvest orchestrator.
//!
//! Drives one connector through its source hierarchy and feeds every
//! discovery into the [`Registry`]. Each run is an explicit state machine:
//!
//! ```text
//! CHECKING ──▶ TRAVERSING_FEEDS ──▶ TRAVERSING_CHANNELS ──▶ TRAVERSING_ASSETS ──▶ DOWNLOADING ──▶ DONE
//!    │
//!    └──▶ FAILED   (check_connection returned false)
//! ```
//!
//! Each level works through the queue filled by the previous level's
//! registration callbacks, with at most `concurrency` calls in flight, and
//! only advances once that queue is drained. Deeper discoveries never reopen
//! a shallower level.
//!
//! Every scrape call runs under a deadline and is retried up to
//! `max_retries` times. A call that still fails is either recorded and
//! skipped or aborts the run, per [`ExtractionErrorPolicy`]. Registry errors
//! always abort.
//!
//! After a level drains, children that a successfully scraped parent no
//! longer reports are marked inactive. Parents whose scrape failed are left
//! alone so a transient error never deactivates anything.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::config::{ExtractionErrorPolicy, FeedConfig, HarvestConfig};
use crate::downloader::AssetDownloader;
use crate::error::{ExtractionError, HarvestError, RegistryError};
use crate::models::{
    AssetDescriptor, ChannelDescriptor, EntityFields, EntityKind, FileDescriptor, ParentRef,
    ScrapingMetadata,
};
use crate::profile::ProfileConfig;
use crate::registry::Registry;
use crate::traits::{Collect, Connector, Register};

/// Tunables for one harvest run.
#[derive(Debug, Clone)]
pub struct HarvestSettings {
    pub concurrency: usize,
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub on_extraction_error: ExtractionErrorPolicy,
    /// Where files are written. `None` skips the download stage.
    pub download_dir: Option<PathBuf>,
}

impl HarvestSettings {
    pub fn from_config(config: &HarvestConfig) -> Self {
        Self {
            concurrency: config.concurrency.max(1),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            max_retries: config.max_retries,
            on_extraction_error: config.on_extraction_error,
            download_dir: config.download.then(|| config.download_dir.clone()),
        }
    }
}

impl Default for HarvestSettings {
    fn default() -> Self {
        Self::from_config(&HarvestConfig::default())
    }
}

/// One feed to traverse.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedTarget {
    pub url: String,
    pub name: Option<String>,
    pub metadata: Option<ScrapingMetadata>,
}

impl From<&FeedConfig> for FeedTarget {
    fn from(feed: &FeedConfig) -> Self {
        Self {
            url: feed.url().to_string(),
            name: feed.name().map(str::to_string),
            metadata: feed.metadata().cloned(),
        }
    }
}

/// What to harvest for a source: its feeds and source-level request metadata.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HarvestTarget {
    pub feeds: Vec<FeedTarget>,
    pub metadata: ScrapingMetadata,
}

impl HarvestTarget {
    pub fn new<I, S>(feeds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            feeds: feeds
                .into_iter()
                .map(|url| FeedTarget {
                    url: url.into(),
                    name: None,
                    metadata: None,
                })
                .collect(),
            metadata: ScrapingMetadata::default(),
        }
    }

    pub fn from_profile(profile: &ProfileConfig) -> Self {
        Self {
            feeds: profile.feeds.iter().map(FeedTarget::from).collect(),
            metadata: profile.metadata.clone(),
        }
    }

    pub fn with_metadata(mut self, metadata: ScrapingMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Per-source run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HarvestState {
    Checking,
    TraversingFeeds,
    TraversingChannels,
    TraversingAssets,
    Downloading,
    Done,
    Failed,
}

impl fmt::Display for HarvestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HarvestState::Checking => "CHECKING",
            HarvestState::TraversingFeeds => "TRAVERSING_FEEDS",
            HarvestState::TraversingChannels => "TRAVERSING_CHANNELS",
            HarvestState::TraversingAssets => "TRAVERSING_ASSETS",
            HarvestState::Downloading => "DOWNLOADING",
            HarvestState::Done => "DONE",
            HarvestState::Failed => "FAILED",
        };
        f.pad(s)
    }
}

/// A scrape or download that was skipped.
#[derive(Debug, Clone, Serialize)]
pub struct Failure {
    pub kind: EntityKind,
    pub url: String,
    pub error: String,
}

/// Summary of one run.
#[derive(Debug, Clone, Serialize)]
pub struct HarvestReport {
    pub source: String,
    pub source_id: Option<i64>,
    pub state: HarvestState,
    /// Every state entered, in order.
    pub transitions: Vec<HarvestState>,
    pub feeds: usize,
    pub channels: usize,
    pub assets: usize,
    pub files: usize,
    pub downloads_failed: usize,
    pub deactivated: u64,
    pub failures: Vec<Failure>,
}

impl HarvestReport {
    fn new(source: &str) -> Self {
        Self {
            source: source.to_string(),
            source_id: None,
            state: HarvestState::Checking,
            transitions: vec![HarvestState::Checking],
            feeds: 0,
            channels: 0,
            assets: 0,
            files: 0,
            downloads_failed: 0,
            deactivated: 0,
            failures: Vec::new(),
        }
    }

    fn enter(&mut self, state: HarvestState) {
        tracing::info!(source = %self.source, state = %state, "harvest state");
        self.state = state;
        self.transitions.push(state);
    }
}

/// Runs harvests against a registry.
pub struct Harvester {
    registry: Arc<dyn Registry>,
    settings: HarvestSettings,
}

impl Harvester {
    pub fn new(registry: Arc<dyn Registry>, settings: HarvestSettings) -> Self {
        Self { registry, settings }
    }

    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.registry
    }

    pub fn settings(&self) -> &HarvestSettings {
        &self.settings
    }

    /// Harvest one source end to end.
    ///
    /// Returns [`HarvestError::Connectivity`] without touching the registry
    /// when the liveness check fails.
    pub async fn harvest(
        &self,
        connector: &dyn Connector,
        target: &HarvestTarget,
    ) -> Result<HarvestReport, HarvestError> {
        let source = connector.get_source_name().to_string();
        let mut report = HarvestReport::new(&source);

        let alive = tokio::time::timeout(
            self.settings.request_timeout,
            connector.check_connection(&target.metadata),
        )
        .await
        .unwrap_or(false);
        if !alive {
            report.enter(HarvestState::Failed);
            tracing::error!(source = %source, "connection check failed, not traversing");
            return Err(HarvestError::Connectivity {
                source_name: source,
            });
        }

        let source_id = self
            .registry
            .upsert(
                EntityKind::Source,
                connector.source_url(),
                EntityFields {
                    name: Some(source.clone()),
                    scraping_metadata: (!target.metadata.is_empty())
                        .then(|| target.metadata.to_value()),
                    ..Default::default()
                },
            )
            .await?
            .id();
        report.source_id = Some(source_id);

        let run = Run {
            registry: self.registry.as_ref(),
            connector,
            settings: &self.settings,
            source_id,
            downloader: self
                .settings
                .download_dir
                .as_ref()
                .map(|dir| AssetDownloader::new(self.registry.clone(), dir.clone())),
        };

        report.enter(HarvestState::TraversingFeeds);
        let feeds = run.register_feeds(target, &mut report).await?;
        let (channels, direct_assets) = run.traverse_feeds(feeds, &mut report).await?;

        report.enter(HarvestState::TraversingChannels);
        let channel_assets = run.traverse_channels(channels, &mut report).await?;

        report.enter(HarvestState::TraversingAssets);
        let mut assets = Queue::default();
        assets.extend(direct_assets);
        assets.extend(channel_assets);
        let files = run.traverse_assets(assets.jobs, &mut report).await?;

        report.enter(HarvestState::Downloading);
        run.download(files, &mut report).await?;

        report.enter(HarvestState::Done);
        tracing::info!(
            source = %source,
            feeds = report.feeds,
            channels = report.channels,
            assets = report.assets,
            files = report.files,
            failures = report.failures.len(),
            deactivated = report.deactivated,
            "harvest finished"
        );
        Ok(report)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Run internals
// ═══════════════════════════════════════════════════════════════════════

/// A registered entity waiting to be scraped.
#[derive(Debug, Clone)]
struct Job {
    id: i64,
    url: String,
    /// Effective request metadata: own metadata layered over the parent's.
    metadata: ScrapingMetadata,
}

struct FileJob {
    asset_id: i64,
    descriptor: FileDescriptor,
    metadata: ScrapingMetadata,
}

/// Jobs in discovery order, each id once.
#[derive(Default)]
struct Queue {
    jobs: Vec<Job>,
    seen: HashSet<i64>,
}

impl Queue {
    fn push(&mut self, job: Job) {
        if self.seen.insert(job.id) {
            self.jobs.push(job);
        }
    }

    fn extend(&mut self, jobs: impl IntoIterator<Item = Job>) {
        for job in jobs {
            self.push(job);
        }
    }
}

fn effective(own: Option<&ScrapingMetadata>, inherited: &ScrapingMetadata) -> ScrapingMetadata {
    match own {
        Some(own) => own.layered_over(inherited),
        None => inherited.clone(),
    }
}

/// Registration callback for channels and assets found under one parent.
struct Registrar<'a> {
    registry: &'a dyn Registry,
    source_id: i64,
    feed_id: Option<i64>,
    channel_id: Option<i64>,
    inherited: ScrapingMetadata,
    found: Mutex<Queue>,
}

impl<'a> Registrar<'a> {
    fn new(
        registry: &'a dyn Registry,
        source_id: i64,
        feed_id: Option<i64>,
        channel_id: Option<i64>,
        inherited: &ScrapingMetadata,
    ) -> Self {
        Self {
            registry,
            source_id,
            feed_id,
            channel_id,
            inherited: inherited.clone(),
            found: Mutex::new(Queue::default()),
        }
    }

    fn record(&self, id: i64, url: String, own: Option<&ScrapingMetadata>) {
        let job = Job {
            id,
            url,
            metadata: effective(own, &self.inherited),
        };
        self.found
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(job);
    }

    fn into_jobs(self) -> Vec<Job> {
        self.found.into_inner().unwrap_or_else(|e| e.into_inner()).jobs
    }
}

#[async_trait]
impl Register<ChannelDescriptor> for Registrar<'_> {
    async fn register(&self, mut channel: ChannelDescriptor) -> Result<(), RegistryError> {
        let fields = EntityFields {
            info: channel.take_info(),
            name: channel.name,
            scraping_metadata: channel.scraping_metadata.as_ref().map(|m| m.to_value()),
            source_id: Some(self.source_id),
            feed_id: self.feed_id,
            ..Default::default()
        };
        let id = self
            .registry
            .upsert(EntityKind::Channel, &channel.url, fields)
            .await?
            .id();
        self.record(id, channel.url, channel.scraping_metadata.as_ref());
        Ok(())
    }
}

#[async_trait]
impl Register<AssetDescriptor> for Registrar<'_> {
    async fn register(&self, mut asset: AssetDescriptor) -> Result<(), RegistryError> {
        let fields = EntityFields {
            info: asset.take_info(),
            scraping_metadata: asset.scraping_metadata.as_ref().map(|m| m.to_value()),
            source_id: Some(self.source_id),
            feed_id: self.feed_id,
            channel_id: self.channel_id,
            ..Default::default()
        };
        let id = self
            .registry
            .upsert(EntityKind::Asset, &asset.url, fields)
            .await?
            .id();
        self.record(id, asset.url, asset.scraping_metadata.as_ref());
        Ok(())
    }
}

/// Queues file descriptors against their already-registered asset. The
/// File row itself is written by the downloader, keyed by content hash.
struct FileRegistrar {
    asset_id: i64,
    inherited: ScrapingMetadata,
    found: Mutex<Vec<FileJob>>,
}

#[async_trait]
impl Register<FileDescriptor> for FileRegistrar {
    async fn register(&self, file: FileDescriptor) -> Result<(), RegistryError> {
        let mut found = self.found.lock().unwrap_or_else(|e| e.into_inner());
        if found.iter().any(|j| j.descriptor.url == file.url) {
            return Ok(());
        }
        found.push(FileJob {
            asset_id: self.asset_id,
            metadata: effective(file.scraping_metadata.as_ref(), &self.inherited),
            descriptor: file,
        });
        Ok(())
    }
}

struct Run<'a> {
    registry: &'a dyn Registry,
    connector: &'a dyn Connector,
    settings: &'a HarvestSettings,
    source_id: i64,
    downloader: Option<AssetDownloader>,
}

impl<'a> Run<'a> {
    /// Run `f` over `items` with bounded concurrency, returning results in
    /// input order.
    async fn fan_out<I, T, F, Fut>(&self, items: Vec<I>, f: F) -> Vec<T>
    where
        F: Fn(I) -> Fut,
        Fut: Future<Output = T>,
    {
        let mut results: Vec<(usize, T)> = stream::iter(items.into_iter().enumerate())
            .map(|(i, item)| {
                let fut = f(item);
                async move { (i, fut.await) }
            })
            .buffer_unordered(self.settings.concurrency.max(1))
            .collect()
            .await;
        results.sort_by_key(|(i, _)| *i);
        results.into_iter().map(|(_, t)| t).collect()
    }

    /// One scrape call with deadline and retries.
    async fn attempt<T, F, Fut>(&self, url: &str, mut call: F) -> Result<T, HarvestError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ExtractionError>>,
    {
        let mut retries = 0;
        loop {
            let err = match tokio::time::timeout(self.settings.request_timeout, call()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(ExtractionError::Registration(e))) => return Err(HarvestError::Registry(e)),
                Ok(Err(source)) => HarvestError::Extraction {
                    url: url.to_string(),
                    source,
                },
                Err(_) => HarvestError::Timeout {
                    url: url.to_string(),
                    secs: self.settings.request_timeout.as_secs(),
                },
            };
            if retries >= self.settings.max_retries {
                return Err(err);
            }
            retries += 1;
            tracing::warn!(url, attempt = retries, error = %err, "retrying");
        }
    }

    /// Apply the extraction-error policy to a failed call.
    fn on_failure(
        &self,
        report: &mut HarvestReport,
        kind: EntityKind,
        url: &str,
        err: HarvestError,
    ) -> Result<(), HarvestError> {
        if let HarvestError::Registry(_) = err {
            return Err(err);
        }
        if self.settings.on_extraction_error == ExtractionErrorPolicy::Abort {
            tracing::error!(source = %report.source, %kind, url, error = %err, "aborting harvest");
            return Err(err);
        }
        tracing::warn!(source = %report.source, %kind, url, error = %err, "skipping");
        report.failures.push(Failure {
            kind,
            url: url.to_string(),
            error: err.to_string(),
        });
        Ok(())
    }

    async fn deactivate(
        &self,
        report: &mut HarvestReport,
        kind: EntityKind,
        ids: Vec<i64>,
    ) -> Result<(), HarvestError> {
        if ids.is_empty() {
            return Ok(());
        }
        let changed = self.registry.mark_unreachable(kind, &ids).await?;
        if changed > 0 {
            tracing::info!(source = %report.source, %kind, count = changed, "marked unreachable");
        }
        report.deactivated += changed;
        Ok(())
    }

    /// Register the target's feeds and retire feeds it no longer lists.
    async fn register_feeds(
        &self,
        target: &HarvestTarget,
        report: &mut HarvestReport,
    ) -> Result<Vec<Job>, HarvestError> {
        let mut queue = Queue::default();
        for feed in &target.feeds {
            let id = self
                .registry
                .upsert(
                    EntityKind::Feed,
                    &feed.url,
                    EntityFields {
                        name: feed.name.clone(),
                        scraping_metadata: feed.metadata.as_ref().map(|m| m.to_value()),
                        source_id: Some(self.source_id),
                        ..Default::default()
                    },
                )
                .await?
                .id();
            queue.push(Job {
                id,
                url: feed.url.clone(),
                metadata: effective(feed.metadata.as_ref(), &target.metadata),
            });
        }

        let stale = self
            .registry
            .children(EntityKind::Feed, ParentRef::Source(self.source_id))
            .await?
            .into_iter()
            .filter(|f| !queue.seen.contains(&f.id))
            .map(|f| f.id)
            .collect();
        self.deactivate(report, EntityKind::Feed, stale).await?;

        Ok(queue.jobs)
    }

    async fn traverse_feeds(
        &self,
        feeds: Vec<Job>,
        report: &mut HarvestReport,
    ) -> Result<(Vec<Job>, Vec<Job>), HarvestError> {
        let this = self;
        let outcomes = self
            .fan_out(feeds, move |job| async move {
                let channels =
                    Registrar::new(this.registry, this.source_id, Some(job.id), None, &job.metadata);
                let assets =
                    Registrar::new(this.registry, this.source_id, Some(job.id), None, &job.metadata);
                let result = this
                    .attempt(&job.url, || {
                        this.connector.scrape_feed(
                            &job.url,
                            &job.metadata,
                            Some(&channels),
                            Some(&assets),
                        )
                    })
                    .await;
                let (channel_jobs, asset_jobs) = (channels.into_jobs(), assets.into_jobs());
                (job, result, channel_jobs, asset_jobs)
            })
            .await;

        let mut channel_queue = Queue::default();
        let mut asset_queue = Queue::default();
        let mut scraped = Vec::new();

        for (job, result, channel_jobs, asset_jobs) in outcomes {
            match result {
                Ok(info) => {
                    report.feeds += 1;
                    self.store_info(EntityKind::Feed, &job.url, info).await?;
                    scraped.push(job.id);
                    channel_queue.extend(channel_jobs);
                    asset_queue.extend(asset_jobs);
                }
                Err(err) => self.on_failure(report, EntityKind::Feed, &job.url, err)?,
            }
        }

        let mut stale_channels = Vec::new();
        let mut stale_assets = Vec::new();
        for feed_id in scraped {
            for channel in self
                .registry
                .children(EntityKind::Channel, ParentRef::Feed(feed_id))
                .await?
            {
                if !channel_queue.seen.contains(&channel.id) {
                    stale_channels.push(channel.id);
                }
            }
            for asset in self
                .registry
                .children(EntityKind::Asset, ParentRef::Feed(feed_id))
                .await?
            {
                if asset.channel_id.is_none() && !asset_queue.seen.contains(&asset.id) {
                    stale_assets.push(asset.id);
                }
            }
        }
        self.deactivate(report, EntityKind::Channel, stale_channels)
            .await?;
        self.deactivate(report, EntityKind::Asset, stale_assets).await?;

        Ok((channel_queue.jobs, asset_queue.jobs))
    }

    async fn traverse_channels(
        &self,
        channels: Vec<Job>,
        report: &mut HarvestReport,
    ) -> Result<Vec<Job>, HarvestError> {
        let this = self;
        let outcomes = self
            .fan_out(channels, move |job| async move {
                let assets = Registrar::new(
                    this.registry,
                    this.source_id,
                    None,
                    Some(job.id),
                    &job.metadata,
                );
                let result = this
                    .attempt(&job.url, || {
                        this.connector
                            .scrape_channel(&job.url, &job.metadata, Some(&assets))
                    })
                    .await;
                let asset_jobs = assets.into_jobs();
                (job, result, asset_jobs)
            })
            .await;

        let mut asset_queue = Queue::default();
        let mut scraped = Vec::new();
        for (job, result, asset_jobs) in outcomes {
            match result {
                Ok(info) => {
                    report.channels += 1;
                    self.store_info(EntityKind::Channel, &job.url, info).await?;
                    scraped.push(job.id);
                    asset_queue.extend(asset_jobs);
                }
                Err(err) => self.on_failure(report, EntityKind::Channel, &job.url, err)?,
            }
        }

        let mut stale = Vec::new();
        for channel_id in scraped {
            for asset in self
                .registry
                .children(EntityKind::Asset, ParentRef::Channel(channel_id))
                .await?
            {
                if !asset_queue.seen.contains(&asset.id) {
                    stale.push(asset.id);
                }
            }
        }
        self.deactivate(report, EntityKind::Asset, stale).await?;

        Ok(asset_queue.jobs)
    }

    async fn traverse_assets(
        &self,
        assets: Vec<Job>,
        report: &mut HarvestReport,
    ) -> Result<Vec<FileJob>, HarvestError> {
        let this = self;
        let outcomes = self
            .fan_out(assets, move |job| async move {
                let files = FileRegistrar {
                    asset_id: job.id,
                    inherited: job.metadata.clone(),
                    found: Mutex::new(Vec::new()),
                };
                let result = this
                    .attempt(&job.url, || {
                        this.connector
                            .scrape_asset(&job.url, &job.metadata, Some(&files))
                    })
                    .await;
                let file_jobs = files.found.into_inner().unwrap_or_else(|e| e.into_inner());
                (job, result, file_jobs)
            })
            .await;

        let mut queue = Vec::new();
        let mut stale = Vec::new();
        for (job, result, file_jobs) in outcomes {
            match result {
                Ok(info) => {
                    report.assets += 1;
                    self.store_info(EntityKind::Asset, &job.url, info).await?;

                    let reported: HashSet<&str> =
                        file_jobs.iter().map(|f| f.descriptor.url.as_str()).collect();
                    for file in self
                        .registry
                        .children(EntityKind::File, ParentRef::Asset(job.id))
                        .await?
                    {
                        if let Some(url) = file.url.as_deref() {
                            if !reported.contains(url) {
                                stale.push(file.id);
                            }
                        }
                    }
                    queue.extend(file_jobs);
                }
                Err(err) => self.on_failure(report, EntityKind::Asset, &job.url, err)?,
            }
        }
        self.deactivate(report, EntityKind::File, stale).await?;

        Ok(queue)
    }

    async fn download(
        &self,
        files: Vec<FileJob>,
        report: &mut HarvestReport,
    ) -> Result<(), HarvestError> {
        let Some(downloader) = &self.downloader else {
            tracing::debug!(source = %report.source, pending = files.len(), "downloads disabled");
            return Ok(());
        };

        let this = self;
        let outcomes = self
            .fan_out(files, move |job| async move {
                let result = tokio::time::timeout(
                    this.settings.request_timeout,
                    downloader.download(this.connector, job.asset_id, &job.descriptor, &job.metadata),
                )
                .await;
                (job, result)
            })
            .await;

        for (job, result) in outcomes {
            match result {
                Ok(Ok(Some(_))) => report.files += 1,
                Ok(Ok(None)) => {
                    report.downloads_failed += 1;
                    report.failures.push(Failure {
                        kind: EntityKind::File,
                        url: job.descriptor.url,
                        error: "download failed".into(),
                    });
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    let err = HarvestError::Timeout {
                        url: job.descriptor.url.clone(),
                        secs: self.settings.request_timeout.as_secs(),
                    };
                    tracing::warn!(source = %report.source, error = %err, "download timed out");
                    report.downloads_failed += 1;
                    report.failures.push(Failure {
                        kind: EntityKind::File,
                        url: job.descriptor.url,
                        error: err.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    async fn store_info(
        &self,
        kind: EntityKind,
        url: &str,
        info: Map<String, Value>,
    ) -> Result<(), HarvestError> {
        self.registry
            .upsert(
                kind,
                url,
                EntityFields {
                    info: Some(Value::Object(info)),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Probe
// ═══════════════════════════════════════════════════════════════════════

/// Level a probe runs at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeLevel {
    Feed,
    Channel,
    Asset,
}

/// Everything one scrape call reported, with nothing written anywhere.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    pub info: Map<String, Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub channels: Vec<ChannelDescriptor>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub assets: Vec<AssetDescriptor>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileDescriptor>,
}

/// Run one scrape with collecting callbacks. Read-only.
pub async fn probe(
    connector: &dyn Connector,
    level: ProbeLevel,
    url: &str,
    metadata: &ScrapingMetadata,
) -> Result<ProbeResult, ExtractionError> {
    let channels: Collect<ChannelDescriptor> = Collect::new();
    let assets: Collect<AssetDescriptor> = Collect::new();
    let files: Collect<FileDescriptor> = Collect::new();

    let info = match level {
        ProbeLevel::Feed => {
            connector
                .scrape_feed(url, metadata, Some(&channels), Some(&assets))
                .await?
        }
        ProbeLevel::Channel => {
            connector
                .scrape_channel(url, metadata, Some(&assets))
                .await?
        }
        ProbeLevel::Asset => connector.scrape_asset(url, metadata, Some(&files)).await?,
    };

    Ok(ProbeResult {
        info,
        channels: channels.into_inner(),
        assets: assets.into_inner(),
        files: files.into_inner(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AssetInfo, ChannelInfo, FeedInfo};
    use crate::registry::InMemoryRegistry;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted connector: feed `f` reports `channels`, each channel reports
    /// one asset, assets report no files. Channel URLs containing "broken"
    /// fail with an extraction error.
    struct Scripted {
        alive: bool,
        channels: Mutex<Vec<&'static str>>,
        channel_calls: AtomicUsize,
    }

    impl Scripted {
        fn new(channels: Vec<&'static str>) -> Self {
            Self {
                alive: true,
                channels: Mutex::new(channels),
                channel_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Connector for Scripted {
        fn get_source_name(&self) -> &str {
            "scripted"
        }

        fn source_url(&self) -> &str {
            "https://example.test/"
        }

        async fn check_connection(&self, _metadata: &ScrapingMetadata) -> bool {
            self.alive
        }

        fn validate_url_responsibility(&self, url: &str) -> bool {
            url.starts_with("https://example.test/")
        }

        async fn scrape_feed(
            &self,
            _feed_url: &str,
            _metadata: &ScrapingMetadata,
            channel_cb: Option<&dyn Register<ChannelDescriptor>>,
            _asset_cb: Option<&dyn Register<AssetDescriptor>>,
        ) -> Result<FeedInfo, ExtractionError> {
            let channels = self.channels.lock().unwrap().clone();
            if let Some(cb) = channel_cb {
                for c in channels {
                    cb.register(ChannelDescriptor {
                        url: format!("https://example.test/{}", c),
                        ..Default::default()
                    })
                    .await?;
                }
            }
            Ok(FeedInfo::new())
        }

        async fn scrape_channel(
            &self,
            channel_url: &str,
            _metadata: &ScrapingMetadata,
            asset_cb: Option<&dyn Register<AssetDescriptor>>,
        ) -> Result<ChannelInfo, ExtractionError> {
            self.channel_calls.fetch_add(1, Ordering::SeqCst);
            if channel_url.contains("broken") {
                return Err(ExtractionError::transform("channel_extractor", "boom"));
            }
            if let Some(cb) = asset_cb {
                cb.register(AssetDescriptor {
                    url: format!("{}/a", channel_url),
                    ..Default::default()
                })
                .await?;
            }
            let mut info = ChannelInfo::new();
            info.insert("title".into(), Value::String(channel_url.to_string()));
            Ok(info)
        }

        async fn scrape_asset(
            &self,
            _asset_url: &str,
            _metadata: &ScrapingMetadata,
            _file_cb: Option<&dyn Register<FileDescriptor>>,
        ) -> Result<AssetInfo, ExtractionError> {
            Ok(AssetInfo::new())
        }

        async fn download_asset(
            &self,
            _output_path: &Path,
            _asset_url: &str,
            _metadata: &ScrapingMetadata,
        ) -> Option<PathBuf> {
            None
        }
    }

    fn harvester(registry: Arc<InMemoryRegistry>, policy: ExtractionErrorPolicy) -> Harvester {
        Harvester::new(
            registry,
            HarvestSettings {
                concurrency: 2,
                request_timeout: Duration::from_secs(5),
                max_retries: 1,
                on_extraction_error: policy,
                download_dir: None,
            },
        )
    }

    fn target() -> HarvestTarget {
        HarvestTarget::new(["https://example.test/feed"])
    }

    #[tokio::test]
    async fn test_state_sequence_and_counts() {
        let registry = Arc::new(InMemoryRegistry::new());
        let connector = Scripted::new(vec!["c1", "c2"]);
        let report = harvester(registry.clone(), ExtractionErrorPolicy::Skip)
            .harvest(&connector, &target())
            .await
            .unwrap();

        assert_eq!(
            report.transitions,
            vec![
                HarvestState::Checking,
                HarvestState::TraversingFeeds,
                HarvestState::TraversingChannels,
                HarvestState::TraversingAssets,
                HarvestState::Downloading,
                HarvestState::Done,
            ]
        );
        assert_eq!((report.feeds, report.channels, report.assets), (1, 2, 2));
        let channel = registry
            .find(EntityKind::Channel, "https://example.test/c1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(channel.info.unwrap()["title"], "https://example.test/c1");
    }

    #[tokio::test]
    async fn test_connectivity_failure_stops_before_traversal() {
        let registry = Arc::new(InMemoryRegistry::new());
        let mut connector = Scripted::new(vec!["c1"]);
        connector.alive = false;
        let err = harvester(registry.clone(), ExtractionErrorPolicy::Skip)
            .harvest(&connector, &target())
            .await
            .unwrap_err();
        assert!(matches!(err, HarvestError::Connectivity { .. }));
        assert!(registry.list(EntityKind::Source).await.unwrap().is_empty());
        assert_eq!(connector.channel_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dropped_channel_becomes_inactive() {
        let registry = Arc::new(InMemoryRegistry::new());
        let connector = Scripted::new(vec!["c1", "c2"]);
        let h = harvester(registry.clone(), ExtractionErrorPolicy::Skip);
        h.harvest(&connector, &target()).await.unwrap();

        *connector.channels.lock().unwrap() = vec!["c1"];
        let report = h.harvest(&connector, &target()).await.unwrap();

        let channels = registry.list(EntityKind::Channel).await.unwrap();
        assert_eq!(channels.len(), 2);
        let c2 = channels
            .iter()
            .find(|c| c.url.as_deref() == Some("https://example.test/c2"))
            .unwrap();
        assert!(c2.inactive);
        assert!(report.deactivated >= 1);
    }

    #[tokio::test]
    async fn test_skip_policy_isolates_failures_and_retries() {
        let registry = Arc::new(InMemoryRegistry::new());
        let connector = Scripted::new(vec!["broken", "c1"]);
        let report = harvester(registry.clone(), ExtractionErrorPolicy::Skip)
            .harvest(&connector, &target())
            .await
            .unwrap();

        assert_eq!(report.channels, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].kind, EntityKind::Channel);
        // one call for c1, two (initial + retry) for the broken channel
        assert_eq!(connector.channel_calls.load(Ordering::SeqCst), 3);
        assert_eq!(report.state, HarvestState::Done);
    }

    #[tokio::test]
    async fn test_abort_policy_returns_error() {
        let registry = Arc::new(InMemoryRegistry::new());
        let connector = Scripted::new(vec!["broken"]);
        let err = harvester(registry, ExtractionErrorPolicy::Abort)
            .harvest(&connector, &target())
            .await
            .unwrap_err();
        assert!(matches!(err, HarvestError::Extraction { .. }));
    }

    #[tokio::test]
    async fn test_probe_writes_nothing() {
        let connector = Scripted::new(vec!["c1", "c2"]);
        let result = probe(
            &connector,
            ProbeLevel::Feed,
            "https://example.test/feed",
            &ScrapingMetadata::default(),
        )
        .await
        .unwrap();
        assert_eq!(result.channels.len(), 2);
        assert!(result.assets.is_empty());
    }
}
