//! End-to-end harvests against a mock HTTP source and a SQLite registry.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use content_harvester::config::{parse_config, Config, ExtractionErrorPolicy};
use content_harvester::connector_profile::ProfileConnector;
use content_harvester::db;
use content_harvester::error::HarvestError;
use content_harvester::harvest::{HarvestSettings, HarvestState, HarvestTarget, Harvester};
use content_harvester::migrate;
use content_harvester::models::{EntityKind, ParentRef};
use content_harvester::plugins::PluginLoader;
use content_harvester::policies::PolicyRegistry;
use content_harvester::profile::{ProfileConfig, ProfileDefinition};
use content_harvester::registry::{InMemoryRegistry, Registry, SqliteRegistry};
use mockito::{Mock, Server, ServerGuard};
use tempfile::TempDir;

const JSON_PROFILE: &str = r#"
source = "mock"
base_url = "{base}"
authorization = ""
feeds = ["{base}/feed"]
feed_info_parser = "document"
channel_info_parser = "document"
asset_info_parser = "document"
channel_extractor = { policy = "json_list", pointer = "/channels" }
asset_extractor = { policy = "json_list", pointer = "/assets" }
file_extractor = { policy = "json_list", pointer = "/files" }
"#;

const HTML_PROFILE: &str = r#"
source = "mock-html"
base_url = "{base}"
authorization = ""
feeds = ["{base}/index.html"]
feed_info_parser = "document"
channel_info_parser = "document"
asset_info_parser = "document"
channel_extractor = { policy = "css_links", selector = "a.channel" }
asset_extractor = { policy = "css_links", selector = "a.asset" }
file_extractor = { policy = "json_list", pointer = "/files" }
"#;

fn profile(template: &str, server: &ServerGuard) -> ProfileConfig {
    toml::from_str(&template.replace("{base}", &server.url())).unwrap()
}

fn connector(cfg: &ProfileConfig) -> ProfileConnector {
    ProfileConnector::new(ProfileDefinition::from(cfg), &PolicyRegistry::with_builtins()).unwrap()
}

fn settings(download_dir: &Path) -> HarvestSettings {
    HarvestSettings {
        concurrency: 1,
        request_timeout: Duration::from_secs(10),
        max_retries: 0,
        on_extraction_error: ExtractionErrorPolicy::Skip,
        download_dir: Some(download_dir.to_path_buf()),
    }
}

async fn sqlite_registry(tmp: &TempDir) -> Arc<SqliteRegistry> {
    let config: Config = parse_config(&format!(
        "[db]\npath = \"{}\"\n",
        tmp.path().join("registry.sqlite").display()
    ))
    .unwrap();
    migrate::run_migrations(&config).await.unwrap();
    Arc::new(SqliteRegistry::new(db::connect(&config).await.unwrap()))
}

async fn json(server: &mut ServerGuard, path: &str, body: &str) -> Mock {
    server
        .mock("GET", path)
        .with_header("content-type", "application/json")
        .with_body(body)
        .create_async()
        .await
}

async fn bytes(server: &mut ServerGuard, path: &str, body: &[u8]) -> Mock {
    server
        .mock("GET", path)
        .with_header("content-type", "application/octet-stream")
        .with_body(body)
        .create_async()
        .await
}

async fn alive(server: &mut ServerGuard) -> Mock {
    server
        .mock("GET", "/")
        .with_status(200)
        .with_body("ok")
        .create_async()
        .await
}

fn files_on_disk(dir: &Path) -> Vec<String> {
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| !e.path().components().any(|c| c.as_os_str() == ".incoming"))
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect()
}

#[tokio::test]
async fn test_reharvest_is_idempotent_and_drops_stale_channel() {
    let tmp = TempDir::new().unwrap();
    let downloads = tmp.path().join("files");
    let registry = sqlite_registry(&tmp).await;
    let mut server = Server::new_async().await;

    let _root = alive(&mut server).await;
    let feed = json(
        &mut server,
        "/feed",
        r#"{"title": "Feed", "channels": ["/c1", "/c2"], "assets": []}"#,
    )
    .await;
    let _c1 = json(&mut server, "/c1", r#"{"title": "One", "assets": ["/a1"]}"#).await;
    let _c2 = json(&mut server, "/c2", r#"{"title": "Two", "assets": ["/a2"]}"#).await;
    let _a1 = json(&mut server, "/a1", r#"{"files": [{"url": "/f/one", "extension": "bin"}]}"#).await;
    let _a2 = json(&mut server, "/a2", r#"{"files": [{"url": "/f/two", "extension": "bin"}]}"#).await;
    let _f1 = bytes(&mut server, "/f/one", b"identical payload").await;
    let _f2 = bytes(&mut server, "/f/two", b"identical payload").await;

    let cfg = profile(JSON_PROFILE, &server);
    let connector = connector(&cfg);
    let target = HarvestTarget::from_profile(&cfg);
    let harvester = Harvester::new(registry.clone(), settings(&downloads));

    let first = harvester.harvest(&connector, &target).await.unwrap();
    assert_eq!(first.state, HarvestState::Done);
    assert_eq!((first.feeds, first.channels, first.assets), (1, 2, 2));
    assert_eq!(first.files, 2);

    // identical bytes from two URLs: one row, one file on disk
    let files = registry.list(EntityKind::File).await.unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files_on_disk(&downloads).len(), 1);
    let stored = Path::new(files[0].path.as_deref().unwrap());
    assert!(stored.exists());
    assert_eq!(stored.extension().unwrap(), "bin");

    let channel_ids: Vec<i64> = registry
        .list(EntityKind::Channel)
        .await
        .unwrap()
        .iter()
        .map(|c| c.id)
        .collect();

    let second = harvester.harvest(&connector, &target).await.unwrap();
    assert_eq!(second.deactivated, 0);
    for kind in EntityKind::ALL {
        assert_eq!(
            registry.count(kind).await.unwrap().inactive,
            0,
            "{} rows went inactive on an unchanged re-harvest",
            kind
        );
    }
    let again: Vec<i64> = registry
        .list(EntityKind::Channel)
        .await
        .unwrap()
        .iter()
        .map(|c| c.id)
        .collect();
    assert_eq!(channel_ids, again);

    feed.remove_async().await;
    let _feed = json(
        &mut server,
        "/feed",
        r#"{"title": "Feed", "channels": ["/c1"], "assets": []}"#,
    )
    .await;

    let third = harvester.harvest(&connector, &target).await.unwrap();
    assert_eq!(third.channels, 1);

    let channels = registry.list(EntityKind::Channel).await.unwrap();
    assert_eq!(channels.len(), 2);
    let c2 = channels
        .iter()
        .find(|c| c.url.as_deref() == Some(format!("{}/c2", server.url()).as_str()))
        .unwrap();
    assert!(c2.inactive);
    let c1 = channels.iter().find(|c| c.id != c2.id).unwrap();
    assert!(!c1.inactive);
    assert_eq!(c1.info.as_ref().unwrap()["title"], "One");

    let source_id = third.source_id.unwrap();
    let active = registry
        .children(EntityKind::Channel, ParentRef::Source(source_id))
        .await
        .unwrap();
    assert_eq!(active.len(), 1);
}

#[tokio::test]
async fn test_concurrent_harvest_with_shared_files_is_stable() {
    let tmp = TempDir::new().unwrap();
    let downloads = tmp.path().join("files");
    let registry = sqlite_registry(&tmp).await;
    let mut server = Server::new_async().await;

    let mut mocks = vec![alive(&mut server).await];
    let channels: Vec<String> = (0..4)
        .map(|c| format!(r#"{{"url": "/c{c}", "rank": {c}}}"#))
        .collect();
    mocks.push(
        json(
            &mut server,
            "/feed",
            &format!(r#"{{"title": "Feed", "channels": [{}], "assets": []}}"#, channels.join(", ")),
        )
        .await,
    );
    for c in 0..4 {
        let assets: Vec<String> = (0..4).map(|i| format!(r#""/a{c}{i}""#)).collect();
        mocks.push(
            json(
                &mut server,
                &format!("/c{c}"),
                &format!(r#"{{"title": "Channel {c}", "assets": [{}]}}"#, assets.join(", ")),
            )
            .await,
        );
        for i in 0..4 {
            mocks.push(
                json(
                    &mut server,
                    &format!("/a{c}{i}"),
                    &format!(r#"{{"files": ["/shared/logo", "/f/{c}{i}"]}}"#),
                )
                .await,
            );
            mocks.push(bytes(&mut server, &format!("/f/{c}{i}"), format!("payload {c}{i}").as_bytes()).await);
        }
    }
    mocks.push(bytes(&mut server, "/shared/logo", b"logo bytes").await);

    let cfg = profile(JSON_PROFILE, &server);
    let connector = connector(&cfg);
    let target = HarvestTarget::from_profile(&cfg);
    let harvester = Harvester::new(
        registry.clone(),
        HarvestSettings {
            concurrency: 8,
            ..settings(&downloads)
        },
    );

    let first = harvester.harvest(&connector, &target).await.unwrap();
    assert_eq!(first.state, HarvestState::Done);
    assert_eq!((first.feeds, first.channels, first.assets), (1, 4, 16));
    assert_eq!(first.downloads_failed, 0, "{:?}", first.failures);
    assert_eq!(first.files, 32);
    assert!(first.failures.is_empty());

    // one shared logo plus sixteen distinct payloads
    assert_eq!(registry.list(EntityKind::File).await.unwrap().len(), 17);
    assert_eq!(files_on_disk(&downloads).len(), 17);

    let channel = registry
        .find(EntityKind::Channel, &format!("{}/c2", server.url()))
        .await
        .unwrap()
        .unwrap();
    let info = channel.info.unwrap();
    assert_eq!(info["rank"], 2);
    assert_eq!(info["title"], "Channel 2");

    let mut ids = Vec::new();
    for kind in EntityKind::ALL {
        let mut rows: Vec<i64> = registry.list(kind).await.unwrap().iter().map(|e| e.id).collect();
        rows.sort_unstable();
        ids.push(rows);
    }

    let second = harvester.harvest(&connector, &target).await.unwrap();
    assert_eq!(second.downloads_failed, 0, "{:?}", second.failures);
    assert_eq!(second.files, 32);
    assert_eq!(second.deactivated, 0);
    for (kind, before) in EntityKind::ALL.into_iter().zip(&ids) {
        let mut after: Vec<i64> = registry.list(kind).await.unwrap().iter().map(|e| e.id).collect();
        after.sort_unstable();
        assert_eq!(&after, before, "{} ids changed on re-harvest", kind);
        assert_eq!(registry.count(kind).await.unwrap().inactive, 0);
    }
    assert_eq!(files_on_disk(&downloads).len(), 17);
}

#[tokio::test]
async fn test_failed_download_does_not_stop_siblings() {
    let tmp = TempDir::new().unwrap();
    let downloads = tmp.path().join("files");
    let registry = sqlite_registry(&tmp).await;
    let mut server = Server::new_async().await;

    let _root = alive(&mut server).await;
    let _feed = json(&mut server, "/feed", r#"{"channels": [], "assets": ["/a1"]}"#).await;
    let _a1 = json(
        &mut server,
        "/a1",
        r#"{"title": "Asset", "files": ["/f/missing", "/f/ok"]}"#,
    )
    .await;
    let _missing = server
        .mock("GET", "/f/missing")
        .with_status(404)
        .create_async()
        .await;
    let _ok = bytes(&mut server, "/f/ok", b"payload").await;

    let cfg = profile(JSON_PROFILE, &server);
    let report = Harvester::new(registry.clone(), settings(&downloads))
        .harvest(&connector(&cfg), &HarvestTarget::from_profile(&cfg))
        .await
        .unwrap();

    assert_eq!(report.state, HarvestState::Done);
    assert_eq!(report.files, 1);
    assert_eq!(report.downloads_failed, 1);

    let files = registry.list(EntityKind::File).await.unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(
        files[0].url.as_deref(),
        Some(format!("{}/f/ok", server.url()).as_str())
    );
    let asset = registry
        .find(EntityKind::Asset, &format!("{}/a1", server.url()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(files[0].asset_id, Some(asset.id));
    assert!(asset.channel_id.is_none());
}

#[tokio::test]
async fn test_html_pages_are_parsed_when_json_fails() {
    let tmp = TempDir::new().unwrap();
    let registry = Arc::new(InMemoryRegistry::new());
    let mut server = Server::new_async().await;

    let _root = alive(&mut server).await;
    let _feed = server
        .mock("GET", "/index.html")
        .with_header("content-type", "text/html")
        .with_body(r#"<html><head><title>Index</title></head><body><a class="channel" href="/c1">First</a></body></html>"#)
        .create_async()
        .await;
    let _c1 = server
        .mock("GET", "/c1")
        .with_header("content-type", "text/html")
        .with_body(r#"<html><head><title>Channel One</title></head><body><a class="asset" href="a/1">A</a></body></html>"#)
        .create_async()
        .await;
    let _a1 = json(&mut server, "/a/1", r#"{"title": "Asset", "files": []}"#).await;

    let cfg = profile(HTML_PROFILE, &server);
    let report = Harvester::new(registry.clone(), settings(&tmp.path().join("files")))
        .harvest(&connector(&cfg), &HarvestTarget::from_profile(&cfg))
        .await
        .unwrap();
    assert!(report.failures.is_empty(), "{:?}", report.failures);

    let channel = registry
        .find(EntityKind::Channel, &format!("{}/c1", server.url()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(channel.info.unwrap()["title"], "Channel One");
    assert!(registry
        .find(EntityKind::Asset, &format!("{}/a/1", server.url()))
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_unreachable_source_fails_without_traversal() {
    let tmp = TempDir::new().unwrap();
    let registry = sqlite_registry(&tmp).await;
    let mut server = Server::new_async().await;

    let _root = server.mock("GET", "/").with_status(503).create_async().await;
    let feed = server
        .mock("GET", "/feed")
        .expect(0)
        .with_body(r#"{"channels": [], "assets": []}"#)
        .create_async()
        .await;

    let cfg = profile(JSON_PROFILE, &server);
    let err = Harvester::new(registry.clone(), settings(&tmp.path().join("files")))
        .harvest(&connector(&cfg), &HarvestTarget::from_profile(&cfg))
        .await
        .unwrap_err();

    assert!(matches!(err, HarvestError::Connectivity { .. }));
    assert_eq!(registry.count(EntityKind::Source).await.unwrap().active, 0);
    feed.assert_async().await;
}

#[tokio::test]
async fn test_plugin_connector_harvests() {
    let tmp = TempDir::new().unwrap();
    let mut server = Server::new_async().await;
    let _root = alive(&mut server).await;
    let _feed = json(&mut server, "/feed", r#"{"channels": ["/c1"], "assets": []}"#).await;
    let _c1 = json(&mut server, "/c1", r#"{"assets": []}"#).await;

    let plugin_dir = tmp.path().join("plugins").join("mock");
    std::fs::create_dir_all(&plugin_dir).unwrap();
    std::fs::write(
        plugin_dir.join("profile.toml"),
        JSON_PROFILE.replace("{base}", &server.url()),
    )
    .unwrap();
    std::fs::write(
        plugin_dir.join("plugin.toml"),
        r#"[plugin]
name = "mock"
connector = "profile"
abi = 1
capabilities = ["get_source_name", "check_connection", "scrape_feed", "scrape_channel", "scrape_asset", "download_asset"]
profile = "profile.toml"
"#,
    )
    .unwrap();

    let loader = PluginLoader::new(PolicyRegistry::with_builtins());
    let mut loaded = loader.load_dir(&tmp.path().join("plugins"));
    assert_eq!(loaded.len(), 1);
    let plugin = loaded.remove(0).1.unwrap();

    let registry = Arc::new(InMemoryRegistry::new());
    let mut s = settings(&tmp.path().join("files"));
    s.download_dir = None;
    let report = Harvester::new(registry.clone(), s)
        .harvest(plugin.connector.as_ref(), &plugin.target)
        .await
        .unwrap();
    assert_eq!(report.channels, 1);
    assert_eq!(
        registry.list(EntityKind::Source).await.unwrap()[0]
            .name
            .as_deref(),
        Some("mock")
    );
}
