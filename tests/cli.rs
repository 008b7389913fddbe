use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

fn harvester_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_harvester"))
}

fn write_config(root: &Path, base_url: &str) -> PathBuf {
    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let config = format!(
        r#"[db]
path = "{root}/data/harvester.sqlite"

[harvest]
concurrency = 2
request_timeout_secs = 10
download_dir = "{root}/data/files"

[profiles.mock]
source = "mock"
base_url = "{base}"
authorization = ""
feeds = ["{base}/feed"]
feed_info_parser = "document"
channel_info_parser = "document"
asset_info_parser = "document"
channel_extractor = {{ policy = "json_list", pointer = "/channels" }}
asset_extractor = {{ policy = "json_list", pointer = "/assets" }}
file_extractor = {{ policy = "json_list", pointer = "/files" }}
"#,
        root = root.display(),
        base = base_url
    );
    let path = config_dir.join("harvester.toml");
    fs::write(&path, config).unwrap();
    path
}

fn run(config: &Path, args: &[&str]) -> Output {
    Command::new(harvester_binary())
        .arg("--config")
        .arg(config)
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .expect("failed to run harvester")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn test_init_sources_stats() {
    let tmp = TempDir::new().unwrap();
    let config = write_config(tmp.path(), "https://unreachable.invalid");

    let out = run(&config, &["init"]);
    assert!(out.status.success(), "init failed: {:?}", out);
    assert!(tmp.path().join("data/harvester.sqlite").exists());

    // idempotent
    assert!(run(&config, &["init"]).status.success());

    let out = run(&config, &["sources"]);
    assert!(out.status.success());
    let listing = stdout(&out);
    assert!(listing.contains("mock"));
    assert!(listing.contains("profile"));

    let out = run(&config, &["stats"]);
    assert!(out.status.success());
    assert!(stdout(&out).contains("channel"));
}

#[test]
fn test_harvest_and_probe_against_mock_source() {
    let tmp = TempDir::new().unwrap();
    let mut server = mockito::Server::new();
    let _root = server.mock("GET", "/").with_status(200).create();
    let _feed = server
        .mock("GET", "/feed")
        .with_header("content-type", "application/json")
        .with_body(r#"{"title": "Feed", "channels": ["/c1"], "assets": []}"#)
        .create();
    let _c1 = server
        .mock("GET", "/c1")
        .with_header("content-type", "application/json")
        .with_body(r#"{"title": "One", "assets": ["/a1"]}"#)
        .create();
    let _a1 = server
        .mock("GET", "/a1")
        .with_header("content-type", "application/json")
        .with_body(r#"{"files": ["/f/1.txt"]}"#)
        .create();
    let _f1 = server
        .mock("GET", "/f/1.txt")
        .with_header("content-type", "text/plain")
        .with_body("hello")
        .create();

    let config = write_config(tmp.path(), &server.url());

    let out = run(&config, &["harvest", "mock"]);
    assert!(out.status.success(), "harvest failed: {:?}", out);
    let summary = stdout(&out);
    assert!(summary.contains("DONE"), "{}", summary);
    assert!(summary.contains("files=1"), "{}", summary);

    let out = run(&config, &["probe", &format!("{}/feed", server.url())]);
    assert!(out.status.success(), "probe failed: {:?}", out);
    let probed: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(probed["info"]["title"], "Feed");
    assert_eq!(probed["channels"].as_array().unwrap().len(), 1);

    let out = run(&config, &["harvest", "nope"]);
    assert!(!out.status.success());
}

#[test]
fn test_unreachable_source_exits_nonzero() {
    let tmp = TempDir::new().unwrap();
    let mut server = mockito::Server::new();
    let _root = server.mock("GET", "/").with_status(500).create();
    let config = write_config(tmp.path(), &server.url());

    let out = run(&config, &["harvest", "all"]);
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("FAILED"));
}
