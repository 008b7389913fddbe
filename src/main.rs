//! # Harvester CLI (`harvester`)
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `harvester init` | Create the SQLite database and schema |
//! | `harvester sources` | List configured profiles and plugins |
//! | `harvester harvest <source>` | Harvest one source, or `all` |
//! | `harvester probe <url>` | Run one scrape and print what it found |
//! | `harvester stats` | Registry counts per entity kind |
//!
//! ## Examples
//!
//! ```bash
//! harvester init --config ./config/harvester.toml
//! harvester harvest all --no-download
//! harvester probe https://example.test/feed.json --level feed
//! RUST_LOG=content_harvester=debug harvester harvest example
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use content_harvester::config;
use content_harvester::db;
use content_harvester::harvest::{self, HarvestSettings, Harvester, ProbeLevel};
use content_harvester::migrate;
use content_harvester::registry::SqliteRegistry;
use content_harvester::sources;
use content_harvester::stats;
use content_harvester::traits::ConnectorRegistry;

/// Harvester CLI: profile-driven content harvesting into a deduplicated
/// source/feed/channel/asset/file registry.
#[derive(Parser)]
#[command(name = "harvester", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/harvester.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// List configured sources.
    Sources {
        /// Also run each connector's connection check.
        #[arg(long)]
        check: bool,
    },

    /// Harvest a source end to end.
    Harvest {
        /// Source name, or `all`.
        source: String,

        /// Register files' assets but skip downloading them.
        #[arg(long)]
        no_download: bool,

        /// Override `[harvest].concurrency`.
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Run a single scrape without touching the registry.
    ///
    /// The connector is chosen by URL responsibility.
    Probe {
        url: String,

        #[arg(long, value_enum, default_value = "feed")]
        level: Level,
    },

    /// Show registry statistics.
    Stats,
}

#[derive(Clone, Copy, ValueEnum)]
enum Level {
    Feed,
    Channel,
    Asset,
}

impl From<Level> for ProbeLevel {
    fn from(level: Level) -> Self {
        match level {
            Level::Feed => ProbeLevel::Feed,
            Level::Channel => ProbeLevel::Channel,
            Level::Asset => ProbeLevel::Asset,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Sources { check } => {
            sources::list_sources(&cfg, check).await?;
        }
        Commands::Harvest {
            source,
            no_download,
            concurrency,
        } => {
            let selected = sources::select(sources::load_sources(&cfg)?, &source)?;

            let mut settings = HarvestSettings::from_config(&cfg.harvest);
            if no_download {
                settings.download_dir = None;
            }
            if let Some(n) = concurrency {
                settings.concurrency = n.max(1);
            }

            migrate::run_migrations(&cfg).await?;
            let pool = db::connect(&cfg).await?;
            let harvester = Harvester::new(Arc::new(SqliteRegistry::new(pool.clone())), settings);

            let mut failed = 0;
            for entry in &selected {
                match harvester.harvest(entry.connector.as_ref(), &entry.target).await {
                    Ok(report) => {
                        println!(
                            "{:<20} {:<6} feeds={} channels={} assets={} files={} failed={} deactivated={}",
                            entry.name,
                            report.state,
                            report.feeds,
                            report.channels,
                            report.assets,
                            report.files,
                            report.failures.len(),
                            report.deactivated
                        );
                    }
                    Err(e) => {
                        failed += 1;
                        eprintln!("{:<20} FAILED {}", entry.name, e);
                    }
                }
            }
            pool.close().await;

            if failed > 0 {
                anyhow::bail!("{} of {} sources failed", failed, selected.len());
            }
        }
        Commands::Probe { url, level } => {
            let entries = sources::load_sources(&cfg)?;
            let mut connectors = ConnectorRegistry::new();
            for entry in &entries {
                connectors.register(entry.connector.clone());
            }
            let connector = connectors
                .route(&url)
                .with_context(|| format!("No configured source is responsible for {}", url))?;
            let entry = entries
                .iter()
                .find(|e| e.connector.get_source_name() == connector.get_source_name())
                .with_context(|| format!("No source entry for {}", connector.get_source_name()))?;

            let result =
                harvest::probe(entry.connector.as_ref(), level.into(), &url, &entry.target.metadata)
                    .await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
    }

    Ok(())
}
