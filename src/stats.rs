//! Registry statistics.
//!
//! Active and inactive row counts per entity kind, plus per-source feed,
//! channel and asset counts. Used by `harvester stats` to confirm that
//! harvests are landing where expected.

use anyhow::Result;
use serde::Serialize;
use sqlx::Row;

use crate::config::Config;
use crate::db;
use crate::models::EntityKind;
use crate::registry::{KindCount, Registry, SqliteRegistry};

/// Counts for every entity kind, in hierarchy order.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub kinds: Vec<(EntityKind, KindCount)>,
}

impl RegistryStats {
    pub async fn collect(registry: &dyn Registry) -> Result<Self> {
        let mut kinds = Vec::with_capacity(EntityKind::ALL.len());
        for kind in EntityKind::ALL {
            kinds.push((kind, registry.count(kind).await?));
        }
        Ok(Self { kinds })
    }

    pub fn get(&self, kind: EntityKind) -> KindCount {
        self.kinds
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, c)| *c)
            .unwrap_or_default()
    }
}

struct SourceRow {
    name: String,
    feeds: i64,
    channels: i64,
    assets: i64,
    last_update: i64,
}

pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let registry = SqliteRegistry::new(pool.clone());
    let stats = RegistryStats::collect(&registry).await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Harvester Registry Stats");
    println!("========================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  {:<10} {:>8} {:>10}", "KIND", "ACTIVE", "INACTIVE");
    println!("  {}", "-".repeat(30));
    for (kind, count) in &stats.kinds {
        println!("  {:<10} {:>8} {:>10}", kind, count.active, count.inactive);
    }

    let rows = sqlx::query(
        r#"
        SELECT
            s.name AS name,
            (SELECT COUNT(*) FROM feed f WHERE f.source_id = s.id AND f.inactive = 0) AS feeds,
            (SELECT COUNT(*) FROM channel c WHERE c.source_id = s.id AND c.inactive = 0) AS channels,
            (SELECT COUNT(*) FROM asset a WHERE a.source_id = s.id AND a.inactive = 0) AS assets,
            s.updated AS last_update
        FROM source s
        ORDER BY s.name
        "#,
    )
    .fetch_all(&pool)
    .await?;

    let sources: Vec<SourceRow> = rows
        .iter()
        .map(|row| SourceRow {
            name: row.get::<Option<String>, _>("name").unwrap_or_default(),
            feeds: row.get("feeds"),
            channels: row.get("channels"),
            assets: row.get("assets"),
            last_update: row.get("last_update"),
        })
        .collect();

    if !sources.is_empty() {
        println!();
        println!("  By source:");
        println!(
            "  {:<24} {:>6} {:>9} {:>8}   {}",
            "SOURCE", "FEEDS", "CHANNELS", "ASSETS", "LAST HARVEST"
        );
        println!("  {}", "-".repeat(72));
        for s in &sources {
            println!(
                "  {:<24} {:>6} {:>9} {:>8}   {}",
                s.name,
                s.feeds,
                s.channels,
                s.assets,
                format_ts_relative(s.last_update)
            );
        }
    }

    println!();
    pool.close().await;
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// "3 hours ago" style, falling back to a date past 30 days.
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    let plural = |n: i64| if n == 1 { "" } else { "s" };
    match delta {
        d if d < 0 => format_ts_iso(ts),
        d if d < 60 => "just now".to_string(),
        d if d < 3600 => format!("{} min{} ago", d / 60, plural(d / 60)),
        d if d < 86400 => format!("{} hour{} ago", d / 3600, plural(d / 3600)),
        d if d < 86400 * 30 => format!("{} day{} ago", d / 86400, plural(d / 86400)),
        _ => format_ts_iso(ts),
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EntityFields;
    use crate::registry::InMemoryRegistry;

    #[tokio::test]
    async fn test_collect_counts_per_kind() {
        let registry = InMemoryRegistry::new();
        let sid = registry
            .upsert(EntityKind::Source, "https://s.test", EntityFields::default())
            .await
            .unwrap()
            .id();
        let fid = registry
            .upsert(
                EntityKind::Feed,
                "https://s.test/f",
                EntityFields {
                    source_id: Some(sid),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .id();
        registry
            .mark_unreachable(EntityKind::Feed, &[fid])
            .await
            .unwrap();

        let stats = RegistryStats::collect(&registry).await.unwrap();
        assert_eq!(stats.kinds.len(), 5);
        assert_eq!(stats.get(EntityKind::Source).active, 1);
        assert_eq!(
            stats.get(EntityKind::Feed),
            KindCount {
                active: 0,
                inactive: 1
            }
        );
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
    }
}
