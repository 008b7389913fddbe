use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create the entity tables. Idempotent.
pub async fn apply_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS source (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            url TEXT NOT NULL UNIQUE,
            name TEXT,
            scraping_metadata TEXT,
            info TEXT,
            created INTEGER NOT NULL,
            updated INTEGER NOT NULL,
            inactive INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS feed (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            url TEXT NOT NULL UNIQUE,
            name TEXT,
            scraping_metadata TEXT,
            info TEXT,
            source_id INTEGER NOT NULL REFERENCES source(id),
            created INTEGER NOT NULL,
            updated INTEGER NOT NULL,
            inactive INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS channel (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            url TEXT NOT NULL UNIQUE,
            name TEXT,
            scraping_metadata TEXT,
            info TEXT,
            source_id INTEGER NOT NULL REFERENCES source(id),
            feed_id INTEGER REFERENCES feed(id),
            created INTEGER NOT NULL,
            updated INTEGER NOT NULL,
            inactive INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS asset (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            url TEXT NOT NULL UNIQUE,
            name TEXT,
            scraping_metadata TEXT,
            info TEXT,
            source_id INTEGER NOT NULL REFERENCES source(id),
            feed_id INTEGER REFERENCES feed(id),
            channel_id INTEGER REFERENCES channel(id),
            created INTEGER NOT NULL,
            updated INTEGER NOT NULL,
            inactive INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    // url is metadata here; content identity is the hash.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS file (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            sha256 TEXT NOT NULL UNIQUE,
            url TEXT,
            path TEXT NOT NULL,
            encoding TEXT NOT NULL DEFAULT '',
            extension TEXT NOT NULL DEFAULT '',
            asset_id INTEGER NOT NULL REFERENCES asset(id),
            created INTEGER NOT NULL,
            updated INTEGER NOT NULL,
            inactive INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_feed_source_id ON feed(source_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_channel_feed_id ON channel(feed_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_asset_channel_id ON asset(channel_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_asset_feed_id ON asset(feed_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_file_asset_id ON file(asset_id)")
        .execute(pool)
        .await?;

    Ok(())
}
