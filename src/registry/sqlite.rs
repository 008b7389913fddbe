//! SQLite-backed [`Registry`] implementation.
//!
//! One table per entity kind (see [`crate::migrate`]). An upsert runs in a
//! single transaction: parent checks, lookup by natural key, merge, then
//! `INSERT` or `UPDATE`. Writers are serialized in-process so concurrent
//! upserts of the same key merge instead of racing on the unique index.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex;

use crate::error::RegistryError;
use crate::models::{Entity, EntityFields, EntityKind, ParentRef};

use super::{
    check_key, has_parent_column, merge_into, new_entity, now, parent_refs, KindCount, Registry,
    Upserted,
};

/// SQLite implementation of the [`Registry`] trait.
pub struct SqliteRegistry {
    pool: SqlitePool,
    write_lock: Mutex<()>,
}

impl SqliteRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            write_lock: Mutex::new(()),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Table name for a kind. Also the SQL identifier, so it must stay a literal.
fn table(kind: EntityKind) -> &'static str {
    kind.as_str()
}

/// Writable columns per kind, in bind order.
fn columns(kind: EntityKind) -> &'static [&'static str] {
    match kind {
        EntityKind::Source => &["url", "name", "scraping_metadata", "info"],
        EntityKind::Feed => &["url", "name", "scraping_metadata", "info", "source_id"],
        EntityKind::Channel => &[
            "url",
            "name",
            "scraping_metadata",
            "info",
            "source_id",
            "feed_id",
        ],
        EntityKind::Asset => &[
            "url",
            "name",
            "scraping_metadata",
            "info",
            "source_id",
            "feed_id",
            "channel_id",
        ],
        EntityKind::File => &["sha256", "url", "path", "encoding", "extension", "asset_id"],
    }
}

enum Bind {
    Text(Option<String>),
    Int(Option<i64>),
}

fn json_text(value: &Option<Value>) -> Option<String> {
    value.as_ref().map(|v| v.to_string())
}

fn column_value(entity: &Entity, column: &str) -> Bind {
    match column {
        "url" => Bind::Text(entity.url.clone()),
        "name" => Bind::Text(entity.name.clone()),
        "scraping_metadata" => Bind::Text(json_text(&entity.scraping_metadata)),
        "info" => Bind::Text(json_text(&entity.info)),
        "sha256" => Bind::Text(entity.sha256.clone()),
        "path" => Bind::Text(entity.path.clone()),
        // NOT NULL in the schema; an unknown value is stored as empty.
        "encoding" => Bind::Text(Some(entity.encoding.clone().unwrap_or_default())),
        "extension" => Bind::Text(Some(entity.extension.clone().unwrap_or_default())),
        "source_id" => Bind::Int(entity.source_id),
        "feed_id" => Bind::Int(entity.feed_id),
        "channel_id" => Bind::Int(entity.channel_id),
        "asset_id" => Bind::Int(entity.asset_id),
        _ => Bind::Text(None),
    }
}

fn row_to_entity(kind: EntityKind, row: &SqliteRow) -> Result<Entity, RegistryError> {
    let cols = columns(kind);
    let text = |name: &str| -> Result<Option<String>, sqlx::Error> {
        if cols.contains(&name) {
            row.try_get::<Option<String>, _>(name)
        } else {
            Ok(None)
        }
    };
    let int = |name: &str| -> Result<Option<i64>, sqlx::Error> {
        if cols.contains(&name) {
            row.try_get::<Option<i64>, _>(name)
        } else {
            Ok(None)
        }
    };
    let json = |name: &str| -> Result<Option<Value>, RegistryError> {
        Ok(text(name)?.map(|s| serde_json::from_str(&s)).transpose()?)
    };
    let non_empty = |v: Option<String>| v.filter(|s| !s.is_empty());

    Ok(Entity {
        id: row.try_get("id")?,
        kind,
        url: text("url")?,
        name: text("name")?,
        scraping_metadata: json("scraping_metadata")?,
        info: json("info")?,
        source_id: int("source_id")?,
        feed_id: int("feed_id")?,
        channel_id: int("channel_id")?,
        asset_id: int("asset_id")?,
        path: text("path")?,
        encoding: non_empty(text("encoding")?),
        extension: non_empty(text("extension")?),
        sha256: text("sha256")?,
        created: row.try_get("created")?,
        updated: row.try_get("updated")?,
        inactive: row.try_get::<i64, _>("inactive")? != 0,
    })
}

fn bind_all<'q>(
    mut query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    values: Vec<Bind>,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    for value in values {
        query = match value {
            Bind::Text(v) => query.bind(v),
            Bind::Int(v) => query.bind(v),
        };
    }
    query
}

#[async_trait]
impl Registry for SqliteRegistry {
    async fn upsert(
        &self,
        kind: EntityKind,
        key: &str,
        fields: EntityFields,
    ) -> Result<Upserted, RegistryError> {
        check_key(kind, key)?;
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let select = format!(
            "SELECT * FROM {} WHERE {} = ?",
            table(kind),
            kind.key_column()
        );
        let existing = match sqlx::query(&select)
            .bind(key)
            .fetch_optional(&mut *tx)
            .await?
        {
            Some(row) => Some(row_to_entity(kind, &row)?),
            None => None,
        };

        for (parent_kind, id) in parent_refs(kind, &fields, existing.is_none())? {
            let sql = format!("SELECT inactive FROM {} WHERE id = ?", table(parent_kind));
            let inactive: Option<i64> = sqlx::query_scalar(&sql)
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
            if inactive != Some(0) {
                return Err(RegistryError::MissingParent {
                    kind: parent_kind,
                    id,
                });
            }
        }

        let ts = now();
        let cols = columns(kind);
        let upserted = match existing {
            Some(mut entity) => {
                merge_into(&mut entity, fields, ts);
                let assignments = cols
                    .iter()
                    .map(|c| format!("{} = ?", c))
                    .collect::<Vec<_>>()
                    .join(", ");
                let sql = format!(
                    "UPDATE {} SET {}, updated = ?, inactive = 0 WHERE id = ?",
                    table(kind),
                    assignments
                );
                let values = cols.iter().map(|c| column_value(&entity, c)).collect();
                bind_all(sqlx::query(&sql), values)
                    .bind(entity.updated)
                    .bind(entity.id)
                    .execute(&mut *tx)
                    .await?;
                Upserted {
                    entity,
                    created: false,
                }
            }
            None => {
                let mut entity = new_entity(kind, key, fields, ts);
                let placeholders = vec!["?"; cols.len()].join(", ");
                let sql = format!(
                    "INSERT INTO {} ({}, created, updated, inactive) VALUES ({}, ?, ?, 0)",
                    table(kind),
                    cols.join(", "),
                    placeholders
                );
                let values = cols.iter().map(|c| column_value(&entity, c)).collect();
                let result = bind_all(sqlx::query(&sql), values)
                    .bind(entity.created)
                    .bind(entity.updated)
                    .execute(&mut *tx)
                    .await?;
                entity.id = result.last_insert_rowid();
                Upserted {
                    entity,
                    created: true,
                }
            }
        };

        tx.commit().await?;
        Ok(upserted)
    }

    async fn mark_unreachable(&self, kind: EntityKind, ids: &[i64]) -> Result<u64, RegistryError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let _guard = self.write_lock.lock().await;
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "UPDATE {} SET inactive = 1, updated = ? WHERE inactive = 0 AND id IN ({})",
            table(kind),
            placeholders
        );
        let mut query = sqlx::query(&sql).bind(now());
        for id in ids {
            query = query.bind(*id);
        }
        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn get(&self, kind: EntityKind, id: i64) -> Result<Option<Entity>, RegistryError> {
        let sql = format!("SELECT * FROM {} WHERE id = ?", table(kind));
        match sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await? {
            Some(row) => Ok(Some(row_to_entity(kind, &row)?)),
            None => Ok(None),
        }
    }

    async fn find(&self, kind: EntityKind, key: &str) -> Result<Option<Entity>, RegistryError> {
        let sql = format!(
            "SELECT * FROM {} WHERE {} = ?",
            table(kind),
            kind.key_column()
        );
        match sqlx::query(&sql).bind(key).fetch_optional(&self.pool).await? {
            Some(row) => Ok(Some(row_to_entity(kind, &row)?)),
            None => Ok(None),
        }
    }

    async fn children(
        &self,
        kind: EntityKind,
        parent: ParentRef,
    ) -> Result<Vec<Entity>, RegistryError> {
        if !has_parent_column(kind, &parent) {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT * FROM {} WHERE {} = ? AND inactive = 0 ORDER BY id",
            table(kind),
            parent.column()
        );
        let rows = sqlx::query(&sql)
            .bind(parent.id())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(|row| row_to_entity(kind, row)).collect()
    }

    async fn list(&self, kind: EntityKind) -> Result<Vec<Entity>, RegistryError> {
        let sql = format!("SELECT * FROM {} ORDER BY id", table(kind));
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(|row| row_to_entity(kind, row)).collect()
    }

    async fn count(&self, kind: EntityKind) -> Result<KindCount, RegistryError> {
        let sql = format!(
            "SELECT COALESCE(SUM(inactive = 0), 0) AS active, \
                    COALESCE(SUM(inactive != 0), 0) AS inactive FROM {}",
            table(kind)
        );
        let row = sqlx::query(&sql).fetch_one(&self.pool).await?;
        Ok(KindCount {
            active: row.try_get("active")?,
            inactive: row.try_get("inactive")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::migrate::apply_schema;

    async fn registry(dir: &tempfile::TempDir) -> SqliteRegistry {
        let pool = db::open(&dir.path().join("registry.sqlite")).await.unwrap();
        apply_schema(&pool).await.unwrap();
        SqliteRegistry::new(pool)
    }

    #[tokio::test]
    async fn test_roundtrip_and_merge() {
        let dir = tempfile::TempDir::new().unwrap();
        let registry = registry(&dir).await;

        let source = registry
            .upsert(
                EntityKind::Source,
                "https://example.test",
                EntityFields {
                    name: Some("demo".into()),
                    info: Some(serde_json::json!({"a": 1})),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(source.created);

        let merged = registry
            .upsert(
                EntityKind::Source,
                "https://example.test",
                EntityFields {
                    info: Some(serde_json::json!({"b": 2})),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(!merged.created);
        assert_eq!(merged.id(), source.id());

        let stored = registry
            .get(EntityKind::Source, source.id())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.info, Some(serde_json::json!({"a": 1, "b": 2})));
        assert_eq!(stored.name.as_deref(), Some("demo"));
    }

    #[tokio::test]
    async fn test_file_dedup_by_hash() {
        let dir = tempfile::TempDir::new().unwrap();
        let registry = registry(&dir).await;
        let sid = registry
            .upsert(EntityKind::Source, "https://example.test", EntityFields::default())
            .await
            .unwrap()
            .id();
        let aid = registry
            .upsert(
                EntityKind::Asset,
                "https://example.test/a",
                EntityFields {
                    source_id: Some(sid),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .id();

        let file = |url: &str, path: &str| EntityFields {
            url: Some(url.into()),
            path: Some(path.into()),
            encoding: Some("binary".into()),
            extension: Some("pdf".into()),
            asset_id: Some(aid),
            ..Default::default()
        };
        let first = registry
            .upsert(EntityKind::File, "deadbeef", file("https://a.test/x", "/one"))
            .await
            .unwrap();
        let second = registry
            .upsert(EntityKind::File, "deadbeef", file("https://b.test/x", "/two"))
            .await
            .unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(second.entity.path.as_deref(), Some("/one"));
        assert_eq!(registry.count(EntityKind::File).await.unwrap().active, 1);
    }

    #[tokio::test]
    async fn test_children_and_mark_unreachable() {
        let dir = tempfile::TempDir::new().unwrap();
        let registry = registry(&dir).await;
        let sid = registry
            .upsert(EntityKind::Source, "https://example.test", EntityFields::default())
            .await
            .unwrap()
            .id();
        let mut ids = Vec::new();
        for url in ["https://example.test/c1", "https://example.test/c2"] {
            ids.push(
                registry
                    .upsert(
                        EntityKind::Channel,
                        url,
                        EntityFields {
                            source_id: Some(sid),
                            ..Default::default()
                        },
                    )
                    .await
                    .unwrap()
                    .id(),
            );
        }

        assert_eq!(
            registry
                .mark_unreachable(EntityKind::Channel, &ids[1..])
                .await
                .unwrap(),
            1
        );
        let active = registry
            .children(EntityKind::Channel, ParentRef::Source(sid))
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, ids[0]);
        assert_eq!(
            registry.count(EntityKind::Channel).await.unwrap(),
            KindCount {
                active: 1,
                inactive: 1
            }
        );
        assert_eq!(registry.list(EntityKind::Channel).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_parent_writes_nothing() {
        let dir = tempfile::TempDir::new().unwrap();
        let registry = registry(&dir).await;
        let err = registry
            .upsert(
                EntityKind::Feed,
                "https://example.test/f",
                EntityFields {
                    source_id: Some(9),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::MissingParent { .. }));
        assert_eq!(registry.count(EntityKind::Feed).await.unwrap(), KindCount::default());
    }
}
