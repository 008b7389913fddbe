//! In-memory [`Registry`] implementation for tests and probes.
//!
//! All tables live behind one `std::sync::RwLock`, so an upsert's parent
//! check and write happen atomically.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::RegistryError;
use crate::models::{Entity, EntityFields, EntityKind, ParentRef};

use super::{
    check_key, has_parent_column, merge_into, new_entity, now, parent_refs, KindCount, Registry,
    Upserted,
};

#[derive(Default)]
struct Table {
    next_id: i64,
    rows: BTreeMap<i64, Entity>,
    by_key: HashMap<String, i64>,
}

/// In-memory registry.
pub struct InMemoryRegistry {
    tables: RwLock<HashMap<EntityKind, Table>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn natural_key(entity: &Entity) -> Option<&str> {
    match entity.kind {
        EntityKind::File => entity.sha256.as_deref(),
        _ => entity.url.as_deref(),
    }
}

#[async_trait]
impl Registry for InMemoryRegistry {
    async fn upsert(
        &self,
        kind: EntityKind,
        key: &str,
        fields: EntityFields,
    ) -> Result<Upserted, RegistryError> {
        check_key(kind, key)?;
        let mut tables = self.tables.write().unwrap();

        let existing = tables
            .get(&kind)
            .and_then(|t| t.by_key.get(key))
            .copied();

        for (parent_kind, id) in parent_refs(kind, &fields, existing.is_none())? {
            let active = tables
                .get(&parent_kind)
                .and_then(|t| t.rows.get(&id))
                .is_some_and(|row| !row.inactive);
            if !active {
                return Err(RegistryError::MissingParent {
                    kind: parent_kind,
                    id,
                });
            }
        }

        let ts = now();
        let table = tables.entry(kind).or_default();
        match existing.and_then(|id| table.rows.get_mut(&id)) {
            Some(row) => {
                merge_into(row, fields, ts);
                Ok(Upserted {
                    entity: row.clone(),
                    created: false,
                })
            }
            None => {
                table.next_id += 1;
                let mut entity = new_entity(kind, key, fields, ts);
                entity.id = table.next_id;
                table.by_key.insert(key.to_string(), entity.id);
                table.rows.insert(entity.id, entity.clone());
                Ok(Upserted {
                    entity,
                    created: true,
                })
            }
        }
    }

    async fn mark_unreachable(&self, kind: EntityKind, ids: &[i64]) -> Result<u64, RegistryError> {
        let mut tables = self.tables.write().unwrap();
        let Some(table) = tables.get_mut(&kind) else {
            return Ok(0);
        };
        let ts = now();
        let mut changed = 0;
        for id in ids {
            if let Some(row) = table.rows.get_mut(id) {
                if !row.inactive {
                    row.inactive = true;
                    row.updated = ts;
                    changed += 1;
                }
            }
        }
        Ok(changed)
    }

    async fn get(&self, kind: EntityKind, id: i64) -> Result<Option<Entity>, RegistryError> {
        let tables = self.tables.read().unwrap();
        Ok(tables.get(&kind).and_then(|t| t.rows.get(&id)).cloned())
    }

    async fn find(&self, kind: EntityKind, key: &str) -> Result<Option<Entity>, RegistryError> {
        let tables = self.tables.read().unwrap();
        Ok(tables.get(&kind).and_then(|t| {
            t.by_key
                .get(key)
                .and_then(|id| t.rows.get(id))
                .filter(|row| natural_key(row) == Some(key))
                .cloned()
        }))
    }

    async fn children(
        &self,
        kind: EntityKind,
        parent: ParentRef,
    ) -> Result<Vec<Entity>, RegistryError> {
        if !has_parent_column(kind, &parent) {
            return Ok(Vec::new());
        }
        let tables = self.tables.read().unwrap();
        Ok(tables
            .get(&kind)
            .map(|t| {
                t.rows
                    .values()
                    .filter(|row| !row.inactive && parent.matches(row))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn list(&self, kind: EntityKind) -> Result<Vec<Entity>, RegistryError> {
        let tables = self.tables.read().unwrap();
        Ok(tables
            .get(&kind)
            .map(|t| t.rows.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn count(&self, kind: EntityKind) -> Result<KindCount, RegistryError> {
        let tables = self.tables.read().unwrap();
        let mut count = KindCount::default();
        if let Some(table) = tables.get(&kind) {
            for row in table.rows.values() {
                if row.inactive {
                    count.inactive += 1;
                } else {
                    count.active += 1;
                }
            }
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn source(registry: &InMemoryRegistry) -> i64 {
        registry
            .upsert(
                EntityKind::Source,
                "https://example.test",
                EntityFields {
                    name: Some("demo".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .id()
    }

    fn channel(source_id: i64) -> EntityFields {
        EntityFields {
            source_id: Some(source_id),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let registry = InMemoryRegistry::new();
        let sid = source(&registry).await;
        let first = registry
            .upsert(EntityKind::Channel, "https://example.test/c1", channel(sid))
            .await
            .unwrap();
        let second = registry
            .upsert(EntityKind::Channel, "https://example.test/c1", channel(sid))
            .await
            .unwrap();
        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.id(), second.id());
        assert_eq!(registry.count(EntityKind::Channel).await.unwrap().active, 1);
    }

    #[tokio::test]
    async fn test_missing_parent_is_rejected() {
        let registry = InMemoryRegistry::new();
        let err = registry
            .upsert(EntityKind::Channel, "https://example.test/c1", channel(42))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RegistryError::MissingParent {
                kind: EntityKind::Source,
                id: 42
            }
        ));
        assert!(registry.list(EntityKind::Channel).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_inactive_parent_is_rejected() {
        let registry = InMemoryRegistry::new();
        let sid = source(&registry).await;
        registry
            .mark_unreachable(EntityKind::Source, &[sid])
            .await
            .unwrap();
        assert!(registry
            .upsert(EntityKind::Feed, "https://example.test/f", channel(sid))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_mark_unreachable_and_reactivate() {
        let registry = InMemoryRegistry::new();
        let sid = source(&registry).await;
        let c2 = registry
            .upsert(EntityKind::Channel, "https://example.test/c2", channel(sid))
            .await
            .unwrap()
            .id();

        assert_eq!(
            registry
                .mark_unreachable(EntityKind::Channel, &[c2])
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            registry
                .mark_unreachable(EntityKind::Channel, &[c2])
                .await
                .unwrap(),
            0
        );
        assert!(registry
            .children(EntityKind::Channel, ParentRef::Source(sid))
            .await
            .unwrap()
            .is_empty());

        let again = registry
            .upsert(EntityKind::Channel, "https://example.test/c2", channel(sid))
            .await
            .unwrap();
        assert_eq!(again.id(), c2);
        assert!(!again.entity.inactive);
    }

    #[tokio::test]
    async fn test_find_by_key() {
        let registry = InMemoryRegistry::new();
        source(&registry).await;
        let found = registry
            .find(EntityKind::Source, "https://example.test")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.name.as_deref(), Some("demo"));
        assert!(registry
            .find(EntityKind::Source, "https://nope.test")
            .await
            .unwrap()
            .is_none());
    }
}
