//! Content registry: the persistent, deduplicated entity store.
//!
//! The [`Registry`] trait is the only way entities are written. Every write
//! goes through [`upsert`](Registry::upsert), which is keyed by natural
//! identity (URL, or content hash for files) and is therefore idempotent.
//! Rows are never deleted; [`mark_unreachable`](Registry::mark_unreachable)
//! soft-deletes them.
//!
//! Both backends share the merge and validation rules in this module so they
//! behave identically:
//!
//! | Kind | Key | Required parents | Optional parents |
//! |------|-----|------------------|------------------|
//! | source | url | none | none |
//! | feed | url | `source_id` | none |
//! | channel | url | `source_id` | `feed_id` |
//! | asset | url | `source_id` | `feed_id`, `channel_id` |
//! | file | sha256 | `asset_id` | none |
//!
//! Every parent reference must name an existing, active row.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::error::RegistryError;
use crate::models::{Entity, EntityFields, EntityKind, ParentRef};

pub use memory::InMemoryRegistry;
pub use sqlite::SqliteRegistry;

/// Result of an [`upsert`](Registry::upsert).
#[derive(Debug, Clone)]
pub struct Upserted {
    /// The row as stored after the write.
    pub entity: Entity,
    /// `true` if the row did not exist before.
    pub created: bool,
}

impl Upserted {
    pub fn id(&self) -> i64 {
        self.entity.id
    }
}

/// Active and inactive row counts for one kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct KindCount {
    pub active: i64,
    pub inactive: i64,
}

/// Abstract entity store.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert`](Registry::upsert) | Create or merge by natural key (all-or-nothing) |
/// | [`mark_unreachable`](Registry::mark_unreachable) | Soft-delete rows |
/// | [`get`](Registry::get) | Row by id |
/// | [`find`](Registry::find) | Row by natural key |
/// | [`children`](Registry::children) | Active rows under a parent |
/// | [`list`](Registry::list) | Every row of a kind, including inactive ones |
/// | [`count`](Registry::count) | Active / inactive counts |
#[async_trait]
pub trait Registry: Send + Sync {
    /// Create the row keyed by `key`, or merge `fields` into the existing
    /// one. An inactive row is reactivated. Parent references are checked
    /// before anything is written.
    async fn upsert(
        &self,
        kind: EntityKind,
        key: &str,
        fields: EntityFields,
    ) -> Result<Upserted, RegistryError>;

    /// Flip the given rows to inactive. Returns how many changed.
    async fn mark_unreachable(&self, kind: EntityKind, ids: &[i64]) -> Result<u64, RegistryError>;

    async fn get(&self, kind: EntityKind, id: i64) -> Result<Option<Entity>, RegistryError>;

    async fn find(&self, kind: EntityKind, key: &str) -> Result<Option<Entity>, RegistryError>;

    /// Active rows of `kind` whose parent column matches `parent`, by id.
    async fn children(
        &self,
        kind: EntityKind,
        parent: ParentRef,
    ) -> Result<Vec<Entity>, RegistryError>;

    async fn list(&self, kind: EntityKind) -> Result<Vec<Entity>, RegistryError>;

    async fn count(&self, kind: EntityKind) -> Result<KindCount, RegistryError>;
}

pub(crate) fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

pub(crate) fn check_key(kind: EntityKind, key: &str) -> Result<(), RegistryError> {
    if key.trim().is_empty() {
        return Err(RegistryError::EmptyKey { kind });
    }
    Ok(())
}

/// Parent rows that must exist and be active for this write.
///
/// Required references are only enforced when the row is being created;
/// an update may omit them and keep the stored values.
pub(crate) fn parent_refs(
    kind: EntityKind,
    fields: &EntityFields,
    creating: bool,
) -> Result<Vec<(EntityKind, i64)>, RegistryError> {
    let mut refs = Vec::new();
    let mut need = |parent: EntityKind,
                    field: &'static str,
                    value: Option<i64>,
                    required: bool|
     -> Result<(), RegistryError> {
        match value {
            Some(id) => refs.push((parent, id)),
            None if required && creating => {
                return Err(RegistryError::MissingParentRef { kind, field })
            }
            None => {}
        }
        Ok(())
    };

    match kind {
        EntityKind::Source => {}
        EntityKind::Feed => {
            need(EntityKind::Source, "source_id", fields.source_id, true)?;
        }
        EntityKind::Channel => {
            need(EntityKind::Source, "source_id", fields.source_id, true)?;
            need(EntityKind::Feed, "feed_id", fields.feed_id, false)?;
        }
        EntityKind::Asset => {
            need(EntityKind::Source, "source_id", fields.source_id, true)?;
            need(EntityKind::Feed, "feed_id", fields.feed_id, false)?;
            need(EntityKind::Channel, "channel_id", fields.channel_id, false)?;
        }
        EntityKind::File => {
            need(EntityKind::Asset, "asset_id", fields.asset_id, true)?;
        }
    }

    if kind == EntityKind::File && creating && fields.path.is_none() {
        return Err(RegistryError::MissingField {
            kind,
            field: "path",
        });
    }

    Ok(refs)
}

/// Build a fresh row from an upsert.
pub(crate) fn new_entity(kind: EntityKind, key: &str, fields: EntityFields, ts: i64) -> Entity {
    let is_file = kind == EntityKind::File;
    let mut entity = Entity {
        id: 0,
        kind,
        url: if is_file {
            fields.url
        } else {
            Some(key.to_string())
        },
        name: None,
        scraping_metadata: None,
        info: None,
        source_id: None,
        feed_id: None,
        channel_id: None,
        asset_id: None,
        path: None,
        encoding: None,
        extension: None,
        sha256: is_file.then(|| key.to_string()),
        created: ts,
        updated: ts,
        inactive: false,
    };

    if is_file {
        entity.asset_id = fields.asset_id;
        entity.path = fields.path;
        entity.encoding = fields.encoding;
        entity.extension = fields.extension;
    } else {
        entity.name = fields.name;
        entity.scraping_metadata = fields.scraping_metadata;
        entity.info = fields.info;
        entity.source_id = fields.source_id;
        entity.feed_id = fields.feed_id;
        entity.channel_id = fields.channel_id;
    }
    entity
}

/// Merge an upsert into an existing row and reactivate it.
///
/// Files keep the first path and owner they were stored with; their other
/// columns are only filled in when missing. For everything else supplied
/// fields win, and `info` objects are merged key by key.
pub(crate) fn merge_into(existing: &mut Entity, fields: EntityFields, ts: i64) {
    if existing.kind == EntityKind::File {
        fill(&mut existing.url, fields.url);
        fill(&mut existing.path, fields.path);
        fill(&mut existing.encoding, fields.encoding);
        fill(&mut existing.extension, fields.extension);
        fill(&mut existing.asset_id, fields.asset_id);
    } else {
        replace(&mut existing.name, fields.name);
        replace(&mut existing.scraping_metadata, fields.scraping_metadata);
        replace(&mut existing.source_id, fields.source_id);
        replace(&mut existing.feed_id, fields.feed_id);
        replace(&mut existing.channel_id, fields.channel_id);
        if let Some(info) = fields.info {
            existing.info = Some(merge_info(existing.info.take(), info));
        }
    }
    existing.updated = ts;
    existing.inactive = false;
}

fn fill<T>(slot: &mut Option<T>, value: Option<T>) {
    if slot.is_none() {
        *slot = value;
    }
}

fn replace<T>(slot: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *slot = value;
    }
}

fn merge_info(old: Option<Value>, new: Value) -> Value {
    match (old, new) {
        (Some(Value::Object(mut base)), Value::Object(top)) => {
            base.extend(top);
            Value::Object(base)
        }
        (_, new) => new,
    }
}

/// Whether rows of `kind` carry the column `parent` filters on.
pub(crate) fn has_parent_column(kind: EntityKind, parent: &ParentRef) -> bool {
    matches!(
        (kind, parent),
        (EntityKind::Feed, ParentRef::Source(_))
            | (EntityKind::Channel, ParentRef::Source(_) | ParentRef::Feed(_))
            | (
                EntityKind::Asset,
                ParentRef::Source(_) | ParentRef::Feed(_) | ParentRef::Channel(_)
            )
            | (EntityKind::File, ParentRef::Asset(_))
    )
}
