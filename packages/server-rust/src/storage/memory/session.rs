//! Per-request sessions and collection handlers over a [`MemoryStore`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rowsync_core::entity::{DynamicEntity, Entity};
use rowsync_core::messages::{QueryRequest, ValueChange};
use rowsync_core::metadata::{row_fields, DataType, DbSetInfo};
use rowsync_core::types::{Principal, Value};
use tracing::debug;

use super::query::run_query;
use super::store::{MemoryStore, StagedChange};
use crate::service::context;
use crate::service::error::ServiceError;
use crate::service::handler::{DataSession, DbSetHandler, IncludedSubset, QueryResult, SessionFactory};
use crate::service::version::{ConcurrencyError, EntityVersion};

// ---------------------------------------------------------------------------
// MemorySessionFactory
// ---------------------------------------------------------------------------

/// Opens one [`MemorySession`] per request.
#[derive(Debug, Clone)]
pub struct MemorySessionFactory {
    store: Arc<MemoryStore>,
}

impl MemorySessionFactory {
    #[must_use]
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl SessionFactory for MemorySessionFactory {
    async fn open(&self, principal: Arc<Principal>) -> anyhow::Result<Arc<dyn DataSession>> {
        Ok(Arc::new(MemorySession::new(Arc::clone(&self.store), principal)))
    }
}

// ---------------------------------------------------------------------------
// MemorySession
// ---------------------------------------------------------------------------

/// Stages the changes of one request and applies them in one commit.
#[derive(Debug)]
pub struct MemorySession {
    store: Arc<MemoryStore>,
    principal: Arc<Principal>,
    staged: Arc<Mutex<Vec<StagedChange>>>,
    closed: AtomicBool,
}

impl MemorySession {
    #[must_use]
    pub fn new(store: Arc<MemoryStore>, principal: Arc<Principal>) -> Self {
        Self {
            store,
            principal,
            staged: Arc::new(Mutex::new(Vec::new())),
            closed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    /// Number of changes waiting for commit.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.staged.lock().len()
    }

    fn ensure_open(&self) -> anyhow::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            anyhow::bail!("session is closed");
        }
        Ok(())
    }
}

#[async_trait]
impl DataSession for MemorySession {
    fn handler(&self, db_set: &Arc<DbSetInfo>) -> anyhow::Result<Arc<dyn DbSetHandler>> {
        self.ensure_open()?;
        if self.store.metadata().db_set(&db_set.db_set_name).is_none() {
            anyhow::bail!("store has no table for DbSet '{}'", db_set.db_set_name);
        }
        Ok(Arc::new(MemoryHandler {
            store: Arc::clone(&self.store),
            staged: Arc::clone(&self.staged),
            db_set: Arc::clone(db_set),
        }))
    }

    async fn commit(&self) -> anyhow::Result<Vec<IncludedSubset>> {
        self.ensure_open()?;
        let changes = std::mem::take(&mut *self.staged.lock());
        if changes.is_empty() {
            return Ok(Vec::new());
        }
        let count = changes.len();
        let version = self.store.commit(changes)?;
        debug!(user = self.principal.display_name(), changes = count, version, "session committed");
        Ok(Vec::new())
    }

    async fn close(&self) -> anyhow::Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let discarded = std::mem::take(&mut *self.staged.lock()).len();
        if discarded > 0 {
            debug!(discarded, "session closed with uncommitted changes");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryHandler
// ---------------------------------------------------------------------------

/// Collection handler staging into its session.
pub struct MemoryHandler {
    store: Arc<MemoryStore>,
    staged: Arc<Mutex<Vec<StagedChange>>>,
    db_set: Arc<DbSetInfo>,
}

impl MemoryHandler {
    fn key(&self, entity: &dyn Entity) -> anyhow::Result<String> {
        Ok(self.store.key_of(&self.db_set, entity)?)
    }

    fn stored(&self, key: &str) -> Result<Arc<dyn Entity>, ConcurrencyError> {
        self.store
            .get(&self.db_set.db_set_name, key)
            .ok_or_else(|| ConcurrencyError::Missing {
                db_set: self.db_set.db_set_name.clone(),
                key: key.to_string(),
            })
    }

    /// Submitted original from the ambient row, or `fallback` outside of one.
    fn original_or(&self, fallback: &dyn Entity) -> Arc<dyn Entity> {
        context::current_original().unwrap_or_else(|| Arc::from(fallback.clone_entity()))
    }

    fn stage(&self, change: StagedChange) {
        self.staged.lock().push(change);
    }

    fn bump_row_version(&self, entity: &mut dyn Entity) -> anyhow::Result<()> {
        for field in row_fields(&self.db_set.fields)
            .filter(|f| f.is_row_version && f.data_type == DataType::Integer)
        {
            let current = entity
                .get_value(&field.field_name)
                .and_then(|v| v.as_i64())
                .unwrap_or(0);
            entity.set_value(&field.field_name, Value::Int(current + 1))?;
        }
        Ok(())
    }
}

/// Top-level names of the values the client changed.
fn changed_names(values: &[ValueChange]) -> Vec<&str> {
    values
        .iter()
        .filter(|v| v.has_changes())
        .map(|v| v.field_name.as_str())
        .collect()
}

fn copy_row_fields(db_set: &DbSetInfo, from: &dyn Entity, to: &mut dyn Entity) -> anyhow::Result<()> {
    for field in row_fields(&db_set.fields) {
        let value = from.get_value(&field.field_name).unwrap_or(Value::Null);
        to.set_value(&field.field_name, value)?;
    }
    Ok(())
}

#[async_trait]
impl DbSetHandler for MemoryHandler {
    fn create_entity(&self) -> Box<dyn Entity> {
        Box::new(DynamicEntity::new(self.db_set.entity_type.clone()))
    }

    async fn query(&self, request: &QueryRequest) -> anyhow::Result<QueryResult> {
        let snapshot = self.store.snapshot();
        Ok(run_query(&self.store, &snapshot, &self.db_set, request)?)
    }

    async fn insert(&self, entity: &mut dyn Entity) -> anyhow::Result<()> {
        for field in self
            .db_set
            .pk_fields()
            .filter(|f| f.is_auto_generated && f.data_type == DataType::Integer)
        {
            let assigned = entity
                .get_value(&field.field_name)
                .and_then(|v| v.as_i64())
                .is_some_and(|n| n > 0);
            if !assigned {
                let next = self.store.next_key(&self.db_set.db_set_name);
                entity.set_value(&field.field_name, Value::Int(next))?;
            }
        }
        self.bump_row_version(entity)?;

        let key = self.key(entity)?;
        let duplicate_staged = self.staged.lock().iter().any(|c| {
            matches!(c, StagedChange::Insert { db_set, key: k, .. }
                if db_set.db_set_name == self.db_set.db_set_name && *k == key)
        });
        if duplicate_staged || self.store.get(&self.db_set.db_set_name, &key).is_some() {
            return Err(ServiceError::protocol(format!(
                "row '{key}' of '{}' already exists",
                self.db_set.db_set_name
            ))
            .into());
        }
        self.stage(StagedChange::Insert {
            db_set: Arc::clone(&self.db_set),
            key,
            entity: Arc::from(entity.clone_entity()),
        });
        Ok(())
    }

    async fn update(&self, entity: &mut dyn Entity) -> anyhow::Result<()> {
        let key = self.key(entity)?;
        let stored = self.stored(&key)?;
        let original = self.original_or(entity);
        EntityVersion::new(&self.db_set, self.store.serializer()).check_against(
            &key,
            original.as_ref(),
            stored.as_ref(),
        )?;

        let mut merged = stored.clone_entity();
        match context::current().and_then(|frame| frame.row.clone()) {
            Some(row) => {
                for name in changed_names(&row.values) {
                    let value = entity.get_value(name).unwrap_or(Value::Null);
                    merged.set_value(name, value)?;
                }
            }
            None => copy_row_fields(&self.db_set, entity, merged.as_mut())?,
        }
        self.bump_row_version(merged.as_mut())?;
        copy_row_fields(&self.db_set, merged.as_ref(), entity)?;

        self.stage(StagedChange::Update {
            db_set: Arc::clone(&self.db_set),
            key,
            original,
            entity: Arc::from(merged),
        });
        Ok(())
    }

    async fn delete(&self, entity: &mut dyn Entity) -> anyhow::Result<()> {
        let key = self.key(entity)?;
        let stored = self.stored(&key)?;
        let original = self.original_or(entity);
        EntityVersion::new(&self.db_set, self.store.serializer()).check_against(
            &key,
            original.as_ref(),
            stored.as_ref(),
        )?;
        self.stage(StagedChange::Delete {
            db_set: Arc::clone(&self.db_set),
            key,
            original,
        });
        Ok(())
    }

    async fn refresh(&self, entity: &mut dyn Entity) -> anyhow::Result<()> {
        let key = self.key(entity)?;
        let stored = self.stored(&key)?;
        copy_row_fields(&self.db_set, stored.as_ref(), entity)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use chrono::{FixedOffset, NaiveDate};
    use rowsync_core::convert::DefaultValueConverter;
    use rowsync_core::metadata::{DateConversion, DbSetInfo, Field, ServiceMetadata};
    use rowsync_core::types::Principal;

    use super::*;

    fn store() -> Arc<MemoryStore> {
        let metadata = ServiceMetadata::builder()
            .handler("Items", Vec::new())
            .db_set(
                DbSetInfo::new("Item", "Item")
                    .field(
                        Field::new("ItemId", DataType::Integer)
                            .primary_key(1)
                            .auto_generated(),
                    )
                    .field(Field::new("Name", DataType::String))
                    .field(Field::new("Version", DataType::Integer).row_version())
                    .crud_methods("Items"),
            )
            .build()
            .unwrap();
        Arc::new(MemoryStore::new(Arc::new(metadata), Arc::new(DefaultValueConverter::utc())))
    }

    fn item(id: i64, name: &str) -> Box<dyn Entity> {
        Box::new(
            DynamicEntity::new("Item")
                .with("ItemId", id)
                .with("Name", name)
                .with("Version", 1i64),
        )
    }

    fn session(store: &Arc<MemoryStore>) -> (MemorySession, Arc<dyn DbSetHandler>) {
        let session = MemorySession::new(Arc::clone(store), Arc::new(Principal::anonymous()));
        let db_set = Arc::clone(store.metadata().db_set("Item").unwrap());
        let handler = session.handler(&db_set).unwrap();
        (session, handler)
    }

    #[tokio::test]
    async fn insert_generates_keys_and_is_invisible_until_commit() {
        let store = store();
        store.seed("Item", vec![item(7, "seeded")]).unwrap();
        let (session, handler) = session(&store);

        let mut entity = handler.create_entity();
        entity.set_value("Name", Value::from("new")).unwrap();
        handler.insert(entity.as_mut()).await.unwrap();

        assert_eq!(entity.get_value("ItemId"), Some(Value::Int(8)));
        assert_eq!(entity.get_value("Version"), Some(Value::Int(1)));
        assert_eq!(store.len("Item"), 1);
        assert_eq!(session.pending(), 1);

        session.commit().await.unwrap();
        assert_eq!(store.len("Item"), 2);
        assert!(store.get("Item", "8").is_some());
    }

    #[tokio::test]
    async fn close_discards_staged_changes() {
        let store = store();
        let (session, handler) = session(&store);
        let mut entity = handler.create_entity();
        handler.insert(entity.as_mut()).await.unwrap();

        session.close().await.unwrap();
        assert_eq!(session.pending(), 0);
        assert_eq!(store.len("Item"), 0);
        assert!(session.commit().await.is_err());
    }

    #[tokio::test]
    async fn update_checks_row_version_against_store() {
        let store = store();
        store.seed("Item", vec![item(1, "a")]).unwrap();

        // Another writer bumps the version first.
        let (first, handler) = session(&store);
        let mut entity = item(1, "b");
        handler.update(entity.as_mut()).await.unwrap();
        assert_eq!(entity.get_value("Version"), Some(Value::Int(2)));
        first.commit().await.unwrap();

        let (_second, handler) = session(&store);
        let mut stale = item(1, "c");
        let err = handler.update(stale.as_mut()).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConcurrencyError>(),
            Some(ConcurrencyError::Conflict { field, .. }) if field == "Version"
        ));
    }

    #[tokio::test]
    async fn conflicting_commits_apply_nothing() {
        let store = store();
        store.seed("Item", vec![item(1, "a"), item(2, "b")]).unwrap();

        let (first, h1) = session(&store);
        let (second, h2) = session(&store);
        h1.update(item(1, "x").as_mut()).await.unwrap();
        h2.update(item(2, "y").as_mut()).await.unwrap();
        h2.update(item(1, "z").as_mut()).await.unwrap();

        first.commit().await.unwrap();
        assert!(second.commit().await.is_err());

        let two = store.get("Item", "2").unwrap();
        assert_eq!(two.get_value("Name"), Some(Value::from("b")));
        let one = store.get("Item", "1").unwrap();
        assert_eq!(one.get_value("Name"), Some(Value::from("x")));
    }

    #[tokio::test]
    async fn delete_of_missing_row_is_reported() {
        let store = store();
        let (_session, handler) = session(&store);
        let err = handler.delete(item(5, "gone").as_mut()).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConcurrencyError>(),
            Some(ConcurrencyError::Missing { .. })
        ));
    }

    #[test]
    fn date_keys_follow_the_service_converter() {
        let metadata = ServiceMetadata::builder()
            .db_set(
                DbSetInfo::new("Shift", "Shift")
                    .field(
                        Field::new("StartsAt", DataType::DateTime)
                            .primary_key(1)
                            .date_conversion(DateConversion::ServerLocalToClientLocal),
                    )
                    .field(Field::new("Name", DataType::String)),
            )
            .build()
            .unwrap();
        let plus_two = FixedOffset::east_opt(2 * 3600).unwrap();
        let store = MemoryStore::new(Arc::new(metadata), Arc::new(DefaultValueConverter::new(plus_two)));
        let noon = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        store
            .seed(
                "Shift",
                vec![Box::new(
                    DynamicEntity::new("Shift")
                        .with("StartsAt", Value::DateTime(noon))
                        .with("Name", "early"),
                )],
            )
            .unwrap();
        assert!(store.get("Shift", "2024-01-01T10:00:00.000Z").is_some());
        assert!(store.get("Shift", "2024-01-01T12:00:00.000Z").is_none());
    }

    #[tokio::test]
    async fn refresh_reads_committed_state() {
        let store = store();
        store.seed("Item", vec![item(3, "stored")]).unwrap();
        let (_session, handler) = session(&store);

        let mut entity = item(3, "client");
        handler.refresh(entity.as_mut()).await.unwrap();
        assert_eq!(entity.get_value("Name"), Some(Value::from("stored")));
    }
}
