//! Snapshot-based in-memory tables.
//!
//! Readers load the current [`StoreSnapshot`] without locking. A commit
//! builds the next snapshot from the staged changes of one session and
//! swaps it in, so a reader sees either none or all of a session's changes.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use parking_lot::Mutex;
use rowsync_core::convert::ValueConverter;
use rowsync_core::entity::Entity;
use rowsync_core::error::CoreError;
use rowsync_core::metadata::{DataType, DbSetInfo, ServiceMetadata};
use rowsync_core::row::RowSerializer;
use tracing::{debug, info};

use crate::service::error::ServiceError;
use crate::service::version::{ConcurrencyError, EntityVersion};

/// Entities of one collection ordered by composite key.
pub type Table = BTreeMap<String, Arc<dyn Entity>>;

/// Immutable view of every table at one point in time.
#[derive(Default)]
pub struct StoreSnapshot {
    tables: HashMap<String, Arc<Table>>,
    version: u64,
}

impl StoreSnapshot {
    #[must_use]
    pub fn table(&self, db_set: &str) -> Option<&Arc<Table>> {
        self.tables.get(db_set)
    }

    #[must_use]
    pub fn get(&self, db_set: &str, key: &str) -> Option<&Arc<dyn Entity>> {
        self.tables.get(db_set).and_then(|t| t.get(key))
    }

    /// Number of commits applied so far.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }
}

/// A change staged by a session, applied at commit.
#[derive(Debug, Clone)]
pub enum StagedChange {
    Insert {
        db_set: Arc<DbSetInfo>,
        key: String,
        entity: Arc<dyn Entity>,
    },
    Update {
        db_set: Arc<DbSetInfo>,
        key: String,
        original: Arc<dyn Entity>,
        entity: Arc<dyn Entity>,
    },
    Delete {
        db_set: Arc<DbSetInfo>,
        key: String,
        original: Arc<dyn Entity>,
    },
}

impl StagedChange {
    fn db_set(&self) -> &Arc<DbSetInfo> {
        match self {
            StagedChange::Insert { db_set, .. }
            | StagedChange::Update { db_set, .. }
            | StagedChange::Delete { db_set, .. } => db_set,
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// In-memory backing store for every collection of one service.
pub struct MemoryStore {
    metadata: Arc<ServiceMetadata>,
    serializer: RowSerializer,
    snapshot: ArcSwap<StoreSnapshot>,
    /// Last generated integer key per collection.
    sequences: DashMap<String, AtomicI64>,
    commit_lock: Mutex<()>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("version", &self.snapshot.load().version)
            .finish_non_exhaustive()
    }
}

impl MemoryStore {
    /// `converter` must be the one the data service over this store uses,
    /// so both derive the same composite keys.
    #[must_use]
    pub fn new(metadata: Arc<ServiceMetadata>, converter: Arc<dyn ValueConverter>) -> Self {
        Self {
            metadata,
            serializer: RowSerializer::new(converter),
            snapshot: ArcSwap::from_pointee(StoreSnapshot::default()),
            sequences: DashMap::new(),
            commit_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn metadata(&self) -> &Arc<ServiceMetadata> {
        &self.metadata
    }

    #[must_use]
    pub fn serializer(&self) -> &RowSerializer {
        &self.serializer
    }

    /// Current committed state.
    #[must_use]
    pub fn snapshot(&self) -> Arc<StoreSnapshot> {
        self.snapshot.load_full()
    }

    /// Committed entity stored under `key`.
    #[must_use]
    pub fn get(&self, db_set: &str, key: &str) -> Option<Arc<dyn Entity>> {
        self.snapshot.load().get(db_set, key).cloned()
    }

    #[must_use]
    pub fn len(&self, db_set: &str) -> usize {
        self.snapshot.load().table(db_set).map_or(0, |t| t.len())
    }

    /// Composite key of `entity`.
    ///
    /// # Errors
    ///
    /// Fails on null key values.
    pub fn key_of(&self, db_set: &DbSetInfo, entity: &dyn Entity) -> Result<String, CoreError> {
        self.serializer.row_key(db_set, entity)
    }

    /// Next generated integer key of `db_set`.
    pub fn next_key(&self, db_set: &str) -> i64 {
        self.sequences
            .entry(db_set.to_string())
            .or_insert_with(|| AtomicI64::new(0))
            .fetch_add(1, Ordering::SeqCst)
            + 1
    }

    /// Stores `entities` directly, bypassing sessions. Generated integer keys
    /// continue after the largest seeded key.
    ///
    /// # Errors
    ///
    /// Fails for unknown collections and entities without a complete key.
    pub fn seed(&self, db_set_name: &str, entities: Vec<Box<dyn Entity>>) -> anyhow::Result<()> {
        let db_set = self
            .metadata
            .db_set(db_set_name)
            .ok_or_else(|| anyhow::anyhow!("unknown DbSet '{db_set_name}'"))?;
        let mut changes = Vec::with_capacity(entities.len());
        for entity in entities {
            self.bump_sequence(db_set, entity.as_ref());
            changes.push(StagedChange::Insert {
                db_set: Arc::clone(db_set),
                key: self.key_of(db_set, entity.as_ref())?,
                entity: Arc::from(entity),
            });
        }
        let count = changes.len();
        self.commit(changes)?;
        info!(db_set = db_set_name, rows = count, "table seeded");
        Ok(())
    }

    fn bump_sequence(&self, db_set: &DbSetInfo, entity: &dyn Entity) {
        for field in db_set.pk_fields().filter(|f| f.data_type == DataType::Integer) {
            if let Some(n) = entity.get_value(&field.field_name).and_then(|v| v.as_i64()) {
                self.sequences
                    .entry(db_set.db_set_name.clone())
                    .or_insert_with(|| AtomicI64::new(0))
                    .fetch_max(n, Ordering::SeqCst);
            }
        }
    }

    /// Verifies and applies `changes` as one unit.
    ///
    /// # Errors
    ///
    /// Fails without applying anything when an insert collides with an
    /// existing key, or an update/delete targets a missing or concurrently
    /// modified row.
    pub fn commit(&self, changes: Vec<StagedChange>) -> anyhow::Result<u64> {
        let _guard = self.commit_lock.lock();
        let current = self.snapshot.load_full();
        let mut tables = current.tables.clone();

        for change in &changes {
            let name = &change.db_set().db_set_name;
            let table = Arc::make_mut(tables.entry(name.clone()).or_default());
            match change {
                StagedChange::Insert { db_set, key, entity } => {
                    if table.contains_key(key) {
                        return Err(ServiceError::protocol(format!(
                            "row '{key}' of '{}' already exists",
                            db_set.db_set_name
                        ))
                        .into());
                    }
                    table.insert(key.clone(), Arc::clone(entity));
                }
                StagedChange::Update {
                    db_set,
                    key,
                    original,
                    entity,
                } => {
                    let stored = stored_or_missing(table, db_set, key)?;
                    EntityVersion::new(db_set, &self.serializer).check_against(
                        key,
                        original.as_ref(),
                        stored.as_ref(),
                    )?;
                    table.insert(key.clone(), Arc::clone(entity));
                }
                StagedChange::Delete {
                    db_set,
                    key,
                    original,
                } => {
                    let stored = stored_or_missing(table, db_set, key)?;
                    EntityVersion::new(db_set, &self.serializer).check_against(
                        key,
                        original.as_ref(),
                        stored.as_ref(),
                    )?;
                    table.remove(key);
                }
            }
        }

        let version = current.version + 1;
        self.snapshot.store(Arc::new(StoreSnapshot { tables, version }));
        debug!(version, changes = changes.len(), "store committed");
        Ok(version)
    }
}

fn stored_or_missing(
    table: &Table,
    db_set: &DbSetInfo,
    key: &str,
) -> Result<Arc<dyn Entity>, ConcurrencyError> {
    table
        .get(key)
        .cloned()
        .ok_or_else(|| ConcurrencyError::Missing {
            db_set: db_set.db_set_name.clone(),
            key: key.to_string(),
        })
}
