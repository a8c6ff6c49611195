//! Metadata registry: builds each service definition's metadata once and
//! hands out the frozen result.

use std::any::{Any, TypeId};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use parking_lot::Mutex;
use rowsync_core::error::CoreError;
use rowsync_core::metadata::ServiceMetadata;
use tracing::info;

// ---------------------------------------------------------------------------
// ServiceDefinition trait
// ---------------------------------------------------------------------------

/// Static description of a data service: its collections, associations,
/// handlers, invoke methods and authorization rules.
///
/// Implemented by marker types; the `Any` bound enables lookup by `TypeId`
/// in the [`MetadataCache`].
pub trait ServiceDefinition: Any + Send + Sync {
    /// Name the service is routed under.
    fn service_name() -> &'static str;

    /// Describes and validates the service metadata.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidMetadata`] when the description is
    /// inconsistent.
    fn build_metadata() -> Result<ServiceMetadata, CoreError>;
}

// ---------------------------------------------------------------------------
// MetadataCache
// ---------------------------------------------------------------------------

type Slot = Arc<Mutex<Option<Arc<ServiceMetadata>>>>;

/// Lazily built, read-only metadata keyed by service definition type.
///
/// The first caller for a type builds the metadata while holding that
/// type's slot lock; concurrent first callers wait for it instead of
/// building again. Failed builds are not cached.
#[derive(Default)]
pub struct MetadataCache {
    by_type: DashMap<TypeId, Slot>,
}

impl std::fmt::Debug for MetadataCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataCache")
            .field("entries", &self.by_type.len())
            .finish()
    }
}

impl MetadataCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide cache.
    #[must_use]
    pub fn global() -> &'static MetadataCache {
        static GLOBAL: OnceLock<MetadataCache> = OnceLock::new();
        GLOBAL.get_or_init(MetadataCache::new)
    }

    /// Returns the metadata of `D`, building it on first access.
    ///
    /// # Errors
    ///
    /// Propagates the definition's build error.
    pub fn get<D: ServiceDefinition>(&self) -> Result<Arc<ServiceMetadata>, CoreError> {
        // Clone the slot out so the DashMap shard is not held while building.
        let slot = Arc::clone(self.by_type.entry(TypeId::of::<D>()).or_default().value());
        let mut guard = slot.lock();
        if let Some(metadata) = guard.as_ref() {
            return Ok(Arc::clone(metadata));
        }
        let metadata = Arc::new(D::build_metadata()?);
        info!(
            service = D::service_name(),
            db_sets = metadata.db_sets.len(),
            associations = metadata.associations.len(),
            "service metadata built"
        );
        *guard = Some(Arc::clone(&metadata));
        Ok(metadata)
    }

    /// Whether metadata for `D` has been built.
    #[must_use]
    pub fn contains<D: ServiceDefinition>(&self) -> bool {
        self.by_type
            .get(&TypeId::of::<D>())
            .is_some_and(|slot| slot.lock().is_some())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_type.iter().filter(|e| e.value().lock().is_some()).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use rowsync_core::metadata::{DataType, DbSetInfo, Field};

    use super::*;

    static BUILDS: AtomicUsize = AtomicUsize::new(0);

    struct Counted;

    impl ServiceDefinition for Counted {
        fn service_name() -> &'static str {
            "counted"
        }

        fn build_metadata() -> Result<ServiceMetadata, CoreError> {
            BUILDS.fetch_add(1, Ordering::SeqCst);
            // Widen the race window for concurrent first access.
            std::thread::sleep(std::time::Duration::from_millis(20));
            ServiceMetadata::builder()
                .db_set(
                    DbSetInfo::new("Items", "Item")
                        .field(Field::new("Id", DataType::Integer).primary_key(1)),
                )
                .build()
        }
    }

    struct Broken;

    impl ServiceDefinition for Broken {
        fn service_name() -> &'static str {
            "broken"
        }

        fn build_metadata() -> Result<ServiceMetadata, CoreError> {
            // No primary key.
            ServiceMetadata::builder()
                .db_set(DbSetInfo::new("Items", "Item").field(Field::new("Name", DataType::String)))
                .build()
        }
    }

    #[test]
    fn builds_once_under_concurrent_first_access() {
        let cache = Arc::new(MetadataCache::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || cache.get::<Counted>().unwrap())
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(BUILDS.load(Ordering::SeqCst), 1);
        assert!(results.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert!(cache.contains::<Counted>());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn build_errors_are_returned_and_not_cached() {
        let cache = MetadataCache::new();
        assert!(matches!(cache.get::<Broken>(), Err(CoreError::InvalidMetadata(_))));
        assert!(!cache.contains::<Broken>());
        assert!(cache.is_empty());
    }
}
