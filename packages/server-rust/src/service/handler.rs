//! Collaborator traits implemented by service authors and storage backends.
//!
//! A [`SessionFactory`] opens one [`DataSession`] per request. The session
//! hands out one [`DbSetHandler`] per collection and commits everything the
//! handlers applied as one unit. Handlers read the current row, its original
//! and its parents through the ambient context (`service::context`).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use rowsync_core::entity::Entity;
use rowsync_core::messages::{QueryRequest, RowInfo, ValidationErrorInfo, ValueChange};
use rowsync_core::metadata::DbSetInfo;
use rowsync_core::types::Principal;
use tracing::{debug, warn};

use super::error::ServiceError;

// ---------------------------------------------------------------------------
// Query results
// ---------------------------------------------------------------------------

/// Total row count of a query, when requested.
pub enum TotalCount {
    None,
    Known(u64),
    /// Resolved only when the client asked for the count.
    Deferred(BoxFuture<'static, anyhow::Result<u64>>),
}

impl std::fmt::Debug for TotalCount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TotalCount::None => f.write_str("None"),
            TotalCount::Known(n) => write!(f, "Known({n})"),
            TotalCount::Deferred(_) => f.write_str("Deferred"),
        }
    }
}

/// Entities of another collection returned beside the main result.
#[derive(Debug)]
pub struct IncludedSubset {
    pub db_set_name: String,
    pub entities: Vec<Box<dyn Entity>>,
}

#[derive(Debug)]
pub struct QueryResult {
    pub entities: Vec<Box<dyn Entity>>,
    pub total_count: TotalCount,
    pub subsets: Vec<IncludedSubset>,
    pub extra_info: Option<serde_json::Value>,
}

impl QueryResult {
    #[must_use]
    pub fn new(entities: Vec<Box<dyn Entity>>) -> Self {
        Self {
            entities,
            total_count: TotalCount::None,
            subsets: Vec::new(),
            extra_info: None,
        }
    }

    #[must_use]
    pub fn with_total_count(mut self, total_count: TotalCount) -> Self {
        self.total_count = total_count;
        self
    }

    #[must_use]
    pub fn with_subset(mut self, subset: IncludedSubset) -> Self {
        self.subsets.push(subset);
        self
    }
}

// ---------------------------------------------------------------------------
// Handler and session traits
// ---------------------------------------------------------------------------

/// Operations bound to one collection.
#[async_trait]
pub trait DbSetHandler: Send + Sync {
    /// A blank native entity of the collection's type.
    fn create_entity(&self) -> Box<dyn Entity>;

    async fn query(&self, request: &QueryRequest) -> anyhow::Result<QueryResult>;

    /// Stages a new entity. Store-generated keys are written onto `entity`.
    async fn insert(&self, entity: &mut dyn Entity) -> anyhow::Result<()>;

    async fn update(&self, entity: &mut dyn Entity) -> anyhow::Result<()>;

    async fn delete(&self, entity: &mut dyn Entity) -> anyhow::Result<()>;

    /// Overwrites `entity` with the stored state.
    async fn refresh(&self, entity: &mut dyn Entity) -> anyhow::Result<()>;

    /// Collection-level validation of an inserted or updated entity.
    async fn validate(&self, _entity: &dyn Entity) -> anyhow::Result<Vec<ValidationErrorInfo>> {
        Ok(Vec::new())
    }

    /// Releases resources at request end.
    async fn dispose(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// One request's unit of work against the store.
#[async_trait]
pub trait DataSession: Send + Sync {
    /// # Errors
    ///
    /// Fails when the session cannot serve `db_set`.
    fn handler(&self, db_set: &Arc<DbSetInfo>) -> anyhow::Result<Arc<dyn DbSetHandler>>;

    /// Persists every staged change as one unit. May return extra subsets.
    async fn commit(&self) -> anyhow::Result<Vec<IncludedSubset>>;

    /// Ends the session, discarding anything not committed.
    async fn close(&self) -> anyhow::Result<()>;
}

#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(&self, principal: Arc<Principal>) -> anyhow::Result<Arc<dyn DataSession>>;
}

/// Model-level validation registered per collection.
#[async_trait]
pub trait ModelValidator: Send + Sync {
    /// `modified` lists the full names of the fields the client changed.
    async fn validate(
        &self,
        entity: &dyn Entity,
        modified: &[String],
    ) -> anyhow::Result<Vec<ValidationErrorInfo>>;
}

/// Implementation of a named invoke method.
#[async_trait]
pub trait InvokeHandler: Send + Sync {
    async fn invoke(
        &self,
        session: &dyn DataSession,
        params: serde_json::Value,
    ) -> anyhow::Result<serde_json::Value>;
}

// ---------------------------------------------------------------------------
// Hooks
// ---------------------------------------------------------------------------

/// Service-wide extension points of the change-set pipeline.
#[async_trait]
pub trait ServiceHooks: Send + Sync {
    /// Runs after the store committed.
    async fn after_execute_changes(&self, _session: &dyn DataSession) -> anyhow::Result<()> {
        Ok(())
    }

    /// Runs last in the commit stage. Returned subsets are added to the
    /// response.
    async fn after_commit_changes(
        &self,
        _session: &dyn DataSession,
    ) -> anyhow::Result<Vec<IncludedSubset>> {
        Ok(Vec::new())
    }

    /// Message reported to the client for `error`.
    fn friendly_message(&self, error: &ServiceError, expose_unexpected: bool) -> String {
        default_friendly_message(error, expose_unexpected)
    }
}

/// Hides the text of unexpected errors unless `expose_unexpected` is set.
#[must_use]
pub fn default_friendly_message(error: &ServiceError, expose_unexpected: bool) -> String {
    if error.is_unexpected() && !expose_unexpected {
        "An unexpected error occurred while processing the request".to_string()
    } else {
        error.to_string()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultHooks;

impl ServiceHooks for DefaultHooks {}

// ---------------------------------------------------------------------------
// Change tracking
// ---------------------------------------------------------------------------

/// One committed row passed to a [`ChangeTracker`].
#[derive(Debug)]
pub struct TrackedChange<'a> {
    pub principal: &'a Principal,
    pub db_set: &'a DbSetInfo,
    pub row: &'a RowInfo,
    /// Values the client changed or the store refreshed.
    pub diff: Vec<&'a ValueChange>,
}

#[async_trait]
pub trait ChangeTracker: Send + Sync {
    async fn track(&self, change: TrackedChange<'_>) -> anyhow::Result<()>;
}

/// Logs one debug event per committed row.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingChangeTracker;

#[async_trait]
impl ChangeTracker for TracingChangeTracker {
    async fn track(&self, change: TrackedChange<'_>) -> anyhow::Result<()> {
        let fields: Vec<&str> = change.diff.iter().map(|v| v.field_name.as_str()).collect();
        debug!(
            db_set = %change.db_set.db_set_name,
            key = change.row.server_key.as_deref().unwrap_or(&change.row.client_key),
            change_type = ?change.row.change_type,
            user = change.principal.display_name(),
            fields = ?fields,
            "row changed"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// HandlerCache
// ---------------------------------------------------------------------------

/// Request-scoped memo of handlers, one per collection.
#[derive(Clone, Default)]
pub struct HandlerCache {
    handlers: Arc<Mutex<HashMap<String, Arc<dyn DbSetHandler>>>>,
}

impl std::fmt::Debug for HandlerCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerCache")
            .field("handlers", &self.handlers.lock().len())
            .finish()
    }
}

impl HandlerCache {
    /// Handler for `db_set`, created through `session` on first use.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Unexpected`] when the session has no handler.
    pub fn get(
        &self,
        session: &dyn DataSession,
        db_set: &Arc<DbSetInfo>,
    ) -> Result<Arc<dyn DbSetHandler>, ServiceError> {
        let mut handlers = self.handlers.lock();
        if let Some(handler) = handlers.get(&db_set.db_set_name) {
            return Ok(Arc::clone(handler));
        }
        let handler = session.handler(db_set).map_err(ServiceError::Unexpected)?;
        handlers.insert(db_set.db_set_name.clone(), Arc::clone(&handler));
        Ok(handler)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Disposes and forgets every cached handler. Failures are logged.
    pub async fn dispose_all(&self) {
        let handlers: Vec<(String, Arc<dyn DbSetHandler>)> = self.handlers.lock().drain().collect();
        for (name, handler) in handlers {
            if let Err(e) = handler.dispose().await {
                warn!(db_set = %name, error = %e, "handler dispose failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use rowsync_core::entity::DynamicEntity;
    use rowsync_core::metadata::{DataType, Field, ServiceMetadata};

    use super::*;

    struct CountingHandler {
        disposed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl DbSetHandler for CountingHandler {
        fn create_entity(&self) -> Box<dyn Entity> {
            Box::new(DynamicEntity::new("Customer"))
        }
        async fn query(&self, _request: &QueryRequest) -> anyhow::Result<QueryResult> {
            Ok(QueryResult::new(Vec::new()))
        }
        async fn insert(&self, _entity: &mut dyn Entity) -> anyhow::Result<()> {
            Ok(())
        }
        async fn update(&self, _entity: &mut dyn Entity) -> anyhow::Result<()> {
            Ok(())
        }
        async fn delete(&self, _entity: &mut dyn Entity) -> anyhow::Result<()> {
            Ok(())
        }
        async fn refresh(&self, _entity: &mut dyn Entity) -> anyhow::Result<()> {
            Ok(())
        }
        async fn dispose(&self) -> anyhow::Result<()> {
            self.disposed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct CountingSession {
        created: AtomicUsize,
        disposed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl DataSession for CountingSession {
        fn handler(&self, _db_set: &Arc<DbSetInfo>) -> anyhow::Result<Arc<dyn DbSetHandler>> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(CountingHandler {
                disposed: Arc::clone(&self.disposed),
            }))
        }
        async fn commit(&self) -> anyhow::Result<Vec<IncludedSubset>> {
            Ok(Vec::new())
        }
        async fn close(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn handlers_are_memoized_and_disposed_once() {
        let meta = ServiceMetadata::builder()
            .db_set(
                DbSetInfo::new("Customer", "Customer")
                    .field(Field::new("Id", DataType::Integer).primary_key(1)),
            )
            .build()
            .unwrap();
        let set = Arc::clone(meta.db_set("Customer").unwrap());
        let session = CountingSession {
            created: AtomicUsize::new(0),
            disposed: Arc::new(AtomicUsize::new(0)),
        };
        let cache = HandlerCache::default();
        cache.get(&session, &set).unwrap();
        cache.get(&session, &set).unwrap();
        assert_eq!(session.created.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);

        cache.dispose_all().await;
        assert!(cache.is_empty());
        assert_eq!(session.disposed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn default_message_hides_unexpected_text() {
        let err = ServiceError::Unexpected(anyhow::anyhow!("connection string leaked"));
        assert!(!default_friendly_message(&err, false).contains("leaked"));
        assert!(default_friendly_message(&err, true).contains("leaked"));
        let protocol = ServiceError::protocol("unknown DbSet 'X'");
        assert_eq!(default_friendly_message(&protocol, false), "unknown DbSet 'X'");
    }
}
