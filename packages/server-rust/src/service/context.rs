//! Ambient request context.
//!
//! Every nested operation (the whole batch, one row, one query, a refresh or
//! an invoke) pushes a [`RequestContext`] frame onto a task-local scope stack
//! and pops it when the operation finishes. Handler code reads the innermost
//! frame through [`current`] instead of receiving it as a parameter.
//!
//! The stack lives in a `tokio::task_local!`, so it follows the task across
//! suspension points and never leaks into other tasks.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rowsync_core::entity::Entity;
use rowsync_core::messages::{ChangeSetRequest, ChangeType, QueryRequest, RowInfo};
use rowsync_core::metadata::DbSetInfo;
use rowsync_core::types::Principal;
use tracing::error;

tokio::task_local! {
    static SCOPES: Arc<ScopeStack>;
}

/// What kind of operation a frame describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    ChangeSet,
    Row,
    Query,
    Refresh,
    Invoke,
}

/// Parent entity resolved for the current row through an association.
#[derive(Debug, Clone)]
pub struct ParentEntity {
    pub association: String,
    pub entity: Arc<dyn Entity>,
}

/// One ambient frame.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub kind: OperationKind,
    pub principal: Arc<Principal>,
    pub db_set: Option<Arc<DbSetInfo>>,
    pub row: Option<RowInfo>,
    pub original: Option<Arc<dyn Entity>>,
    pub parents: Vec<ParentEntity>,
    pub query: Option<Arc<QueryRequest>>,
    pub change_set: Option<Arc<ChangeSetRequest>>,
}

impl RequestContext {
    #[must_use]
    pub fn new(kind: OperationKind, principal: Arc<Principal>) -> Self {
        Self {
            kind,
            principal,
            db_set: None,
            row: None,
            original: None,
            parents: Vec::new(),
            query: None,
            change_set: None,
        }
    }

    #[must_use]
    pub fn with_db_set(mut self, db_set: Arc<DbSetInfo>) -> Self {
        self.db_set = Some(db_set);
        self
    }

    #[must_use]
    pub fn with_row(mut self, row: RowInfo) -> Self {
        self.row = Some(row);
        self
    }

    #[must_use]
    pub fn with_original(mut self, original: Arc<dyn Entity>) -> Self {
        self.original = Some(original);
        self
    }

    #[must_use]
    pub fn with_parent(mut self, association: impl Into<String>, entity: Arc<dyn Entity>) -> Self {
        self.parents.push(ParentEntity {
            association: association.into(),
            entity,
        });
        self
    }

    #[must_use]
    pub fn with_query(mut self, query: Arc<QueryRequest>) -> Self {
        self.query = Some(query);
        self
    }

    #[must_use]
    pub fn with_change_set(mut self, change_set: Arc<ChangeSetRequest>) -> Self {
        self.change_set = Some(change_set);
        self
    }

    /// Change type of the current row, `None` outside of row frames.
    #[must_use]
    pub fn change_type(&self) -> ChangeType {
        self.row.as_ref().map_or(ChangeType::None, |r| r.change_type)
    }

    /// Parent entity linked through `association`.
    #[must_use]
    pub fn parent(&self, association: &str) -> Option<&Arc<dyn Entity>> {
        self.parents
            .iter()
            .find(|p| p.association == association)
            .map(|p| &p.entity)
    }
}

/// Misuse of the scope stack.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScopeError {
    #[error("no ambient scope is active on this task")]
    NoScope,
    #[error("scope {closed} closed while inner scope {innermost} is still active")]
    OutOfOrder { closed: u64, innermost: u64 },
    #[error("scope {0} was already closed")]
    AlreadyClosed(u64),
}

// ---------------------------------------------------------------------------
// ScopeStack
// ---------------------------------------------------------------------------

static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(1);

/// Frames of one logical unit of work, innermost last.
#[derive(Debug, Default)]
pub struct ScopeStack {
    frames: Mutex<Vec<(u64, Arc<RequestContext>)>>,
}

impl ScopeStack {
    /// Pushes a frame and returns the guard that pops it.
    pub fn enter(self: &Arc<Self>, frame: RequestContext) -> ScopeGuard {
        let id = NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed);
        self.frames.lock().push((id, Arc::new(frame)));
        ScopeGuard {
            stack: Arc::clone(self),
            id,
            closed: false,
        }
    }

    #[must_use]
    pub fn top(&self) -> Option<Arc<RequestContext>> {
        self.frames.lock().last().map(|(_, f)| Arc::clone(f))
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.frames.lock().len()
    }

    fn close(&self, id: u64) -> Result<(), ScopeError> {
        let mut frames = self.frames.lock();
        let Some(pos) = frames.iter().position(|(fid, _)| *fid == id) else {
            return Err(ScopeError::AlreadyClosed(id));
        };
        let innermost = frames.last().map_or(id, |(fid, _)| *fid);
        // An outer frame is removed even when closed out of order so it can
        // never become current again.
        frames.remove(pos);
        if innermost == id {
            Ok(())
        } else {
            Err(ScopeError::OutOfOrder {
                closed: id,
                innermost,
            })
        }
    }
}

/// Pops its frame on [`close`](Self::close) or on drop.
#[derive(Debug)]
pub struct ScopeGuard {
    stack: Arc<ScopeStack>,
    id: u64,
    closed: bool,
}

impl ScopeGuard {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Pops the frame.
    ///
    /// # Errors
    ///
    /// Returns [`ScopeError::OutOfOrder`] when inner frames are still active.
    /// The frame is removed regardless.
    pub fn close(mut self) -> Result<(), ScopeError> {
        self.closed = true;
        self.stack.close(self.id)
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(e) = self.stack.close(self.id) {
            error!(error = %e, "ambient scope disposed out of order");
        }
    }
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Runs `fut` with `frame` as the innermost ambient context. Creates the
/// task's scope stack when none exists yet. The frame is popped on every exit
/// path, including cancellation of `fut`.
pub async fn scoped<F>(frame: RequestContext, fut: F) -> F::Output
where
    F: Future,
{
    match SCOPES.try_with(Arc::clone) {
        Ok(stack) => run_frame(stack, frame, fut).await,
        Err(_) => {
            let stack = Arc::new(ScopeStack::default());
            SCOPES
                .scope(Arc::clone(&stack), run_frame(stack, frame, fut))
                .await
        }
    }
}

async fn run_frame<F: Future>(stack: Arc<ScopeStack>, frame: RequestContext, fut: F) -> F::Output {
    let guard = stack.enter(frame);
    let output = fut.await;
    if let Err(e) = guard.close() {
        error!(error = %e, "ambient scope closed out of order");
    }
    output
}

/// The task's scope stack, for manual frame management.
///
/// # Errors
///
/// Returns [`ScopeError::NoScope`] outside of [`scoped`].
pub fn stack() -> Result<Arc<ScopeStack>, ScopeError> {
    SCOPES.try_with(Arc::clone).map_err(|_| ScopeError::NoScope)
}

/// Innermost live frame of the current task.
#[must_use]
pub fn current() -> Option<Arc<RequestContext>> {
    SCOPES.try_with(|s| s.top()).ok().flatten()
}

/// Original (pre-change) entity of the current row.
#[must_use]
pub fn current_original() -> Option<Arc<dyn Entity>> {
    current().and_then(|c| c.original.clone())
}

/// Parent entity of the current row through `association`.
#[must_use]
pub fn current_parent(association: &str) -> Option<Arc<dyn Entity>> {
    current().and_then(|c| c.parent(association).cloned())
}

/// The query being executed, searching outward through enclosing frames.
#[must_use]
pub fn current_query() -> Option<Arc<QueryRequest>> {
    SCOPES
        .try_with(|s| {
            s.frames
                .lock()
                .iter()
                .rev()
                .find_map(|(_, f)| f.query.clone())
        })
        .ok()
        .flatten()
}

/// The batch being executed, searching outward through enclosing frames.
#[must_use]
pub fn current_change_set() -> Option<Arc<ChangeSetRequest>> {
    SCOPES
        .try_with(|s| {
            s.frames
                .lock()
                .iter()
                .rev()
                .find_map(|(_, f)| f.change_set.clone())
        })
        .ok()
        .flatten()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rowsync_core::entity::DynamicEntity;

    use super::*;

    fn frame(kind: OperationKind) -> RequestContext {
        RequestContext::new(kind, Arc::new(Principal::anonymous()))
    }

    #[tokio::test]
    async fn no_context_outside_scope() {
        assert!(current().is_none());
        assert_eq!(stack().unwrap_err(), ScopeError::NoScope);
    }

    #[tokio::test]
    async fn nested_scopes_survive_suspension() {
        let query = Arc::new(QueryRequest {
            db_set_name: "Customer".into(),
            ..QueryRequest::default()
        });
        scoped(frame(OperationKind::Query).with_query(Arc::clone(&query)), async {
            assert_eq!(current().unwrap().kind, OperationKind::Query);
            scoped(frame(OperationKind::Row), async {
                tokio::time::sleep(Duration::from_millis(1)).await;
                assert_eq!(current().unwrap().kind, OperationKind::Row);
                assert_eq!(current_query().unwrap().db_set_name, "Customer");
            })
            .await;
            tokio::task::yield_now().await;
            assert_eq!(current().unwrap().kind, OperationKind::Query);
        })
        .await;
        assert!(current().is_none());
    }

    #[tokio::test]
    async fn scopes_do_not_leak_between_tasks() {
        let outer = scoped(frame(OperationKind::ChangeSet), async {
            tokio::spawn(async { current().is_none() }).await.unwrap()
        })
        .await;
        assert!(outer);
    }

    #[tokio::test]
    async fn out_of_order_close_removes_outer_frame() {
        scoped(frame(OperationKind::ChangeSet), async {
            let stack = stack().unwrap();
            let outer = stack.enter(frame(OperationKind::Query));
            let inner = stack.enter(frame(OperationKind::Row));
            let outer_id = outer.id();
            let err = outer.close().unwrap_err();
            assert_eq!(
                err,
                ScopeError::OutOfOrder {
                    closed: outer_id,
                    innermost: inner.id()
                }
            );
            assert_eq!(current().unwrap().kind, OperationKind::Row);
            inner.close().unwrap();
            // The superseded outer frame never comes back.
            assert_eq!(current().unwrap().kind, OperationKind::ChangeSet);
        })
        .await;
    }

    #[tokio::test]
    async fn frame_is_popped_when_future_errors() {
        scoped(frame(OperationKind::ChangeSet), async {
            let result: Result<(), &str> = scoped(frame(OperationKind::Row), async { Err("boom") }).await;
            assert!(result.is_err());
            assert_eq!(stack().unwrap().depth(), 1);
        })
        .await;
    }

    #[tokio::test]
    async fn original_and_parent_lookup() {
        let original: Arc<dyn Entity> = Arc::new(DynamicEntity::new("Customer").with("Name", "Old"));
        let parent: Arc<dyn Entity> = Arc::new(DynamicEntity::new("Customer").with("Id", 1_i64));
        let ctx = frame(OperationKind::Row)
            .with_original(original)
            .with_parent("CustomerAddresses", parent);
        scoped(ctx, async {
            assert!(current_original().is_some());
            assert!(current_parent("CustomerAddresses").is_some());
            assert!(current_parent("Other").is_none());
            assert_eq!(current().unwrap().change_type(), ChangeType::None);
        })
        .await;
    }
}
