//! Admission, deadlines and outcome recording for data operations.
//!
//! Operations fall into three classes:
//!
//! | class      | operations            | shed | deadline |
//! |------------|-----------------------|------|----------|
//! | `describe` | metadata              | no   | no       |
//! | `read`     | query, refresh        | yes  | yes      |
//! | `write`    | change set, invoke    | yes  | yes      |
//!
//! Reads take a permit from the shared pool. Writes take a shared permit
//! and a write permit, so a burst of change sets leaves room for reads.
//! A write that runs past its deadline is dropped with its session
//! uncommitted.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tower::{Layer, Service};
use tracing::{info, info_span, warn, Instrument, Span};

use crate::service::config::ServerConfig;
use crate::service::operation::{Operation, OperationError, OperationResponse};

/// Cost class of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationClass {
    Describe,
    Read,
    Write,
}

impl OperationClass {
    #[must_use]
    pub fn of(op: &Operation) -> Self {
        match op {
            Operation::GetMetadata { .. } => OperationClass::Describe,
            Operation::Query { .. } | Operation::Refresh { .. } => OperationClass::Read,
            Operation::ApplyChangeSet { .. } | Operation::Invoke { .. } => OperationClass::Write,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            OperationClass::Describe => "describe",
            OperationClass::Read => "read",
            OperationClass::Write => "write",
        }
    }
}

#[derive(Debug)]
struct Permits {
    all: Arc<Semaphore>,
    writes: Arc<Semaphore>,
}

/// Permits held for the lifetime of one operation.
struct Admitted {
    _all: Option<OwnedSemaphorePermit>,
    _write: Option<OwnedSemaphorePermit>,
}

impl Permits {
    /// `None` when the operation must be shed.
    fn admit(&self, class: OperationClass) -> Option<Admitted> {
        match class {
            OperationClass::Describe => Some(Admitted {
                _all: None,
                _write: None,
            }),
            OperationClass::Read => Some(Admitted {
                _all: Some(Arc::clone(&self.all).try_acquire_owned().ok()?),
                _write: None,
            }),
            OperationClass::Write => {
                let write = Arc::clone(&self.writes).try_acquire_owned().ok()?;
                Some(Admitted {
                    _all: Some(Arc::clone(&self.all).try_acquire_owned().ok()?),
                    _write: Some(write),
                })
            }
        }
    }
}

/// Layer applying [`OperationGuard`]. Clones share the permit pools.
#[derive(Debug, Clone)]
pub struct OperationGuardLayer {
    permits: Arc<Permits>,
}

impl OperationGuardLayer {
    #[must_use]
    pub fn new(max_concurrent: u32, max_concurrent_writes: u32) -> Self {
        Self {
            permits: Arc::new(Permits {
                all: Arc::new(Semaphore::new(max_concurrent as usize)),
                writes: Arc::new(Semaphore::new(max_concurrent_writes as usize)),
            }),
        }
    }

    #[must_use]
    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(config.max_concurrent_operations, config.max_concurrent_writes)
    }
}

impl<S> Layer<S> for OperationGuardLayer {
    type Service = OperationGuard<S>;

    fn layer(&self, inner: S) -> Self::Service {
        OperationGuard {
            inner,
            permits: Arc::clone(&self.permits),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OperationGuard<S> {
    inner: S,
    permits: Arc<Permits>,
}

impl<S> Service<Operation> for OperationGuard<S>
where
    S: Service<Operation, Response = OperationResponse, Error = OperationError> + Send,
    S::Future: Send + 'static,
{
    type Response = OperationResponse;
    type Error = OperationError;
    type Future = Pin<Box<dyn Future<Output = Result<OperationResponse, OperationError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, op: Operation) -> Self::Future {
        let class = OperationClass::of(&op);
        let ctx = op.ctx();
        let span = info_span!(
            "operation",
            service = %ctx.service_name,
            call_id = ctx.call_id,
            kind = op.kind(),
            class = class.as_str(),
            rows = op.row_count(),
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
            error_kind = tracing::field::Empty,
        );

        let Some(admitted) = self.permits.admit(class) else {
            span.record("outcome", "shed");
            span.in_scope(|| warn!("operation shed"));
            return Box::pin(async { Err(OperationError::Overloaded) });
        };
        let timeout_ms = match class {
            OperationClass::Describe => 0,
            OperationClass::Read | OperationClass::Write => ctx.call_timeout_ms,
        };
        let fut = self.inner.call(op);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = if timeout_ms == 0 {
                    fut.await
                } else {
                    tokio::time::timeout(Duration::from_millis(timeout_ms), fut)
                        .await
                        .unwrap_or_else(|_| Err(OperationError::Timeout { timeout_ms }))
                };
                drop(admitted);

                let duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
                let outcome = outcome(&result);
                let span = Span::current();
                span.record("duration_ms", duration_ms);
                span.record("outcome", outcome);
                if let Ok(Some(error)) = result.as_ref().map(OperationResponse::error) {
                    span.record("error_kind", error.kind.as_str());
                }
                info!(duration_ms, outcome, "operation complete");
                result
            }
            .instrument(span),
        )
    }
}

fn outcome(result: &Result<OperationResponse, OperationError>) -> &'static str {
    match result {
        Ok(resp) if resp.error().is_some() => "rejected",
        Ok(_) => "ok",
        Err(OperationError::Timeout { .. }) => "timeout",
        Err(OperationError::Overloaded) => "shed",
        Err(OperationError::UnknownService { .. }) => "unknown_service",
        Err(OperationError::Internal(_)) => "error",
    }
}
