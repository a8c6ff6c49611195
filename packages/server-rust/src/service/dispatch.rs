//! Front door of the operation pipeline: stamps operations with a context
//! and drives them through the tower stack.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rowsync_core::messages::{ChangeSetRequest, InvokeRequest, QueryRequest, RefreshRequest};
use rowsync_core::types::Principal;
use tower::ServiceExt;

use super::config::ServerConfig;
use super::middleware::{build_operation_pipeline, OperationPipeline};
use super::operation::{Operation, OperationContext, OperationError, OperationResponse};
use super::router::OperationRouter;

// ---------------------------------------------------------------------------
// OperationService
// ---------------------------------------------------------------------------

/// Builds typed `Operation` values for incoming calls and dispatches them.
///
/// Each operation receives a unique call id and the configured default
/// timeout.
pub struct OperationService {
    pipeline: OperationPipeline,
    services: Vec<String>,
    config: Arc<ServerConfig>,
    call_id_counter: AtomicU64,
}

impl std::fmt::Debug for OperationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationService")
            .field("services", &self.services)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl OperationService {
    #[must_use]
    pub fn new(router: OperationRouter, config: Arc<ServerConfig>) -> Self {
        let services = router.service_names().into_iter().map(str::to_owned).collect();
        Self {
            pipeline: build_operation_pipeline(router, &config),
            services,
            config,
            call_id_counter: AtomicU64::new(1),
        }
    }

    fn next_call_id(&self) -> u64 {
        self.call_id_counter.fetch_add(1, Ordering::Relaxed)
    }

    /// Build an `OperationContext` for the given service and caller.
    #[must_use]
    pub fn make_ctx(&self, service_name: &str, principal: Arc<Principal>) -> OperationContext {
        OperationContext::new(
            self.next_call_id(),
            service_name,
            principal,
            self.config.default_operation_timeout_ms,
        )
    }

    /// Registered service names, sorted.
    #[must_use]
    pub fn service_names(&self) -> &[String] {
        &self.services
    }

    #[must_use]
    pub fn has_service(&self, name: &str) -> bool {
        self.services.iter().any(|s| s == name)
    }

    /// Run one operation through the pipeline.
    ///
    /// # Errors
    ///
    /// Returns the pipeline's `OperationError`: unknown service, timeout,
    /// overload or an internal failure.
    pub async fn dispatch(&self, op: Operation) -> Result<OperationResponse, OperationError> {
        self.pipeline.clone().oneshot(op).await
    }

    // -- Typed entry points ------------------------------------------------

    /// # Errors
    ///
    /// See [`dispatch`](Self::dispatch).
    pub async fn get_metadata(
        &self,
        service: &str,
        principal: Arc<Principal>,
    ) -> Result<OperationResponse, OperationError> {
        let ctx = self.make_ctx(service, principal);
        self.dispatch(Operation::GetMetadata { ctx }).await
    }

    /// # Errors
    ///
    /// See [`dispatch`](Self::dispatch).
    pub async fn query(
        &self,
        service: &str,
        principal: Arc<Principal>,
        request: QueryRequest,
    ) -> Result<OperationResponse, OperationError> {
        let ctx = self.make_ctx(service, principal);
        self.dispatch(Operation::Query { ctx, request }).await
    }

    /// # Errors
    ///
    /// See [`dispatch`](Self::dispatch).
    pub async fn apply_change_set(
        &self,
        service: &str,
        principal: Arc<Principal>,
        request: ChangeSetRequest,
    ) -> Result<OperationResponse, OperationError> {
        let ctx = self.make_ctx(service, principal);
        self.dispatch(Operation::ApplyChangeSet { ctx, request }).await
    }

    /// # Errors
    ///
    /// See [`dispatch`](Self::dispatch).
    pub async fn refresh(
        &self,
        service: &str,
        principal: Arc<Principal>,
        request: RefreshRequest,
    ) -> Result<OperationResponse, OperationError> {
        let ctx = self.make_ctx(service, principal);
        self.dispatch(Operation::Refresh { ctx, request }).await
    }

    /// # Errors
    ///
    /// See [`dispatch`](Self::dispatch).
    pub async fn invoke(
        &self,
        service: &str,
        principal: Arc<Principal>,
        request: InvokeRequest,
    ) -> Result<OperationResponse, OperationError> {
        let ctx = self.make_ctx(service, principal);
        self.dispatch(Operation::Invoke { ctx, request }).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use rowsync_core::messages::InvokeResponse;
    use tower::Service;

    use super::*;

    /// Echoes the call id and timeout it was given.
    #[derive(Clone)]
    struct EchoService;

    impl Service<Operation> for EchoService {
        type Response = OperationResponse;
        type Error = OperationError;
        type Future =
            Pin<Box<dyn Future<Output = Result<OperationResponse, OperationError>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, op: Operation) -> Self::Future {
            let ctx = op.ctx().clone();
            Box::pin(async move {
                Ok(OperationResponse::Invoke(Box::new(InvokeResponse {
                    result: Some(serde_json::json!({
                        "callId": ctx.call_id,
                        "timeoutMs": ctx.call_timeout_ms,
                        "user": ctx.principal.id,
                    })),
                    error: None,
                })))
            })
        }
    }

    fn service() -> OperationService {
        let mut router = OperationRouter::new();
        router.register("echo", EchoService);
        let config = ServerConfig {
            default_operation_timeout_ms: 1234,
            ..ServerConfig::default()
        };
        OperationService::new(router, Arc::new(config))
    }

    fn echoed(resp: OperationResponse) -> serde_json::Value {
        match resp {
            OperationResponse::Invoke(r) => r.result.unwrap_or_default(),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn call_ids_are_unique_and_increasing() {
        let svc = service();
        let a = svc.make_ctx("echo", Arc::new(Principal::anonymous()));
        let b = svc.make_ctx("echo", Arc::new(Principal::anonymous()));
        assert!(b.call_id > a.call_id);
        assert_eq!(a.call_timeout_ms, 1234);
    }

    #[tokio::test]
    async fn dispatches_with_stamped_context() {
        let svc = service();
        let principal = Arc::new(Principal::user("ann", &[]));
        let resp = svc
            .invoke("echo", principal, InvokeRequest::default())
            .await
            .unwrap();
        let value = echoed(resp);
        assert_eq!(value["timeoutMs"], 1234);
        assert_eq!(value["user"], "ann");
    }

    #[tokio::test]
    async fn unknown_service_is_reported() {
        let svc = service();
        assert!(svc.has_service("echo"));
        assert!(!svc.has_service("other"));
        let err = svc
            .get_metadata("other", Arc::new(Principal::anonymous()))
            .await
            .unwrap_err();
        assert!(matches!(err, OperationError::UnknownService { .. }));
    }
}
