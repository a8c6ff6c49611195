//! Operation routing: dispatches `Operation` to data services by `service_name`.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tower::util::BoxCloneSyncService;
use tower::{Service, ServiceExt};

use super::operation::{Operation, OperationError, OperationResponse};

/// A type-erased, cloneable service handling the operations of one data service.
type BoxedService = BoxCloneSyncService<Operation, OperationResponse, OperationError>;

// ---------------------------------------------------------------------------
// OperationRouter
// ---------------------------------------------------------------------------

/// Routes `Operation` values to the data service registered under
/// `ctx.service_name`.
///
/// Operations naming an unregistered service return
/// `OperationError::UnknownService`. Cloning is cheap; clones share nothing
/// mutable, every registered service is cloned per call.
#[derive(Clone, Default)]
pub struct OperationRouter {
    services: Arc<HashMap<String, BoxedService>>,
}

impl std::fmt::Debug for OperationRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationRouter")
            .field("services", &self.service_names())
            .finish()
    }
}

impl OperationRouter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service for the given name, replacing any previous one.
    ///
    /// Registration happens at startup, before the router is shared.
    pub fn register<S>(&mut self, name: impl Into<String>, service: S)
    where
        S: Service<Operation, Response = OperationResponse, Error = OperationError>
            + Clone
            + Send
            + Sync
            + 'static,
        S::Future: Send + 'static,
    {
        Arc::make_mut(&mut self.services).insert(name.into(), BoxCloneSyncService::new(service));
    }

    /// Registered service names, sorted.
    #[must_use]
    pub fn service_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.services.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }
}

impl Service<Operation> for OperationRouter {
    type Response = OperationResponse;
    type Error = OperationError;
    type Future = Pin<Box<dyn Future<Output = Result<OperationResponse, OperationError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // Readiness is checked per call on the target service's clone.
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, op: Operation) -> Self::Future {
        match self.services.get(&op.ctx().service_name) {
            Some(svc) => Box::pin(svc.clone().oneshot(op)),
            None => {
                let name = op.ctx().service_name.clone();
                Box::pin(async move { Err(OperationError::UnknownService { name }) })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use rowsync_core::messages::InvokeResponse;
    use rowsync_core::types::Principal;

    use super::*;
    use crate::service::operation::OperationContext;

    /// A stub service that answers with its own name.
    #[derive(Clone)]
    struct StubService {
        name: &'static str,
    }

    impl Service<Operation> for StubService {
        type Response = OperationResponse;
        type Error = OperationError;
        type Future = Pin<Box<dyn Future<Output = Result<OperationResponse, OperationError>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, _op: Operation) -> Self::Future {
            let name = self.name;
            Box::pin(async move {
                Ok(OperationResponse::Invoke(Box::new(InvokeResponse {
                    result: Some(serde_json::json!(name)),
                    error: None,
                })))
            })
        }
    }

    fn make_op(service_name: &str) -> Operation {
        let ctx = OperationContext::new(1, service_name, Arc::new(Principal::anonymous()), 5000);
        Operation::GetMetadata { ctx }
    }

    fn answered_by(resp: &OperationResponse) -> Option<&str> {
        match resp {
            OperationResponse::Invoke(r) => r.result.as_ref().and_then(|v| v.as_str()),
            _ => None,
        }
    }

    #[tokio::test]
    async fn routes_to_registered_service() {
        let mut router = OperationRouter::new();
        router.register("customers", StubService { name: "customers" });

        let resp = router.oneshot(make_op("customers")).await.unwrap();
        assert_eq!(answered_by(&resp), Some("customers"));
    }

    #[tokio::test]
    async fn unknown_service_returns_error() {
        let mut router = OperationRouter::new();
        router.register("customers", StubService { name: "customers" });

        let err = router.oneshot(make_op("nonexistent")).await.unwrap_err();
        assert!(matches!(
            err,
            OperationError::UnknownService { name } if name == "nonexistent"
        ));
    }

    #[tokio::test]
    async fn routes_to_correct_service_among_multiple() {
        let mut router = OperationRouter::new();
        router.register("customers", StubService { name: "customers" });
        router.register("orders", StubService { name: "orders" });
        router.register("products", StubService { name: "products" });
        assert_eq!(router.service_names(), vec!["customers", "orders", "products"]);

        let resp = router.clone().oneshot(make_op("orders")).await.unwrap();
        assert_eq!(answered_by(&resp), Some("orders"));

        let resp = router.oneshot(make_op("products")).await.unwrap();
        assert_eq!(answered_by(&resp), Some("products"));
    }
}
