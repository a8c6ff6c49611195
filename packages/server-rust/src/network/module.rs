//! Network module with deferred startup lifecycle.
//!
//! `new()` creates resources, `start()` binds the TCP listener, and
//! `serve()` starts accepting connections. Callers can read the bound port
//! between `start()` and `serve()`.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tracing::{info, warn};

use super::config::NetworkConfig;
use super::handlers::{
    changes_handler, health_handler, invoke_handler, liveness_handler, metadata_handler,
    query_handler, readiness_handler, refresh_handler, AppState,
};
use super::middleware::build_http_layers;
use super::shutdown::ShutdownController;
use crate::service::OperationService;

/// Manages the HTTP server lifecycle.
///
/// 1. `new()` allocates shared state (operations, shutdown controller)
/// 2. `start()` binds the TCP listener to the configured address
/// 3. `serve()` accepts connections until shutdown is signalled
pub struct NetworkModule {
    config: NetworkConfig,
    listener: Option<TcpListener>,
    operations: Arc<OperationService>,
    shutdown: Arc<ShutdownController>,
}

impl NetworkModule {
    #[must_use]
    pub fn new(config: NetworkConfig, operations: Arc<OperationService>) -> Self {
        Self {
            config,
            listener: None,
            operations,
            shutdown: Arc::new(ShutdownController::new()),
        }
    }

    /// Returns a shared reference to the shutdown controller.
    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    /// Assembles the axum router with all routes and middleware.
    ///
    /// Routes:
    /// - `GET /health`, `GET /health/live`, `GET /health/ready`
    /// - `GET /api/{service}/metadata`
    /// - `POST /api/{service}/query`
    /// - `POST /api/{service}/changes`
    /// - `POST /api/{service}/refresh`
    /// - `POST /api/{service}/invoke`
    pub fn build_router(&self) -> Router {
        let state = AppState {
            operations: Arc::clone(&self.operations),
            shutdown: Arc::clone(&self.shutdown),
            config: Arc::new(self.config.clone()),
            start_time: Instant::now(),
        };

        Router::new()
            .route("/health", get(health_handler))
            .route("/health/live", get(liveness_handler))
            .route("/health/ready", get(readiness_handler))
            .route("/api/{service}/metadata", get(metadata_handler))
            .route("/api/{service}/query", post(query_handler))
            .route("/api/{service}/changes", post(changes_handler))
            .route("/api/{service}/refresh", post(refresh_handler))
            .route("/api/{service}/invoke", post(invoke_handler))
            .layer(build_http_layers(&self.config))
            .with_state(state)
    }

    /// Binds the TCP listener to the configured host and port.
    ///
    /// Returns the bound port, which differs from the configured one when
    /// port 0 asks the OS for an ephemeral port.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound (e.g., port in use).
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let listener = TcpListener::bind(self.config.bind_addr()).await?;
        let port = listener.local_addr()?.port();
        info!(host = %self.config.host, port, "TCP listener bound");
        self.listener = Some(listener);
        Ok(port)
    }

    /// Serves connections until the shutdown future resolves, then drains
    /// in-flight requests for up to `drain_timeout`.
    ///
    /// # Errors
    ///
    /// Returns an error if `start()` was not called first or the server
    /// hits a fatal I/O error.
    pub async fn serve(
        mut self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let Some(listener) = self.listener.take() else {
            anyhow::bail!("start() must be called before serve()");
        };
        let router = self.build_router();
        self.shutdown.set_ready();
        info!(
            services = ?self.operations.service_names(),
            "serving data services"
        );

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        self.shutdown.trigger_shutdown();
        if self.shutdown.wait_for_drain(self.config.drain_timeout).await {
            info!("all in-flight requests drained");
        } else {
            warn!(
                remaining = self.shutdown.in_flight_count(),
                "drain timeout expired with in-flight requests remaining"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use rowsync_core::messages::{
        ChangeSetRequest, ChangeSetResponse, ChangeType, DbSetChanges, InvokeResponse, RowInfo,
        ValueChange,
    };
    use serde_json::json;

    use super::*;
    use crate::demo::{build_demo, DemoService, CUSTOMERS};
    use crate::service::{OperationRouter, ServerConfig, ServiceConfig, ServiceDefinition};

    fn module() -> NetworkModule {
        let operations = Arc::new(OperationService::new(
            OperationRouter::new(),
            Arc::new(ServerConfig::default()),
        ));
        NetworkModule::new(NetworkConfig::default(), operations)
    }

    #[test]
    fn new_creates_module_without_binding() {
        assert!(module().listener.is_none());
    }

    #[test]
    fn shutdown_controller_returns_shared_arc() {
        let module = module();
        assert!(Arc::ptr_eq(
            &module.shutdown_controller(),
            &module.shutdown_controller()
        ));
    }

    #[tokio::test]
    async fn start_binds_to_os_assigned_port() {
        let mut module = module();
        let port = module.start().await.expect("start should succeed");
        assert!(port > 0);
        assert!(module.listener.is_some());
    }

    #[tokio::test]
    async fn serve_without_start_is_an_error() {
        let err = module()
            .serve(std::future::pending::<()>())
            .await
            .expect_err("serve must fail without a listener");
        assert!(err.to_string().contains("start()"));
    }

    #[tokio::test]
    async fn data_routes_reject_requests_before_ready() {
        let router = module().build_router();
        let response = router
            .oneshot(
                Request::get("/api/Demo/metadata")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn unknown_service_is_not_found() {
        let module = module();
        module.shutdown_controller().set_ready();
        let response = module
            .build_router()
            .oneshot(
                Request::get("/api/Nope/metadata")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn malformed_body_is_bad_request() {
        let module = module();
        module.shutdown_controller().set_ready();
        let response = module
            .build_router()
            .oneshot(
                Request::post("/api/Nope/query")
                    .header("content-type", "application/json")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    fn demo_module() -> NetworkModule {
        let demo = build_demo(ServiceConfig::default()).unwrap();
        let mut router = OperationRouter::new();
        router.register(DemoService::service_name(), demo.service);
        let operations = Arc::new(OperationService::new(router, Arc::new(ServerConfig::default())));
        let module = NetworkModule::new(NetworkConfig::default(), operations);
        module.shutdown_controller().set_ready();
        module
    }

    async fn body_json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn invoke_over_http_returns_the_envelope() {
        let body = json!({ "methodName": "CountCustomers", "params": {} });
        let response = demo_module()
            .build_router()
            .oneshot(
                Request::post("/api/Demo/invoke")
                    .header("content-type", "application/json")
                    .header("x-user-id", "ann")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let envelope: InvokeResponse = body_json(response).await;
        assert!(envelope.error.is_none());
        assert_eq!(envelope.result.unwrap()["count"], json!(3));
    }

    #[tokio::test]
    async fn rejected_change_set_is_still_ok_with_error_envelope() {
        let request = ChangeSetRequest {
            db_sets: vec![DbSetChanges {
                db_set_name: CUSTOMERS.to_string(),
                rows: vec![RowInfo::new(ChangeType::Added, "c1")
                    .value(ValueChange::changed("Name", Some("")))],
            }],
            track_assocs: Vec::new(),
        };
        let response = demo_module()
            .build_router()
            .oneshot(
                Request::post("/api/Demo/changes")
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_vec(&request).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let envelope: ChangeSetResponse = body_json(response).await;
        let error = envelope.error.unwrap();
        assert_eq!(error.kind, "validation");
        assert_eq!(error.invalid_rows[0].client_key, "c1");
    }
}
