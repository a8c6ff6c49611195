//! Health, liveness and readiness probes.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::json;

use super::AppState;

/// Detailed status. Always 200: the `state` field tells a draining server
/// apart from a dead one.
pub async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "state": state.shutdown.health_state().as_str(),
        "services": state.operations.service_names(),
        "in_flight": state.shutdown.in_flight_count(),
        "uptime_secs": state.start_time.elapsed().as_secs(),
    }))
}

/// 200 while the process answers at all.
pub async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

/// 200 only while data requests are accepted.
pub async fn readiness_handler(State(state): State<AppState>) -> StatusCode {
    if state.shutdown.health_state().accepts_requests() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Instant;

    use super::*;
    use crate::demo::{build_demo, DemoService};
    use crate::network::{NetworkConfig, ShutdownController};
    use crate::service::{
        OperationRouter, OperationService, ServerConfig, ServiceConfig, ServiceDefinition,
    };

    fn state_with(router: OperationRouter) -> AppState {
        AppState {
            operations: Arc::new(OperationService::new(router, Arc::new(ServerConfig::default()))),
            shutdown: Arc::new(ShutdownController::new()),
            config: Arc::new(NetworkConfig::default()),
            start_time: Instant::now(),
        }
    }

    fn empty_state() -> AppState {
        state_with(OperationRouter::new())
    }

    #[tokio::test]
    async fn health_lists_registered_services() {
        let mut router = OperationRouter::new();
        router.register(
            DemoService::service_name(),
            build_demo(ServiceConfig::default()).unwrap().service,
        );
        let state = state_with(router);
        state.shutdown.set_ready();

        let Json(body) = health_handler(State(state)).await;
        assert_eq!(body["state"], "ready");
        assert_eq!(body["services"], json!(["Demo"]));
        assert_eq!(body["in_flight"], 0);
        assert!(body["uptime_secs"].is_number());
    }

    #[tokio::test]
    async fn health_reports_state_and_in_flight() {
        let state = empty_state();
        let Json(body) = health_handler(State(state.clone())).await;
        assert_eq!(body["state"], "starting");

        let _guard = state.shutdown.in_flight_guard();
        state.shutdown.trigger_shutdown();
        let Json(body) = health_handler(State(state)).await;
        assert_eq!(body["state"], "draining");
        assert_eq!(body["in_flight"], 1);
    }

    #[tokio::test]
    async fn liveness_is_always_ok() {
        assert_eq!(liveness_handler().await, StatusCode::OK);
    }

    #[tokio::test]
    async fn readiness_follows_the_lifecycle() {
        let state = empty_state();
        assert_eq!(
            readiness_handler(State(state.clone())).await,
            StatusCode::SERVICE_UNAVAILABLE
        );
        state.shutdown.set_ready();
        assert_eq!(readiness_handler(State(state.clone())).await, StatusCode::OK);
        state.shutdown.trigger_shutdown();
        assert_eq!(
            readiness_handler(State(state)).await,
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
