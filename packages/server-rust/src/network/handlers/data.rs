//! Data service endpoints: metadata, query, change sets, refresh and
//! invoke, all under `/api/{service}`.
//!
//! Domain failures travel inside the response envelope with status 200.
//! Pipeline failures map to HTTP status codes with an `ErrorInfo` body.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequestParts, Path, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use rowsync_core::messages::{
    ChangeSetRequest, ErrorInfo, InvokeRequest, QueryRequest, RefreshRequest,
};
use rowsync_core::types::Principal;
use tracing::warn;

use super::AppState;
use crate::service::{Operation, OperationContext, OperationError, OperationResponse};

/// Header carrying the caller's user id. Absent or empty means anonymous.
pub const USER_ID_HEADER: &str = "x-user-id";
/// Header carrying the caller's comma-separated roles.
pub const USER_ROLES_HEADER: &str = "x-user-roles";

// ---------------------------------------------------------------------------
// Principal extraction
// ---------------------------------------------------------------------------

/// Caller identity read from the user headers.
#[derive(Debug, Clone)]
pub struct CallerPrincipal(pub Arc<Principal>);

impl CallerPrincipal {
    #[must_use]
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };
        let principal = match header(USER_ID_HEADER) {
            Some(id) => Principal {
                id: id.to_string(),
                roles: header(USER_ROLES_HEADER)
                    .map(|roles| {
                        roles
                            .split(',')
                            .map(str::trim)
                            .filter(|r| !r.is_empty())
                            .map(str::to_owned)
                            .collect()
                    })
                    .unwrap_or_default(),
                authenticated: true,
            },
            None => Principal::anonymous(),
        };
        Self(Arc::new(principal))
    }
}

impl<S: Send + Sync> FromRequestParts<S> for CallerPrincipal {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self::from_headers(&parts.headers))
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

pub async fn metadata_handler(
    State(state): State<AppState>,
    Path(service): Path<String>,
    CallerPrincipal(principal): CallerPrincipal,
) -> Response {
    dispatch(&state, &service, principal, |ctx| Operation::GetMetadata { ctx }).await
}

pub async fn query_handler(
    State(state): State<AppState>,
    Path(service): Path<String>,
    CallerPrincipal(principal): CallerPrincipal,
    body: Result<Json<QueryRequest>, JsonRejection>,
) -> Response {
    match body {
        Ok(Json(request)) => {
            dispatch(&state, &service, principal, |ctx| Operation::Query { ctx, request }).await
        }
        Err(rejection) => bad_body(&rejection),
    }
}

pub async fn changes_handler(
    State(state): State<AppState>,
    Path(service): Path<String>,
    CallerPrincipal(principal): CallerPrincipal,
    body: Result<Json<ChangeSetRequest>, JsonRejection>,
) -> Response {
    match body {
        Ok(Json(request)) => {
            dispatch(&state, &service, principal, |ctx| Operation::ApplyChangeSet {
                ctx,
                request,
            })
            .await
        }
        Err(rejection) => bad_body(&rejection),
    }
}

pub async fn refresh_handler(
    State(state): State<AppState>,
    Path(service): Path<String>,
    CallerPrincipal(principal): CallerPrincipal,
    body: Result<Json<RefreshRequest>, JsonRejection>,
) -> Response {
    match body {
        Ok(Json(request)) => {
            dispatch(&state, &service, principal, |ctx| Operation::Refresh { ctx, request }).await
        }
        Err(rejection) => bad_body(&rejection),
    }
}

pub async fn invoke_handler(
    State(state): State<AppState>,
    Path(service): Path<String>,
    CallerPrincipal(principal): CallerPrincipal,
    body: Result<Json<InvokeRequest>, JsonRejection>,
) -> Response {
    match body {
        Ok(Json(request)) => {
            dispatch(&state, &service, principal, |ctx| Operation::Invoke { ctx, request }).await
        }
        Err(rejection) => bad_body(&rejection),
    }
}

// ---------------------------------------------------------------------------
// Dispatch and response mapping
// ---------------------------------------------------------------------------

async fn dispatch(
    state: &AppState,
    service: &str,
    principal: Arc<Principal>,
    make: impl FnOnce(OperationContext) -> Operation,
) -> Response {
    if !state.shutdown.health_state().accepts_requests() {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "unavailable",
            "server is not accepting requests",
        );
    }
    let _in_flight = state.shutdown.in_flight_guard();
    let ctx = state.operations.make_ctx(service, principal);
    match state.operations.dispatch(make(ctx)).await {
        Ok(response) => envelope(response),
        Err(e) => operation_error(&e),
    }
}

fn envelope(response: OperationResponse) -> Response {
    match response {
        OperationResponse::Metadata(r) => Json(*r).into_response(),
        OperationResponse::Query(r) => Json(*r).into_response(),
        OperationResponse::ChangeSet(r) => Json(*r).into_response(),
        OperationResponse::Refresh(r) => Json(*r).into_response(),
        OperationResponse::Invoke(r) => Json(*r).into_response(),
    }
}

fn operation_error(error: &OperationError) -> Response {
    match error {
        OperationError::UnknownService { .. } => {
            error_response(StatusCode::NOT_FOUND, "unknown_service", &error.to_string())
        }
        OperationError::Timeout { .. } => {
            error_response(StatusCode::GATEWAY_TIMEOUT, "timeout", &error.to_string())
        }
        OperationError::Overloaded => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, "overloaded", &error.to_string())
        }
        OperationError::Internal(e) => {
            warn!(error = %e, "operation failed inside the pipeline");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "unexpected",
                "An unexpected error occurred while processing the request",
            )
        }
    }
}

fn bad_body(rejection: &JsonRejection) -> Response {
    error_response(rejection.status(), "protocol", &rejection.body_text())
}

fn error_response(status: StatusCode, kind: &str, message: &str) -> Response {
    let body = ErrorInfo {
        message: message.to_string(),
        kind: kind.to_string(),
        invalid_rows: Vec::new(),
    };
    (status, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, value.parse().unwrap());
        }
        map
    }

    #[test]
    fn missing_user_header_is_anonymous() {
        let CallerPrincipal(p) = CallerPrincipal::from_headers(&HeaderMap::new());
        assert!(!p.authenticated);

        let CallerPrincipal(p) = CallerPrincipal::from_headers(&headers(&[(USER_ID_HEADER, "  ")]));
        assert!(!p.authenticated);
    }

    #[test]
    fn user_headers_build_authenticated_principal() {
        let CallerPrincipal(p) = CallerPrincipal::from_headers(&headers(&[
            (USER_ID_HEADER, "ann"),
            (USER_ROLES_HEADER, "admin, editor,,"),
        ]));
        assert!(p.authenticated);
        assert_eq!(p.id, "ann");
        assert_eq!(p.roles, vec!["admin", "editor"]);
    }

    #[test]
    fn pipeline_errors_map_to_status_codes() {
        let cases = [
            (
                OperationError::UnknownService { name: "x".into() },
                StatusCode::NOT_FOUND,
            ),
            (
                OperationError::Timeout { timeout_ms: 5 },
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (OperationError::Overloaded, StatusCode::SERVICE_UNAVAILABLE),
            (
                OperationError::Internal(anyhow::anyhow!("boom")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (error, status) in cases {
            assert_eq!(operation_error(&error).status(), status);
        }
    }
}
