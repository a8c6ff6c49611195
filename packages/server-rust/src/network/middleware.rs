//! Transport-level layers wrapped around every HTTP route.
//!
//! Operation-level concerns (load shedding, per-operation timeouts,
//! metrics) live in `service::middleware` and apply to data requests only.

use axum::http::header::{HeaderName, CONTENT_TYPE};
use axum::http::{Method, StatusCode};
use tower::layer::util::{Identity, Stack};
use tower::ServiceBuilder;
use tower_http::classify::{ServerErrorsAsFailures, SharedClassifier};
use tower_http::compression::CompressionLayer;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use super::config::NetworkConfig;
use super::handlers::data::{USER_ID_HEADER, USER_ROLES_HEADER};

const REQUEST_ID: &str = "x-request-id";

/// Outermost layer last.
type HttpLayers = Stack<
    PropagateRequestIdLayer,
    Stack<
        TimeoutLayer,
        Stack<
            CorsLayer,
            Stack<
                CompressionLayer,
                Stack<
                    TraceLayer<SharedClassifier<ServerErrorsAsFailures>>,
                    Stack<SetRequestIdLayer<MakeRequestUuid>, Stack<RequestBodyLimitLayer, Identity>>,
                >,
            >,
        >,
    >,
>;

/// Body size limit (413), request id, tracing, gzip, CORS, request
/// timeout (408) and request id echo, in that order from the outside in.
///
/// The body limit sits outside the timeout because its response body has
/// no `Default` for the timeout's 408 reply.
#[must_use]
pub fn build_http_layers(config: &NetworkConfig) -> HttpLayers {
    let request_id = HeaderName::from_static(REQUEST_ID);
    ServiceBuilder::new()
        .layer(RequestBodyLimitLayer::new(config.max_body_bytes))
        .layer(SetRequestIdLayer::new(request_id.clone(), MakeRequestUuid))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(cors_layer(&config.cors_origins))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            config.request_timeout,
        ))
        .layer(PropagateRequestIdLayer::new(request_id))
        .into_inner()
}

/// `"*"` allows any origin. Unparseable origins are skipped with a warning.
fn cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(origins.iter().filter_map(|o| match o.parse() {
            Ok(origin) => Some(origin),
            Err(_) => {
                warn!(origin = %o, "ignoring invalid CORS origin");
                None
            }
        }))
    };
    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([
            CONTENT_TYPE,
            HeaderName::from_static(REQUEST_ID),
            HeaderName::from_static(USER_ID_HEADER),
            HeaderName::from_static(USER_ROLES_HEADER),
        ])
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use axum::routing::post;
    use axum::Router;
    use tower::ServiceExt;

    use super::*;

    fn echo(config: &NetworkConfig) -> Router {
        Router::new()
            .route("/echo", post(|body: String| async move { body }))
            .layer(build_http_layers(config))
    }

    #[tokio::test]
    async fn responses_carry_a_request_id() {
        let response = echo(&NetworkConfig::default())
            .oneshot(Request::post("/echo").body(Body::from("hi")).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key(REQUEST_ID));
    }

    #[tokio::test]
    async fn client_request_id_is_echoed() {
        let response = echo(&NetworkConfig::default())
            .oneshot(
                Request::post("/echo")
                    .header(REQUEST_ID, "abc-123")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.headers()[REQUEST_ID], "abc-123");
    }

    #[tokio::test]
    async fn oversized_bodies_are_rejected() {
        let config = NetworkConfig {
            max_body_bytes: 8,
            ..NetworkConfig::default()
        };
        let response = echo(&config)
            .oneshot(
                Request::post("/echo")
                    .body(Body::from("far more than eight bytes"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn slow_handlers_time_out_behind_the_body_limit() {
        let config = NetworkConfig {
            request_timeout: std::time::Duration::from_millis(20),
            max_body_bytes: 64,
            ..NetworkConfig::default()
        };
        let app = Router::new()
            .route(
                "/slow",
                post(|| async {
                    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                    "late"
                }),
            )
            .layer(build_http_layers(&config));
        let response = app
            .oneshot(Request::post("/slow").body(Body::from("x")).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
    }

    #[test]
    fn explicit_origins_build() {
        let _ = cors_layer(&["http://localhost:3000".to_string(), "not a url\n".to_string()]);
    }
}
