//! Wraps the router into the boxed service every front end dispatches to.

use tower::util::BoxCloneSyncService;
use tower::ServiceBuilder;

use super::guard::OperationGuardLayer;
use crate::service::config::ServerConfig;
use crate::service::operation::{Operation, OperationError, OperationResponse};
use crate::service::router::OperationRouter;

/// The composed, cloneable operation pipeline.
pub type OperationPipeline = BoxCloneSyncService<Operation, OperationResponse, OperationError>;

/// Guards the router with per-class admission and deadlines. Clones share
/// the permit pools.
#[must_use]
pub fn build_operation_pipeline(router: OperationRouter, config: &ServerConfig) -> OperationPipeline {
    let svc = ServiceBuilder::new()
        .layer(OperationGuardLayer::from_config(config))
        .service(router);
    BoxCloneSyncService::new(svc)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rowsync_core::messages::{ChangeSetRequest, QueryRequest};
    use rowsync_core::types::Principal;
    use tower::ServiceExt;

    use super::*;
    use crate::demo::{build_demo, CUSTOMERS};
    use crate::service::config::ServiceConfig;
    use crate::service::operation::OperationContext;

    fn pipeline(config: &ServerConfig) -> OperationPipeline {
        let demo = build_demo(ServiceConfig::default()).unwrap();
        let mut router = OperationRouter::new();
        router.register("Demo", demo.service);
        build_operation_pipeline(router, config)
    }

    fn ctx(service: &str) -> OperationContext {
        OperationContext::new(7, service, Arc::new(Principal::anonymous()), 5000)
    }

    #[tokio::test]
    async fn routes_to_the_named_data_service() {
        let resp = pipeline(&ServerConfig::default())
            .oneshot(Operation::GetMetadata { ctx: ctx("Demo") })
            .await
            .unwrap();
        assert!(matches!(resp, OperationResponse::Metadata(m) if m.db_sets.len() == 2));
    }

    #[tokio::test]
    async fn unknown_service_is_surfaced() {
        let err = pipeline(&ServerConfig::default())
            .oneshot(Operation::GetMetadata { ctx: ctx("Billing") })
            .await
            .unwrap_err();
        assert!(matches!(err, OperationError::UnknownService { name } if name == "Billing"));
    }

    #[tokio::test]
    async fn read_only_deployment_sheds_change_sets() {
        let config = ServerConfig {
            max_concurrent_writes: 0,
            ..ServerConfig::default()
        };
        let svc = pipeline(&config);
        let err = svc
            .clone()
            .oneshot(Operation::ApplyChangeSet {
                ctx: ctx("Demo"),
                request: ChangeSetRequest::default(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, OperationError::Overloaded));

        let resp = svc
            .oneshot(Operation::Query {
                ctx: ctx("Demo"),
                request: QueryRequest {
                    db_set_name: CUSTOMERS.to_string(),
                    ..QueryRequest::default()
                },
            })
            .await
            .unwrap();
        assert!(matches!(resp, OperationResponse::Query(q) if q.rows.len() == 3));
    }
}
