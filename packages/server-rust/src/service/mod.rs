//! Change-set synchronization service layer.
//!
//! 1. **Metadata** (`registry`): service definitions built once and frozen
//! 2. **Data services** (`data_service`): query, change-set, refresh and
//!    invoke over one service definition
//! 3. **Change-set stages** (`stages`): authorize, apply, validate, commit,
//!    track, built on `graph`, `context`, `authorization`, `validation` and
//!    `version`
//! 4. **Middleware** (`middleware`): Tower layers (timeout, metrics, load-shedding)
//! 5. **Routing** (`router`, `dispatch`): dispatch to data services by `service_name`

pub mod authorization;
pub mod config;
pub mod context;
pub mod data_service;
pub mod dispatch;
pub mod error;
pub mod graph;
pub mod handler;
pub mod middleware;
pub mod operation;
pub mod registry;
pub mod router;
pub mod stages;
pub mod validation;
pub mod version;

// Re-export key types for convenient access.
pub use authorization::{authorize_methods, AuthorizationError, AuthorizationTree};
pub use config::{ServerConfig, ServiceConfig};
pub use context::{scoped, OperationKind, RequestContext, ScopeError};
pub use data_service::{DataService, DataServiceBuilder};
pub use dispatch::OperationService;
pub use error::ServiceError;
pub use graph::{ChangeSetGraph, GraphError, RowRef};
pub use handler::{
    ChangeTracker, DataSession, DbSetHandler, DefaultHooks, IncludedSubset, InvokeHandler,
    ModelValidator, QueryResult, ServiceHooks, SessionFactory, TotalCount, TrackedChange,
    TracingChangeTracker,
};
pub use operation::{Operation, OperationContext, OperationError, OperationResponse};
pub use registry::{MetadataCache, ServiceDefinition};
pub use router::OperationRouter;
pub use stages::{Stage, StagePipeline};
pub use version::{ConcurrencyError, EntityVersion};
