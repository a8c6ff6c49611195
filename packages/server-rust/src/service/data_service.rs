//! Data service facade: metadata, query, change-set, refresh and invoke
//! operations over one service definition.
//!
//! Every operation opens a session, runs inside an ambient scope and closes
//! the session on every exit path. Failures never escape as `Err`: they are
//! mapped to one [`ErrorInfo`] carried by the response.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use rowsync_core::convert::{DefaultValueConverter, ValueConverter};
use rowsync_core::entity::Entity;
use rowsync_core::messages::{
    ChangeSetRequest, ChangeSetResponse, ErrorInfo, InvokeRequest, InvokeResponse,
    MetadataResponse, QueryRequest, QueryResponse, RefreshRequest, RefreshResponse, Subset,
};
use rowsync_core::metadata::{MethodType, ServiceMetadata};
use rowsync_core::row::{ApplyMode, RowSerializer};
use rowsync_core::types::Principal;
use tower::Service;
use tracing::{debug, error, info, warn};

use super::authorization::authorize_methods;
use super::config::ServiceConfig;
use super::context::{scoped, OperationKind, RequestContext};
use super::error::ServiceError;
use super::graph::GraphError;
use super::handler::{
    ChangeTracker, DataSession, DefaultHooks, HandlerCache, IncludedSubset, InvokeHandler,
    ModelValidator, ServiceHooks, SessionFactory, TotalCount, TracingChangeTracker,
};
use super::operation::{Operation, OperationError, OperationResponse};
use super::stages::{BatchContext, StagePipeline};
use super::validation::FieldValidator;

// ---------------------------------------------------------------------------
// ServiceShared
// ---------------------------------------------------------------------------

/// Immutable parts of a data service, shared by every request.
pub struct ServiceShared {
    pub name: String,
    pub metadata: Arc<ServiceMetadata>,
    pub serializer: RowSerializer,
    pub config: ServiceConfig,
    pub field_validator: FieldValidator,
    pub model_validators: HashMap<String, Arc<dyn ModelValidator>>,
    pub invoke_handlers: HashMap<String, Arc<dyn InvokeHandler>>,
    pub hooks: Arc<dyn ServiceHooks>,
    pub tracker: Arc<dyn ChangeTracker>,
    pub sessions: Arc<dyn SessionFactory>,
    pub stages: StagePipeline,
}

impl std::fmt::Debug for ServiceShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceShared")
            .field("name", &self.name)
            .field("stages", &self.stages)
            .finish_non_exhaustive()
    }
}

impl ServiceShared {
    /// Serializes included entities into response subsets, distinct by key.
    ///
    /// # Errors
    ///
    /// Fails for subsets naming unknown collections and on conversion errors.
    pub fn serialize_subsets(&self, subsets: Vec<IncludedSubset>) -> Result<Vec<Subset>, ServiceError> {
        subsets
            .into_iter()
            .map(|subset| {
                let db_set = self.metadata.db_set(&subset.db_set_name).ok_or_else(|| {
                    ServiceError::Unexpected(anyhow::anyhow!(
                        "included subset names unknown DbSet '{}'",
                        subset.db_set_name
                    ))
                })?;
                let rows = self
                    .serializer
                    .to_distinct_rows(db_set, subset.entities.iter().map(|e| &**e))?;
                Ok(Subset {
                    db_set_name: subset.db_set_name,
                    names: RowSerializer::field_names(db_set),
                    rows,
                })
            })
            .collect()
    }

    fn error_info(&self, error: &ServiceError) -> ErrorInfo {
        if error.is_unexpected() {
            error!(service = %self.name, error = %error, "operation failed");
        } else {
            warn!(service = %self.name, kind = error.kind(), error = %error, "operation rejected");
        }
        error.to_error_info(
            self.hooks
                .friendly_message(error, self.config.expose_unexpected_errors),
        )
    }
}

/// Session and handler memo of one request.
struct RequestScope {
    session: Arc<dyn DataSession>,
    handlers: HandlerCache,
}

impl RequestScope {
    async fn finish(self) {
        self.handlers.dispose_all().await;
        if let Err(e) = self.session.close().await {
            warn!(error = %e, "session close failed");
        }
    }
}

// ---------------------------------------------------------------------------
// DataService
// ---------------------------------------------------------------------------

/// One data service. Cheap to clone.
#[derive(Debug, Clone)]
pub struct DataService {
    shared: Arc<ServiceShared>,
}

impl DataService {
    #[must_use]
    pub fn builder(name: impl Into<String>, metadata: Arc<ServiceMetadata>) -> DataServiceBuilder {
        DataServiceBuilder {
            name: name.into(),
            metadata,
            config: ServiceConfig::default(),
            sessions: None,
            converter: None,
            hooks: Arc::new(DefaultHooks),
            tracker: Arc::new(TracingChangeTracker),
            model_validators: HashMap::new(),
            invoke_handlers: HashMap::new(),
            stages: StagePipeline::standard(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    #[must_use]
    pub fn metadata(&self) -> &Arc<ServiceMetadata> {
        &self.shared.metadata
    }

    #[must_use]
    pub fn get_metadata(&self) -> MetadataResponse {
        MetadataResponse::from(self.shared.metadata.as_ref())
    }

    async fn open(&self, principal: &Arc<Principal>) -> Result<RequestScope, ServiceError> {
        let session = self
            .shared
            .sessions
            .open(Arc::clone(principal))
            .await
            .map_err(ServiceError::collaborator)?;
        Ok(RequestScope {
            session,
            handlers: HandlerCache::default(),
        })
    }

    // -- Query ---------------------------------------------------------------

    pub async fn get_data(&self, principal: Arc<Principal>, request: QueryRequest) -> QueryResponse {
        let db_set_name = request.db_set_name.clone();
        let page_index = request.page_index;
        let result = match self.open(&principal).await {
            Ok(scope) => {
                let result = self.query(&scope, &principal, request).await;
                scope.finish().await;
                result
            }
            Err(e) => Err(e),
        };
        result.unwrap_or_else(|e| QueryResponse {
            db_set_name,
            page_index,
            error: Some(self.shared.error_info(&e)),
            ..QueryResponse::default()
        })
    }

    async fn query(
        &self,
        scope: &RequestScope,
        principal: &Arc<Principal>,
        mut request: QueryRequest,
    ) -> Result<QueryResponse, ServiceError> {
        let shared = &self.shared;
        let db_set = shared
            .metadata
            .db_set(&request.db_set_name)
            .ok_or_else(|| GraphError::UnknownDbSet(request.db_set_name.clone()))?;
        let method = db_set
            .method_info(MethodType::Query)
            .filter(|m| request.query_name.as_ref().map_or(true, |q| *q == m.method_name))
            .ok_or_else(|| {
                ServiceError::protocol(format!(
                    "DbSet '{}' has no query '{}'",
                    db_set.db_set_name,
                    request.query_name.as_deref().unwrap_or("default")
                ))
            })?;
        authorize_methods(&shared.metadata, principal, [method])?;

        if db_set.enable_paging && request.page_size.is_none() {
            request.page_size = Some(db_set.page_size.unwrap_or(shared.config.default_page_size));
        }
        let request = Arc::new(request);
        let handler = scope.handlers.get(scope.session.as_ref(), db_set)?;
        let frame = RequestContext::new(OperationKind::Query, Arc::clone(principal))
            .with_db_set(Arc::clone(db_set))
            .with_query(Arc::clone(&request));
        let result = scoped(frame, handler.query(&request))
            .await
            .map_err(ServiceError::collaborator)?;

        let rows = shared
            .serializer
            .to_distinct_rows(db_set, result.entities.iter().map(|e| &**e))?;
        let total_count = match (request.is_include_total_count, result.total_count) {
            (false, _) | (true, TotalCount::None) => None,
            (true, TotalCount::Known(n)) => Some(n),
            (true, TotalCount::Deferred(count)) => Some(count.await.map_err(ServiceError::collaborator)?),
        };
        debug!(db_set = %db_set.db_set_name, rows = rows.len(), ?total_count, "query executed");
        Ok(QueryResponse {
            db_set_name: db_set.db_set_name.clone(),
            names: RowSerializer::field_names(db_set),
            rows,
            page_index: request.page_index,
            total_count,
            subsets: shared.serialize_subsets(result.subsets)?,
            extra_info: result.extra_info,
            error: None,
        })
    }

    // -- Change set ----------------------------------------------------------

    pub async fn apply_change_set(
        &self,
        principal: Arc<Principal>,
        request: ChangeSetRequest,
    ) -> ChangeSetResponse {
        let scope = match self.open(&principal).await {
            Ok(scope) => scope,
            Err(e) => return ChangeSetResponse::failed(self.shared.error_info(&e)),
        };
        let request = Arc::new(request);
        let mut ctx = BatchContext::new(
            Arc::clone(&request),
            Arc::clone(&principal),
            Arc::clone(&self.shared),
            Arc::clone(&scope.session),
            scope.handlers.clone(),
        );
        let frame = RequestContext::new(OperationKind::ChangeSet, principal).with_change_set(request);
        let outcome = scoped(frame, self.shared.stages.execute(&mut ctx)).await;
        scope.finish().await;

        match outcome {
            Ok(()) => {
                info!(service = %self.shared.name, "change set applied");
                ctx.response
            }
            Err(e) => {
                if let Some(r) = ctx.failed_row {
                    let row = ctx.row(r);
                    warn!(
                        db_set = %ctx.request.db_sets[r.set_idx].db_set_name,
                        key = %row.client_key,
                        change = ?row.change_type,
                        "row failed"
                    );
                }
                ChangeSetResponse::failed(self.shared.error_info(&e))
            }
        }
    }

    // -- Refresh -------------------------------------------------------------

    pub async fn refresh_row(&self, principal: Arc<Principal>, request: RefreshRequest) -> RefreshResponse {
        let db_set_name = request.db_set_name.clone();
        let result = match self.open(&principal).await {
            Ok(scope) => {
                let result = self.refresh(&scope, &principal, request).await;
                scope.finish().await;
                result
            }
            Err(e) => Err(e),
        };
        result.unwrap_or_else(|e| RefreshResponse {
            db_set_name,
            row_info: None,
            error: Some(self.shared.error_info(&e)),
        })
    }

    async fn refresh(
        &self,
        scope: &RequestScope,
        principal: &Arc<Principal>,
        request: RefreshRequest,
    ) -> Result<RefreshResponse, ServiceError> {
        let shared = &self.shared;
        let db_set = shared
            .metadata
            .db_set(&request.db_set_name)
            .ok_or_else(|| GraphError::UnknownDbSet(request.db_set_name.clone()))?;
        let method = db_set.method_info(MethodType::Refresh).ok_or_else(|| {
            ServiceError::protocol(format!("DbSet '{}' has no refresh method", db_set.db_set_name))
        })?;
        authorize_methods(&shared.metadata, principal, [method])?;

        let mut row = request.row_info;
        let handler = scope.handlers.get(scope.session.as_ref(), db_set)?;
        let mut entity = handler.create_entity();
        shared
            .serializer
            .apply_values(db_set, entity.as_mut(), &row.values, ApplyMode::Original)?;
        let original: Arc<dyn Entity> = Arc::from(entity.clone_entity());

        let frame = RequestContext::new(OperationKind::Refresh, Arc::clone(principal))
            .with_db_set(Arc::clone(db_set))
            .with_row(row.clone())
            .with_original(original);
        scoped(frame, handler.refresh(entity.as_mut()))
            .await
            .map_err(ServiceError::collaborator)?;

        let refreshed = shared
            .serializer
            .refresh_values(db_set, entity.as_ref(), &mut row.values)?;
        row.server_key = Some(shared.serializer.row_key(db_set, entity.as_ref())?);
        debug!(db_set = %db_set.db_set_name, refreshed, "row refreshed");
        Ok(RefreshResponse {
            db_set_name: request.db_set_name,
            row_info: Some(row),
            error: None,
        })
    }

    // -- Invoke --------------------------------------------------------------

    pub async fn invoke_method(&self, principal: Arc<Principal>, request: InvokeRequest) -> InvokeResponse {
        let result = match self.open(&principal).await {
            Ok(scope) => {
                let result = self.invoke(&scope, &principal, request).await;
                scope.finish().await;
                result
            }
            Err(e) => Err(e),
        };
        match result {
            Ok(value) => InvokeResponse {
                result: Some(value),
                error: None,
            },
            Err(e) => InvokeResponse {
                result: None,
                error: Some(self.shared.error_info(&e)),
            },
        }
    }

    async fn invoke(
        &self,
        scope: &RequestScope,
        principal: &Arc<Principal>,
        request: InvokeRequest,
    ) -> Result<serde_json::Value, ServiceError> {
        let shared = &self.shared;
        let method = shared
            .metadata
            .invoke_methods
            .get(&request.method_name)
            .ok_or_else(|| ServiceError::protocol(format!("unknown method '{}'", request.method_name)))?;
        authorize_methods(&shared.metadata, principal, [method])?;
        let handler = shared.invoke_handlers.get(&request.method_name).ok_or_else(|| {
            ServiceError::Unexpected(anyhow::anyhow!(
                "no handler registered for method '{}'",
                request.method_name
            ))
        })?;
        let frame = RequestContext::new(OperationKind::Invoke, Arc::clone(principal));
        scoped(frame, handler.invoke(scope.session.as_ref(), request.params))
            .await
            .map_err(ServiceError::collaborator)
    }
}

// ---------------------------------------------------------------------------
// Service<Operation>
// ---------------------------------------------------------------------------

impl Service<Operation> for DataService {
    type Response = OperationResponse;
    type Error = OperationError;
    type Future = Pin<Box<dyn Future<Output = Result<OperationResponse, OperationError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, op: Operation) -> Self::Future {
        let svc = self.clone();
        Box::pin(async move {
            let principal = Arc::clone(&op.ctx().principal);
            let response = match op {
                Operation::GetMetadata { .. } => {
                    OperationResponse::Metadata(Box::new(svc.get_metadata()))
                }
                Operation::Query { request, .. } => {
                    OperationResponse::Query(Box::new(svc.get_data(principal, request).await))
                }
                Operation::ApplyChangeSet { request, .. } => OperationResponse::ChangeSet(Box::new(
                    svc.apply_change_set(principal, request).await,
                )),
                Operation::Refresh { request, .. } => {
                    OperationResponse::Refresh(Box::new(svc.refresh_row(principal, request).await))
                }
                Operation::Invoke { request, .. } => {
                    OperationResponse::Invoke(Box::new(svc.invoke_method(principal, request).await))
                }
            };
            Ok(response)
        })
    }
}

// ---------------------------------------------------------------------------
// DataServiceBuilder
// ---------------------------------------------------------------------------

pub struct DataServiceBuilder {
    name: String,
    metadata: Arc<ServiceMetadata>,
    config: ServiceConfig,
    sessions: Option<Arc<dyn SessionFactory>>,
    converter: Option<Arc<dyn ValueConverter>>,
    hooks: Arc<dyn ServiceHooks>,
    tracker: Arc<dyn ChangeTracker>,
    model_validators: HashMap<String, Arc<dyn ModelValidator>>,
    invoke_handlers: HashMap<String, Arc<dyn InvokeHandler>>,
    stages: StagePipeline,
}

impl DataServiceBuilder {
    #[must_use]
    pub fn config(mut self, config: ServiceConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn sessions(mut self, sessions: Arc<dyn SessionFactory>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    /// Value converter shared with the store behind the sessions. Defaults
    /// to [`DefaultValueConverter`] at the configured server offset.
    #[must_use]
    pub fn converter(mut self, converter: Arc<dyn ValueConverter>) -> Self {
        self.converter = Some(converter);
        self
    }

    #[must_use]
    pub fn hooks(mut self, hooks: Arc<dyn ServiceHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    #[must_use]
    pub fn tracker(mut self, tracker: Arc<dyn ChangeTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    #[must_use]
    pub fn model_validator(mut self, db_set: impl Into<String>, validator: Arc<dyn ModelValidator>) -> Self {
        self.model_validators.insert(db_set.into(), validator);
        self
    }

    #[must_use]
    pub fn invoke_handler(mut self, method: impl Into<String>, handler: Arc<dyn InvokeHandler>) -> Self {
        self.invoke_handlers.insert(method.into(), handler);
        self
    }

    #[must_use]
    pub fn stages(mut self, stages: StagePipeline) -> Self {
        self.stages = stages;
        self
    }

    /// # Errors
    ///
    /// Fails without a session factory, or when validators or invoke handlers
    /// name collections or methods the metadata does not declare.
    pub fn build(self) -> anyhow::Result<DataService> {
        let sessions = self
            .sessions
            .ok_or_else(|| anyhow::anyhow!("data service '{}' has no session factory", self.name))?;
        if let Some(name) = self
            .model_validators
            .keys()
            .find(|n| self.metadata.db_set(n).is_none())
        {
            anyhow::bail!("model validator registered for unknown DbSet '{name}'");
        }
        if let Some(name) = self
            .invoke_handlers
            .keys()
            .find(|n| !self.metadata.invoke_methods.contains_key(*n))
        {
            anyhow::bail!("invoke handler registered for undeclared method '{name}'");
        }
        let server_offset = self.config.server_offset();
        let converter = self
            .converter
            .unwrap_or_else(|| Arc::new(DefaultValueConverter::new(server_offset)));
        Ok(DataService {
            shared: Arc::new(ServiceShared {
                name: self.name,
                metadata: self.metadata,
                serializer: RowSerializer::new(converter),
                config: self.config,
                field_validator: FieldValidator::new(),
                model_validators: self.model_validators,
                invoke_handlers: self.invoke_handlers,
                hooks: self.hooks,
                tracker: self.tracker,
                sessions,
                stages: self.stages,
            }),
        })
    }
}
