//! Operation types dispatched through the tower pipeline.

use std::sync::Arc;

use rowsync_core::messages::{
    ChangeSetRequest, ChangeSetResponse, ErrorInfo, InvokeRequest, InvokeResponse, MetadataResponse,
    QueryRequest, QueryResponse, RefreshRequest, RefreshResponse,
};
use rowsync_core::types::Principal;

/// Context carried with every operation through the pipeline.
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub call_id: u64,
    /// Name of the data service the operation is routed to.
    pub service_name: String,
    pub principal: Arc<Principal>,
    pub call_timeout_ms: u64,
}

impl OperationContext {
    #[must_use]
    pub fn new(
        call_id: u64,
        service_name: impl Into<String>,
        principal: Arc<Principal>,
        call_timeout_ms: u64,
    ) -> Self {
        Self {
            call_id,
            service_name: service_name.into(),
            principal,
            call_timeout_ms,
        }
    }
}

/// Typed operation variants dispatched through the pipeline.
#[derive(Debug)]
pub enum Operation {
    GetMetadata {
        ctx: OperationContext,
    },
    Query {
        ctx: OperationContext,
        request: QueryRequest,
    },
    ApplyChangeSet {
        ctx: OperationContext,
        request: ChangeSetRequest,
    },
    Refresh {
        ctx: OperationContext,
        request: RefreshRequest,
    },
    Invoke {
        ctx: OperationContext,
        request: InvokeRequest,
    },
}

impl Operation {
    #[must_use]
    pub fn ctx(&self) -> &OperationContext {
        match self {
            Operation::GetMetadata { ctx }
            | Operation::Query { ctx, .. }
            | Operation::ApplyChangeSet { ctx, .. }
            | Operation::Refresh { ctx, .. }
            | Operation::Invoke { ctx, .. } => ctx,
        }
    }

    pub fn ctx_mut(&mut self) -> &mut OperationContext {
        match self {
            Operation::GetMetadata { ctx }
            | Operation::Query { ctx, .. }
            | Operation::ApplyChangeSet { ctx, .. }
            | Operation::Refresh { ctx, .. }
            | Operation::Invoke { ctx, .. } => ctx,
        }
    }

    /// Rows carried by the operation: every row of a change set, the one
    /// row of a refresh, zero otherwise.
    #[must_use]
    pub fn row_count(&self) -> usize {
        match self {
            Operation::ApplyChangeSet { request, .. } => request.db_sets.iter().map(|s| s.rows.len()).sum(),
            Operation::Refresh { .. } => 1,
            Operation::GetMetadata { .. } | Operation::Query { .. } | Operation::Invoke { .. } => 0,
        }
    }

    /// Short name used in logs and spans.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Operation::GetMetadata { .. } => "get_metadata",
            Operation::Query { .. } => "query",
            Operation::ApplyChangeSet { .. } => "apply_change_set",
            Operation::Refresh { .. } => "refresh",
            Operation::Invoke { .. } => "invoke",
        }
    }
}

/// Successful response from a data service. Domain failures travel inside
/// the envelope's `error` field.
#[derive(Debug)]
pub enum OperationResponse {
    Metadata(Box<MetadataResponse>),
    Query(Box<QueryResponse>),
    ChangeSet(Box<ChangeSetResponse>),
    Refresh(Box<RefreshResponse>),
    Invoke(Box<InvokeResponse>),
}

impl OperationResponse {
    /// Domain error carried by the envelope, if any.
    #[must_use]
    pub fn error(&self) -> Option<&ErrorInfo> {
        match self {
            OperationResponse::Metadata(_) => None,
            OperationResponse::Query(r) => r.error.as_ref(),
            OperationResponse::ChangeSet(r) => r.error.as_ref(),
            OperationResponse::Refresh(r) => r.error.as_ref(),
            OperationResponse::Invoke(r) => r.error.as_ref(),
        }
    }
}

/// Errors returned by the pipeline itself.
#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    #[error("unknown service: {name}")]
    UnknownService { name: String },
    #[error("operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("server overloaded, try again later")]
    Overloaded,
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}
