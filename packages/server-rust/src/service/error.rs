//! Domain error taxonomy of data service operations.

use rowsync_core::error::CoreError;
use rowsync_core::messages::{ErrorInfo, InvalidRow};

use super::authorization::AuthorizationError;
use super::context::ScopeError;
use super::graph::GraphError;
use super::version::ConcurrencyError;

/// Error raised while executing a data service operation. Every variant maps
/// to one stable kind tag reported to the client.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Malformed request: unknown collection, unresolvable association hint,
    /// missing change type, unbound method.
    #[error("{0}")]
    Protocol(String),
    #[error(transparent)]
    Authorization(#[from] AuthorizationError),
    #[error("{} row(s) failed validation", .0.len())]
    Validation(Vec<InvalidRow>),
    #[error(transparent)]
    Concurrency(#[from] ConcurrencyError),
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error(transparent)]
    Scope(#[from] ScopeError),
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

impl From<GraphError> for ServiceError {
    fn from(e: GraphError) -> Self {
        ServiceError::Protocol(e.to_string())
    }
}

impl ServiceError {
    pub fn protocol(message: impl Into<String>) -> Self {
        ServiceError::Protocol(message.into())
    }

    /// Maps a collaborator failure. Domain errors raised by the collaborator
    /// itself keep their kind.
    pub fn collaborator(error: anyhow::Error) -> Self {
        match error.downcast::<ConcurrencyError>() {
            Ok(e) => ServiceError::Concurrency(e),
            Err(error) => match error.downcast::<ServiceError>() {
                Ok(e) => e,
                Err(error) => ServiceError::Unexpected(error),
            },
        }
    }

    /// Stable kind tag placed in [`ErrorInfo::kind`].
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::Protocol(_) => "protocol",
            ServiceError::Authorization(_) => "authorization",
            ServiceError::Validation(_) => "validation",
            ServiceError::Concurrency(_) => "concurrency",
            ServiceError::Core(_) | ServiceError::Scope(_) | ServiceError::Unexpected(_) => {
                "unexpected"
            }
        }
    }

    #[must_use]
    pub fn is_unexpected(&self) -> bool {
        self.kind() == "unexpected"
    }

    /// Builds the response descriptor with an already resolved message.
    #[must_use]
    pub fn to_error_info(&self, message: String) -> ErrorInfo {
        ErrorInfo {
            message,
            kind: self.kind().to_string(),
            invalid_rows: match self {
                ServiceError::Validation(rows) => rows.clone(),
                _ => Vec::new(),
            },
        }
    }
}
