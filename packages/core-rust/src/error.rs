//! Error type shared by the metadata, conversion and serialization layers.

/// Errors raised while describing, converting or serializing entities.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CoreError {
    #[error("unknown field '{field}' on '{owner}'")]
    UnknownField { owner: String, field: String },
    #[error("primary key field '{field}' of '{db_set}' is null")]
    NullPrimaryKey { db_set: String, field: String },
    #[error("cannot convert value of field '{field}': {reason}")]
    Conversion { field: String, reason: String },
    #[error("field '{field}' is read-only")]
    ReadOnlyField { field: String },
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        expected: &'static str,
        actual: &'static str,
    },
    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),
    #[error("wire codec error: {0}")]
    Codec(String),
}

impl CoreError {
    pub(crate) fn conversion(field: &str, reason: impl Into<String>) -> Self {
        CoreError::Conversion {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}
