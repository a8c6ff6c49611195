//! `RowSync` Core: metadata model, native values, entity access, value
//! conversion, row serialization and wire envelopes.

pub mod codec;
pub mod convert;
pub mod entity;
pub mod error;
pub mod messages;
pub mod metadata;
pub mod row;
pub mod types;

pub use codec::{JsonCodec, MsgPackCodec, WireCodec};
pub use convert::{DefaultValueConverter, ValueConverter};
pub use entity::{get_path, set_path, AccessorTable, DynamicEntity, Entity, Record};
pub use error::CoreError;
pub use messages::{
    ChangeSetRequest, ChangeSetResponse, ChangeType, DbSetChanges, ErrorInfo, FieldName,
    InvalidRow, InvokeRequest, InvokeResponse, MetadataResponse, QueryRequest, QueryResponse,
    RefreshRequest, RefreshResponse, Row, RowInfo, Subset, TrackAssoc, ValidationErrorInfo,
    ValueChange, ValueFlags, WireValue,
};
pub use metadata::{
    Association, AuthorizeData, DataType, DateConversion, DbSetInfo, Field, FieldKind, FieldRel,
    HandlerInfo, MethodInfoData, MethodOwner, MethodType, ServiceMetadata,
    ServiceMetadataBuilder,
};
pub use row::{ApplyMode, RowSerializer};
pub use types::{FromValue, Principal, Value};
