//! Wire envelopes exchanged with clients.
//!
//! All types use camelCase field names. Field values travel as strings
//! produced by a [`ValueConverter`](crate::convert::ValueConverter); the
//! envelopes themselves are encoded by a [`WireCodec`](crate::codec::WireCodec).

use std::ops::{BitOr, BitOrAssign};

use serde::{Deserialize, Serialize};

use crate::metadata::{Association, DbSetInfo, MethodInfoData, ServiceMetadata};

// ---------------------------------------------------------------------------
// Change-set rows
// ---------------------------------------------------------------------------

/// Kind of a proposed mutation. `None` is never valid inside a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeType {
    #[default]
    None,
    Added,
    Updated,
    Deleted,
}

/// Bit flags attached to a [`ValueChange`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ValueFlags(u8);

impl ValueFlags {
    pub const NONE: Self = Self(0);
    /// The client changed the value.
    pub const CHANGED: Self = Self(1);
    /// The client assigned the value (possibly to the same value).
    pub const SET: Self = Self(2);
    /// The server produced a value different from the submitted one.
    pub const REFRESHED: Self = Self(4);

    #[must_use]
    pub fn bits(self) -> u8 {
        self.0
    }

    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl BitOr for ValueFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for ValueFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// One field's submitted value. Object-typed fields carry their values in
/// `nested` and leave `val`/`orig` empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueChange {
    pub field_name: String,
    pub val: Option<String>,
    pub orig: Option<String>,
    pub flags: ValueFlags,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nested: Vec<ValueChange>,
}

impl ValueChange {
    #[must_use]
    pub fn new(field_name: impl Into<String>, val: Option<&str>) -> Self {
        Self {
            field_name: field_name.into(),
            val: val.map(str::to_string),
            ..Self::default()
        }
    }

    /// A value the client assigned and changed.
    #[must_use]
    pub fn changed(field_name: impl Into<String>, val: Option<&str>) -> Self {
        Self::new(field_name, val).with_flags(ValueFlags::CHANGED | ValueFlags::SET)
    }

    /// Object-typed value holding nested values.
    #[must_use]
    pub fn object(field_name: impl Into<String>, nested: Vec<ValueChange>) -> Self {
        Self {
            field_name: field_name.into(),
            nested,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_orig(mut self, orig: Option<&str>) -> Self {
        self.orig = orig.map(str::to_string);
        self
    }

    #[must_use]
    pub fn with_flags(mut self, flags: ValueFlags) -> Self {
        self.flags = flags;
        self
    }

    #[must_use]
    pub fn is_changed(&self) -> bool {
        self.flags.contains(ValueFlags::CHANGED)
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        self.flags.contains(ValueFlags::SET)
    }

    /// Whether this value or any nested value was changed.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.is_changed() || self.nested.iter().any(ValueChange::has_changes)
    }
}

/// A validation failure, optionally bound to one field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationErrorInfo {
    pub field_name: Option<String>,
    pub message: String,
}

impl ValidationErrorInfo {
    #[must_use]
    pub fn field(field_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field_name: Some(field_name.into()),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn entity(message: impl Into<String>) -> Self {
        Self {
            field_name: None,
            message: message.into(),
        }
    }
}

/// One proposed mutation of one entity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowInfo {
    pub change_type: ChangeType,
    /// Temporary key assigned by the client, unique within its collection.
    pub client_key: String,
    /// Composite primary key once known.
    pub server_key: Option<String>,
    pub values: Vec<ValueChange>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub invalid: Vec<ValidationErrorInfo>,
}

impl RowInfo {
    #[must_use]
    pub fn new(change_type: ChangeType, client_key: impl Into<String>) -> Self {
        Self {
            change_type,
            client_key: client_key.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn value(mut self, value: ValueChange) -> Self {
        self.values.push(value);
        self
    }

    /// Finds a value by dotted field path.
    #[must_use]
    pub fn find_value(&self, path: &str) -> Option<&ValueChange> {
        let mut parts = path.split('.');
        let first = parts.next()?;
        let mut current = self.values.iter().find(|v| v.field_name == first)?;
        for part in parts {
            current = current.nested.iter().find(|v| v.field_name == part)?;
        }
        Some(current)
    }
}

/// Rows of one collection inside a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbSetChanges {
    pub db_set_name: String,
    pub rows: Vec<RowInfo>,
}

/// Client hint linking a child row to its parent row through an association.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackAssoc {
    pub assoc_name: String,
    /// Client key of the parent row.
    pub parent_key: String,
    /// Client key of the child row.
    pub child_key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSetRequest {
    pub db_sets: Vec<DbSetChanges>,
    #[serde(default)]
    pub track_assocs: Vec<TrackAssoc>,
}

/// Either every refreshed row or exactly one error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSetResponse {
    pub db_sets: Vec<DbSetChanges>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subsets: Vec<Subset>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl ChangeSetResponse {
    #[must_use]
    pub fn failed(error: ErrorInfo) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Response-level error descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    pub message: String,
    /// Stable error-kind tag (`protocol`, `authorization`, `validation`,
    /// `concurrency`, `unexpected`).
    pub kind: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub invalid_rows: Vec<InvalidRow>,
}

/// Validation errors of one rejected row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidRow {
    pub db_set_name: String,
    pub client_key: String,
    pub errors: Vec<ValidationErrorInfo>,
}

// ---------------------------------------------------------------------------
// Serialized rows
// ---------------------------------------------------------------------------

/// A converted field value. Object-typed fields become a positional array
/// following the nested field order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireValue {
    Null,
    Text(String),
    Nested(Vec<WireValue>),
}

impl WireValue {
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            WireValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<Option<String>> for WireValue {
    fn from(v: Option<String>) -> Self {
        v.map_or(WireValue::Null, WireValue::Text)
    }
}

/// A flat serialized entity: composite key plus values in field order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    pub k: String,
    pub v: Vec<WireValue>,
}

/// Column header for serialized rows. `p` lists the nested names of
/// object-typed fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldName {
    pub n: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p: Option<Vec<FieldName>>,
}

/// An additional collection returned beside the primary result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subset {
    pub db_set_name: String,
    pub names: Vec<FieldName>,
    pub rows: Vec<Row>,
}

// ---------------------------------------------------------------------------
// Query / refresh / invoke / metadata
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub db_set_name: String,
    /// Named query method; the collection's bound query method when absent.
    #[serde(default)]
    pub query_name: Option<String>,
    /// Filter descriptor forwarded untouched to the store.
    #[serde(default)]
    pub filter: serde_json::Value,
    /// Sort descriptor forwarded untouched to the store.
    #[serde(default)]
    pub sort: serde_json::Value,
    #[serde(default)]
    pub page_index: u32,
    #[serde(default)]
    pub page_size: Option<u32>,
    #[serde(default)]
    pub page_count: Option<u32>,
    #[serde(default)]
    pub is_include_total_count: bool,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
    pub db_set_name: String,
    pub names: Vec<FieldName>,
    pub rows: Vec<Row>,
    pub page_index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subsets: Vec<Subset>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_info: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    pub db_set_name: String,
    pub row_info: RowInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResponse {
    pub db_set_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_info: Option<RowInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeRequest {
    pub method_name: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

/// Serializable view of a service's metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataResponse {
    pub db_sets: Vec<DbSetInfo>,
    pub associations: Vec<Association>,
    pub methods: Vec<MethodInfoData>,
}

impl From<&ServiceMetadata> for MetadataResponse {
    fn from(meta: &ServiceMetadata) -> Self {
        Self {
            db_sets: meta.db_sets.values().map(|s| (**s).clone()).collect(),
            associations: meta.associations.values().map(|a| (**a).clone()).collect(),
            methods: meta.invoke_methods.values().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_combine_and_test() {
        let mut flags = ValueFlags::CHANGED | ValueFlags::SET;
        assert!(flags.contains(ValueFlags::SET));
        assert!(!flags.contains(ValueFlags::REFRESHED));
        flags.insert(ValueFlags::REFRESHED);
        flags.remove(ValueFlags::CHANGED);
        assert_eq!(flags.bits(), 6);
    }

    #[test]
    fn row_info_uses_camel_case_and_numeric_flags() {
        let row = RowInfo::new(ChangeType::Added, "c1")
            .value(ValueChange::changed("Name", Some("Ann")));
        let json = serde_json::to_value(&row).unwrap();
        assert_eq!(json["changeType"], "added");
        assert_eq!(json["clientKey"], "c1");
        assert_eq!(json["values"][0]["fieldName"], "Name");
        assert_eq!(json["values"][0]["flags"], 3);
        assert!(json.get("invalid").is_none());
    }

    #[test]
    fn wire_values_are_untagged() {
        let row = Row {
            k: "1".into(),
            v: vec![
                WireValue::Text("a".into()),
                WireValue::Null,
                WireValue::Nested(vec![WireValue::Text("x".into())]),
            ],
        };
        let json = serde_json::to_string(&row).unwrap();
        assert_eq!(json, r#"{"k":"1","v":["a",null,["x"]]}"#);
        let back: Row = serde_json::from_str(&json).unwrap();
        assert_eq!(back, row);
    }

    #[test]
    fn find_value_descends_nested() {
        let row = RowInfo::new(ChangeType::Updated, "1").value(ValueChange::object(
            "Address",
            vec![ValueChange::changed("City", Some("Oslo"))],
        ));
        assert_eq!(
            row.find_value("Address.City").and_then(|v| v.val.as_deref()),
            Some("Oslo")
        );
        assert!(row.values[0].has_changes());
        assert!(row.find_value("Address.Zip").is_none());
    }

    #[test]
    fn missing_track_assocs_defaults_to_empty() {
        let req: ChangeSetRequest = serde_json::from_str(r#"{"dbSets":[]}"#).unwrap();
        assert!(req.track_assocs.is_empty());
    }
}
