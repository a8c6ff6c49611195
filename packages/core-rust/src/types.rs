use std::collections::BTreeMap;

use chrono::{NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

/// Native runtime value held by an entity field.
///
/// This is the server-side representation; the wire form is produced by a
/// [`ValueConverter`](crate::convert::ValueConverter). Object-typed fields hold
/// their nested values in a `BTreeMap` keyed by nested field name.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Absent / SQL null.
    Null,
    Bool(bool),
    /// Signed 64-bit integer.
    Int(i64),
    /// Exact decimal.
    Decimal(Decimal),
    /// 64-bit IEEE 754 float.
    Float(f64),
    String(String),
    /// Date and time without an attached zone. Interpreted per the field's
    /// date conversion policy.
    DateTime(NaiveDateTime),
    Time(NaiveTime),
    Guid(Uuid),
    Bytes(Vec<u8>),
    /// Complex (object-typed) field value.
    Object(BTreeMap<String, Value>),
}

impl Value {
    /// Returns `true` for [`Value::Null`].
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Short name of the variant, used in conversion error messages.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Decimal(_) => "decimal",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::DateTime(_) => "datetime",
            Value::Time(_) => "time",
            Value::Guid(_) => "guid",
            Value::Bytes(_) => "bytes",
            Value::Object(_) => "object",
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_object(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<Decimal> for Value {
    fn from(v: Decimal) -> Self {
        Value::Decimal(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Value::DateTime(v)
    }
}

impl From<NaiveTime> for Value {
    fn from(v: NaiveTime) -> Self {
        Value::Time(v)
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Self {
        Value::Guid(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

// ---------------------------------------------------------------------------
// FromValue
// ---------------------------------------------------------------------------

/// Fallible extraction of a typed value, used by typed entity setters.
pub trait FromValue: Sized {
    /// # Errors
    ///
    /// Returns [`CoreError::TypeMismatch`] when the variant does not fit `Self`.
    fn from_value(value: Value) -> Result<Self, CoreError>;
}

macro_rules! from_value_impl {
    ($ty:ty, $expected:literal, $($pat:pat => $out:expr),+ $(,)?) => {
        impl FromValue for $ty {
            fn from_value(value: Value) -> Result<Self, CoreError> {
                match value {
                    $($pat => Ok($out),)+
                    other => Err(CoreError::TypeMismatch {
                        expected: $expected,
                        actual: other.type_name(),
                    }),
                }
            }
        }
    };
}

from_value_impl!(bool, "bool", Value::Bool(b) => b);
from_value_impl!(i64, "int", Value::Int(n) => n);
from_value_impl!(String, "string", Value::String(s) => s);
from_value_impl!(Decimal, "decimal", Value::Decimal(d) => d, Value::Int(n) => Decimal::from(n));
from_value_impl!(NaiveDateTime, "datetime", Value::DateTime(dt) => dt);
from_value_impl!(NaiveTime, "time", Value::Time(t) => t);
from_value_impl!(Uuid, "guid", Value::Guid(g) => g);
from_value_impl!(Vec<u8>, "bytes", Value::Bytes(b) => b);

impl FromValue for f64 {
    // Integer ids and counts fit well within the 53-bit mantissa.
    #[allow(clippy::cast_precision_loss)]
    fn from_value(value: Value) -> Result<Self, CoreError> {
        match value {
            Value::Float(f) => Ok(f),
            Value::Int(n) => Ok(n as f64),
            other => Err(CoreError::TypeMismatch {
                expected: "float",
                actual: other.type_name(),
            }),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: Value) -> Result<Self, CoreError> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

// ---------------------------------------------------------------------------
// Principal
// ---------------------------------------------------------------------------

/// Caller identity used for authorization checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    /// Unique identifier for the authenticated entity. Empty when anonymous.
    pub id: String,
    /// Roles assigned to this principal.
    pub roles: Vec<String>,
    pub authenticated: bool,
}

impl Principal {
    #[must_use]
    pub fn anonymous() -> Self {
        Self {
            id: String::new(),
            roles: Vec::new(),
            authenticated: false,
        }
    }

    #[must_use]
    pub fn user(id: impl Into<String>, roles: &[&str]) -> Self {
        Self {
            id: id.into(),
            roles: roles.iter().map(|r| (*r).to_string()).collect(),
            authenticated: true,
        }
    }

    #[must_use]
    pub fn is_in_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    /// Name used in denial messages.
    #[must_use]
    pub fn display_name(&self) -> &str {
        if self.authenticated && !self.id.is_empty() {
            &self.id
        } else {
            "anonymous"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn option_into_value() {
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert_eq!(Value::from(Some("x")), Value::String("x".to_string()));
    }

    #[test]
    fn from_value_widens_int() {
        assert_eq!(Decimal::from_value(Value::Int(3)).unwrap(), Decimal::from(3));
        assert!((f64::from_value(Value::Int(2)).unwrap() - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn from_value_rejects_mismatch() {
        let err = i64::from_value(Value::String("1".into())).unwrap_err();
        assert!(matches!(
            err,
            CoreError::TypeMismatch {
                expected: "int",
                actual: "string"
            }
        ));
    }

    #[test]
    fn optional_from_null() {
        assert_eq!(Option::<String>::from_value(Value::Null).unwrap(), None);
    }

    #[test]
    fn anonymous_display_name() {
        assert_eq!(Principal::anonymous().display_name(), "anonymous");
        assert_eq!(Principal::user("ann", &["admin"]).display_name(), "ann");
    }
}
