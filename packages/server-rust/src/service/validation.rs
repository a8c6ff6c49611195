//! Field-level checks run by the validate stage: nullability, string length,
//! regex and numeric/date range.

use std::collections::HashSet;

use chrono::{NaiveDate, NaiveDateTime};
use dashmap::DashMap;
use regex::Regex;
use rowsync_core::entity::{get_path, Entity};
use rowsync_core::error::CoreError;
use rowsync_core::messages::{ChangeType, RowInfo, ValidationErrorInfo};
use rowsync_core::metadata::{row_fields, DataType, DbSetInfo, Field, FieldKind};
use rowsync_core::types::Value;
use rust_decimal::Decimal;

/// Checks field constraints. Compiled patterns are cached for the validator's
/// lifetime.
#[derive(Debug, Default)]
pub struct FieldValidator {
    patterns: DashMap<String, Regex>,
}

impl FieldValidator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates the fields of one insert or update.
    ///
    /// Updates check every field the client marked changed. Inserts check
    /// every non-generated field except those in `linked`, the child fields
    /// filled from parent rows.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidMetadata`] when a field's regex or range
    /// is malformed.
    pub fn validate_row(
        &self,
        db_set: &DbSetInfo,
        entity: &dyn Entity,
        row: &RowInfo,
        linked: &HashSet<String>,
    ) -> Result<Vec<ValidationErrorInfo>, CoreError> {
        let mut errors = Vec::new();
        self.validate_level(&db_set.fields, entity, row, linked, &mut errors)?;
        Ok(errors)
    }

    fn validate_level(
        &self,
        fields: &[Field],
        entity: &dyn Entity,
        row: &RowInfo,
        linked: &HashSet<String>,
        errors: &mut Vec<ValidationErrorInfo>,
    ) -> Result<(), CoreError> {
        for field in row_fields(fields) {
            if field.kind == FieldKind::ServerCalculated {
                continue;
            }
            if field.is_object() {
                self.validate_level(&field.nested, entity, row, linked, errors)?;
                continue;
            }
            let checked = match row.change_type {
                ChangeType::Added => !field.is_auto_generated && !linked.contains(&field.full_name),
                ChangeType::Updated => row
                    .find_value(&field.full_name)
                    .is_some_and(|v| v.is_changed()),
                ChangeType::Deleted | ChangeType::None => false,
            };
            if !checked {
                continue;
            }
            let value = get_path(entity, &field.full_name).unwrap_or(Value::Null);
            if let Some(message) = self.check_value(field, &value)? {
                errors.push(ValidationErrorInfo::field(field.full_name.clone(), message));
            }
        }
        Ok(())
    }

    /// Checks one value against its field's constraints.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidMetadata`] for malformed constraints.
    pub fn check_value(&self, field: &Field, value: &Value) -> Result<Option<String>, CoreError> {
        let name = &field.full_name;
        let missing = match value {
            Value::Null => true,
            Value::String(s) => s.is_empty() && field.data_type == DataType::String,
            _ => false,
        };
        if missing {
            return Ok((!field.is_nullable).then(|| format!("'{name}' is required")));
        }

        if let Value::String(s) = value {
            if let Some(max) = field.max_length {
                if s.chars().count() > max {
                    return Ok(Some(format!("'{name}' exceeds the maximum length of {max}")));
                }
            }
            if let Some(pattern) = &field.regex {
                if !self.pattern(pattern)?.is_match(s) {
                    return Ok(Some(format!("'{name}' has an invalid format")));
                }
            }
        }

        if let Some(range) = &field.range {
            if !in_range(field, range, value)? {
                return Ok(Some(format!("'{name}' must be within [{range}]")));
            }
        }
        Ok(None)
    }

    fn pattern(&self, pattern: &str) -> Result<Regex, CoreError> {
        if let Some(re) = self.patterns.get(pattern) {
            return Ok(re.clone());
        }
        let re = Regex::new(pattern)
            .map_err(|e| CoreError::InvalidMetadata(format!("invalid regex '{pattern}': {e}")))?;
        self.patterns.insert(pattern.to_string(), re.clone());
        Ok(re)
    }
}

// ---------------------------------------------------------------------------
// Range
// ---------------------------------------------------------------------------

fn in_range(field: &Field, range: &str, value: &Value) -> Result<bool, CoreError> {
    let (min, max) = range.split_once(',').ok_or_else(|| bad_range(field, range))?;
    let (min, max) = (min.trim(), max.trim());
    match value {
        Value::Int(_) | Value::Decimal(_) | Value::Float(_) => {
            let current = numeric(value).ok_or_else(|| bad_range(field, range))?;
            let parse = |s: &str| s.parse::<Decimal>().map_err(|_| bad_range(field, range));
            Ok(within(current, bound(min, parse)?, bound(max, parse)?))
        }
        Value::DateTime(current) => {
            let parse = |s: &str| parse_date(s).ok_or_else(|| bad_range(field, range));
            Ok(within(*current, bound(min, parse)?, bound(max, parse)?))
        }
        // Range has no meaning for other values.
        _ => Ok(true),
    }
}

fn bound<T>(text: &str, parse: impl Fn(&str) -> Result<T, CoreError>) -> Result<Option<T>, CoreError> {
    if text.is_empty() {
        Ok(None)
    } else {
        parse(text).map(Some)
    }
}

fn within<T: PartialOrd>(value: T, min: Option<T>, max: Option<T>) -> bool {
    min.map_or(true, |m| value >= m) && max.map_or(true, |m| value <= m)
}

fn numeric(value: &Value) -> Option<Decimal> {
    match value {
        Value::Int(v) => Some(Decimal::from(*v)),
        Value::Decimal(v) => Some(*v),
        Value::Float(v) => Decimal::try_from(*v).ok(),
        _ => None,
    }
}

fn parse_date(text: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

fn bad_range(field: &Field, range: &str) -> CoreError {
    CoreError::InvalidMetadata(format!("invalid range '{range}' on field '{}'", field.full_name))
}

#[cfg(test)]
mod tests {
    use rowsync_core::entity::DynamicEntity;
    use rowsync_core::messages::ValueChange;
    use rowsync_core::metadata::ServiceMetadata;

    use super::*;

    fn set() -> std::sync::Arc<DbSetInfo> {
        let meta = ServiceMetadata::builder()
            .db_set(
                DbSetInfo::new("Customer", "Customer")
                    .field(Field::new("CustomerId", DataType::Integer).primary_key(1).auto_generated())
                    .field(Field::new("Name", DataType::String).required().max_length(5))
                    .field(Field::new("Email", DataType::String).regex(r"^[^@]+@[^@]+$"))
                    .field(Field::new("Age", DataType::Integer).range("0,130"))
                    .field(Field::new("Since", DataType::DateTime).range("2000-01-01,"))
                    .field(Field::new("ParentId", DataType::Integer).required()),
            )
            .build()
            .unwrap();
        std::sync::Arc::clone(meta.db_set("Customer").unwrap())
    }

    fn field_names(errors: &[ValidationErrorInfo]) -> Vec<&str> {
        errors.iter().filter_map(|e| e.field_name.as_deref()).collect()
    }

    #[test]
    fn insert_requires_non_nullable_fields() {
        let set = set();
        let entity = DynamicEntity::new("Customer").with("Name", Value::Null);
        let row = RowInfo::new(ChangeType::Added, "c1");
        let linked = HashSet::from(["ParentId".to_string()]);
        let errors = FieldValidator::new()
            .validate_row(&set, &entity, &row, &linked)
            .unwrap();
        // CustomerId is generated, ParentId comes from the parent row.
        assert_eq!(field_names(&errors), vec!["Name"]);
        assert!(errors[0].message.contains("required"));
    }

    #[test]
    fn update_checks_only_changed_fields() {
        let set = set();
        let entity = DynamicEntity::new("Customer")
            .with("Name", "far too long")
            .with("Age", 200_i64);
        let row = RowInfo::new(ChangeType::Updated, "1").value(ValueChange::changed("Age", Some("200")));
        let errors = FieldValidator::new()
            .validate_row(&set, &entity, &row, &HashSet::new())
            .unwrap();
        assert_eq!(field_names(&errors), vec!["Age"]);
    }

    #[test]
    fn length_regex_and_ranges() {
        let set = set();
        let v = FieldValidator::new();
        let name = set.find_field("Name").unwrap();
        assert!(v.check_value(name, &Value::from("Ann")).unwrap().is_none());
        assert!(v.check_value(name, &Value::from("Annabel")).unwrap().is_some());
        assert!(v.check_value(name, &Value::from("")).unwrap().is_some());

        let email = set.find_field("Email").unwrap();
        assert!(v.check_value(email, &Value::from("a@b")).unwrap().is_none());
        assert!(v.check_value(email, &Value::from("nope")).unwrap().is_some());
        assert!(v.check_value(email, &Value::Null).unwrap().is_none());

        let since = set.find_field("Since").unwrap();
        let old = NaiveDate::from_ymd_opt(1999, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
        assert!(v.check_value(since, &Value::DateTime(old)).unwrap().is_some());
    }

    #[test]
    fn malformed_constraint_is_an_error() {
        let v = FieldValidator::new();
        let bad = Field::new("X", DataType::String).regex("(");
        assert!(matches!(
            v.check_value(&bad, &Value::from("x")),
            Err(CoreError::InvalidMetadata(_))
        ));
        let bad_range = Field::new("Y", DataType::Integer).range("abc");
        assert!(v.check_value(&bad_range, &Value::Int(1)).is_err());
    }
}
