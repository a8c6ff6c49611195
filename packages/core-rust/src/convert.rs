//! Table-driven conversion between native [`Value`]s and their wire strings.
//!
//! | data type        | wire form                                   |
//! |------------------|---------------------------------------------|
//! | bool             | `true` / `false`                            |
//! | date, datetime   | `YYYY-MM-DDTHH:MM:SS.mmmZ` (UTC)            |
//! | time             | `1970-01-01THH:MM:SS.mmmZ`                  |
//! | guid             | lowercase hyphenated                        |
//! | binary           | `[1,2,3]`                                   |
//! | integer, decimal, float | culture-invariant decimal text       |
//! | string           | passthrough                                 |
//!
//! Null is always `None` on the wire.

use std::str::FromStr;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Offset, TimeZone, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::CoreError;
use crate::metadata::{DataType, DateConversion, Field};
use crate::types::Value;

/// Output format of date and time values.
pub const DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// Field-level value conversion. Override to customise formats per service.
pub trait ValueConverter: Send + Sync {
    /// Converts a native value to its wire string. Null becomes `None`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Conversion`] when the value does not match the
    /// field's data type.
    fn serialize(&self, field: &Field, value: &Value) -> Result<Option<String>, CoreError>;

    /// Parses a wire string into a native value. `None` becomes `Value::Null`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Conversion`] when the text cannot be parsed.
    fn deserialize(&self, field: &Field, text: Option<&str>) -> Result<Value, CoreError>;
}

/// Standard converter. Server-local date values are shifted by
/// `server_offset` when a field uses
/// [`DateConversion::ServerLocalToClientLocal`].
#[derive(Debug, Clone, Copy)]
pub struct DefaultValueConverter {
    server_offset: FixedOffset,
}

impl DefaultValueConverter {
    #[must_use]
    pub fn new(server_offset: FixedOffset) -> Self {
        Self { server_offset }
    }

    /// Converter for a server running in UTC.
    #[must_use]
    pub fn utc() -> Self {
        Self::new(Utc.fix())
    }

    fn date_to_wire(&self, field: &Field, value: NaiveDateTime) -> Result<String, CoreError> {
        let utc = match field.date_conversion {
            DateConversion::ServerLocalToClientLocal => self
                .server_offset
                .from_local_datetime(&value)
                .single()
                .ok_or_else(|| CoreError::conversion(&field.full_name, "ambiguous local time"))?
                .naive_utc(),
            DateConversion::None | DateConversion::UtcToClientLocal => value,
        };
        Ok(utc.format(DATE_FORMAT).to_string())
    }

    fn date_from_wire(&self, field: &Field, text: &str) -> Result<NaiveDateTime, CoreError> {
        let utc = parse_utc(text)
            .ok_or_else(|| CoreError::conversion(&field.full_name, format!("invalid date '{text}'")))?;
        Ok(match field.date_conversion {
            DateConversion::ServerLocalToClientLocal => Utc
                .from_utc_datetime(&utc)
                .with_timezone(&self.server_offset)
                .naive_local(),
            DateConversion::None | DateConversion::UtcToClientLocal => utc,
        })
    }
}

impl Default for DefaultValueConverter {
    fn default() -> Self {
        Self::utc()
    }
}

fn parse_utc(text: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.naive_utc());
    }
    NaiveDateTime::parse_from_str(text.trim_end_matches('Z'), "%Y-%m-%dT%H:%M:%S%.f").ok()
}

fn epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default()
}

fn mismatch(field: &Field, value: &Value) -> CoreError {
    CoreError::conversion(
        &field.full_name,
        format!("{} value for {:?} field", value.type_name(), field.data_type),
    )
}

impl ValueConverter for DefaultValueConverter {
    fn serialize(&self, field: &Field, value: &Value) -> Result<Option<String>, CoreError> {
        if value.is_null() {
            return Ok(None);
        }
        let text = match (field.data_type, value) {
            (DataType::String, Value::String(s)) => s.clone(),
            (DataType::Bool, Value::Bool(b)) => b.to_string(),
            (DataType::Integer, Value::Int(n)) => n.to_string(),
            (DataType::Decimal, Value::Decimal(d)) => d.to_string(),
            (DataType::Decimal | DataType::Float, Value::Int(n)) => n.to_string(),
            (DataType::Float, Value::Float(f)) => f.to_string(),
            (DataType::DateTime | DataType::Date, Value::DateTime(dt)) => {
                self.date_to_wire(field, *dt)?
            }
            (DataType::Time, Value::Time(t)) => epoch().and_time(*t).format(DATE_FORMAT).to_string(),
            (DataType::Guid, Value::Guid(g)) => g.hyphenated().to_string(),
            (DataType::Binary, Value::Bytes(bytes)) => {
                let items: Vec<String> = bytes.iter().map(u8::to_string).collect();
                format!("[{}]", items.join(","))
            }
            _ => return Err(mismatch(field, value)),
        };
        Ok(Some(text))
    }

    fn deserialize(&self, field: &Field, text: Option<&str>) -> Result<Value, CoreError> {
        let Some(text) = text else {
            return Ok(Value::Null);
        };
        let bad = |what: &str| CoreError::conversion(&field.full_name, format!("invalid {what} '{text}'"));
        let value = match field.data_type {
            DataType::String => Value::String(text.to_string()),
            DataType::Bool => match text.to_ascii_lowercase().as_str() {
                "true" => Value::Bool(true),
                "false" => Value::Bool(false),
                _ => return Err(bad("bool")),
            },
            DataType::Integer => Value::Int(text.trim().parse().map_err(|_| bad("integer"))?),
            DataType::Decimal => Value::Decimal(
                Decimal::from_str(text.trim())
                    .or_else(|_| Decimal::from_scientific(text.trim()))
                    .map_err(|_| bad("decimal"))?,
            ),
            DataType::Float => Value::Float(text.trim().parse().map_err(|_| bad("float"))?),
            DataType::DateTime | DataType::Date => Value::DateTime(self.date_from_wire(field, text)?),
            DataType::Time => Value::Time(parse_time(text).ok_or_else(|| bad("time"))?),
            DataType::Guid => Value::Guid(Uuid::parse_str(text.trim()).map_err(|_| bad("guid"))?),
            DataType::Binary => Value::Bytes(parse_bytes(text).ok_or_else(|| bad("binary"))?),
            DataType::None => {
                return Err(CoreError::conversion(
                    &field.full_name,
                    "field has no scalar data type",
                ))
            }
        };
        Ok(value)
    }
}

fn parse_time(text: &str) -> Option<NaiveTime> {
    parse_utc(text)
        .map(|dt| dt.time())
        .or_else(|| NaiveTime::parse_from_str(text, "%H:%M:%S%.f").ok())
}

fn parse_bytes(text: &str) -> Option<Vec<u8>> {
    let inner = text.trim().strip_prefix('[')?.strip_suffix(']')?.trim();
    if inner.is_empty() {
        return Some(Vec::new());
    }
    inner
        .split(',')
        .map(|part| part.trim().parse::<u8>().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(data_type: DataType) -> Field {
        Field::new("F", data_type)
    }

    fn round_trip(conv: &DefaultValueConverter, f: &Field, value: Value) -> (Option<String>, Value) {
        let text = conv.serialize(f, &value).unwrap();
        let back = conv.deserialize(f, text.as_deref()).unwrap();
        (text, back)
    }

    #[test]
    fn scalars_use_invariant_text() {
        let conv = DefaultValueConverter::utc();
        assert_eq!(
            conv.serialize(&field(DataType::Bool), &Value::Bool(true)).unwrap(),
            Some("true".into())
        );
        assert_eq!(
            conv.serialize(&field(DataType::Decimal), &Value::Decimal(Decimal::new(12_345, 2)))
                .unwrap(),
            Some("123.45".into())
        );
        assert_eq!(
            conv.serialize(&field(DataType::Binary), &Value::Bytes(vec![1, 2, 255]))
                .unwrap(),
            Some("[1,2,255]".into())
        );
        assert_eq!(conv.serialize(&field(DataType::String), &Value::Null).unwrap(), None);
    }

    #[test]
    fn every_tag_round_trips() {
        let conv = DefaultValueConverter::utc();
        let dt = NaiveDate::from_ymd_opt(2024, 2, 29)
            .unwrap()
            .and_hms_milli_opt(13, 14, 15, 120)
            .unwrap();
        let cases = vec![
            (DataType::String, Value::from("héllo; world")),
            (DataType::Bool, Value::Bool(false)),
            (DataType::Integer, Value::Int(-42)),
            (DataType::Decimal, Value::Decimal(Decimal::new(-1_005, 3))),
            (DataType::Float, Value::Float(0.1)),
            (DataType::DateTime, Value::DateTime(dt)),
            (DataType::Time, Value::Time(NaiveTime::from_hms_milli_opt(8, 30, 0, 5).unwrap())),
            (DataType::Guid, Value::Guid(Uuid::new_v4())),
            (DataType::Binary, Value::Bytes(vec![])),
            (DataType::Binary, Value::Bytes(vec![0, 7, 200])),
        ];
        for (data_type, value) in cases {
            let (_, back) = round_trip(&conv, &field(data_type), value.clone());
            assert_eq!(back, value, "{data_type:?}");
        }
    }

    #[test]
    fn datetime_wire_format_has_millis_and_z() {
        let conv = DefaultValueConverter::utc();
        let dt = NaiveDate::from_ymd_opt(2023, 1, 2)
            .unwrap()
            .and_hms_opt(3, 4, 5)
            .unwrap();
        let text = conv
            .serialize(&field(DataType::DateTime), &Value::DateTime(dt))
            .unwrap();
        assert_eq!(text.as_deref(), Some("2023-01-02T03:04:05.000Z"));
    }

    #[test]
    fn server_local_dates_are_shifted_to_utc() {
        let conv = DefaultValueConverter::new(FixedOffset::east_opt(2 * 3600).unwrap());
        let f = field(DataType::DateTime).date_conversion(DateConversion::ServerLocalToClientLocal);
        let local = NaiveDate::from_ymd_opt(2023, 6, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        let (text, back) = round_trip(&conv, &f, Value::DateTime(local));
        assert_eq!(text.as_deref(), Some("2023-06-01T10:00:00.000Z"));
        assert_eq!(back, Value::DateTime(local));
    }

    #[test]
    fn type_mismatch_is_a_conversion_error() {
        let conv = DefaultValueConverter::utc();
        let err = conv
            .serialize(&field(DataType::Integer), &Value::from("x"))
            .unwrap_err();
        assert!(matches!(err, CoreError::Conversion { field, .. } if field == "F"));
    }

    #[test]
    fn malformed_text_is_rejected() {
        let conv = DefaultValueConverter::utc();
        assert!(conv.deserialize(&field(DataType::Binary), Some("1,2")).is_err());
        assert!(conv.deserialize(&field(DataType::Bool), Some("yes")).is_err());
        assert!(conv.deserialize(&field(DataType::Guid), Some("nope")).is_err());
    }
}
