use super::field::FieldType;
use crate::errors::{ErrorKind, GpkgError, GpkgResult};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, SecondsFormat};
use rusqlite::types::{ToSqlOutput, Value as SqlValue, ValueRef};
use rusqlite::ToSql;
use std::fmt::{Display, Formatter};

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Value of one attribute field.
///
/// Each non-null variant corresponds to one [`FieldType`]. Dates are stored as
/// ISO-8601 text and parsed back with `chrono`.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum FieldValue {
    #[default]
    Null,
    Integer(i32),
    Integer64(i64),
    Real(f64),
    String(String),
    Binary(Vec<u8>),
    Boolean(bool),
    Date(NaiveDate),
    DateTime(DateTime<FixedOffset>),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Integer(v) => Some(*v as i64),
            FieldValue::Integer64(v) => Some(*v),
            FieldValue::Boolean(v) => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Real(v) => Some(*v),
            FieldValue::Integer(v) => Some(*v as f64),
            FieldValue::Integer64(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(v) => Some(v),
            _ => None,
        }
    }

    /// Whether this value may be stored in a column of `field_type`.
    pub fn matches(&self, field_type: FieldType) -> bool {
        matches!(
            (self, field_type),
            (FieldValue::Null, _)
                | (FieldValue::Integer(_), FieldType::Integer)
                | (FieldValue::Integer(_), FieldType::Integer64)
                | (FieldValue::Integer64(_), FieldType::Integer64)
                | (FieldValue::Real(_), FieldType::Real)
                | (FieldValue::String(_), FieldType::String)
                | (FieldValue::Binary(_), FieldType::Binary)
                | (FieldValue::Boolean(_), FieldType::Boolean)
                | (FieldValue::Date(_), FieldType::Date)
                | (FieldValue::DateTime(_), FieldType::DateTime)
        )
    }

    /// Converts a raw SQLite value of a column declared as `field_type`.
    pub fn from_sql(value: ValueRef<'_>, field_type: FieldType) -> GpkgResult<FieldValue> {
        if let ValueRef::Null = value {
            return Ok(FieldValue::Null);
        }
        let converted = match field_type {
            FieldType::Integer => {
                let v = value.as_i64()?;
                let v = i32::try_from(v).map_err(|_| {
                    GpkgError::new(
                        &format!("Value {} does not fit a 32-bit integer field", v),
                        ErrorKind::ReadError,
                    )
                })?;
                FieldValue::Integer(v)
            }
            FieldType::Integer64 => FieldValue::Integer64(value.as_i64()?),
            FieldType::Real => match value {
                ValueRef::Integer(v) => FieldValue::Real(v as f64),
                other => FieldValue::Real(other.as_f64()?),
            },
            FieldType::String => match value {
                ValueRef::Integer(v) => FieldValue::String(v.to_string()),
                ValueRef::Real(v) => FieldValue::String(v.to_string()),
                other => FieldValue::String(other.as_str()?.to_string()),
            },
            FieldType::Binary => match value {
                ValueRef::Text(v) => FieldValue::Binary(v.to_vec()),
                other => FieldValue::Binary(other.as_blob()?.to_vec()),
            },
            FieldType::Boolean => FieldValue::Boolean(value.as_i64()? != 0),
            FieldType::Date => FieldValue::Date(parse_date(value.as_str()?)?),
            FieldType::DateTime => FieldValue::DateTime(parse_datetime(value.as_str()?)?),
        };
        Ok(converted)
    }
}

/// Parses `YYYY-MM-DD`, tolerating a trailing time part.
pub(crate) fn parse_date(text: &str) -> GpkgResult<NaiveDate> {
    let head = text.get(0..10).unwrap_or(text);
    NaiveDate::parse_from_str(head, DATE_FORMAT).map_err(|e| {
        GpkgError::new(
            &format!("Invalid date '{}': {}", text, e),
            ErrorKind::ReadError,
        )
    })
}

/// Parses RFC 3339 text. Values without an offset are taken as UTC.
pub(crate) fn parse_datetime(text: &str) -> GpkgResult<DateTime<FixedOffset>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Ok(dt);
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Ok(naive.and_utc().fixed_offset());
        }
    }
    Err(GpkgError::new(
        &format!("Invalid datetime '{}'", text),
        ErrorKind::ReadError,
    ))
}

pub(crate) fn format_datetime(value: &DateTime<FixedOffset>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl ToSql for FieldValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        let output = match self {
            FieldValue::Null => ToSqlOutput::Owned(SqlValue::Null),
            FieldValue::Integer(v) => ToSqlOutput::Owned(SqlValue::Integer(*v as i64)),
            FieldValue::Integer64(v) => ToSqlOutput::Owned(SqlValue::Integer(*v)),
            FieldValue::Real(v) => ToSqlOutput::Owned(SqlValue::Real(*v)),
            FieldValue::String(v) => ToSqlOutput::Borrowed(ValueRef::Text(v.as_bytes())),
            FieldValue::Binary(v) => ToSqlOutput::Borrowed(ValueRef::Blob(v)),
            FieldValue::Boolean(v) => ToSqlOutput::Owned(SqlValue::Integer(*v as i64)),
            FieldValue::Date(v) => {
                ToSqlOutput::Owned(SqlValue::Text(v.format(DATE_FORMAT).to_string()))
            }
            FieldValue::DateTime(v) => ToSqlOutput::Owned(SqlValue::Text(format_datetime(v))),
        };
        Ok(output)
    }
}

impl Display for FieldValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldValue::Null => write!(f, "NULL"),
            FieldValue::Integer(v) => write!(f, "{}", v),
            FieldValue::Integer64(v) => write!(f, "{}", v),
            FieldValue::Real(v) => write!(f, "{}", v),
            FieldValue::String(v) => write!(f, "{}", v),
            FieldValue::Binary(v) => write!(f, "<{} bytes>", v.len()),
            FieldValue::Boolean(v) => write!(f, "{}", v),
            FieldValue::Date(v) => write!(f, "{}", v.format(DATE_FORMAT)),
            FieldValue::DateTime(v) => write!(f, "{}", format_datetime(v)),
        }
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        FieldValue::Integer(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Integer64(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Real(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::String(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::String(v)
    }
}

impl From<Vec<u8>> for FieldValue {
    fn from(v: Vec<u8>) -> Self {
        FieldValue::Binary(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Boolean(v)
    }
}

impl From<NaiveDate> for FieldValue {
    fn from(v: NaiveDate) -> Self {
        FieldValue::Date(v)
    }
}

impl From<DateTime<FixedOffset>> for FieldValue {
    fn from(v: DateTime<FixedOffset>) -> Self {
        FieldValue::DateTime(v)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(FieldValue::Null)
    }
}
