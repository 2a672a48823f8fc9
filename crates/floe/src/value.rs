//! Typed cell values, rows and primary keys.

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::error::RowError;
use crate::schema::DataType;

/// A single cell value.
///
/// Floating point values compare and hash by bit pattern so that they can
/// take part in primary keys and partition keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Null,
    Boolean(bool),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Utf8(String),
    /// Days since the Unix epoch.
    Date32(i32),
    /// Microseconds since the Unix epoch, UTC.
    Timestamp(i64),
}

/// An ordered sequence of values matching the table's columns.
pub type Row = Vec<Value>;

impl Value {
    /// The type of this value, or `None` for `Null`.
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Value::Null => None,
            Value::Boolean(_) => Some(DataType::Boolean),
            Value::Int16(_) => Some(DataType::Int16),
            Value::Int32(_) => Some(DataType::Int32),
            Value::Int64(_) => Some(DataType::Int64),
            Value::Float32(_) => Some(DataType::Float32),
            Value::Float64(_) => Some(DataType::Float64),
            Value::Utf8(_) => Some(DataType::Utf8),
            Value::Date32(_) => Some(DataType::Date32),
            Value::Timestamp(_) => Some(DataType::Timestamp),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    fn type_name(&self) -> String {
        self.data_type()
            .map(|dt| dt.to_string())
            .unwrap_or_else(|| "null".to_string())
    }

    /// Convert a JSON value into a value of the given column type.
    pub fn from_json(
        json: &serde_json::Value,
        data_type: DataType,
        column: &str,
    ) -> Result<Value, RowError> {
        use serde_json::Value as Json;

        let invalid = |message: String| RowError::JsonValue {
            column: column.to_string(),
            message,
        };
        let integer = |json: &Json| {
            json.as_i64()
                .ok_or_else(|| invalid(format!("expected an integer, got {json}")))
        };

        if json.is_null() {
            return Ok(Value::Null);
        }

        let value = match data_type {
            DataType::Boolean => Value::Boolean(
                json.as_bool()
                    .ok_or_else(|| invalid(format!("expected a boolean, got {json}")))?,
            ),
            DataType::Int16 => Value::Int16(
                i16::try_from(integer(json)?).map_err(|e| invalid(e.to_string()))?,
            ),
            DataType::Int32 => Value::Int32(
                i32::try_from(integer(json)?).map_err(|e| invalid(e.to_string()))?,
            ),
            DataType::Int64 => Value::Int64(integer(json)?),
            DataType::Float32 | DataType::Float64 => {
                let float = json
                    .as_f64()
                    .ok_or_else(|| invalid(format!("expected a number, got {json}")))?;
                if data_type == DataType::Float32 {
                    let narrowed = float as f32;
                    if narrowed.is_infinite() && float.is_finite() {
                        return Err(invalid(format!("{float} is out of range for float32")));
                    }
                    Value::Float32(narrowed)
                } else {
                    Value::Float64(float)
                }
            }
            DataType::Utf8 => Value::Utf8(
                json.as_str()
                    .ok_or_else(|| invalid(format!("expected a string, got {json}")))?
                    .to_string(),
            ),
            DataType::Date32 => match json {
                Json::String(text) => {
                    let date = NaiveDate::parse_from_str(text, "%Y-%m-%d")
                        .map_err(|e| invalid(format!("invalid date '{text}': {e}")))?;
                    let days = date
                        .signed_duration_since(DateTime::UNIX_EPOCH.date_naive())
                        .num_days();
                    Value::Date32(i32::try_from(days).map_err(|e| invalid(e.to_string()))?)
                }
                _ => Value::Date32(
                    i32::try_from(integer(json)?).map_err(|e| invalid(e.to_string()))?,
                ),
            },
            DataType::Timestamp => match json {
                Json::String(text) => {
                    let ts = DateTime::parse_from_rfc3339(text)
                        .map_err(|e| invalid(format!("invalid timestamp '{text}': {e}")))?;
                    Value::Timestamp(ts.timestamp_micros())
                }
                _ => Value::Timestamp(integer(json)?),
            },
        };
        Ok(value)
    }

    /// Render this value as JSON. Dates and timestamps become ISO-8601 strings.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;

        match self {
            Value::Null => Json::Null,
            Value::Boolean(v) => Json::Bool(*v),
            Value::Int16(v) => Json::from(*v),
            Value::Int32(v) => Json::from(*v),
            Value::Int64(v) => Json::from(*v),
            Value::Float32(v) => serde_json::Number::from_f64(f64::from(*v))
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Value::Float64(v) => serde_json::Number::from_f64(*v)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Value::Utf8(_) | Value::Date32(_) | Value::Timestamp(_) => {
                Json::String(self.to_string())
            }
        }
    }

    /// Check that this value may be stored in a column of `data_type`.
    pub(crate) fn check_type(&self, data_type: DataType, column: &str) -> Result<(), RowError> {
        match self.data_type() {
            None => Ok(()),
            Some(actual) if actual == data_type => Ok(()),
            Some(_) => Err(RowError::TypeMismatch {
                column: column.to_string(),
                expected: data_type,
                actual: self.type_name(),
            }),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Int16(a), Value::Int16(b)) => a == b,
            (Value::Int32(a), Value::Int32(b)) => a == b,
            (Value::Int64(a), Value::Int64(b)) => a == b,
            (Value::Float32(a), Value::Float32(b)) => a.to_bits() == b.to_bits(),
            (Value::Float64(a), Value::Float64(b)) => a.to_bits() == b.to_bits(),
            (Value::Utf8(a), Value::Utf8(b)) => a == b,
            (Value::Date32(a), Value::Date32(b)) => a == b,
            (Value::Timestamp(a), Value::Timestamp(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Null => {}
            Value::Boolean(v) => v.hash(state),
            Value::Int16(v) => v.hash(state),
            Value::Int32(v) | Value::Date32(v) => v.hash(state),
            Value::Int64(v) | Value::Timestamp(v) => v.hash(state),
            Value::Float32(v) => v.to_bits().hash(state),
            Value::Float64(v) => v.to_bits().hash(state),
            Value::Utf8(v) => v.hash(state),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Boolean(v) => write!(f, "{v}"),
            Value::Int16(v) => write!(f, "{v}"),
            Value::Int32(v) => write!(f, "{v}"),
            Value::Int64(v) => write!(f, "{v}"),
            Value::Float32(v) => write!(f, "{v}"),
            Value::Float64(v) => write!(f, "{v}"),
            Value::Utf8(v) => write!(f, "{v}"),
            Value::Date32(days) => {
                match DateTime::from_timestamp(i64::from(*days) * 86_400, 0) {
                    Some(dt) => write!(f, "{}", dt.date_naive().format("%Y-%m-%d")),
                    None => write!(f, "{days}"),
                }
            }
            Value::Timestamp(micros) => match DateTime::<Utc>::from_timestamp_micros(*micros) {
                Some(dt) => write!(f, "{}", dt.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
                None => write!(f, "{micros}"),
            },
        }
    }
}

/// The projection of a row onto the primary-key columns, in key order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PrimaryKey(Vec<Value>);

impl PrimaryKey {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    pub fn values(&self) -> &[Value] {
        &self.0
    }

    /// The key as a row of the primary-key projection schema.
    pub fn into_row(self) -> Row {
        self.0
    }
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, value) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{value}")?;
        }
        write!(f, ")")
    }
}
