use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::column::PgDataType;

/// A single field value carried by a metric.
///
/// This is the closed set of value types the engine stores; anything else
/// must be converted by the producer before it reaches the sink.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum FieldValue {
    Bool(bool),
    I64(i64),
    U64(u64),
    F64(f64),
    Str(String),
    Timestamp(DateTime<Utc>),
}

impl FieldValue {
    /// The column type a freshly seen value of this variant creates.
    ///
    /// u64 maps to `numeric`: `bigint` cannot hold the upper half of the
    /// range and silently wrapping it is not an option.
    pub fn infer_type(&self) -> PgDataType {
        match self {
            FieldValue::Bool(_) => PgDataType::Bool,
            FieldValue::I64(_) => PgDataType::Int8,
            FieldValue::U64(_) => PgDataType::Numeric,
            FieldValue::F64(_) => PgDataType::Float8,
            FieldValue::Str(_) => PgDataType::Text,
            FieldValue::Timestamp(_) => PgDataType::TimestampTz,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            FieldValue::Bool(_) => "bool",
            FieldValue::I64(_) => "i64",
            FieldValue::U64(_) => "u64",
            FieldValue::F64(_) => "f64",
            FieldValue::Str(_) => "string",
            FieldValue::Timestamp(_) => "timestamp",
        }
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::I64(v)
    }
}

impl From<u64> for FieldValue {
    fn from(v: u64) -> Self {
        FieldValue::U64(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::F64(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Str(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Str(v)
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(v: DateTime<Utc>) -> Self {
        FieldValue::Timestamp(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infer_type() {
        assert_eq!(FieldValue::Bool(true).infer_type(), PgDataType::Bool);
        assert_eq!(FieldValue::I64(-1).infer_type(), PgDataType::Int8);
        assert_eq!(FieldValue::U64(u64::MAX).infer_type(), PgDataType::Numeric);
        assert_eq!(FieldValue::F64(0.5).infer_type(), PgDataType::Float8);
        assert_eq!(
            FieldValue::Str("x".to_string()).infer_type(),
            PgDataType::Text
        );
    }
}
