//! Argument and return values carried by calls.
//!
//! Every value crossing the process boundary is a [`Value`]. Hosted operations pull typed
//! arguments out with [`FromValue`]; callers build arguments with the `From` conversions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A dynamically typed value on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    #[serde(with = "float")]
    Float(f64),
    String(String),
    DateTime(DateTime<Utc>),
    List(Vec<Value>),
}

/// Finite floats travel as numbers, non-finite ones as `"NaN"`, `"inf"` or `"-inf"`.
mod float {
    use std::fmt;

    use serde::de::{self, Unexpected, Visitor};
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if v.is_finite() {
            serializer.serialize_f64(*v)
        } else if v.is_nan() {
            serializer.serialize_str("NaN")
        } else if v.is_sign_positive() {
            serializer.serialize_str("inf")
        } else {
            serializer.serialize_str("-inf")
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        deserializer.deserialize_any(FloatVisitor)
    }

    struct FloatVisitor;

    impl Visitor<'_> for FloatVisitor {
        type Value = f64;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a number, \"NaN\", \"inf\" or \"-inf\"")
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> Result<f64, E> {
            Ok(v)
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<f64, E> {
            Ok(v as f64)
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<f64, E> {
            Ok(v as f64)
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<f64, E> {
            match v {
                "NaN" => Ok(f64::NAN),
                "inf" => Ok(f64::INFINITY),
                "-inf" => Ok(f64::NEG_INFINITY),
                other => Err(E::invalid_value(Unexpected::Str(other), &self)),
            }
        }
    }
}

impl Value {
    /// Short type name used in mismatch diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::DateTime(_) => "datetime",
            Self::List(_) => "list",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Self::DateTime(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Self::List(v.into_iter().map(Into::into).collect())
    }
}

/// A value did not have the shape the receiver asked for.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("expected {expected}, got {found}")]
pub struct ValueTypeError {
    pub expected: &'static str,
    pub found: &'static str,
}

impl ValueTypeError {
    fn new(expected: &'static str, found: &Value) -> Self {
        Self {
            expected,
            found: found.kind(),
        }
    }
}

/// Conversion out of a [`Value`].
pub trait FromValue: Sized {
    /// Type name reported when the conversion fails.
    const EXPECTED: &'static str;

    fn from_value(value: Value) -> Result<Self, ValueTypeError>;
}

impl FromValue for Value {
    const EXPECTED: &'static str = "any";

    fn from_value(value: Value) -> Result<Self, ValueTypeError> {
        Ok(value)
    }
}

impl FromValue for String {
    const EXPECTED: &'static str = "string";

    fn from_value(value: Value) -> Result<Self, ValueTypeError> {
        match value {
            Value::String(s) => Ok(s),
            other => Err(ValueTypeError::new(Self::EXPECTED, &other)),
        }
    }
}

impl FromValue for i64 {
    const EXPECTED: &'static str = "int";

    fn from_value(value: Value) -> Result<Self, ValueTypeError> {
        match value {
            Value::Int(i) => Ok(i),
            other => Err(ValueTypeError::new(Self::EXPECTED, &other)),
        }
    }
}

impl FromValue for i32 {
    const EXPECTED: &'static str = "int32";

    fn from_value(value: Value) -> Result<Self, ValueTypeError> {
        match value {
            Value::Int(i) => i32::try_from(i).map_err(|_| ValueTypeError {
                expected: Self::EXPECTED,
                found: "int out of range",
            }),
            other => Err(ValueTypeError::new(Self::EXPECTED, &other)),
        }
    }
}

impl FromValue for bool {
    const EXPECTED: &'static str = "bool";

    fn from_value(value: Value) -> Result<Self, ValueTypeError> {
        match value {
            Value::Bool(b) => Ok(b),
            other => Err(ValueTypeError::new(Self::EXPECTED, &other)),
        }
    }
}

impl FromValue for f64 {
    const EXPECTED: &'static str = "float";

    fn from_value(value: Value) -> Result<Self, ValueTypeError> {
        match value {
            Value::Float(f) => Ok(f),
            Value::Int(i) => Ok(i as f64),
            other => Err(ValueTypeError::new(Self::EXPECTED, &other)),
        }
    }
}

impl FromValue for DateTime<Utc> {
    const EXPECTED: &'static str = "datetime";

    fn from_value(value: Value) -> Result<Self, ValueTypeError> {
        match value {
            Value::DateTime(d) => Ok(d),
            other => Err(ValueTypeError::new(Self::EXPECTED, &other)),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    const EXPECTED: &'static str = T::EXPECTED;

    fn from_value(value: Value) -> Result<Self, ValueTypeError> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

impl<T: FromValue> FromValue for Vec<T> {
    const EXPECTED: &'static str = "list";

    fn from_value(value: Value) -> Result<Self, ValueTypeError> {
        match value {
            Value::List(items) => items.into_iter().map(T::from_value).collect(),
            other => Err(ValueTypeError::new(Self::EXPECTED, &other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn option_maps_none_to_null() {
        let none: Option<i64> = None;
        assert_eq!(Value::from(none), Value::Null);
        assert_eq!(Value::from(Some(7i64)), Value::Int(7));
    }

    #[test]
    fn null_converts_to_none() {
        let v: Option<String> = FromValue::from_value(Value::Null).unwrap();
        assert_eq!(v, None);

        let v: Option<String> = FromValue::from_value(Value::from("x")).unwrap();
        assert_eq!(v.as_deref(), Some("x"));
    }

    #[test]
    fn mismatch_reports_both_types() {
        let err = String::from_value(Value::Int(1)).unwrap_err();
        assert_eq!(err.expected, "string");
        assert_eq!(err.found, "int");
        assert_eq!(err.to_string(), "expected string, got int");
    }

    #[test]
    fn i32_rejects_out_of_range() {
        assert_eq!(i32::from_value(Value::Int(42)).unwrap(), 42);
        assert!(i32::from_value(Value::Int(i64::MAX)).is_err());
    }

    #[test]
    fn float_accepts_int() {
        assert_eq!(f64::from_value(Value::Int(3)).unwrap(), 3.0);
    }

    #[test]
    fn datetime_converts() {
        let ts = Utc.with_ymd_and_hms(2024, 2, 29, 12, 30, 0).unwrap();
        assert_eq!(DateTime::<Utc>::from_value(Value::from(ts)).unwrap(), ts);
    }

    #[test]
    fn list_converts_elementwise() {
        let v = Value::from(vec![1i64, 2, 3]);
        assert_eq!(Vec::<i64>::from_value(v).unwrap(), vec![1, 2, 3]);

        let mixed = Value::List(vec![Value::Int(1), Value::from("two")]);
        assert!(Vec::<i64>::from_value(mixed).is_err());
    }
}
