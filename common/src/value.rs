use std::fmt;

use serde::{Deserialize, Serialize};

/// The type of a measurement field, fixed at field creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Float,
    Integer,
    Boolean,
    String,
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::Float => write!(f, "float"),
            FieldType::Integer => write!(f, "integer"),
            FieldType::Boolean => write!(f, "boolean"),
            FieldType::String => write!(f, "string"),
        }
    }
}

/// A single field value carried by a point.
///
/// Integer is listed before Float so that untagged deserialization maps
/// whole JSON numbers to Integer and fractional ones to Float.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Integer(i64),
    Float(f64),
    Boolean(bool),
    String(String),
}

impl FieldValue {
    pub fn field_type(&self) -> FieldType {
        match self {
            FieldValue::Integer(_) => FieldType::Integer,
            FieldValue::Float(_) => FieldType::Float,
            FieldValue::Boolean(_) => FieldType::Boolean,
            FieldValue::String(_) => FieldType::String,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Float(v) => Some(*v),
            FieldValue::Integer(v) => Some(*v as f64),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Integer(v) => write!(f, "{v}"),
            FieldValue::Float(v) => write!(f, "{v}"),
            FieldValue::Boolean(v) => write!(f, "{v}"),
            FieldValue::String(v) => write!(f, "{v}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infers_types() {
        assert_eq!(FieldValue::Integer(3).field_type(), FieldType::Integer);
        assert_eq!(FieldValue::Float(1.5).field_type(), FieldType::Float);
        assert_eq!(FieldValue::Boolean(true).field_type(), FieldType::Boolean);
        assert_eq!(
            FieldValue::String("x".into()).field_type(),
            FieldType::String
        );
    }

    #[test]
    fn untagged_json_numbers() {
        let v: FieldValue = serde_json::from_str("42").unwrap();
        assert_eq!(v, FieldValue::Integer(42));
        let v: FieldValue = serde_json::from_str("4.25").unwrap();
        assert_eq!(v, FieldValue::Float(4.25));
    }
}
