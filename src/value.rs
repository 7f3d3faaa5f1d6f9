//! Dynamic field payloads.
//!
//! The wire payload of an envelope is an unrestricted JSON object. Rather
//! than threading `serde_json::Value` everywhere, the driver-facing API
//! works with a small tagged value that mirrors the product schema's
//! scalar type alphabet (spec §3, §9 "Dynamic field payloads").

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::domain::ScalarType;
use crate::error::DriverError;

/// A field value carried by a [`crate::envelope::Envelope`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Int(i64),
    Uint(u64),
    Float(f64),
    Bool(bool),
    String(String),
    Map(HashMap<String, FieldValue>),
    List(Vec<FieldValue>),
}

impl FieldValue {
    /// Validate that this value's runtime shape matches a product's
    /// declared scalar type for a property/field.
    pub fn matches(&self, scalar: ScalarType) -> bool {
        matches!(
            (self, scalar),
            (FieldValue::Int(_), ScalarType::Int)
                | (FieldValue::Uint(_), ScalarType::Uint)
                | (FieldValue::Float(_), ScalarType::Float)
                | (FieldValue::Bool(_), ScalarType::Bool)
                | (FieldValue::String(_), ScalarType::String)
        )
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Float(f) => Some(*f),
            FieldValue::Int(i) => Some(*i as f64),
            FieldValue::Uint(u) => Some(*u as f64),
            _ => None,
        }
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<u64> for FieldValue {
    fn from(v: u64) -> Self {
        FieldValue::Uint(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::String(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::String(v.to_string())
    }
}

/// A named bag of field values, the payload carried by every envelope.
pub type Fields = HashMap<String, FieldValue>;

/// Convert a `T: Serialize` into a [`Fields`] map, the Rust analogue of the
/// original's `Struct2Map` helper (`internal/operations/operation_message.go`).
pub fn encode_fields<T: Serialize>(value: &T) -> Result<Fields, DriverError> {
    let json = serde_json::to_value(value)?;
    match json {
        serde_json::Value::Object(map) => {
            let mut fields = Fields::new();
            for (k, v) in map {
                fields.insert(k, serde_json::from_value(v)?);
            }
            Ok(fields)
        }
        other => Err(DriverError::Internal(format!(
            "cannot encode non-object value as fields: {other}"
        ))),
    }
}

/// Convert a [`Fields`] map back into a `T: DeserializeOwned`, the Rust
/// analogue of the original's `Map2Struct` helper.
pub fn decode_fields<T: serde::de::DeserializeOwned>(fields: &Fields) -> Result<T, DriverError> {
    let value = serde_json::to_value(fields)?;
    Ok(serde_json::from_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        a: i64,
        b: String,
    }

    #[test]
    fn round_trips_through_fields() {
        let sample = Sample {
            a: 42,
            b: "hi".into(),
        };
        let fields = encode_fields(&sample).unwrap();
        let back: Sample = decode_fields(&fields).unwrap();
        assert_eq!(sample, back);
    }

    #[test]
    fn matches_scalar_types() {
        assert!(FieldValue::Int(1).matches(ScalarType::Int));
        assert!(!FieldValue::Int(1).matches(ScalarType::String));
        assert!(FieldValue::String("x".into()).matches(ScalarType::String));
    }
}
