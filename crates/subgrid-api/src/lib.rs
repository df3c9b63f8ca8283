use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub mod diagnosis;
pub mod entity;
pub mod query;
pub mod record;
pub mod relationship;

pub use diagnosis::{DiagnosisContext, ErrorDiagnosis, RateLimitInfo};
pub use entity::{
    pluralize, AttributeDefinition, AttributeType, EntityDefinition, EntitySchema,
    LookupAttribute, UNKNOWN_ENTITY,
};
pub use query::{
    DatasetRequest, FailureKind, OrderBy, ParentRecord, QueryDescriptor, QueryResult, RawRow,
    ServiceFailure, SortDirection, ValidationReport, SERVICE_UNAVAILABLE_MESSAGE,
};
pub use record::{ConvertedRecordSet, DatasetRecord, FieldValidation, FieldValue};
pub use relationship::{Confidence, DiscoveredRelationship, DiscoverySource};

/// Value carried by a converted record field.
///
/// Mirrors the JSON value space returned by the entity service, with integers
/// and floats kept apart so grids can format them differently.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Value {
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Array(Vec<Value>),
    Object(HashMap<String, Value>),
    Null,
}

impl Value {
    /// Create a Value from a serde_json::Value
    pub fn from_json_value(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Boolean(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Integer(i)
                } else if let Some(f) = n.as_f64() {
                    Value::Float(f)
                } else {
                    Value::String(n.to_string())
                }
            }
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(arr) => {
                Value::Array(arr.into_iter().map(Value::from_json_value).collect())
            }
            serde_json::Value::Object(obj) => Value::Object(
                obj.into_iter()
                    .map(|(k, v)| (k, Value::from_json_value(v)))
                    .collect(),
            ),
        }
    }

    pub fn as_string(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Float(f) => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Render scalar values as display text; `None` for null and composites.
    pub fn to_display_string(&self) -> Option<String> {
        match self {
            Value::String(s) => Some(s.clone()),
            Value::Integer(i) => Some(i.to_string()),
            Value::Float(f) => Some(f.to_string()),
            Value::Boolean(b) => Some(b.to_string()),
            Value::Array(_) | Value::Object(_) | Value::Null => None,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Integer(i as i64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl<T> From<Option<T>> for Value
where
    T: Into<Value>,
{
    fn from(opt: Option<T>) -> Self {
        match opt {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::from_json_value(v)
    }
}

impl From<Value> for serde_json::Value {
    fn from(v: Value) -> Self {
        match v {
            Value::String(s) => serde_json::Value::String(s),
            Value::Integer(i) => serde_json::Value::Number(serde_json::Number::from(i)),
            Value::Float(f) => serde_json::Number::from_f64(f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Boolean(b) => serde_json::Value::Bool(b),
            Value::Array(arr) => {
                serde_json::Value::Array(arr.into_iter().map(Into::into).collect())
            }
            Value::Object(obj) => {
                serde_json::Value::Object(obj.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
            Value::Null => serde_json::Value::Null,
        }
    }
}

/// Structured error types for API boundaries.
///
/// These errors are serialisable so a host UI can render them without
/// depending on the engine's internal error types.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
pub enum ApiError {
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Not found: {what}")]
    NotFound { what: String },

    #[error("Network error: {message}")]
    Network { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl From<&ServiceFailure> for ApiError {
    fn from(failure: &ServiceFailure) -> Self {
        match failure.kind {
            FailureKind::Validation => ApiError::InvalidRequest {
                message: failure.message.clone(),
            },
            FailureKind::Unavailable | FailureKind::Transport => ApiError::Network {
                message: failure.message.clone(),
            },
            FailureKind::Remote if failure.status == Some(404) => ApiError::NotFound {
                what: failure.message.clone(),
            },
            FailureKind::Remote | FailureKind::Parse => ApiError::Internal {
                message: failure.message.clone(),
            },
        }
    }
}
