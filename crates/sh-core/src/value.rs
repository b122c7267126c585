use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Number as JsonNumber, Value as JsonValue};

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Value crossing the host/script boundary.
///
/// Plain data converts structurally in both directions. Anything the script
/// produces that has no plain-data shape (function pointers, maps holding
/// closures, custom types) comes back as a [`OpaqueHandle`] that can be
/// handed back to the same engine later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<Value>),
    Map(BTreeMap<String, Value>),
    #[serde(skip)]
    Handle(OpaqueHandle),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_string(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value.as_str()),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Self::Array(values) => Some(values.as_slice()),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Self::Map(values) => Some(values),
            _ => None,
        }
    }

    pub fn as_handle(&self) -> Option<&OpaqueHandle> {
        match self {
            Self::Handle(handle) => Some(handle),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::Array(_) => "array",
            Self::Map(_) => "map",
            Self::Handle(_) => "handle",
        }
    }

    /// JSON form of plain data. `None` when the value holds a handle or a
    /// non-finite number.
    pub fn to_json(&self) -> Option<JsonValue> {
        match self {
            Self::Null => Some(JsonValue::Null),
            Self::Bool(value) => Some(JsonValue::Bool(*value)),
            Self::Number(value) => number_to_json(*value),
            Self::String(value) => Some(JsonValue::String(value.clone())),
            Self::Array(values) => values
                .iter()
                .map(Value::to_json)
                .collect::<Option<Vec<_>>>()
                .map(JsonValue::Array),
            Self::Map(values) => {
                let mut out = serde_json::Map::new();
                for (key, value) in values {
                    out.insert(key.clone(), value.to_json()?);
                }
                Some(JsonValue::Object(out))
            }
            Self::Handle(_) => None,
        }
    }
}

fn number_to_json(value: f64) -> Option<JsonValue> {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        return Some(JsonValue::Number(JsonNumber::from(value as i64)));
    }
    JsonNumber::from_f64(value).map(JsonValue::Number)
}

impl From<JsonValue> for Value {
    fn from(value: JsonValue) -> Self {
        match value {
            JsonValue::Null => Self::Null,
            JsonValue::Bool(value) => Self::Bool(value),
            JsonValue::Number(value) => Self::Number(value.as_f64().unwrap_or(f64::NAN)),
            JsonValue::String(value) => Self::String(value),
            JsonValue::Array(values) => Self::Array(values.into_iter().map(Value::from).collect()),
            JsonValue::Object(values) => Self::Map(
                values
                    .into_iter()
                    .map(|(key, value)| (key, Value::from(value)))
                    .collect(),
            ),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Number(value as f64)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Number(f64::from(value))
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(values: Vec<Value>) -> Self {
        Self::Array(values)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(values: BTreeMap<String, Value>) -> Self {
        Self::Map(values)
    }
}

impl From<OpaqueHandle> for Value {
    fn from(handle: OpaqueHandle) -> Self {
        Self::Handle(handle)
    }
}

/// Reference to an interpreter-side object that has no plain-data form.
///
/// Cloning a handle clones the reference, not the object. Two handles are
/// equal when they point at the same object.
#[derive(Clone)]
pub struct OpaqueHandle {
    id: u64,
    type_name: String,
    payload: Arc<dyn Any + Send + Sync>,
}

impl OpaqueHandle {
    pub fn new<T: Any + Send + Sync>(type_name: impl Into<String>, payload: T) -> Self {
        Self {
            id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
            type_name: type_name.into(),
            payload: Arc::new(payload),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn payload<T: Any>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }
}

impl PartialEq for OpaqueHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl fmt::Debug for OpaqueHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpaqueHandle")
            .field("id", &self.id)
            .field("type_name", &self.type_name)
            .finish()
    }
}
