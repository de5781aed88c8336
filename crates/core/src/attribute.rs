//! Attribute events.
//!
//! An attribute is a free-form JSON object describing one logged fact. The
//! well-known fields are `type`, `id`, `key`, `value` and `sessionId`; any
//! other field is carried along untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

pub const FIELD_TYPE: &str = "type";
pub const FIELD_ID: &str = "id";
pub const FIELD_KEY: &str = "key";
pub const FIELD_VALUE: &str = "value";
pub const FIELD_SESSION_ID: &str = "sessionId";
pub const FIELD_CLIENT_ID: &str = "clientId";

/// Placeholder for attributes that omit `type` or `id`.
pub const UNKNOWN: &str = "unknown";

/// One logged fact.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Attribute(Map<String, Value>);

impl Attribute {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    /// Build from any JSON value; only objects are attributes.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(fields) => Ok(Self(fields)),
            other => Err(Error::validation(format!(
                "attribute must be a JSON object, got {}",
                json_kind(&other)
            ))),
        }
    }

    pub fn kind(&self) -> Option<&str> {
        self.str_field(FIELD_TYPE)
    }

    pub fn id(&self) -> Option<&str> {
        self.str_field(FIELD_ID)
    }

    pub fn key(&self) -> Option<&str> {
        self.str_field(FIELD_KEY)
    }

    pub fn value(&self) -> Option<&Value> {
        self.0.get(FIELD_VALUE)
    }

    pub fn session_id(&self) -> Option<&str> {
        self.str_field(FIELD_SESSION_ID)
    }

    /// Stamp the owning session onto the attribute.
    pub fn with_session_id(mut self, session_id: &str) -> Self {
        self.0.insert(
            FIELD_SESSION_ID.to_string(),
            Value::String(session_id.to_string()),
        );
        self
    }

    /// Remove and return a non-empty string field.
    pub fn take_str(&mut self, field: &str) -> Option<String> {
        match self.0.remove(field) {
            Some(Value::String(s)) if !s.is_empty() => Some(s),
            _ => None,
        }
    }

    /// `type` with the placeholder for missing values. Numbers are accepted.
    pub fn kind_or_unknown(&self) -> String {
        self.loose_field(FIELD_TYPE)
    }

    /// `id` with the placeholder for missing values. Numbers are accepted.
    pub fn id_or_unknown(&self) -> String {
        self.loose_field(FIELD_ID)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_fields(self) -> Map<String, Value> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn str_field(&self, field: &str) -> Option<&str> {
        self.0.get(field).and_then(Value::as_str)
    }

    fn loose_field(&self, field: &str) -> String {
        match self.0.get(field) {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => UNKNOWN.to_string(),
        }
    }
}

impl From<Map<String, Value>> for Attribute {
    fn from(fields: Map<String, Value>) -> Self {
        Self(fields)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
