use serde_json::{Map, Value};
use std::collections::HashMap;
use thiserror::Error;

/// Field name to value. A field missing from the map is absent.
pub type FieldMapping = HashMap<String, String>;

/// Typed view of the designated log field inside an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLine<'a> {
    Text(&'a str),
    /// Missing key, or an explicit `null`.
    Absent,
    /// Present but not a string; carries the JSON kind for diagnostics.
    NotText(&'static str),
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload is a JSON {0}, expected an object")]
    NotAnObject(&'static str),
}

/// The structured JSON object a log record travels in.
#[derive(Debug, Clone)]
pub struct Envelope {
    fields: Map<String, Value>,
}

impl Envelope {
    pub fn parse(payload: &[u8]) -> Result<Self, DecodeError> {
        match serde_json::from_slice(payload)? {
            Value::Object(fields) => Ok(Self { fields }),
            other => Err(DecodeError::NotAnObject(json_kind(&other))),
        }
    }

    pub fn log_line(&self, field: &str) -> LogLine<'_> {
        match self.fields.get(field) {
            None | Some(Value::Null) => LogLine::Absent,
            Some(Value::String(line)) => LogLine::Text(line),
            Some(other) => LogLine::NotText(json_kind(other)),
        }
    }

    /// Flatten the top-level fields into strings, skipping nulls.
    pub fn into_fields(self) -> FieldMapping {
        self.fields
            .into_iter()
            .filter_map(|(key, value)| field_value(value).map(|value| (key, value)))
            .collect()
    }
}

fn field_value(value: Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        nested @ (Value::Array(_) | Value::Object(_)) => Some(nested.to_string()),
    }
}

pub(crate) fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
