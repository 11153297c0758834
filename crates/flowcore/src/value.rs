use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;

/// Data flowing between steps over ports.
///
/// The tagged wire form (`{"type": ..., "value": ...}`) is what run data
/// stores. HTTP and CLI input use plain JSON, see [`Value::from_plain_json`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "value")]
pub enum Value {
    Null,
    Bool(bool),
    Number(#[serde(with = "number")] f64),
    String(String),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
    Array(Vec<Value>),
    Object(HashMap<String, Value>),
}

impl Value {
    /// Short name of the variant, for type mismatch errors.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Json(_) => "json",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }

    // Scalar accessors look through `Json` so parsed documents and native
    // values read the same way.

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            Value::Json(j) => j.as_str(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Json(j) => j.as_f64(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Json(j) => j.as_bool(),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Json(j) => j.is_null(),
            _ => false,
        }
    }

    /// Plain JSON rendering, without the type tags used on the wire.
    /// Bytes become an array of numbers; non-finite numbers become null.
    pub fn to_plain_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;
        match self {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Number(n) => serde_json::Number::from_f64(*n)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Value::String(s) => Json::String(s.clone()),
            Value::Bytes(bytes) => bytes.iter().copied().map(Json::from).collect(),
            Value::Json(j) => j.clone(),
            Value::Array(items) => items.iter().map(Value::to_plain_json).collect(),
            Value::Object(map) => Json::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_plain_json()))
                    .collect(),
            ),
        }
    }

    /// Reads untagged JSON into native values, recursively.
    pub fn from_plain_json(json: serde_json::Value) -> Value {
        use serde_json::Value as Json;
        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(b),
            Json::Number(n) => n.as_f64().map(Value::Number).unwrap_or(Value::Null),
            Json::String(s) => Value::String(s),
            Json::Array(items) => Value::Array(items.into_iter().map(Value::from_plain_json).collect()),
            Json::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, Value::from_plain_json(v)))
                    .collect(),
            ),
        }
    }
}

/// JSON has no NaN or infinity. Those are written as the strings `"NaN"`,
/// `"Infinity"` and `"-Infinity"` so stored run data reads back unchanged.
mod number {
    use super::*;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Finite(f64),
        Special(String),
    }

    pub fn serialize<S: Serializer>(n: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if n.is_finite() {
            serializer.serialize_f64(*n)
        } else if n.is_nan() {
            serializer.serialize_str("NaN")
        } else if n.is_sign_positive() {
            serializer.serialize_str("Infinity")
        } else {
            serializer.serialize_str("-Infinity")
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Finite(n) => Ok(n),
            Repr::Special(s) => match s.as_str() {
                "NaN" => Ok(f64::NAN),
                "Infinity" => Ok(f64::INFINITY),
                "-Infinity" => Ok(f64::NEG_INFINITY),
                other => Err(serde::de::Error::custom(format!(
                    "expected a number, got {:?}",
                    other
                ))),
            },
        }
    }
}

macro_rules! value_from {
    ($($source:ty => |$v:ident| $body:expr),* $(,)?) => {
        $(
            impl From<$source> for Value {
                fn from($v: $source) -> Self {
                    $body
                }
            }
        )*
    };
}

value_from! {
    String => |s| Value::String(s),
    &str => |s| Value::String(s.to_string()),
    f64 => |n| Value::Number(n),
    i64 => |n| Value::Number(n as f64),
    u64 => |n| Value::Number(n as f64),
    bool => |b| Value::Bool(b),
    serde_json::Value => |j| Value::Json(j),
    Vec<Value> => |items| Value::Array(items),
    HashMap<String, Value> => |map| Value::Object(map),
}
