// shoal-codec: body and querystring serialization for the shoal transport.
//
// JSON and NDJSON encoding sit on serde_json; the decoder carries an optional
// poisoning guard that rejects `__proto__` / `constructor.prototype` keys in
// parsed documents before they reach application code.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

mod query;
mod vectors;

pub use query::{Query, qserialize};
pub use vectors::{decode_float32_vector, encode_float32_vector};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// A value could not be encoded to JSON or NDJSON.
///
/// Carries a short description of the offending data when one is available.
#[derive(Debug, thiserror::Error)]
#[error("serialization failure: {message}")]
pub struct SerializationError {
    pub message: String,
    /// Rendering of the data that failed to encode, when representable.
    pub data: Option<String>,
}

/// A payload could not be decoded.
///
/// Carries the offending input so callers can log or inspect it.
#[derive(Debug, thiserror::Error)]
#[error("deserialization failure: {message}")]
pub struct DeserializationError {
    pub message: String,
    /// The input that failed to decode.
    pub data: String,
}

// ---------------------------------------------------------------------------
// Poisoning guard
// ---------------------------------------------------------------------------

/// Which guarded keys cause a decode to be rejected.
///
/// `__proto__` and `constructor.prototype` are harmless in Rust, but payloads
/// containing them are almost certainly crafted for a downstream JavaScript
/// consumer; the guard lets a deployment refuse them at the transport edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PoisonGuard {
    #[default]
    Off,
    /// Reject `__proto__` keys only.
    ProtoOnly,
    /// Reject `constructor` objects containing a `prototype` key only.
    ConstructorOnly,
    /// Reject both.
    All,
}

impl PoisonGuard {
    fn checks_proto(self) -> bool {
        matches!(self, PoisonGuard::ProtoOnly | PoisonGuard::All)
    }

    fn checks_constructor(self) -> bool {
        matches!(self, PoisonGuard::ConstructorOnly | PoisonGuard::All)
    }
}

// ---------------------------------------------------------------------------
// Bulk lines
// ---------------------------------------------------------------------------

/// One line of an NDJSON bulk body.
#[derive(Debug, Clone, PartialEq)]
pub enum BulkLine {
    /// Serialized with the configured JSON encoder.
    Json(Value),
    /// Passed through verbatim (already encoded by the caller).
    Raw(String),
}

impl From<Value> for BulkLine {
    fn from(value: Value) -> Self {
        BulkLine::Json(value)
    }
}

impl From<String> for BulkLine {
    fn from(line: String) -> Self {
        BulkLine::Raw(line)
    }
}

impl From<&str> for BulkLine {
    fn from(line: &str) -> Self {
        BulkLine::Raw(line.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Serializer
// ---------------------------------------------------------------------------

/// The stock codec: canonical JSON, NDJSON bulk bodies, and a guarded decoder.
///
/// Cheap to clone; the transport holds one and threads it through the
/// request pipeline.
#[derive(Debug, Clone, Default)]
pub struct Serializer {
    guard: PoisonGuard,
}

impl Serializer {
    pub fn new(guard: PoisonGuard) -> Self {
        Serializer { guard }
    }

    /// Encode a value as canonical JSON.
    pub fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<String, SerializationError> {
        serde_json::to_string(value).map_err(|e| SerializationError {
            message: format!("unable to encode value as JSON: {e}"),
            data: None,
        })
    }

    /// Decode JSON text into a dynamic value, applying the poisoning guard.
    pub fn deserialize(&self, text: &str) -> Result<Value, DeserializationError> {
        let value: Value = serde_json::from_str(text).map_err(|e| DeserializationError {
            message: format!("unable to parse JSON: {e}"),
            data: text.to_owned(),
        })?;
        self.check_poisoned(&value).map_err(|key| DeserializationError {
            message: format!("rejected payload containing guarded key '{key}'"),
            data: text.to_owned(),
        })?;
        Ok(value)
    }

    /// Decode JSON text into a concrete type, applying the poisoning guard.
    pub fn deserialize_into<T: DeserializeOwned>(
        &self,
        text: &str,
    ) -> Result<T, DeserializationError> {
        let value = self.deserialize(text)?;
        serde_json::from_value(value).map_err(|e| DeserializationError {
            message: format!("unable to decode JSON into target type: {e}"),
            data: text.to_owned(),
        })
    }

    /// Encode an ordered sequence of bulk lines as NDJSON.
    ///
    /// Every line, including the last, gets a trailing newline.
    pub fn ndserialize(&self, lines: &[BulkLine]) -> Result<String, SerializationError> {
        let mut out = String::new();
        for line in lines {
            match line {
                BulkLine::Json(value) => out.push_str(&self.serialize(value)?),
                BulkLine::Raw(text) => out.push_str(text),
            }
            out.push('\n');
        }
        Ok(out)
    }

    /// Walk a parsed document for guarded keys. Returns the offending key.
    fn check_poisoned<'a>(&self, value: &'a Value) -> Result<(), &'a str> {
        if self.guard == PoisonGuard::Off {
            return Ok(());
        }
        match value {
            Value::Object(map) => {
                for (key, child) in map {
                    if self.guard.checks_proto() && key == "__proto__" {
                        return Err("__proto__");
                    }
                    if self.guard.checks_constructor() && key == "constructor" {
                        if let Value::Object(inner) = child {
                            if inner.contains_key("prototype") {
                                return Err("constructor.prototype");
                            }
                        }
                    }
                    self.check_poisoned(child)?;
                }
                Ok(())
            }
            Value::Array(items) => {
                for item in items {
                    self.check_poisoned(item)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}
