//! Querystring encoding.
//!
//! Follows form-urlencoding with two transport-specific rules: map entries
//! whose value is `null` are treated as unset and omitted, and array values
//! are joined with `,` before encoding. A caller that already built an
//! encoded string gets it back unchanged.

use serde_json::Value;

/// A request querystring: either a pre-encoded string or a map of parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    /// Already encoded; passed through verbatim.
    Raw(String),
    /// Encoded as `key=value&...` in map order.
    Params(serde_json::Map<String, Value>),
}

impl From<&str> for Query {
    fn from(raw: &str) -> Self {
        Query::Raw(raw.to_owned())
    }
}

impl From<String> for Query {
    fn from(raw: String) -> Self {
        Query::Raw(raw)
    }
}

impl From<serde_json::Map<String, Value>> for Query {
    fn from(params: serde_json::Map<String, Value>) -> Self {
        Query::Params(params)
    }
}

/// Encode a querystring. `None` and an empty map both yield `""`.
pub fn qserialize(query: Option<&Query>) -> String {
    match query {
        None => String::new(),
        Some(Query::Raw(raw)) => raw.clone(),
        Some(Query::Params(params)) => {
            let mut enc = url::form_urlencoded::Serializer::new(String::new());
            for (key, value) in params {
                match value {
                    // Unset sentinel: the key is omitted entirely.
                    Value::Null => {}
                    Value::Array(items) => {
                        let joined = items
                            .iter()
                            .map(scalar_text)
                            .collect::<Vec<_>>()
                            .join(",");
                        enc.append_pair(key, &joined);
                    }
                    other => {
                        enc.append_pair(key, &scalar_text(other));
                    }
                }
            }
            enc.finish()
        }
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
