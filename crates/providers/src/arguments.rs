//! Tool-call argument decoding.
//!
//! Chat-completion servers disagree on whether `function.arguments` is a
//! JSON object or a string holding encoded JSON. Both shapes decode into
//! [`RawArguments`] first and are normalized by [`RawArguments::into_map`].
//! Any other JSON value is accepted too, so one odd call never fails the
//! whole response.

use pincer_core::message::Arguments;
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum RawArguments {
    Object(Arguments),
    Encoded(String),
    Other(Value),
}

impl RawArguments {
    /// Normalize to an argument map. Undecodable text yields an empty map.
    pub(crate) fn into_map(self, tool: &str) -> Arguments {
        match self {
            Self::Object(map) => map,
            Self::Encoded(text) => decode_arguments(&text, tool),
            Self::Other(Value::Null) => Arguments::new(),
            Self::Other(value) => {
                warn!(
                    tool,
                    kind = value_kind(&value),
                    "Tool arguments are not an object, using empty map"
                );
                Arguments::new()
            }
        }
    }
}

/// Decode accumulated argument text. Blank text is an empty map; text that
/// is not a JSON object logs a warning and also yields an empty map.
pub(crate) fn decode_arguments(text: &str, tool: &str) -> Arguments {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Arguments::new();
    }

    match serde_json::from_str::<RawArguments>(trimmed) {
        Ok(RawArguments::Object(map)) => map,
        Ok(RawArguments::Encoded(inner)) => match serde_json::from_str::<Arguments>(&inner) {
            Ok(map) => map,
            Err(e) => {
                warn!(tool, error = %e, "Tool arguments are not a JSON object, using empty map");
                Arguments::new()
            }
        },
        Ok(RawArguments::Other(value)) => {
            warn!(
                tool,
                kind = value_kind(&value),
                "Tool arguments are not an object, using empty map"
            );
            Arguments::new()
        }
        Err(e) => {
            warn!(tool, error = %e, "Malformed tool arguments, using empty map");
            Arguments::new()
        }
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
