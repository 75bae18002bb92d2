//! Recovery of tool calls that a model wrote as text.
//!
//! Some models answer a tool-enabled request with the call serialized into
//! the message body instead of the structured field. The extractor accepts:
//!
//! - a bare `{"name": ..., "arguments": {...}}` object (or `parameters`)
//! - an array of such objects
//! - either of the above inside a single fenced code block
//! - either of the above embedded in prose, found by balanced-bracket scanning
//!
//! Invalid backslash escapes (`\%`, `\_`, ...) are repaired
//! before the second decode attempt. Tool names are mapped through a small
//! alias table so that `WebFetch` or `web-fetch` reach the `web_fetch` tool.

use pincer_core::message::{Arguments, ToolCall};
use serde_json::Value;
use tracing::debug;

/// Known spelling variants, keyed by lowercase name.
const TOOL_ALIASES: &[(&str, &str)] = &[
    ("shell", "shell"),
    ("web_fetch", "web_fetch"),
    ("webfetch", "web_fetch"),
    ("web-fetch", "web_fetch"),
    ("web_search", "web_search"),
    ("websearch", "web_search"),
    ("web-search", "web_search"),
    ("read_file", "read_file"),
    ("readfile", "read_file"),
    ("read-file", "read_file"),
    ("write_file", "write_file"),
    ("writefile", "write_file"),
    ("write-file", "write_file"),
    ("system_info", "system_info"),
    ("systeminfo", "system_info"),
    ("system-info", "system_info"),
];

/// Characters that may legally follow a backslash in a JSON string.
const VALID_ESCAPES: &[char] = &['"', '\\', '/', 'b', 'f', 'n', 'r', 't', 'u'];

/// Extract tool calls from free text. Returns an empty list when the text
/// holds no recognizable call. Every returned call has a non-empty name and
/// a freshly generated id.
pub fn extract_tool_calls(text: &str) -> Vec<ToolCall> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    let body = strip_code_fence(trimmed);
    if let Some(calls) = decode_calls(body) {
        return calls;
    }

    let sanitized = sanitize_escapes(body);
    if let Some(calls) = decode_calls(&sanitized) {
        return calls;
    }

    for span in balanced_spans(&sanitized) {
        if let Some(calls) = decode_calls(span) {
            debug!(count = calls.len(), "Recovered tool calls from embedded JSON");
            return calls;
        }
    }

    Vec::new()
}

/// Remove backslashes that precede a character JSON does not allow to be
/// escaped, inside or outside strings. Valid escape pairs (including `\\`
/// and `\"`) pass through as a unit so an escaped quote never ends a string.
/// A trailing lone backslash is kept.
pub fn sanitize_escapes(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    let mut in_string = false;

    while let Some(c) = chars.next() {
        match c {
            '"' => {
                in_string = !in_string;
                out.push(c);
            }
            '\\' => match chars.peek() {
                // Outside a string the quote still opens one.
                Some(&'"') if !in_string => {}
                Some(&next) if VALID_ESCAPES.contains(&next) => {
                    out.push('\\');
                    out.push(next);
                    chars.next();
                }
                // Invalid escape: drop the backslash, keep the character.
                Some(_) => {}
                None => out.push('\\'),
            },
            _ => out.push(c),
        }
    }

    out
}

/// Map a tool name through the alias table (case-insensitive). Unknown
/// names are returned trimmed but otherwise unchanged.
pub fn normalize_tool_name(name: &str) -> String {
    let trimmed = name.trim();
    let lower = trimmed.to_ascii_lowercase();
    TOOL_ALIASES
        .iter()
        .find(|(alias, _)| *alias == lower)
        .map(|(_, canonical)| (*canonical).to_string())
        .unwrap_or_else(|| trimmed.to_string())
}

/// If the whole text is one fenced block, return its inner content.
fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let Some(inner) = rest.strip_suffix("```") else {
        return text;
    };
    // Skip the info string (`json`, `tool_call`, ...) on the opening line.
    match inner.find('\n') {
        Some(pos) => inner[pos + 1..].trim(),
        None => inner.trim(),
    }
}

/// Decode `text` as one call or an array of calls. `None` unless at least
/// one valid call came out.
fn decode_calls(text: &str) -> Option<Vec<ToolCall>> {
    let value: Value = serde_json::from_str(text.trim()).ok()?;

    let calls: Vec<ToolCall> = match value {
        Value::Object(object) => call_from_object(object).into_iter().collect(),
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::Object(object) => call_from_object(object),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    };

    if calls.is_empty() {
        None
    } else {
        Some(calls)
    }
}

fn call_from_object(mut object: serde_json::Map<String, Value>) -> Option<ToolCall> {
    let name = match object.get("name") {
        Some(Value::String(name)) if !name.trim().is_empty() => normalize_tool_name(name),
        _ => return None,
    };

    let raw = match object.remove("parameters") {
        Some(value) if !value.is_null() => Some(value),
        _ => object.remove("arguments"),
    };

    Some(ToolCall::new(
        ToolCall::generate_id(),
        name,
        arguments_from_value(raw),
    ))
}

/// Arguments may arrive as an object or as a JSON-encoded object string.
fn arguments_from_value(raw: Option<Value>) -> Arguments {
    match raw {
        Some(Value::Object(map)) => map,
        Some(Value::String(encoded)) => match serde_json::from_str::<Value>(&encoded) {
            Ok(Value::Object(map)) => map,
            _ => Arguments::new(),
        },
        _ => Arguments::new(),
    }
}

/// Top-level balanced `{...}` / `[...]` spans in order of appearance.
/// Brackets inside JSON strings are ignored.
fn balanced_spans(text: &str) -> Vec<&str> {
    let mut spans = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }

        match c {
            '"' if depth > 0 => in_string = true,
            '{' | '[' => {
                if depth == 0 {
                    start = i;
                }
                depth += 1;
            }
            '}' | ']' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    spans.push(&text[start..=i]);
                }
            }
            _ => {}
        }
    }

    spans
}
