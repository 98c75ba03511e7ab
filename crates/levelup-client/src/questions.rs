//! Normalization of list-valued text fields.
//!
//! The backend has stored interview questions (and tech stacks) in several
//! encodings over time. [`parse_string_list`] tries the known encodings in a
//! fixed priority order:
//!
//! 1. a JSON array of strings: `["q1", "q2"]`
//! 2. a JSON array whose elements embed a fenced ```` ```json ```` block:
//!    `["```json", "[\"q1\", \"q2\"]", "```"]`
//! 3. a bare fenced block around a JSON array
//! 4. a JSON string literal holding any of the above (double encoding)
//! 5. anything else is a single literal entry

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::debug;

/// Nested encodings deeper than this are treated as literal text.
const MAX_DEPTH: usize = 4;

const FENCE: &str = "```";

static FENCED_BLOCK: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?s)```[A-Za-z]*\s*(.*?)\s*```").ok());

/// Normalizes a raw JSON field into a list of strings.
///
/// Arrays are taken element by element, strings go through
/// [`parse_string_list`], `null` is empty and other scalars become a single
/// entry.
#[must_use]
pub fn normalize_string_list(value: &Value) -> Vec<String> {
    match value {
        Value::Null => Vec::new(),
        Value::String(raw) => parse_string_list(raw),
        Value::Array(items) => from_array(items, 0),
        other => vec![other.to_string()],
    }
}

/// Parses a text field that may hold a list in one of the known encodings.
#[must_use]
pub fn parse_string_list(raw: &str) -> Vec<String> {
    parse_at_depth(raw, 0)
}

fn parse_at_depth(raw: &str, depth: usize) -> Vec<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    if depth > MAX_DEPTH {
        return vec![trimmed.to_string()];
    }

    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Array(items)) => return from_array(&items, depth),
        Ok(Value::String(inner)) => {
            debug!(depth, "Field is a double-encoded JSON string");
            return parse_at_depth(&inner, depth + 1);
        }
        _ => {}
    }

    if let Some(body) = fenced_body(trimmed) {
        debug!(depth, "Field is a fenced code block");
        return parse_at_depth(&body, depth + 1);
    }

    vec![trimmed.to_string()]
}

fn from_array(items: &[Value], depth: usize) -> Vec<String> {
    let entries: Vec<String> = items
        .iter()
        .map(|item| match item {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect();

    if entries.iter().any(|entry| entry.contains(FENCE)) && depth < MAX_DEPTH {
        let joined = entries.join("\n");
        if let Some(body) = fenced_body(&joined) {
            debug!(depth, "Field is an array wrapping a fenced code block");
            return parse_at_depth(&body, depth + 1);
        }
    }

    entries
        .into_iter()
        .map(|entry| entry.trim().to_string())
        .filter(|entry| !entry.is_empty())
        .collect()
}

/// Extracts the body of the first fenced block, tolerating a missing closing
/// fence.
fn fenced_body(text: &str) -> Option<String> {
    if let Some(re) = FENCED_BLOCK.as_ref() {
        if let Some(body) = re.captures(text).and_then(|cap| cap.get(1)) {
            return Some(body.as_str().to_string());
        }
    }

    let start = text.find(FENCE)?;
    let rest = &text[start + FENCE.len()..];
    let rest = rest.trim_start_matches(|c: char| c.is_ascii_alphabetic());
    Some(rest.trim().to_string())
}
