//! Redaction and truncation of captured payloads
//!
//! Request and response bodies pass through [`Redactor::protect`] before they
//! are queued or stored. Values under sensitive keys become `"[REDACTED]"`,
//! nesting beyond [`MAX_REDACTION_DEPTH`] is cut off, and anything still
//! larger than the byte budget is replaced by a truncation marker:
//!
//! ```json
//! {"truncated": true, "originalSize": 20480, "preview": "{\"items\":[..."}
//! ```
//!
//! `protect` is idempotent: a marker it produced passes through unchanged.

use serde_json::{Map, Value};

/// Replacement for values under sensitive keys
pub const REDACTED: &str = "[REDACTED]";

/// Replacement for containers nested deeper than [`MAX_REDACTION_DEPTH`]
pub const MAX_DEPTH_EXCEEDED: &str = "[MAX_DEPTH_EXCEEDED]";

/// Container levels kept below the root
pub const MAX_REDACTION_DEPTH: usize = 10;

/// Upper bound for the preview carried by a truncation marker
pub const MAX_PREVIEW_BYTES: usize = 1000;

/// Substrings that mark a key as sensitive (case-insensitive)
pub const DEFAULT_SENSITIVE_FIELDS: &[&str] = &[
    "password",
    "passwd",
    "secret",
    "token",
    "apikey",
    "api_key",
    "authorization",
    "cookie",
    "creditcard",
    "credit_card",
    "cardnumber",
    "cvv",
    "ssn",
    "private_key",
    "refresh_token",
    "access_token",
    "otp_code",
    "one_time_password",
    "pin_code",
];

const MARKER_TRUNCATED: &str = "truncated";
const MARKER_ORIGINAL_SIZE: &str = "originalSize";
const MARKER_PREVIEW: &str = "preview";

/// Applies the sensitive-field list to JSON payloads
#[derive(Debug, Clone)]
pub struct Redactor {
    fields: Vec<String>,
}

impl Default for Redactor {
    fn default() -> Self {
        Self::new(DEFAULT_SENSITIVE_FIELDS)
    }
}

impl Redactor {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let fields = fields
            .into_iter()
            .map(|f| f.as_ref().trim().to_lowercase())
            .filter(|f| !f.is_empty())
            .collect();
        Self { fields }
    }

    /// Whether a key's value must never be stored
    pub fn is_sensitive(&self, key: &str) -> bool {
        let key = key.to_lowercase();
        self.fields.iter().any(|field| key.contains(field.as_str()))
    }

    /// Redact sensitive keys and bound nesting depth
    pub fn redact(&self, value: &Value) -> Value {
        self.redact_at(value, 0)
    }

    fn redact_at(&self, value: &Value, depth: usize) -> Value {
        match value {
            Value::Object(_) | Value::Array(_) if depth >= MAX_REDACTION_DEPTH => {
                Value::String(MAX_DEPTH_EXCEEDED.to_string())
            },
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (key, inner) in map {
                    let protected = if self.is_sensitive(key) {
                        Value::String(REDACTED.to_string())
                    } else {
                        self.redact_at(inner, depth + 1)
                    };
                    out.insert(key.clone(), protected);
                }
                Value::Object(out)
            },
            Value::Array(items) => {
                Value::Array(items.iter().map(|item| self.redact_at(item, depth + 1)).collect())
            },
            primitive => primitive.clone(),
        }
    }

    /// Redact, then bound the serialized size to `max_bytes`
    pub fn protect(&self, value: &Value, max_bytes: usize) -> Value {
        if is_truncation_marker(value, max_bytes) {
            return value.clone();
        }
        truncate(self.redact(value), max_bytes)
    }
}

/// Replace `value` by a truncation marker when its JSON exceeds `max_bytes`
pub fn truncate(value: Value, max_bytes: usize) -> Value {
    let serialized = value.to_string();
    if serialized.len() <= max_bytes {
        return value;
    }
    let preview_budget = (max_bytes / 2).min(MAX_PREVIEW_BYTES);
    truncation_marker(serialized.len(), prefix_on_char_boundary(&serialized, preview_budget), max_bytes)
}

/// Build a marker whose own serialization fits in `max_bytes`
///
/// The preview shrinks until it fits; below roughly 64 bytes of budget the
/// preview ends up empty.
pub fn truncation_marker(original_size: usize, preview: &str, max_bytes: usize) -> Value {
    let mut preview = preview;
    loop {
        let marker = marker_value(original_size, preview);
        let size = marker.to_string().len();
        if size <= max_bytes || preview.is_empty() {
            return marker;
        }
        let excess = size - max_bytes;
        preview = prefix_on_char_boundary(preview, preview.len().saturating_sub(excess.max(1)));
    }
}

fn marker_value(original_size: usize, preview: &str) -> Value {
    let mut map = Map::new();
    map.insert(MARKER_TRUNCATED.to_string(), Value::Bool(true));
    map.insert(MARKER_ORIGINAL_SIZE.to_string(), Value::from(original_size));
    map.insert(MARKER_PREVIEW.to_string(), Value::String(preview.to_string()));
    Value::Object(map)
}

/// Whether `value` is a marker this module produced for the same budget
pub fn is_truncation_marker(value: &Value, max_bytes: usize) -> bool {
    let Value::Object(map) = value else {
        return false;
    };
    map.len() == 3
        && map.get(MARKER_TRUNCATED) == Some(&Value::Bool(true))
        && map.get(MARKER_ORIGINAL_SIZE).is_some_and(Value::is_u64)
        && map.get(MARKER_PREVIEW).is_some_and(Value::is_string)
        && value.to_string().len() <= max_bytes
}

fn prefix_on_char_boundary(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
