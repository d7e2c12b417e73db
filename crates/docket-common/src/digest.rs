//! Canonical encoding and digests for tamper-evident records
//!
//! The audit hash chain commits to a small JSON document per record. Two
//! processes must produce byte-identical input for the same logical document,
//! so objects are written with lexicographically sorted keys and no
//! insignificant whitespace, independent of how `serde_json::Map` happens to
//! be ordered in the current build.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Hex digest length of SHA-256
pub const SHA256_HEX_LEN: usize = 64;

/// Compute the lowercase hex SHA-256 of raw bytes
pub fn sha256_hex(bytes: impl AsRef<[u8]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes.as_ref());
    hex::encode(hasher.finalize())
}

/// Encode a JSON value canonically (sorted keys, compact separators)
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();

            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Serializing a str cannot fail
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                if let Some(inner) = map.get(*key) {
                    write_canonical(inner, out);
                }
            }
            out.push('}');
        },
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        },
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// SHA-256 over the canonical encoding of `value`
pub fn digest_canonical(value: &Value) -> String {
    sha256_hex(canonical_json(value))
}

/// Whether `s` looks like a lowercase hex SHA-256 digest
pub fn is_sha256_hex(s: &str) -> bool {
    s.len() == SHA256_HEX_LEN && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
