//! Canonical JSON and SHA-256 digests used as cache and lock keys.
//!
//! Two encodings live here:
//! - [`canonical_json`]: keys sorted by UTF-16 code units, integer-valued
//!   floats collapsed to integers. Used for content addresses that only this
//!   system computes.
//! - [`to_go_json`]: the byte layout of Go's `encoding/json` (struct fields
//!   in declaration order, map keys sorted, `<`, `>`, `&`, U+2028 and U+2029
//!   escaped). Lock names must match the keys already held by other
//!   processes, so they are hashed over this encoding.

use std::io;

use serde::Serialize;
use serde_json::ser::{CharEscape, CompactFormatter, Formatter};
use sha2::{Digest, Sha256};

use crate::error::{CoreError, Result};

/// Hex-encoded SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn sort_keys_utf16(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().collect();
            keys.sort_by(|a, b| a.encode_utf16().cmp(b.encode_utf16()));

            let mut sorted = serde_json::Map::new();
            for key in keys {
                if let Some(v) = map.get(key) {
                    sorted.insert(key.to_string(), sort_keys_utf16(v));
                }
            }
            serde_json::Value::Object(sorted)
        }
        serde_json::Value::Array(arr) => {
            serde_json::Value::Array(arr.iter().map(sort_keys_utf16).collect())
        }
        other => other.clone(),
    }
}

fn normalize_numbers(value: &serde_json::Value) -> Result<serde_json::Value> {
    match value {
        serde_json::Value::Object(map) => {
            let mut normalized = serde_json::Map::new();
            for (k, v) in map {
                normalized.insert(k.clone(), normalize_numbers(v)?);
            }
            Ok(serde_json::Value::Object(normalized))
        }
        serde_json::Value::Array(arr) => arr
            .iter()
            .map(normalize_numbers)
            .collect::<Result<Vec<_>>>()
            .map(serde_json::Value::Array),
        serde_json::Value::Number(n) if !(n.is_i64() || n.is_u64()) => match n.as_f64() {
            Some(f) if !f.is_finite() => Err(CoreError::NonFiniteNumber),
            Some(f) if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 => {
                Ok(serde_json::Value::Number(serde_json::Number::from(f as i64)))
            }
            _ => Ok(serde_json::Value::Number(n.clone())),
        },
        other => Ok(other.clone()),
    }
}

/// Canonical compact JSON of `value`.
pub fn canonical_json(value: &serde_json::Value) -> Result<String> {
    let normalized = normalize_numbers(value)?;
    Ok(serde_json::to_string(&sort_keys_utf16(&normalized))?)
}

/// SHA-256 hex digest of the canonical JSON of `value`.
pub fn compute_digest(value: &serde_json::Value) -> Result<String> {
    Ok(sha256_hex(canonical_json(value)?.as_bytes()))
}

/// Compact JSON formatter with Go `encoding/json` string escaping.
#[derive(Debug, Clone, Copy, Default)]
pub struct GoJsonFormatter;

impl Formatter for GoJsonFormatter {
    fn write_string_fragment<W: ?Sized + io::Write>(
        &mut self,
        writer: &mut W,
        fragment: &str,
    ) -> io::Result<()> {
        let mut start = 0;
        for (i, ch) in fragment.char_indices() {
            let escaped = match ch {
                '<' => "\\u003c",
                '>' => "\\u003e",
                '&' => "\\u0026",
                '\u{2028}' => "\\u2028",
                '\u{2029}' => "\\u2029",
                _ => continue,
            };
            writer.write_all(fragment[start..i].as_bytes())?;
            writer.write_all(escaped.as_bytes())?;
            start = i + ch.len_utf8();
        }
        writer.write_all(fragment[start..].as_bytes())
    }

    fn write_char_escape<W: ?Sized + io::Write>(
        &mut self,
        writer: &mut W,
        char_escape: CharEscape,
    ) -> io::Result<()> {
        match char_escape {
            CharEscape::Backspace => writer.write_all(b"\\u0008"),
            CharEscape::FormFeed => writer.write_all(b"\\u000c"),
            other => CompactFormatter.write_char_escape(writer, other),
        }
    }
}

/// Serialize `value` exactly as Go's `json.Marshal` would.
///
/// Structs keep field declaration order; `BTreeMap` and `serde_json::Map`
/// keys come out sorted, as Go sorts map keys.
pub fn to_go_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let mut buf = Vec::new();
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, GoJsonFormatter);
    value.serialize(&mut ser)?;
    // serde_json only ever emits UTF-8.
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_json_sorts_nested_keys() {
        let a = canonical_json(&json!({"outer": {"z": 1, "y": 2}, "a": [3, 1]})).unwrap();
        assert_eq!(a, r#"{"a":[3,1],"outer":{"y":2,"z":1}}"#);
    }

    #[test]
    fn canonical_json_collapses_integer_floats() {
        assert_eq!(canonical_json(&json!({"v": 1.0})).unwrap(), r#"{"v":1}"#);
        assert_eq!(canonical_json(&json!({"v": 1.5})).unwrap(), r#"{"v":1.5}"#);
        assert_eq!(canonical_json(&json!({"v": 1e10})).unwrap(), r#"{"v":10000000000}"#);
    }

    #[test]
    fn compute_digest_ignores_key_order() {
        let a = compute_digest(&json!({"uri": "x", "branch": "main"})).unwrap();
        let b = compute_digest(&json!({"branch": "main", "uri": "x"})).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn compute_digest_changes_with_content() {
        let a = compute_digest(&json!({"uri": "x"})).unwrap();
        let b = compute_digest(&json!({"uri": "y"})).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn go_json_escapes_html_characters() {
        let out = to_go_json(&json!({"q": "a<b>&c"})).unwrap();
        assert_eq!(out, r#"{"q":"a\u003cb\u003e\u0026c"}"#);
    }

    #[test]
    fn go_json_escapes_line_separators_and_controls() {
        let out = to_go_json(&json!("x\u{2028}y\u{8}\u{c}\n")).unwrap();
        assert_eq!(out, r#""x\u2028y\u0008\u000c\n""#);
    }

    #[test]
    fn go_json_keeps_struct_field_order() {
        #[derive(Serialize)]
        struct Ordered<'a> {
            z: &'a str,
            a: &'a str,
        }
        let out = to_go_json(&Ordered { z: "1", a: "2" }).unwrap();
        assert_eq!(out, r#"{"z":"1","a":"2"}"#);
    }

    #[test]
    fn sha256_hex_of_empty_input() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
