//! Canonical JSON serialization (RFC 8785 JCS) and object hashing.
//!
//! Object ids and transaction signatures are both defined over the canonical
//! serialization, so this codec must agree byte-for-byte with every other
//! node on the network. Keys are sorted by UTF-16 code units, whitespace is
//! omitted, and integers are emitted without a decimal point. Only integer
//! numbers occur on this wire; non-integer numbers fall back to serde_json's
//! shortest round-trip form.

use std::cmp::Ordering;
use std::fmt::Write as _;

use blake2::{Blake2s256, Digest};
use serde_json::Value;

use crate::types::Hex256;

/// Serialize a JSON value in RFC 8785 canonical form.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_value(value, &mut out);
    out
}

/// Blake2s-256 digest of a value's canonical serialization.
pub fn hash_value(value: &Value) -> Hex256 {
    let canonical = canonical_json(value);
    let digest = Blake2s256::digest(canonical.as_bytes());
    Hex256(digest.into())
}

fn write_value(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => write_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| cmp_utf16(a.0, b.0));
            out.push('{');
            for (i, (key, item)) in entries.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                write_value(item, out);
            }
            out.push('}');
        }
    }
}

/// JCS string escaping: `"`, `\`, and the C0 controls only. Everything else,
/// including non-ASCII, is emitted as raw UTF-8.
fn write_string(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\u{0008}' => out.push_str("\\b"),
            '\u{0009}' => out.push_str("\\t"),
            '\u{000A}' => out.push_str("\\n"),
            '\u{000C}' => out.push_str("\\f"),
            '\u{000D}' => out.push_str("\\r"),
            c if (c as u32) < 0x20 => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

fn cmp_utf16(a: &str, b: &str) -> Ordering {
    a.encode_utf16().cmp(b.encode_utf16())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn keys_sorted_and_whitespace_stripped() {
        let value = json!({"zebra": 1, "apple": [1, 2], "mango": {"b": 2, "a": 1}});
        assert_eq!(
            canonical_json(&value),
            r#"{"apple":[1,2],"mango":{"a":1,"b":2},"zebra":1}"#
        );
    }

    #[test]
    fn integers_without_decimal_point() {
        let value = json!({"value": 50_000_000_000_000u64, "zero": 0});
        assert_eq!(
            canonical_json(&value),
            r#"{"value":50000000000000,"zero":0}"#
        );
    }

    #[test]
    fn null_and_bools() {
        assert_eq!(canonical_json(&json!([null, true, false])), "[null,true,false]");
    }

    #[test]
    fn control_characters_escaped() {
        let value = json!({"note": "line1\nline2\ttab\u{0001}"});
        assert_eq!(
            canonical_json(&value),
            "{\"note\":\"line1\\nline2\\ttab\\u0001\"}"
        );
    }

    #[test]
    fn non_ascii_emitted_raw() {
        let value = json!({"note": "héllo"});
        assert_eq!(canonical_json(&value), "{\"note\":\"héllo\"}");
    }

    #[test]
    fn hash_is_independent_of_key_order() {
        let a: Value = serde_json::from_str(r#"{"x":1,"y":2}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"y":2,"x":1}"#).unwrap();
        assert_eq!(hash_value(&a), hash_value(&b));
    }

    #[test]
    fn hash_is_64_lowercase_hex() {
        let id = hash_value(&json!({"type": "block"}));
        let s = id.to_string();
        assert_eq!(s.len(), 64);
        assert!(s.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    // Strategy for JSON values restricted to what the wire carries:
    // null, bools, u64 integers, strings, arrays, objects.
    fn wire_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<u64>().prop_map(|n| json!(n)),
            "[a-zA-Z0-9 _.\\-]{0,12}".prop_map(Value::String),
        ];
        leaf.prop_recursive(3, 24, 6, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn canonical_form_round_trips(value in wire_value()) {
            let canonical = canonical_json(&value);
            let parsed: Value = serde_json::from_str(&canonical).unwrap();
            prop_assert_eq!(parsed, value);
        }

        #[test]
        fn canonicalization_is_idempotent(value in wire_value()) {
            let once = canonical_json(&value);
            let parsed: Value = serde_json::from_str(&once).unwrap();
            prop_assert_eq!(canonical_json(&parsed), once);
        }
    }
}
