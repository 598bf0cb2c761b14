//! Canonical source strings for hashing and signing.
//!
//! A JSON value is flattened into tokens joined by NUL:
//! - scalars become a type tag (`s`, `n`, `b`) followed by the value text
//! - arrays are bracketed by `[` and `]` tokens around their elements
//! - objects emit each key (sorted by UTF-16 code units) followed by its value
//!
//! Nulls, empty arrays and empty objects are rejected rather than skipped: a
//! hash that silently dropped data could be satisfied by a different message.

use serde_json::{Map, Number, Value};

use crate::hash::sha256;

const JOIN: &str = "\u{0}";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CanonicalError {
    #[error("null value at {0}")]
    Null(String),
    #[error("empty array at {0}")]
    EmptyArray(String),
    #[error("empty object at {0}")]
    EmptyObject(String),
}

/// Number text as JavaScript's `String(n)` prints it. Every number is a double
/// on the signing side, so integers beyond 2^53 round the same way.
fn number_text(n: &Number) -> String {
    match n.as_f64() {
        Some(f) => js_number_text(f),
        None => n.to_string(),
    }
}

/// ECMAScript `Number::toString` for finite doubles: shortest round-trip
/// digits, plain notation for decimal exponents in [-7, 21), otherwise
/// `d.ddde±x`.
fn js_number_text(f: f64) -> String {
    if f == 0.0 {
        return "0".to_string();
    }
    // `{:e}` yields the shortest round-trip digits as `d.ddde<exp>`.
    let sci = format!("{:e}", f.abs());
    let Some((mantissa, exp)) = sci.split_once('e') else {
        return f.to_string();
    };
    let Ok(exp) = exp.parse::<i32>() else {
        return f.to_string();
    };
    let digits: String = mantissa.chars().filter(|c| *c != '.').collect();
    let k = digits.len() as i32;
    let n = exp + 1;

    let body = if k <= n && n <= 21 {
        format!("{digits}{}", "0".repeat((n - k) as usize))
    } else if 0 < n && n <= 21 {
        let (int, frac) = digits.split_at(n as usize);
        format!("{int}.{frac}")
    } else if -6 < n && n <= 0 {
        format!("0.{}{digits}", "0".repeat((-n) as usize))
    } else {
        let e = n - 1;
        let sign = if e < 0 { '-' } else { '+' };
        let (lead, rest) = digits.split_at(1);
        if rest.is_empty() {
            format!("{lead}e{sign}{}", e.abs())
        } else {
            format!("{lead}.{rest}e{sign}{}", e.abs())
        }
    };
    if f < 0.0 {
        format!("-{body}")
    } else {
        body
    }
}

fn sorted_keys(map: &Map<String, Value>) -> Vec<&String> {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort_by(|a, b| a.encode_utf16().cmp(b.encode_utf16()));
    keys
}

fn extract(value: &Value, path: &str, out: &mut Vec<String>) -> Result<(), CanonicalError> {
    match value {
        Value::Null => return Err(CanonicalError::Null(path.to_string())),
        Value::String(s) => {
            out.push("s".into());
            out.push(s.clone());
        }
        Value::Number(n) => {
            out.push("n".into());
            out.push(number_text(n));
        }
        Value::Bool(b) => {
            out.push("b".into());
            out.push(b.to_string());
        }
        Value::Array(items) => {
            if items.is_empty() {
                return Err(CanonicalError::EmptyArray(path.to_string()));
            }
            out.push("[".into());
            for (i, item) in items.iter().enumerate() {
                extract(item, &format!("{path}[{i}]"), out)?;
            }
            out.push("]".into());
        }
        Value::Object(map) => {
            if map.is_empty() {
                return Err(CanonicalError::EmptyObject(path.to_string()));
            }
            for key in sorted_keys(map) {
                out.push(key.clone());
                extract(&map[key], &format!("{path}.{key}"), out)?;
            }
        }
    }
    Ok(())
}

/// Flatten `value` into its canonical NUL-joined source string.
pub fn source_string(value: &Value) -> Result<String, CanonicalError> {
    let mut parts = Vec::new();
    extract(value, "$", &mut parts)?;
    Ok(parts.join(JOIN))
}

/// Canonical byte form of `value`.
pub fn canonicalize(value: &Value) -> Result<Vec<u8>, CanonicalError> {
    source_string(value).map(String::into_bytes)
}

/// Remove every null-valued object field, recursively. Nulls inside arrays
/// are left in place and will fail canonicalization.
pub fn strip_nulls(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.retain(|_, v| !v.is_null());
            map.values_mut().for_each(strip_nulls);
        }
        Value::Array(items) => items.iter_mut().for_each(strip_nulls),
        _ => {}
    }
}

/// SHA-256 of the canonical form of `message` with its `signature` field
/// removed and all null fields stripped.
///
/// Device messages are free-form and relayed by an untrusted hub, so any
/// field an attacker injects as null must not reach the hash.
pub fn hash_for_signing(message: &Value) -> Result<[u8; 32], CanonicalError> {
    let mut naked = message.clone();
    if let Value::Object(map) = &mut naked {
        map.remove("signature");
    }
    strip_nulls(&mut naked);
    Ok(sha256(source_string(&naked)?.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scalars() {
        assert_eq!(source_string(&json!("abc")).unwrap(), "s\u{0}abc");
        assert_eq!(source_string(&json!(42)).unwrap(), "n\u{0}42");
        assert_eq!(source_string(&json!(-1.5)).unwrap(), "n\u{0}-1.5");
        assert_eq!(source_string(&json!(3.0)).unwrap(), "n\u{0}3");
        assert_eq!(source_string(&json!(true)).unwrap(), "b\u{0}true");
    }

    #[test]
    fn test_numbers_print_like_javascript() {
        let cases: [(f64, &str); 14] = [
            (1.0, "1"),
            (-0.0, "0"),
            (0.1, "0.1"),
            (123.456, "123.456"),
            (1e-6, "0.000001"),
            (1.5e-6, "0.0000015"),
            (1e-7, "1e-7"),
            (-2.5e-8, "-2.5e-8"),
            (1e20, "100000000000000000000"),
            (1.2345678901234568e20, "123456789012345680000"),
            (1e21, "1e+21"),
            (1.5e300, "1.5e+300"),
            (5e-324, "5e-324"),
            (f64::MAX, "1.7976931348623157e+308"),
        ];
        for (value, expected) in cases {
            assert_eq!(js_number_text(value), expected, "{value:e}");
        }
        assert_eq!(source_string(&json!(u64::MAX)).unwrap(), "n\u{0}18446744073709552000");
        assert_eq!(source_string(&json!(-7)).unwrap(), "n\u{0}-7");
        assert_eq!(source_string(&json!(1e21)).unwrap(), "n\u{0}1e+21");
    }

    #[test]
    fn test_object_keys_sorted_and_arrays_bracketed() {
        let v = json!({"b": [1, "x"], "a": {"z": false}});
        assert_eq!(
            source_string(&v).unwrap(),
            ["a", "z", "b", "false", "b", "[", "n", "1", "s", "x", "]"].join("\u{0}")
        );
    }

    #[test]
    fn test_rejects_null_empty_array_empty_object() {
        assert_eq!(
            source_string(&json!({"a": null})),
            Err(CanonicalError::Null("$.a".into()))
        );
        assert_eq!(
            source_string(&json!({"a": [1, []]})),
            Err(CanonicalError::EmptyArray("$.a[1]".into()))
        );
        assert_eq!(
            source_string(&json!({"a": {}})),
            Err(CanonicalError::EmptyObject("$.a".into()))
        );
        assert!(source_string(&json!([null])).is_err());
    }

    #[test]
    fn test_structurally_different_values_differ() {
        let pairs = [
            (json!({"a": "b"}), json!({"b": "a"})),
            (json!([1, 2]), json!([2, 1])),
            (json!({"a": [1]}), json!({"a": 1})),
            (json!("1"), json!(1)),
            (json!(true), json!("true")),
        ];
        for (x, y) in pairs {
            assert_ne!(canonicalize(&x).unwrap(), canonicalize(&y).unwrap(), "{x} vs {y}");
        }
    }

    #[test]
    fn test_hash_ignores_signature_and_nulls() {
        let signed = json!({"pubkey": "k", "to": "0ABC", "signature": "sig", "extra": null});
        let bare = json!({"pubkey": "k", "to": "0ABC"});
        assert_eq!(hash_for_signing(&signed).unwrap(), hash_for_signing(&bare).unwrap());

        let nested = json!({"pubkey": "k", "pkg": {"iv": "x", "junk": null}});
        let nested_bare = json!({"pubkey": "k", "pkg": {"iv": "x"}});
        assert_eq!(hash_for_signing(&nested).unwrap(), hash_for_signing(&nested_bare).unwrap());
    }

    #[test]
    fn test_hash_rejects_null_inside_array() {
        assert!(hash_for_signing(&json!({"a": [1, null]})).is_err());
    }
}
