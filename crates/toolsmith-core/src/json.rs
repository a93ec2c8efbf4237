//! Canonical JSON encoding.
//!
//! Object keys are sorted recursively; arrays keep their order; scalars use
//! `serde_json`'s standard rendering. The result cache fingerprint and the
//! integrity chain's leaf encoding are both contracts on these bytes, so two
//! semantically equal values always encode identically.

use serde_json::Value;

/// Encode a JSON value canonically (recursively sorted object keys).
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            out.push('{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // serde_json renders the key with proper escaping
                out.push_str(&serde_json::to_string(key).unwrap_or_else(|_| "\"\"".to_string()));
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => {
            out.push_str(&scalar.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_object_keys_sorted() {
        let a = json!({"b": 1, "a": {"z": true, "y": null}});
        let b = json!({"a": {"y": null, "z": true}, "b": 1});
        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(canonical_json(&a), r#"{"a":{"y":null,"z":true},"b":1}"#);
    }

    #[test]
    fn test_array_order_preserved() {
        let v = json!([3, 1, 2]);
        assert_eq!(canonical_json(&v), "[3,1,2]");
    }

    #[test]
    fn test_string_escaping() {
        let v = json!({"k\"ey": "va\nlue"});
        assert_eq!(canonical_json(&v), r#"{"k\"ey":"va\nlue"}"#);
    }
}
