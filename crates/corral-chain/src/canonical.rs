use serde_json::Value;

/// Render `value` as canonical JSON: object keys sorted lexicographically at
/// every depth, array order preserved, compact separators, numbers in their
/// shortest round-trip form.
///
/// Absent optional fields must be dropped by the caller's serde derives
/// before reaching this function; a JSON `null` that does appear is kept.
/// Idempotent: canonicalizing the parse of a canonical string reproduces it.
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
                // serde_json's Display for Value::String performs JSON escaping.
                out.push_str(&Value::String((*key).clone()).to_string());
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
        // Null, Bool, Number, String: serde_json already renders the shortest
        // round-trip form with compact separators.
        other => out.push_str(&other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sorts_keys_at_every_depth() {
        let v = json!({"b": {"z": 1, "a": 2}, "a": [{"y": 1, "x": 2}]});
        assert_eq!(
            canonical_json(&v),
            r#"{"a":[{"x":2,"y":1}],"b":{"a":2,"z":1}}"#
        );
    }

    #[test]
    fn arrays_preserve_order() {
        let v = json!({"k": [3, 1, 2]});
        assert_eq!(canonical_json(&v), r#"{"k":[3,1,2]}"#);
    }

    #[test]
    fn idempotent() {
        let v = json!({"m": {"b": 1.5, "a": "x"}, "n": [true, null]});
        let once = canonical_json(&v);
        let reparsed: Value = serde_json::from_str(&once).unwrap();
        assert_eq!(canonical_json(&reparsed), once);
    }

    #[test]
    fn stable_across_key_reordering() {
        let a: Value = serde_json::from_str(r#"{"x":1,"y":2,"z":{"q":3,"p":4}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"z":{"p":4,"q":3},"y":2,"x":1}"#).unwrap();
        assert_eq!(canonical_json(&a), canonical_json(&b));
    }

    #[test]
    fn escapes_strings() {
        let v = json!({"k": "line\n\"quote\""});
        assert_eq!(canonical_json(&v), r#"{"k":"line\n\"quote\""}"#);
    }

    #[test]
    fn integers_render_without_fraction() {
        let v = json!({"ts": 1670000000000i64, "n": 0});
        assert_eq!(canonical_json(&v), r#"{"n":0,"ts":1670000000000}"#);
    }
}
