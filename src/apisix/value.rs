//! Structural equivalence of plugin configuration trees.
//!
//! Values reach the model from JSON (store), YAML (extra resources, file
//! store) and TOML, and the decoders disagree on number representation: `1`
//! from one source may be `1.0` from another. Equivalence compares numbers by
//! value so such pairs never register as a difference.

use serde_json::{Number, Value};

/// Returns true if `a` and `b` describe the same tree.
pub fn values_equivalent(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => numbers_equivalent(x, y),
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| values_equivalent(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(key, x)| ys.get(key).is_some_and(|y| values_equivalent(x, y)))
        }
        _ => a == b,
    }
}

fn numbers_equivalent(x: &Number, y: &Number) -> bool {
    if let (Some(a), Some(b)) = (x.as_i64(), y.as_i64()) {
        return a == b;
    }
    if let (Some(a), Some(b)) = (x.as_u64(), y.as_u64()) {
        return a == b;
    }
    match (x.as_f64(), y.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_integer_and_float_are_equivalent() {
        assert!(values_equivalent(&json!({"rate": 1}), &json!({"rate": 1.0})));
        assert!(!values_equivalent(&json!({"rate": 1}), &json!({"rate": 1.5})));
    }

    #[test]
    fn test_yaml_and_json_decoders_agree() {
        let from_json: Value =
            serde_json::from_str(r#"{"limit-req": {"rate": 10, "burst": 5.0, "keys": ["a"]}}"#)
                .unwrap();
        let from_yaml: Value =
            serde_yaml::from_str("limit-req:\n  rate: 10.0\n  burst: 5\n  keys: [a]\n").unwrap();
        assert!(values_equivalent(&from_json, &from_yaml));
    }

    #[test]
    fn test_object_key_sets_must_match() {
        assert!(!values_equivalent(&json!({"a": 1}), &json!({"a": 1, "b": 2})));
        assert!(!values_equivalent(&json!({"a": 1, "b": 2}), &json!({"a": 1, "c": 2})));
    }

    #[test]
    fn test_array_order_matters() {
        assert!(!values_equivalent(&json!([1, 2]), &json!([2, 1])));
        assert!(values_equivalent(&json!([1, "x", null]), &json!([1.0, "x", null])));
    }
}
