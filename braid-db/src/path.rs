//! Dotted-path evaluation over parsed JSON.
//!
//! Index and query paths are dotted property chains with integer segments
//! indexing into arrays, e.g. `author.name` or `tags.0`.

use serde_json::Value;

/// Resolve a dotted path against a JSON value. `None` when any segment is
/// missing or of the wrong shape.
pub fn path_value<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// The canonical index-key string of a JSON value: strings index as
/// themselves, everything else as its JSON encoding.
pub fn value_key(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resolves_nested_and_array_paths() {
        let doc = json!({
            "author": {"name": "ada"},
            "tags": ["a", "b"],
            "editions": [{"year": 1843}],
        });
        assert_eq!(path_value(&doc, "author.name"), Some(&json!("ada")));
        assert_eq!(path_value(&doc, "tags.1"), Some(&json!("b")));
        assert_eq!(path_value(&doc, "editions.0.year"), Some(&json!(1843)));
        assert_eq!(path_value(&doc, "author.age"), None);
        assert_eq!(path_value(&doc, "tags.x"), None);
        assert_eq!(path_value(&doc, "tags.5"), None);
    }

    #[test]
    fn value_keys_are_stable() {
        assert_eq!(value_key(&json!("x")), "x");
        assert_eq!(value_key(&json!(3)), "3");
        assert_eq!(value_key(&json!(true)), "true");
        assert_eq!(value_key(&json!(null)), "null");
    }
}
