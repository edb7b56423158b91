//! Payload diffing and storage size estimation
//!
//! Payloads are JSON key trees rooted at account ids, e.g.
//! `{"alice": {"profile": {"name": "Alice"}}}`. A `null` value deletes the
//! key it is written to.

use serde_json::{Map, Value};

/// Estimated ledger overhead of a new key/value pair, in bytes
pub const ESTIMATED_KEY_VALUE_SIZE: i64 = 40 * 3 + 8 + 12;

/// Estimated ledger overhead of a new object node, in bytes
pub const ESTIMATED_NODE_SIZE: i64 = 40 * 2 + 8 + 10;

/// Size charged for scalars that are not strings
const SCALAR_SIZE: i64 = 8;

/// Leaf paths of a payload, segments joined with `/`
///
/// Empty objects count as leaves so that writing `{}` still fetches the key.
pub fn extract_keys(data: &Value) -> Vec<String> {
    let mut keys = Vec::new();
    if let Value::Object(map) = data {
        collect_keys(map, "", &mut keys);
    }
    keys
}

fn collect_keys(map: &Map<String, Value>, prefix: &str, keys: &mut Vec<String>) {
    for (key, value) in map {
        let path = format!("{}{}", prefix, key);
        match value {
            Value::Object(child) if !child.is_empty() => {
                collect_keys(child, &format!("{}/", path), keys);
            }
            _ => keys.push(path),
        }
    }
}

/// Minimal patch turning `current` into `desired`
///
/// Keys whose value already matches are dropped, as are deletions of keys
/// that do not exist. `None` means nothing would change.
pub fn compute_diff(desired: &Value, current: &Value) -> Option<Value> {
    match (desired, current) {
        (Value::Object(want), Value::Object(have)) => {
            let mut patch = Map::new();
            for (key, value) in want {
                match have.get(key) {
                    Some(existing) => {
                        if let Some(changed) = compute_diff(value, existing) {
                            patch.insert(key.clone(), changed);
                        }
                    }
                    None if value.is_null() => {}
                    None => {
                        patch.insert(key.clone(), value.clone());
                    }
                }
            }
            if patch.is_empty() {
                None
            } else {
                Some(Value::Object(patch))
            }
        }
        (Value::Object(want), _) if want.is_empty() => None,
        (want, have) if want == have => None,
        (want, _) => Some(want.clone()),
    }
}

/// Estimated change in stored bytes from writing `data` over `prev`
///
/// Negative when the write shrinks existing values.
pub fn estimate_data_size(data: &Value, prev: Option<&Value>) -> i64 {
    match data {
        Value::Object(map) => {
            let prev_map = prev.and_then(Value::as_object);
            let base = if prev_map.is_some() { 0 } else { ESTIMATED_NODE_SIZE };
            map.iter().fold(base, |size, (key, value)| {
                match prev_map.and_then(|m| m.get(key)) {
                    Some(prev_value) => size + estimate_data_size(value, Some(prev_value)),
                    None => {
                        size + key.len() as i64 * 2
                            + estimate_data_size(value, None)
                            + ESTIMATED_KEY_VALUE_SIZE
                    }
                }
            })
        }
        other => {
            let size = match other {
                Value::String(s) if !s.is_empty() => s.len() as i64,
                _ => SCALAR_SIZE,
            };
            let prev_size = match prev {
                Some(Value::String(s)) => s.len() as i64,
                _ => 0,
            };
            size - prev_size
        }
    }
}

/// Apply `patch` to `target` in place; `null` values delete keys
pub fn apply_patch(target: &mut Value, patch: &Value) {
    let Value::Object(entries) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(map) = target {
        for (key, value) in entries {
            if value.is_null() {
                map.remove(key);
                continue;
            }
            match map.get_mut(key) {
                Some(existing) if existing.is_object() && value.is_object() => {
                    apply_patch(existing, value);
                }
                _ => {
                    map.insert(key.clone(), value.clone());
                }
            }
        }
    }
}

/// Value stored at a `/`-separated path, if any
pub fn value_at<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('/')
        .try_fold(root, |node, segment| node.as_object()?.get(segment))
}

/// Copy the values at `keys` out of `root` into a fresh tree
pub fn select_paths(root: &Value, keys: &[String]) -> Value {
    let mut out = Map::new();
    for key in keys {
        if let Some(found) = value_at(root, key) {
            let segments: Vec<&str> = key.split('/').collect();
            insert_at(&mut out, &segments, found.clone());
        }
    }
    Value::Object(out)
}

fn insert_at(map: &mut Map<String, Value>, segments: &[&str], value: Value) {
    match segments {
        [] => {}
        [last] => {
            map.insert((*last).to_string(), value);
        }
        [head, rest @ ..] => {
            let child = map
                .entry((*head).to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(child) = child {
                insert_at(child, rest, value);
            }
        }
    }
}
