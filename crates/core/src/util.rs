//! Small helpers shared with the expression evaluator: id generation,
//! status condition lookup, finalizer checks.

use rand::Rng;
use serde_json::Value;

const ID_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Random lowercase alphanumeric suffix for generated resource names.
/// Lengths outside 1..=100 fall back to 4.
pub fn make_id(length: Option<usize>) -> String {
    let length = match length {
        Some(n) if (1..=100).contains(&n) => n,
        _ => 4,
    };
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| ID_CHARS[rng.gen_range(0..ID_CHARS.len())] as char)
        .collect()
}

/// Find a `.status.conditions[]` entry by type.
pub fn find_condition<'a>(obj: &'a Value, cond_type: &str) -> Option<&'a Value> {
    obj.get("status")?
        .get("conditions")?
        .as_array()?
        .iter()
        .find(|c| c.get("type").and_then(Value::as_str) == Some(cond_type))
}

/// Like [`find_condition`] but only when the condition status is "True".
pub fn find_condition_true<'a>(obj: &'a Value, cond_type: &str) -> Option<&'a Value> {
    find_condition(obj, cond_type)
        .filter(|c| c.get("status").and_then(Value::as_str) == Some("True"))
}

/// True when the object carries the given finalizer, or any finalizer at
/// all when `finalizer` is None.
pub fn has_finalizer(obj: &Value, finalizer: Option<&str>) -> bool {
    let Some(list) = obj
        .get("metadata")
        .and_then(|m| m.get("finalizers"))
        .and_then(Value::as_array)
    else {
        return false;
    };
    if list.is_empty() {
        return false;
    }
    match finalizer {
        None => true,
        Some(f) => list.iter().any(|v| v.as_str() == Some(f)),
    }
}
