//! Patch application.
//!
//! Container values are merged into the container already at the target path
//! so references held by the caller stay attached to the same storage.

use super::{parse_pointer, Patch, PatchOp};
use crate::error::{EnigmaError, Result};
use serde_json::{Map, Value};

/// Apply `patches` to `target` in order.
///
/// Stops at the first failing patch; earlier patches stay applied.
pub fn apply(target: &mut Value, patches: &[Patch]) -> Result<()> {
    for patch in patches {
        apply_one(target, patch)?;
    }
    Ok(())
}

fn apply_one(doc: &mut Value, patch: &Patch) -> Result<()> {
    let path = parse_pointer(&patch.path)?;
    let value = patch.value.clone().unwrap_or(Value::Null);

    if path.is_empty() {
        return match patch.op {
            PatchOp::Add | PatchOp::Replace if patch.has_container_value() => {
                merge_into(doc, value);
                Ok(())
            }
            PatchOp::Add | PatchOp::Replace => {
                *doc = value;
                Ok(())
            }
            PatchOp::Remove | PatchOp::Move => Err(no_parent(&patch.path)),
        };
    }

    match patch.op {
        PatchOp::Add => apply_add(doc, &patch.path, &path, value),
        PatchOp::Replace => apply_replace(doc, &patch.path, &path, value),
        PatchOp::Remove => apply_remove(doc, &patch.path, &path).map(|_| ()),
        PatchOp::Move => {
            let from_raw = patch.from.as_deref().ok_or_else(|| EnigmaError::InvalidPatch {
                path: patch.path.clone(),
                message: "move without 'from'".to_string(),
            })?;
            let from = parse_pointer(from_raw)?;
            if from.is_empty() {
                return Err(no_parent(from_raw));
            }
            let moved = apply_remove(doc, from_raw, &from)?.ok_or_else(|| {
                EnigmaError::InvalidPatch {
                    path: from_raw.to_string(),
                    message: "nothing to move".to_string(),
                }
            })?;
            apply_add(doc, &patch.path, &path, moved)
        }
    }
}

fn no_parent(path: &str) -> EnigmaError {
    EnigmaError::PatchHasNoParent {
        path: path.to_string(),
    }
}

/// Mutable navigation to the container holding the last token of `path`.
fn parent_mut<'a>(doc: &'a mut Value, raw: &str, path: &[String]) -> Result<&'a mut Value> {
    let (parent_path, _) = path.split_at(path.len() - 1);
    let mut current = doc;
    for token in parent_path {
        current = match current {
            Value::Object(map) => map.get_mut(token),
            Value::Array(items) => token.parse::<usize>().ok().and_then(|i| items.get_mut(i)),
            _ => None,
        }
        .ok_or_else(|| no_parent(raw))?;
    }
    if current.is_object() || current.is_array() {
        Ok(current)
    } else {
        Err(no_parent(raw))
    }
}

fn index(raw: &str, key: &str) -> Result<usize> {
    key.parse().map_err(|_| EnigmaError::InvalidPatch {
        path: raw.to_string(),
        message: format!("'{}' is not an array index", key),
    })
}

fn out_of_range(raw: &str, idx: usize, len: usize) -> EnigmaError {
    EnigmaError::InvalidPatch {
        path: raw.to_string(),
        message: format!("index {} out of range for length {}", idx, len),
    }
}

fn last(path: &[String]) -> &str {
    path.last().map(String::as_str).unwrap_or_default()
}

fn apply_add(doc: &mut Value, raw: &str, path: &[String], value: Value) -> Result<()> {
    let key = last(path);
    match parent_mut(doc, raw, path)? {
        Value::Object(map) => {
            set_key(map, key, value);
            Ok(())
        }
        Value::Array(items) => {
            if key == "-" {
                items.push(value);
                return Ok(());
            }
            let idx = index(raw, key)?;
            if idx > items.len() {
                return Err(out_of_range(raw, idx, items.len()));
            }
            items.insert(idx, value);
            Ok(())
        }
        _ => Err(no_parent(raw)),
    }
}

fn apply_replace(doc: &mut Value, raw: &str, path: &[String], value: Value) -> Result<()> {
    let key = last(path);
    match parent_mut(doc, raw, path)? {
        Value::Object(map) => {
            set_key(map, key, value);
            Ok(())
        }
        Value::Array(items) => {
            let idx = index(raw, key)?;
            let len = items.len();
            let slot = items.get_mut(idx).ok_or_else(|| out_of_range(raw, idx, len))?;
            merge_into(slot, value);
            Ok(())
        }
        _ => Err(no_parent(raw)),
    }
}

fn apply_remove(doc: &mut Value, raw: &str, path: &[String]) -> Result<Option<Value>> {
    let key = last(path);
    match parent_mut(doc, raw, path)? {
        Value::Object(map) => Ok(map.remove(key)),
        Value::Array(items) => {
            let idx = index(raw, key)?;
            if idx >= items.len() {
                return Err(out_of_range(raw, idx, items.len()));
            }
            Ok(Some(items.remove(idx)))
        }
        _ => Err(no_parent(raw)),
    }
}

fn set_key(map: &mut Map<String, Value>, key: &str, value: Value) {
    match map.get_mut(key) {
        Some(slot) => merge_into(slot, value),
        None => {
            map.insert(key.to_string(), value);
        }
    }
}

/// Overwrite `slot` with `value`, reusing `slot`'s storage when both are the
/// same kind of container.
fn merge_into(slot: &mut Value, value: Value) {
    match (slot, value) {
        (Value::Object(existing), Value::Object(incoming)) => {
            existing.retain(|key, _| incoming.contains_key(key));
            for (key, item) in incoming {
                existing.insert(key, item);
            }
        }
        (Value::Array(existing), Value::Array(incoming)) => {
            let len = incoming.len();
            for (i, item) in incoming.into_iter().enumerate() {
                match existing.get_mut(i) {
                    Some(current) => *current = item,
                    None => existing.push(item),
                }
            }
            existing.truncate(len);
        }
        (slot, value) => *slot = value,
    }
}
