//! Patch generation.

use super::{escape_token, Patch};
use serde_json::{Map, Value};
use std::borrow::Cow;

/// Elements that carry a stable identifier can be diffed by identity.
///
/// Arrays where every element (old and new) yields an identifier are matched
/// element by element; any element without one forces a whole-array replace.
pub trait StableIdentity {
    fn stable_id<'a>(&self, item: &'a Value) -> Option<&'a Value>;
}

/// Identifier located by a JSON pointer inside each element.
#[derive(Debug, Clone)]
pub struct IdPointer(Cow<'static, str>);

impl IdPointer {
    /// The engine's conventional nested object id.
    pub const QINFO: IdPointer = IdPointer(Cow::Borrowed("/qInfo/qId"));

    pub fn new(pointer: impl Into<String>) -> Self {
        Self(Cow::Owned(pointer.into()))
    }
}

impl Default for IdPointer {
    fn default() -> Self {
        Self::QINFO
    }
}

impl StableIdentity for IdPointer {
    fn stable_id<'a>(&self, item: &'a Value) -> Option<&'a Value> {
        item.pointer(&self.0).filter(|id| !id.is_null())
    }
}

/// Diff two values, matching array elements by `qInfo.qId`.
pub fn generate(original: &Value, updated: &Value, base_path: &str) -> Vec<Patch> {
    generate_with(original, updated, base_path, &IdPointer::QINFO)
}

/// Diff two values with a caller-chosen element identity.
pub fn generate_with(
    original: &Value,
    updated: &Value,
    base_path: &str,
    identity: &dyn StableIdentity,
) -> Vec<Patch> {
    let mut patches = Vec::new();
    diff(original, updated, base_path, identity, &mut patches);
    patches
}

fn target(path: &str) -> &str {
    if path.is_empty() {
        "/"
    } else {
        path
    }
}

fn diff(
    original: &Value,
    updated: &Value,
    path: &str,
    identity: &dyn StableIdentity,
    out: &mut Vec<Patch>,
) {
    if original == updated {
        return;
    }
    match (original, updated) {
        (Value::Object(old), Value::Object(new)) => diff_objects(old, new, path, identity, out),
        (Value::Array(old), Value::Array(new)) => diff_arrays(old, new, path, identity, out),
        _ => out.push(Patch::replace(target(path), updated.clone())),
    }
}

fn diff_objects(
    old: &Map<String, Value>,
    new: &Map<String, Value>,
    path: &str,
    identity: &dyn StableIdentity,
    out: &mut Vec<Patch>,
) {
    for (key, value) in new {
        let child = format!("{}/{}", path, escape_token(key));
        match old.get(key) {
            None => out.push(Patch::add(child, value.clone())),
            Some(previous) => diff(previous, value, &child, identity, out),
        }
    }
    for key in old.keys() {
        if !new.contains_key(key) {
            out.push(Patch::remove(format!("{}/{}", path, escape_token(key))));
        }
    }
}

fn diff_arrays(
    old: &[Value],
    new: &[Value],
    path: &str,
    identity: &dyn StableIdentity,
    out: &mut Vec<Patch>,
) {
    let keyed = old
        .iter()
        .chain(new.iter())
        .all(|item| identity.stable_id(item).is_some());
    if !keyed {
        out.push(Patch::replace(target(path), Value::Array(new.to_vec())));
        return;
    }

    // Mirrors the target array while the patch list is built.
    let mut working: Vec<&Value> = old.iter().collect();

    for i in (0..working.len()).rev() {
        let id = identity.stable_id(working[i]);
        match find_in_new(new, id, i, identity) {
            None => {
                out.push(Patch::remove(format!("{}/{}", path, i)));
                working.remove(i);
            }
            Some(j) => diff(working[i], &new[j], &format!("{}/{}", path, i), identity, out),
        }
    }

    for (i, item) in new.iter().enumerate() {
        let id = identity.stable_id(item);
        // Everything before `i` already matches `new`.
        let found = working[i..]
            .iter()
            .position(|candidate| identity.stable_id(candidate) == id)
            .map(|offset| offset + i);
        match found {
            None => {
                out.push(Patch::add(format!("{}/{}", path, i), item.clone()));
                working.insert(i, item);
            }
            Some(j) if j != i => {
                out.push(Patch::move_to(
                    format!("{}/{}", path, j),
                    format!("{}/{}", path, i),
                ));
                let moved = working.remove(j);
                working.insert(i, moved);
            }
            Some(_) => {}
        }
    }
}

fn find_in_new(
    new: &[Value],
    id: Option<&Value>,
    hint: usize,
    identity: &dyn StableIdentity,
) -> Option<usize> {
    if let Some(item) = new.get(hint) {
        if identity.stable_id(item) == id {
            return Some(hint);
        }
    }
    new.iter().position(|item| identity.stable_id(item) == id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::{apply, PatchOp};
    use serde_json::json;

    fn by_id() -> IdPointer {
        IdPointer::new("/id")
    }

    #[test]
    fn test_identical_values_produce_no_patches() {
        let value = json!({"a": [1, 2, {"b": null}], "c": "x"});
        assert!(generate(&value, &value, "").is_empty());
        assert!(generate(&json!(3), &json!(3), "").is_empty());
    }

    #[test]
    fn test_object_add_replace_remove() {
        let original = json!({"keep": 1, "change": "a", "drop": true, "retype": 1});
        let updated = json!({"keep": 1, "change": "b", "retype": "1", "new": [1]});
        let patches = generate(&original, &updated, "");

        assert!(patches.contains(&Patch::replace("/change", json!("b"))));
        assert!(patches.contains(&Patch::replace("/retype", json!("1"))));
        assert!(patches.contains(&Patch::add("/new", json!([1]))));
        assert!(patches.contains(&Patch::remove("/drop")));
        assert_eq!(patches.len(), 4);
    }

    #[test]
    fn test_nested_objects_recurse() {
        let original = json!({"qLayout": {"qTitle": "A", "qMeta": {"rank": 1}}});
        let updated = json!({"qLayout": {"qTitle": "A", "qMeta": {"rank": 2}}});
        assert_eq!(
            generate(&original, &updated, ""),
            vec![Patch::replace("/qLayout/qMeta/rank", json!(2))]
        );
    }

    #[test]
    fn test_base_path_and_escaping() {
        let patches = generate(&json!({}), &json!({"a/b": 1}), "/root");
        assert_eq!(patches, vec![Patch::add("/root/a~1b", json!(1))]);
    }

    #[test]
    fn test_differing_roots_replace_at_root() {
        assert_eq!(
            generate(&json!({"a": 1}), &json!(false), ""),
            vec![Patch::replace("/", json!(false))]
        );
    }

    #[test]
    fn test_array_without_identifiers_is_replaced() {
        let original = json!({"list": [1, 2, 3]});
        let updated = json!({"list": [1, 3]});
        assert_eq!(
            generate(&original, &updated, ""),
            vec![Patch::replace("/list", json!([1, 3]))]
        );
    }

    #[test]
    fn test_array_with_one_unidentified_element_is_replaced() {
        let original = json!([{"id": 1}, {"id": 2}]);
        let updated = json!([{"id": 1}, {"name": "anonymous"}]);
        let patches = generate_with(&original, &updated, "", &by_id());
        assert_eq!(patches, vec![Patch::replace("/", updated.clone())]);
    }

    #[test]
    fn test_identifier_matched_array_diff() {
        let original = json!([{"id": 1}, {"id": 2}, {"id": 3}]);
        let updated = json!([{"id": 2}, {"id": 4}]);
        let patches = generate_with(&original, &updated, "", &by_id());

        assert_eq!(
            patches,
            vec![
                Patch::remove("/2"),
                Patch::remove("/0"),
                Patch::add("/1", json!({"id": 4})),
            ]
        );

        let mut target = original.clone();
        apply(&mut target, &patches).unwrap();
        assert_eq!(target, updated);
    }

    #[test]
    fn test_identifier_matched_array_reorder_uses_move() {
        let original = json!([{"id": "a"}, {"id": "b"}, {"id": "c"}]);
        let updated = json!([{"id": "c"}, {"id": "a"}, {"id": "b"}]);
        let patches = generate_with(&original, &updated, "", &by_id());

        assert!(patches.iter().all(|p| p.op == PatchOp::Move));
        let mut target = original.clone();
        apply(&mut target, &patches).unwrap();
        assert_eq!(target, updated);
    }

    #[test]
    fn test_identifier_matched_elements_recurse() {
        let original = json!({"items": [{"qInfo": {"qId": "x"}, "qTitle": "old"}]});
        let updated = json!({"items": [{"qInfo": {"qId": "x"}, "qTitle": "new"}]});
        assert_eq!(
            generate(&original, &updated, ""),
            vec![Patch::replace("/items/0/qTitle", json!("new"))]
        );
    }

    #[test]
    fn test_round_trip_mixed_document() {
        let original = json!({
            "qInfo": {"qId": "sheet", "qType": "sheet"},
            "cells": [
                {"qInfo": {"qId": "c1"}, "col": 0},
                {"qInfo": {"qId": "c2"}, "col": 6},
                {"qInfo": {"qId": "c3"}, "col": 12}
            ],
            "tags": ["a", "b"],
            "rank": 3
        });
        let updated = json!({
            "qInfo": {"qId": "sheet", "qType": "sheet"},
            "cells": [
                {"qInfo": {"qId": "c3"}, "col": 0},
                {"qInfo": {"qId": "c4"}, "col": 6},
                {"qInfo": {"qId": "c1"}, "col": 12}
            ],
            "tags": ["b"],
            "title": "Overview"
        });

        let mut target = original.clone();
        apply(&mut target, &generate(&original, &updated, "")).unwrap();
        assert_eq!(target, updated);
    }
}
