//! Structural diff and patch engine.
//!
//! Patches are JSON-Pointer addressed mutations (`add`, `replace`, `remove`,
//! `move`). [`generate`] produces the minimal list that turns one value into
//! another and [`apply`] replays a list in place, merging container values into
//! the existing container instead of swapping it out.
//!
//! The engine addresses the document root as `/` (an empty path is accepted
//! as well).

mod apply;
mod generate;

pub use apply::apply;
pub use generate::{generate, generate_with, IdPointer, StableIdentity};

use crate::error::{EnigmaError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Patch operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchOp {
    Add,
    Replace,
    Remove,
    Move,
}

/// A single JSON-Pointer addressed mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    pub op: PatchOp,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
}

impl Patch {
    pub fn add(path: impl Into<String>, value: Value) -> Self {
        Self {
            op: PatchOp::Add,
            path: path.into(),
            value: Some(value),
            from: None,
        }
    }

    pub fn replace(path: impl Into<String>, value: Value) -> Self {
        Self {
            op: PatchOp::Replace,
            path: path.into(),
            value: Some(value),
            from: None,
        }
    }

    pub fn remove(path: impl Into<String>) -> Self {
        Self {
            op: PatchOp::Remove,
            path: path.into(),
            value: None,
            from: None,
        }
    }

    pub fn move_to(from: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            op: PatchOp::Move,
            path: path.into(),
            value: None,
            from: Some(from.into()),
        }
    }

    /// Whether the patch targets the document root.
    pub fn is_root(&self) -> bool {
        is_root_path(&self.path)
    }

    /// Whether the carried value is an object or array.
    pub fn has_container_value(&self) -> bool {
        matches!(self.value, Some(Value::Object(_)) | Some(Value::Array(_)))
    }
}

pub(crate) fn is_root_path(path: &str) -> bool {
    path.is_empty() || path == "/"
}

/// Escape one reference token (`~` → `~0`, `/` → `~1`).
pub fn escape_token(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

fn unescape_token(token: &str) -> String {
    token.replace("~1", "/").replace("~0", "~")
}

/// Split a pointer into unescaped reference tokens; the root yields none.
pub(crate) fn parse_pointer(path: &str) -> Result<Vec<String>> {
    if is_root_path(path) {
        return Ok(Vec::new());
    }
    let rest = path.strip_prefix('/').ok_or_else(|| EnigmaError::InvalidPatch {
        path: path.to_string(),
        message: "pointer must start with '/'".to_string(),
    })?;
    Ok(rest.split('/').map(unescape_token).collect())
}

/// Bring `original` up to date with `new_data`.
///
/// An empty original (null, `{}` or `[]`) takes a copy of `new_data`; anything
/// else is patched in place with the generated diff.
pub fn update_object(original: &mut Value, new_data: &Value) -> Result<()> {
    let empty = match original {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    };
    if empty {
        *original = new_data.clone();
        return Ok(());
    }
    let patches = generate(original, new_data, "");
    apply(original, &patches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_patch_serialization() {
        let patch = Patch::move_to("/a/0", "/a/2");
        let json = serde_json::to_value(&patch).unwrap();
        assert_eq!(json, json!({"op": "move", "path": "/a/2", "from": "/a/0"}));

        let parsed: Patch =
            serde_json::from_value(json!({"op": "add", "path": "/", "value": {"a": 1}})).unwrap();
        assert_eq!(parsed, Patch::add("/", json!({"a": 1})));
        assert!(parsed.is_root());
        assert!(parsed.has_container_value());
    }

    #[test]
    fn test_parse_pointer() {
        assert!(parse_pointer("/").unwrap().is_empty());
        assert!(parse_pointer("").unwrap().is_empty());
        assert_eq!(parse_pointer("/a~1b/c~0d/0").unwrap(), vec!["a/b", "c~d", "0"]);
        assert!(parse_pointer("a/b").is_err());
    }

    #[test]
    fn test_escape_token() {
        assert_eq!(escape_token("a/b~c"), "a~1b~0c");
    }

    #[test]
    fn test_update_object_copies_into_empty() {
        let mut original = json!({});
        update_object(&mut original, &json!({"qTitle": "Sheet"})).unwrap();
        assert_eq!(original, json!({"qTitle": "Sheet"}));
    }

    #[test]
    fn test_update_object_patches_existing() {
        let mut original = json!({"qTitle": "Sheet", "qStale": true});
        update_object(&mut original, &json!({"qTitle": "Renamed", "qRank": 2})).unwrap();
        assert_eq!(original, json!({"qTitle": "Renamed", "qRank": 2}));
    }
}
