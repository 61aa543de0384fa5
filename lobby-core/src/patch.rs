//! Structural patches over the JSON form of [`SharedState`].
//!
//! Patches use JSON-pointer paths (`/users/1/name`) and three operations.
//! They assume a single writer per document: only the server role computes
//! diffs and appends them, so two patches never race on the same path.
//! Concurrent structural writers are unsupported.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::SharedState;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PatchError {
    #[error("invalid pointer: {0}")]
    InvalidPointer(String),

    #[error("path not found: {0}")]
    PathNotFound(String),

    #[error("cannot remove the document root")]
    RemoveRoot,

    #[error("state (de)serialization failed: {0}")]
    State(String),
}

/// A single structural change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
    Add { path: String, value: Value },
    Remove { path: String },
    Replace { path: String, value: Value },
}

impl PatchOp {
    pub fn path(&self) -> &str {
        match self {
            PatchOp::Add { path, .. } | PatchOp::Remove { path } | PatchOp::Replace { path, .. } => {
                path
            }
        }
    }
}

/// Compute the ops turning `old` into `new`.
pub fn diff(old: &Value, new: &Value) -> Vec<PatchOp> {
    let mut ops = Vec::new();
    diff_into(old, new, String::new(), &mut ops);
    ops
}

fn diff_into(old: &Value, new: &Value, path: String, ops: &mut Vec<PatchOp>) {
    if old == new {
        return;
    }
    match (old, new) {
        (Value::Object(a), Value::Object(b)) => {
            for key in a.keys() {
                if !b.contains_key(key) {
                    ops.push(PatchOp::Remove {
                        path: child(&path, key),
                    });
                }
            }
            for (key, value) in b {
                match a.get(key) {
                    Some(prev) => diff_into(prev, value, child(&path, key), ops),
                    None => ops.push(PatchOp::Add {
                        path: child(&path, key),
                        value: value.clone(),
                    }),
                }
            }
        }
        (Value::Array(a), Value::Array(b)) => {
            let common = a.len().min(b.len());
            for i in 0..common {
                diff_into(&a[i], &b[i], child(&path, &i.to_string()), ops);
            }
            for (i, value) in b.iter().enumerate().skip(common) {
                ops.push(PatchOp::Add {
                    path: child(&path, &i.to_string()),
                    value: value.clone(),
                });
            }
            // Highest index first so earlier removals don't shift later ones.
            for i in (common..a.len()).rev() {
                ops.push(PatchOp::Remove {
                    path: child(&path, &i.to_string()),
                });
            }
        }
        _ => ops.push(PatchOp::Replace {
            path,
            value: new.clone(),
        }),
    }
}

fn child(path: &str, token: &str) -> String {
    let escaped = token.replace('~', "~0").replace('/', "~1");
    format!("{path}/{escaped}")
}

fn parse_pointer(path: &str) -> Result<Vec<String>, PatchError> {
    if path.is_empty() {
        return Ok(Vec::new());
    }
    let rest = path
        .strip_prefix('/')
        .ok_or_else(|| PatchError::InvalidPointer(path.to_string()))?;
    Ok(rest
        .split('/')
        .map(|t| t.replace("~1", "/").replace("~0", "~"))
        .collect())
}

/// Apply `ops` in order. On error `doc` may be partially patched; use
/// [`apply_to_state`] for all-or-nothing application.
pub fn apply(doc: &mut Value, ops: &[PatchOp]) -> Result<(), PatchError> {
    for op in ops {
        apply_one(doc, op)?;
    }
    Ok(())
}

fn apply_one(doc: &mut Value, op: &PatchOp) -> Result<(), PatchError> {
    let tokens = parse_pointer(op.path())?;
    let Some((last, parents)) = tokens.split_last() else {
        return match op {
            PatchOp::Add { value, .. } | PatchOp::Replace { value, .. } => {
                *doc = value.clone();
                Ok(())
            }
            PatchOp::Remove { .. } => Err(PatchError::RemoveRoot),
        };
    };

    let mut target = doc;
    for token in parents {
        target = match target {
            Value::Object(map) => map.get_mut(token),
            Value::Array(items) => token.parse::<usize>().ok().and_then(|i| items.get_mut(i)),
            _ => None,
        }
        .ok_or_else(|| PatchError::PathNotFound(op.path().to_string()))?;
    }

    let not_found = || PatchError::PathNotFound(op.path().to_string());
    match target {
        Value::Object(map) => apply_to_object(map, last, op).ok_or_else(not_found),
        Value::Array(items) => apply_to_array(items, last, op).ok_or_else(not_found),
        _ => Err(not_found()),
    }
}

fn apply_to_object(map: &mut Map<String, Value>, key: &str, op: &PatchOp) -> Option<()> {
    match op {
        PatchOp::Add { value, .. } => {
            map.insert(key.to_string(), value.clone());
        }
        PatchOp::Replace { value, .. } => {
            *map.get_mut(key)? = value.clone();
        }
        PatchOp::Remove { .. } => {
            map.remove(key)?;
        }
    }
    Some(())
}

fn apply_to_array(items: &mut Vec<Value>, token: &str, op: &PatchOp) -> Option<()> {
    if token == "-" {
        return match op {
            PatchOp::Add { value, .. } => {
                items.push(value.clone());
                Some(())
            }
            _ => None,
        };
    }
    let index: usize = token.parse().ok()?;
    match op {
        PatchOp::Add { value, .. } if index <= items.len() => items.insert(index, value.clone()),
        PatchOp::Replace { value, .. } if index < items.len() => items[index] = value.clone(),
        PatchOp::Remove { .. } if index < items.len() => {
            items.remove(index);
        }
        _ => return None,
    }
    Some(())
}

/// Diff two typed states.
pub fn diff_state(old: &SharedState, new: &SharedState) -> Result<Vec<PatchOp>, PatchError> {
    let a = serde_json::to_value(old).map_err(|e| PatchError::State(e.to_string()))?;
    let b = serde_json::to_value(new).map_err(|e| PatchError::State(e.to_string()))?;
    Ok(diff(&a, &b))
}

/// Apply ops to a typed state, returning the patched copy. `state` is left
/// untouched when any op fails.
pub fn apply_to_state(state: &SharedState, ops: &[PatchOp]) -> Result<SharedState, PatchError> {
    let mut value = serde_json::to_value(state).map_err(|e| PatchError::State(e.to_string()))?;
    apply(&mut value, ops)?;
    serde_json::from_value(value).map_err(|e| PatchError::State(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_diff_identical_is_empty() {
        let v = json!({"a": 1, "b": [1, 2]});
        assert!(diff(&v, &v).is_empty());
    }

    #[test]
    fn test_diff_apply_object_changes() {
        let old = json!({"name": "a", "gone": true, "nested": {"x": 1}});
        let new = json!({"name": "b", "added": [1], "nested": {"x": 2, "y": 3}});
        let ops = diff(&old, &new);
        let mut doc = old.clone();
        apply(&mut doc, &ops).unwrap();
        assert_eq!(doc, new);
    }

    #[test]
    fn test_diff_apply_array_grow_and_shrink() {
        let old = json!({"users": [1, 2, 3, 4]});
        let shrunk = json!({"users": [1, 3]});
        let grown = json!({"users": [1, 3, 5, 6, 7]});

        let mut doc = old.clone();
        apply(&mut doc, &diff(&old, &shrunk)).unwrap();
        assert_eq!(doc, shrunk);

        apply(&mut doc, &diff(&shrunk, &grown)).unwrap();
        assert_eq!(doc, grown);
    }

    #[test]
    fn test_array_removals_highest_first() {
        let ops = diff(&json!([1, 2, 3]), &json!([1]));
        assert_eq!(
            ops,
            vec![
                PatchOp::Remove { path: "/2".into() },
                PatchOp::Remove { path: "/1".into() },
            ]
        );
    }

    #[test]
    fn test_pointer_escaping() {
        let old = json!({});
        let new = json!({"a/b": 1, "c~d": 2});
        let ops = diff(&old, &new);
        assert!(ops.iter().any(|op| op.path() == "/a~1b"));
        assert!(ops.iter().any(|op| op.path() == "/c~0d"));
        let mut doc = old.clone();
        apply(&mut doc, &ops).unwrap();
        assert_eq!(doc, new);
    }

    #[test]
    fn test_root_replace_and_remove() {
        let mut doc = json!(1);
        apply(&mut doc, &diff(&json!(1), &json!("x"))).unwrap();
        assert_eq!(doc, json!("x"));
        assert_eq!(
            apply(&mut doc, &[PatchOp::Remove { path: String::new() }]),
            Err(PatchError::RemoveRoot)
        );
    }

    #[test]
    fn test_append_with_dash() {
        let mut doc = json!({"list": [1]});
        apply(
            &mut doc,
            &[PatchOp::Add {
                path: "/list/-".into(),
                value: json!(2),
            }],
        )
        .unwrap();
        assert_eq!(doc, json!({"list": [1, 2]}));
    }

    #[test]
    fn test_missing_path_errors() {
        let mut doc = json!({"a": {}});
        let err = apply(&mut doc, &[PatchOp::Remove { path: "/a/b".into() }]).unwrap_err();
        assert_eq!(err, PatchError::PathNotFound("/a/b".into()));

        let err = apply(
            &mut doc,
            &[PatchOp::Replace {
                path: "/x/y".into(),
                value: json!(1),
            }],
        )
        .unwrap_err();
        assert!(matches!(err, PatchError::PathNotFound(_)));

        assert!(matches!(
            apply(&mut doc, &[PatchOp::Remove { path: "a".into() }]),
            Err(PatchError::InvalidPointer(_))
        ));
    }

    #[test]
    fn test_patch_op_json_shape() {
        let op = PatchOp::Replace {
            path: "/name".into(),
            value: json!("x"),
        };
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json, json!({"op": "replace", "path": "/name", "value": "x"}));
    }
}
