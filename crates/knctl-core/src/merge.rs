//! Three-way JSON merge patches
//!
//! Patches follow RFC 7386: objects merge key by key, `null` deletes a key
//! and arrays are replaced whole. The three-way patch combines deletions
//! from `original -> modified` with additions and changes from
//! `current -> modified`, so fields the server (or an admission controller)
//! added to `current` survive as long as the user never authored them.

use serde_json::{Map, Value};

/// Compute the patch that moves `current` to the user's `modified` intent
///
/// `original` is the previously applied configuration; `None` when the
/// object was never applied, in which case nothing is deleted.
pub fn three_way_merge(original: Option<&Value>, modified: &Value, current: &Value) -> Value {
    let empty = Value::Object(Map::new());

    let deletions = diff(
        original.unwrap_or(&empty),
        modified,
        DiffMode::DeletionsOnly,
    );
    let delta = diff(current, modified, DiffMode::IgnoreDeletions);

    let mut patch = Value::Object(deletions);
    merge_into(&mut patch, Value::Object(delta));
    patch
}

/// Whether a patch would change nothing
pub fn is_empty_patch(patch: &Value) -> bool {
    patch.as_object().is_some_and(Map::is_empty)
}

/// Apply a merge patch in place
pub fn apply_merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    let Value::Object(target) = target else {
        return;
    };
    for (key, value) in patch {
        if value.is_null() {
            target.remove(key);
        } else {
            let slot = target.entry(key.clone()).or_insert(Value::Null);
            apply_merge_patch(slot, value);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DiffMode {
    /// Only keys removed between `from` and `to`
    DeletionsOnly,
    /// Only keys added or changed between `from` and `to`
    IgnoreDeletions,
}

fn diff(from: &Value, to: &Value, mode: DiffMode) -> Map<String, Value> {
    let mut patch = Map::new();
    let (Some(from), Some(to)) = (from.as_object(), to.as_object()) else {
        return patch;
    };

    for (key, to_value) in to {
        match from.get(key) {
            None => {
                if mode == DiffMode::IgnoreDeletions {
                    patch.insert(key.clone(), to_value.clone());
                }
            }
            Some(from_value) if from_value.is_object() && to_value.is_object() => {
                let nested = diff(from_value, to_value, mode);
                if !nested.is_empty() {
                    patch.insert(key.clone(), Value::Object(nested));
                }
            }
            Some(from_value) => {
                if from_value != to_value && mode == DiffMode::IgnoreDeletions {
                    patch.insert(key.clone(), to_value.clone());
                }
            }
        }
    }

    if mode == DiffMode::DeletionsOnly {
        for key in from.keys() {
            if !to.contains_key(key) {
                patch.insert(key.clone(), Value::Null);
            }
        }
    }
    patch
}

/// Deep merge `overlay` into `base`; overlay wins on scalar conflicts
fn merge_into(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        merge_into(existing, value);
                    }
                    _ => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unchanged_is_empty() {
        let doc = json!({"spec": {"image": "a", "env": [{"name": "A"}]}});
        let patch = three_way_merge(Some(&doc), &doc, &doc);
        assert!(is_empty_patch(&patch));
    }

    #[test]
    fn test_foreign_fields_survive() {
        let original = json!({"spec": {"image": "a"}});
        let modified = json!({"spec": {"image": "b"}});
        let current = json!({
            "metadata": {"annotations": {"injected": "yes"}},
            "spec": {"image": "a", "sidecar": true},
            "status": {"ready": true}
        });

        let patch = three_way_merge(Some(&original), &modified, &current);
        assert_eq!(patch, json!({"spec": {"image": "b"}}));

        let mut result = current.clone();
        apply_merge_patch(&mut result, &patch);
        assert_eq!(result["metadata"]["annotations"]["injected"], "yes");
        assert_eq!(result["spec"]["sidecar"], true);
        assert_eq!(result["spec"]["image"], "b");
    }

    #[test]
    fn test_removed_user_field_is_deleted() {
        let original = json!({"metadata": {"labels": {"a": "1", "b": "2"}}});
        let modified = json!({"metadata": {"labels": {"a": "1"}}});
        let current = json!({"metadata": {"labels": {"a": "1", "b": "2", "c": "server"}}});

        let patch = three_way_merge(Some(&original), &modified, &current);
        assert_eq!(patch, json!({"metadata": {"labels": {"b": null}}}));

        let mut result = current;
        apply_merge_patch(&mut result, &patch);
        assert_eq!(result, json!({"metadata": {"labels": {"a": "1", "c": "server"}}}));
    }

    #[test]
    fn test_arrays_are_replaced() {
        let original = json!({"env": [{"name": "A", "value": "1"}]});
        let modified = json!({"env": [{"name": "A", "value": "2"}]});
        let current = original.clone();
        let patch = three_way_merge(Some(&original), &modified, &current);
        assert_eq!(patch, modified);
    }

    #[test]
    fn test_without_original_nothing_is_deleted() {
        let modified = json!({"spec": {"image": "a"}});
        let current = json!({"spec": {"image": "a", "extra": 1}});
        let patch = three_way_merge(None, &modified, &current);
        assert!(is_empty_patch(&patch));
    }

    #[test]
    fn test_current_drift_is_corrected() {
        let original = json!({"spec": {"image": "a"}});
        let current = json!({"spec": {"image": "hand-edited"}});
        let patch = three_way_merge(Some(&original), &original, &current);
        assert_eq!(patch, json!({"spec": {"image": "a"}}));
    }

    #[test]
    fn test_apply_merge_patch_rfc_examples() {
        let mut target = json!({"a": "b", "c": {"d": "e", "f": "g"}});
        apply_merge_patch(&mut target, &json!({"a": "z", "c": {"f": null}}));
        assert_eq!(target, json!({"a": "z", "c": {"d": "e"}}));

        let mut target = json!({"a": [1, 2]});
        apply_merge_patch(&mut target, &json!({"a": [3]}));
        assert_eq!(target, json!({"a": [3]}));

        let mut target = json!("scalar");
        apply_merge_patch(&mut target, &json!({"a": {"b": "c"}}));
        assert_eq!(target, json!({"a": {"b": "c"}}));
    }
}
