//! Session attribute patches.
//!
//! Attributes are a nested record on each session summary: a `core` block
//! (working dir, active branch, auto title), per-provider blocks under
//! `providers.<id>`, a `scheduledSession` marker, and arbitrary plugin
//! keys. Patches deep-merge: `null` deletes a key, nested objects merge
//! recursively, arrays and primitives replace.

use serde_json::{Map, Value};

use parlor_domain::error::{Error, Result};

/// Deep-merge `patch` into `base`.
pub fn merge_attributes(base: &mut Map<String, Value>, patch: &Map<String, Value>) {
    for (key, incoming) in patch {
        match incoming {
            Value::Null => {
                base.remove(key);
            }
            Value::Object(patch_obj) => match base.get_mut(key) {
                Some(Value::Object(base_obj)) => merge_attributes(base_obj, patch_obj),
                _ => {
                    let mut fresh = Map::new();
                    merge_attributes(&mut fresh, patch_obj);
                    base.insert(key.clone(), Value::Object(fresh));
                }
            },
            other => {
                base.insert(key.clone(), other.clone());
            }
        }
    }
}

/// Validate a patch before it is applied. Plugin keys are free-form; the
/// well-known subtrees are shape-checked.
pub fn validate_patch(patch: &Value) -> Result<()> {
    let obj = patch
        .as_object()
        .ok_or_else(|| Error::InvalidSessionAttributes("patch must be an object".into()))?;

    if let Some(core) = obj.get("core") {
        validate_core(core)?;
    }
    if let Some(providers) = obj.get("providers") {
        validate_providers(providers)?;
    }
    if let Some(marker) = obj.get("scheduledSession") {
        validate_scheduled_session(marker)?;
    }
    Ok(())
}

fn validate_core(core: &Value) -> Result<()> {
    if core.is_null() {
        return Ok(());
    }
    let obj = core
        .as_object()
        .ok_or_else(|| Error::InvalidSessionAttributes("core must be an object".into()))?;

    if let Some(wd) = obj.get("workingDir") {
        if !wd.is_null() {
            let s = wd.as_str().ok_or_else(|| {
                Error::InvalidSessionAttributes("core.workingDir must be a string".into())
            })?;
            if !std::path::Path::new(s).is_absolute() {
                return Err(Error::InvalidSessionAttributes(format!(
                    "core.workingDir must be absolute, got '{s}'"
                )));
            }
        }
    }
    if let Some(branch) = obj.get("activeBranch") {
        if !branch.is_null() && !branch.is_string() {
            return Err(Error::InvalidSessionAttributes(
                "core.activeBranch must be a string".into(),
            ));
        }
    }
    if let Some(title) = obj.get("autoTitle") {
        if !title.is_null() && !title.is_string() {
            return Err(Error::InvalidSessionAttributes(
                "core.autoTitle must be a string".into(),
            ));
        }
    }
    Ok(())
}

fn validate_providers(providers: &Value) -> Result<()> {
    if providers.is_null() {
        return Ok(());
    }
    let obj = providers
        .as_object()
        .ok_or_else(|| Error::InvalidSessionAttributes("providers must be an object".into()))?;

    for (provider_id, entry) in obj {
        if entry.is_null() {
            continue;
        }
        let entry_obj = entry.as_object().ok_or_else(|| {
            Error::InvalidSessionAttributes(format!(
                "providers.{provider_id} must be an object"
            ))
        })?;
        for field in ["sessionId", "cwd"] {
            if let Some(v) = entry_obj.get(field) {
                if !v.is_null() && !v.is_string() {
                    return Err(Error::InvalidSessionAttributes(format!(
                        "providers.{provider_id}.{field} must be a string"
                    )));
                }
            }
        }
    }
    Ok(())
}

fn validate_scheduled_session(marker: &Value) -> Result<()> {
    if marker.is_null() {
        return Ok(());
    }
    let obj = marker.as_object().ok_or_else(|| {
        Error::InvalidSessionAttributes("scheduledSession must be an object".into())
    })?;
    for field in ["agentId", "scheduleId"] {
        match obj.get(field) {
            Some(Value::String(s)) if !s.is_empty() => {}
            _ => {
                return Err(Error::InvalidSessionAttributes(format!(
                    "scheduledSession.{field} must be a non-empty string"
                )))
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn as_map(v: Value) -> Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn null_deletes_a_subtree() {
        let mut base = as_map(json!({"core": {"workingDir": "/w"}, "keep": 1}));
        merge_attributes(&mut base, &as_map(json!({"core": null})));
        assert!(!base.contains_key("core"));
        assert_eq!(base["keep"], 1);
    }

    #[test]
    fn nested_objects_merge_recursively() {
        let mut base = as_map(json!({"providers": {"claude-cli": {"sessionId": "a"}}}));
        merge_attributes(
            &mut base,
            &as_map(json!({"providers": {"claude-cli": {"cwd": "/repo"}}})),
        );
        assert_eq!(base["providers"]["claude-cli"]["sessionId"], "a");
        assert_eq!(base["providers"]["claude-cli"]["cwd"], "/repo");
    }

    #[test]
    fn arrays_and_primitives_replace() {
        let mut base = as_map(json!({"tags": ["a", "b"], "count": 1}));
        merge_attributes(&mut base, &as_map(json!({"tags": ["c"], "count": 2})));
        assert_eq!(base["tags"], json!(["c"]));
        assert_eq!(base["count"], 2);
    }

    #[test]
    fn object_replaces_primitive() {
        let mut base = as_map(json!({"x": 1}));
        merge_attributes(&mut base, &as_map(json!({"x": {"y": 2}})));
        assert_eq!(base["x"]["y"], 2);
    }

    #[test]
    fn relative_working_dir_rejected() {
        let err = validate_patch(&json!({"core": {"workingDir": "repo/src"}})).unwrap_err();
        assert_eq!(err.code(), "invalid_session_attributes");
    }

    #[test]
    fn absolute_working_dir_accepted() {
        validate_patch(&json!({"core": {"workingDir": "/home/me/repo"}})).unwrap();
    }

    #[test]
    fn non_string_branch_rejected() {
        assert!(validate_patch(&json!({"core": {"activeBranch": 42}})).is_err());
    }

    #[test]
    fn provider_entries_must_be_objects() {
        assert!(validate_patch(&json!({"providers": {"claude-cli": "oops"}})).is_err());
        validate_patch(&json!({"providers": {"claude-cli": {"sessionId": "x"}}})).unwrap();
    }

    #[test]
    fn scheduled_session_marker_shape() {
        validate_patch(&json!({"scheduledSession": {"agentId": "a", "scheduleId": "s"}})).unwrap();
        assert!(validate_patch(&json!({"scheduledSession": {"agentId": "a"}})).is_err());
        validate_patch(&json!({"scheduledSession": null})).unwrap();
    }

    #[test]
    fn plugin_keys_are_free_form() {
        validate_patch(&json!({"myPlugin": {"anything": [1, 2, {"deep": true}]}})).unwrap();
    }
}
