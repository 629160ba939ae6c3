// SPDX-License-Identifier: MIT OR Apache-2.0
//! Deep config merging.
//!
//! Walking a chain from the primitive back to the leaf, each layer's config
//! is merged over the accumulated one: when both sides hold maps the merge
//! recurses, otherwise the child (closer to the leaf) wins outright. Lists
//! are replaced, never concatenated — manifests that want extension use a
//! map keyed by entry id. Env maps fall out of the map-map rule: keys are
//! unioned and leaf keys override.

use serde_json::{Map, Value};

/// Merge `overlay` (the child) into `base`, child-wins.
pub fn deep_merge(base: &mut Map<String, Value>, overlay: &Map<String, Value>) {
    for (key, overlay_value) in overlay {
        match (base.get_mut(key), overlay_value) {
            (Some(Value::Object(base_map)), Value::Object(overlay_map)) => {
                deep_merge(base_map, overlay_map);
            }
            _ => {
                base.insert(key.clone(), overlay_value.clone());
            }
        }
    }
}

/// Merge a whole chain, primitive first and leaf last, returning the
/// effective config.
pub fn merge_chain<'a>(configs: impl Iterator<Item = &'a Map<String, Value>>) -> Map<String, Value> {
    let mut acc = Map::new();
    for config in configs {
        deep_merge(&mut acc, config);
    }
    acc
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(v: Value) -> Map<String, Value> {
        v.as_object().expect("object literal").clone()
    }

    #[test]
    fn child_scalar_wins() {
        let mut base = map(json!({"timeout": 300, "command": "python3"}));
        deep_merge(&mut base, &map(json!({"timeout": 30})));
        assert_eq!(base["timeout"], 30);
        assert_eq!(base["command"], "python3");
    }

    #[test]
    fn maps_recurse_and_union() {
        let mut base = map(json!({"env": {"PATH": "/bin", "LANG": "C"}}));
        deep_merge(&mut base, &map(json!({"env": {"LANG": "en_US", "EXTRA": "1"}})));
        assert_eq!(base["env"]["PATH"], "/bin", "parent keys survive");
        assert_eq!(base["env"]["LANG"], "en_US", "leaf keys override");
        assert_eq!(base["env"]["EXTRA"], "1");
    }

    #[test]
    fn lists_are_replaced_not_concatenated() {
        let mut base = map(json!({"args": ["-u", "-B"]}));
        deep_merge(&mut base, &map(json!({"args": ["script.py"]})));
        assert_eq!(base["args"], json!(["script.py"]));
    }

    #[test]
    fn scalar_replaced_by_map_and_vice_versa() {
        let mut base = map(json!({"venv": true}));
        deep_merge(&mut base, &map(json!({"venv": {"enabled": false}})));
        assert_eq!(base["venv"], json!({"enabled": false}));

        let mut base = map(json!({"venv": {"enabled": true}}));
        deep_merge(&mut base, &map(json!({"venv": false})));
        assert_eq!(base["venv"], json!(false));
    }

    #[test]
    fn merge_is_idempotent() {
        let primitive = map(json!({"timeout": 300, "env": {"A": "1"}}));
        let runtime = map(json!({"command": "python3", "env": {"B": "2"}}));
        let leaf = map(json!({"args": ["main.py"], "env": {"A": "9"}}));

        let once = merge_chain([&primitive, &runtime, &leaf].into_iter());
        let twice = merge_chain([&once.clone(), &once.clone()].into_iter());
        assert_eq!(once, twice);
    }

    #[test]
    fn chain_order_means_leaf_wins() {
        let primitive = map(json!({"timeout": 300}));
        let runtime = map(json!({"timeout": 120, "command": "python3"}));
        let leaf = map(json!({"timeout": 10}));
        let merged = merge_chain([&primitive, &runtime, &leaf].into_iter());
        assert_eq!(merged["timeout"], 10);
        assert_eq!(merged["command"], "python3");
    }
}
