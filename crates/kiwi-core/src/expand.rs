// SPDX-License-Identifier: MIT OR Apache-2.0
//! Environment-variable expansion and parameter templating.
//!
//! Two distinct substitution passes run over executor configs:
//!
//! - `${VAR}` / `${VAR:-default}` / `${VAR:+alt}` pull from the process
//!   environment (or any lookup function) — shell semantics.
//! - `{name}` placeholders pull from runtime parameters; used in
//!   `url_template`, `body_template`, and header values.
//!
//! Unknown placeholders are left untouched so that downstream layers can
//! report them instead of silently emitting empty strings.

use serde_json::Value;
use std::collections::BTreeMap;

use crate::PARAM_ENV_PREFIX;

/// Expand `${VAR}` references in `s` using the process environment.
pub fn expand_env(s: &str) -> String {
    expand_env_with(s, |name| std::env::var(name).ok())
}

/// Expand `${VAR}` references using a caller-supplied lookup.
///
/// Supported forms, matching shell parameter expansion:
/// - `${VAR}` — the value, or the literal text when `VAR` is unset.
/// - `${VAR:-default}` — the value when set and non-empty, else `default`.
/// - `${VAR:+alt}` — `alt` when `VAR` is set and non-empty, else empty.
pub fn expand_env_with<F>(s: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(s.len());
    let mut rest = s;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            // Unterminated reference: emit verbatim and stop scanning.
            out.push_str(&rest[start..]);
            return out;
        };
        let expr = &after[..end];
        out.push_str(&expand_one(expr, &lookup));
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}

fn expand_one<F>(expr: &str, lookup: &F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    if let Some((name, default)) = expr.split_once(":-") {
        return match lookup(name) {
            Some(v) if !v.is_empty() => v,
            _ => default.to_string(),
        };
    }
    if let Some((name, alt)) = expr.split_once(":+") {
        return match lookup(name) {
            Some(v) if !v.is_empty() => alt.to_string(),
            _ => String::new(),
        };
    }
    match lookup(expr) {
        Some(v) => v,
        // Leave the reference intact; the caller may expand it later or
        // surface it in an error message.
        None => format!("${{{expr}}}"),
    }
}

/// Recursively expand `${VAR}` references through every string in a JSON tree.
pub fn expand_value_env(value: &Value) -> Value {
    expand_value_env_with(value, |name| std::env::var(name).ok())
}

/// [`expand_value_env`] with a caller-supplied lookup.
pub fn expand_value_env_with<F>(value: &Value, lookup: F) -> Value
where
    F: Fn(&str) -> Option<String> + Copy,
{
    match value {
        Value::String(s) => Value::String(expand_env_with(s, lookup)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| expand_value_env_with(v, lookup))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), expand_value_env_with(v, lookup)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Substitute `{name}` placeholders in `s` from runtime parameters.
///
/// Placeholder names are `[A-Za-z0-9_]+`. `${…}` sequences are left alone
/// (they belong to the environment pass), as are placeholders with no
/// matching parameter. Non-string parameter values are rendered as JSON.
pub fn render_template(s: &str, params: &BTreeMap<String, Value>) -> String {
    let bytes = s.as_bytes();
    let mut out = String::with_capacity(s.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'{' {
            // `${` belongs to env expansion, not templating.
            let preceded_by_dollar = i > 0 && bytes[i - 1] == b'$';
            if !preceded_by_dollar {
                if let Some(rel_end) = s[i + 1..].find('}') {
                    let name = &s[i + 1..i + 1 + rel_end];
                    if !name.is_empty()
                        && name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
                    {
                        if let Some(v) = params.get(name) {
                            out.push_str(&value_to_text(v));
                            i += rel_end + 2;
                            continue;
                        }
                    }
                }
            }
        }
        let ch = s[i..].chars().next().unwrap_or('\u{FFFD}');
        out.push(ch);
        i += ch.len_utf8();
    }

    out
}

/// Recursively apply [`render_template`] through a JSON tree.
pub fn render_value(value: &Value, params: &BTreeMap<String, Value>) -> Value {
    match value {
        Value::String(s) => Value::String(render_template(s, params)),
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| render_value(v, params)).collect())
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_value(v, params)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn value_to_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Environment key a runtime parameter is injected under:
/// `name` → `KIWI_PARAM_NAME`.
pub fn param_env_key(name: &str) -> String {
    let upper: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{PARAM_ENV_PREFIX}{upper}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn env<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + Copy + 'a {
        move |name| {
            pairs
                .iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| v.to_string())
        }
    }

    #[test]
    fn plain_expansion() {
        let lookup = env(&[("HOME", "/home/kiwi")]);
        assert_eq!(expand_env_with("${HOME}/bin", lookup), "/home/kiwi/bin");
    }

    #[test]
    fn default_when_unset_or_empty() {
        let lookup = env(&[("EMPTY", "")]);
        assert_eq!(expand_env_with("${MISSING:-fallback}", lookup), "fallback");
        assert_eq!(expand_env_with("${EMPTY:-fallback}", lookup), "fallback");
        let set = env(&[("NAME", "kiwi")]);
        assert_eq!(expand_env_with("${NAME:-fallback}", set), "kiwi");
    }

    #[test]
    fn alt_when_set() {
        let lookup = env(&[("FLAG", "1")]);
        assert_eq!(expand_env_with("${FLAG:+--verbose}", lookup), "--verbose");
        assert_eq!(expand_env_with("${OTHER:+--verbose}", lookup), "");
    }

    #[test]
    fn unset_plain_reference_is_preserved() {
        let lookup = env(&[]);
        assert_eq!(expand_env_with("${NOPE}", lookup), "${NOPE}");
    }

    #[test]
    fn unterminated_reference_is_literal() {
        let lookup = env(&[("A", "x")]);
        assert_eq!(expand_env_with("${A} and ${B", lookup), "x and ${B");
    }

    #[test]
    fn multiple_references_in_one_string() {
        let lookup = env(&[("A", "1"), ("B", "2")]);
        assert_eq!(expand_env_with("${A}-${B}-${A}", lookup), "1-2-1");
    }

    #[test]
    fn value_tree_expansion() {
        let lookup = env(&[("TOKEN", "s3cr3t")]);
        let v = json!({
            "headers": {"Authorization": "Bearer ${TOKEN}"},
            "list": ["${TOKEN}", 42],
        });
        let out = expand_value_env_with(&v, lookup);
        assert_eq!(out["headers"]["Authorization"], "Bearer s3cr3t");
        assert_eq!(out["list"][0], "s3cr3t");
        assert_eq!(out["list"][1], 42);
    }

    #[test]
    fn template_substitution() {
        let mut params = BTreeMap::new();
        params.insert("name".to_string(), json!("world"));
        params.insert("count".to_string(), json!(3));
        assert_eq!(
            render_template("hello {name} x{count}", &params),
            "hello world x3"
        );
    }

    #[test]
    fn template_leaves_env_references_alone() {
        let mut params = BTreeMap::new();
        params.insert("VAR".to_string(), json!("nope"));
        assert_eq!(render_template("${VAR}", &params), "${VAR}");
    }

    #[test]
    fn template_leaves_unknown_placeholders() {
        let params = BTreeMap::new();
        assert_eq!(render_template("{missing}", &params), "{missing}");
    }

    #[test]
    fn template_recurses_through_maps_and_lists() {
        let mut params = BTreeMap::new();
        params.insert("id".to_string(), json!("42"));
        let body = json!({"issue": {"id": "{id}"}, "tags": ["{id}"]});
        let out = render_value(&body, &params);
        assert_eq!(out["issue"]["id"], "42");
        assert_eq!(out["tags"][0], "42");
    }

    #[test]
    fn param_env_keys() {
        assert_eq!(param_env_key("name"), "KIWI_PARAM_NAME");
        assert_eq!(param_env_key("dry-run"), "KIWI_PARAM_DRY_RUN");
        assert_eq!(param_env_key("x2"), "KIWI_PARAM_X2");
    }
}
