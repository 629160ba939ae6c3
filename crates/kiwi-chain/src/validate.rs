// SPDX-License-Identifier: MIT OR Apache-2.0
//! Post-merge validation: the terminal primitive's contract, cross-layer
//! conflicts, and runtime-declared validation rules.

use crate::Primitive;
use kiwi_error::{KernelError, KernelResult};
use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::warn;

/// Check the merged config satisfies the terminal primitive's required
/// fields: `command` for subprocess, `url` or `url_template` for http_client.
pub fn check_terminal_contract(
    primitive: Primitive,
    config: &Map<String, Value>,
) -> KernelResult<()> {
    match primitive {
        Primitive::Subprocess => {
            if config.get("command").and_then(Value::as_str).is_none() {
                return Err(KernelError::chain(
                    "merged config missing required field 'command' for subprocess",
                )
                .with_suggestion("declare `command:` on the runtime or tool config"));
            }
        }
        Primitive::HttpClient => {
            let has_url = config.get("url").and_then(Value::as_str).is_some()
                || config.get("url_template").and_then(Value::as_str).is_some();
            if !has_url {
                return Err(KernelError::chain(
                    "merged config missing required field 'url' or 'url_template' for http_client",
                )
                .with_suggestion("declare `url:` or `url_template:` on the tool config"));
            }
        }
    }
    Ok(())
}

/// Detect contradictions between a layer and the layers beneath it.
///
/// The known case: a tool turning a venv off while its runtime requires one.
pub fn check_cross_layer_conflicts(
    layers: &[(String, &Map<String, Value>)],
) -> KernelResult<()> {
    for (upper_idx, (upper_id, upper)) in layers.iter().enumerate() {
        let enabled = upper
            .get("venv")
            .and_then(|v| v.get("enabled"))
            .and_then(Value::as_bool);
        if enabled != Some(false) {
            continue;
        }
        for (lower_id, lower) in layers.iter().skip(upper_idx + 1) {
            let required = lower
                .get("venv")
                .and_then(|v| v.get("required"))
                .and_then(Value::as_bool);
            if required == Some(true) {
                return Err(KernelError::chain(format!(
                    "config conflict: '{upper_id}' sets venv.enabled=false but '{lower_id}' requires a venv"
                ))
                .with_context("tool", upper_id.clone())
                .with_context("runtime", lower_id.clone()));
            }
        }
    }
    Ok(())
}

/// One validation rule declared under a runtime's `config.validation.rules`.
#[derive(Debug, Clone, Deserialize)]
pub struct ValidationRule {
    /// `shebang-required`, `regex`, or `syntax-check`.
    #[serde(rename = "type")]
    pub rule_type: String,
    /// Regex pattern (for `regex` rules).
    #[serde(default)]
    pub pattern: Option<String>,
    /// `block` (default) or `warn`.
    #[serde(default = "default_action")]
    pub action: String,
    /// Message attached to failures.
    #[serde(default)]
    pub message: Option<String>,
    /// Command prefix (for `syntax-check` rules); the file path is appended.
    #[serde(default)]
    pub command: Option<String>,
}

fn default_action() -> String {
    "block".to_string()
}

/// Extract the declared rules from a merged or per-layer config.
pub fn extract_rules(config: &Map<String, Value>) -> Vec<ValidationRule> {
    config
        .get("validation")
        .and_then(|v| v.get("rules"))
        .and_then(Value::as_array)
        .map(|rules| {
            rules
                .iter()
                .filter_map(|r| serde_json::from_value(r.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

/// Apply the static rules (shebang, regex) to a tool's files before
/// execution. Block rules abort with `invalid_item`; warn rules log and are
/// returned for result metadata.
pub fn apply_static_rules(
    tool_id: &str,
    rules: &[ValidationRule],
    files: &BTreeMap<String, String>,
) -> KernelResult<Vec<String>> {
    let mut warnings = Vec::new();

    for rule in rules {
        match rule.rule_type.as_str() {
            "shebang-required" => {
                for (name, content) in files {
                    if !content.starts_with("#!") {
                        let msg = rule
                            .message
                            .clone()
                            .unwrap_or_else(|| format!("'{name}' is missing a shebang line"));
                        if rule.action == "warn" {
                            warn!(target: "kiwi.chain.validate", tool_id, file = %name, "{msg}");
                            warnings.push(msg);
                        } else {
                            return Err(KernelError::invalid_item(format!(
                                "tool '{tool_id}': {msg}"
                            )));
                        }
                    }
                }
            }
            "regex" => {
                let Some(pattern) = &rule.pattern else {
                    continue;
                };
                let re = Regex::new(pattern).map_err(|e| {
                    KernelError::invalid_item(format!(
                        "tool '{tool_id}': invalid validation pattern '{pattern}': {e}"
                    ))
                })?;
                for (name, content) in files {
                    if re.is_match(content) {
                        let msg = rule.message.clone().unwrap_or_else(|| {
                            format!("'{name}' matches blocked pattern '{pattern}'")
                        });
                        if rule.action == "warn" {
                            warn!(target: "kiwi.chain.validate", tool_id, file = %name, "{msg}");
                            warnings.push(msg);
                        } else {
                            return Err(KernelError::invalid_item(format!(
                                "tool '{tool_id}': {msg}"
                            )));
                        }
                    }
                }
            }
            // Executed by the operations layer through the subprocess
            // primitive; nothing static to do here.
            "syntax-check" => {}
            other => {
                warn!(target: "kiwi.chain.validate", tool_id, rule = other, "unknown validation rule type");
            }
        }
    }

    Ok(warnings)
}

/// The syntax-check commands to run before execution, in declaration order.
pub fn syntax_check_commands(rules: &[ValidationRule]) -> Vec<String> {
    rules
        .iter()
        .filter(|r| r.rule_type == "syntax-check")
        .filter_map(|r| r.command.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(v: Value) -> Map<String, Value> {
        v.as_object().expect("object literal").clone()
    }

    #[test]
    fn subprocess_requires_command() {
        let err = check_terminal_contract(Primitive::Subprocess, &map(json!({})))
            .expect_err("missing command");
        assert_eq!(err.kind, kiwi_error::ErrorKind::ChainError);
        check_terminal_contract(Primitive::Subprocess, &map(json!({"command": "python3"})))
            .expect("command present");
    }

    #[test]
    fn http_requires_url_or_template() {
        check_terminal_contract(Primitive::HttpClient, &map(json!({"url": "https://x"})))
            .expect("url");
        check_terminal_contract(
            Primitive::HttpClient,
            &map(json!({"url_template": "https://x/{id}"})),
        )
        .expect("url_template");
        assert!(check_terminal_contract(Primitive::HttpClient, &map(json!({}))).is_err());
    }

    #[test]
    fn venv_conflict_detected() {
        let tool = map(json!({"venv": {"enabled": false}}));
        let runtime = map(json!({"venv": {"required": true}}));
        let err = check_cross_layer_conflicts(&[
            ("mytool".into(), &tool),
            ("python_runtime".into(), &runtime),
        ])
        .expect_err("conflict");
        assert!(err.message.contains("venv"));
        assert_eq!(err.context["tool"], "mytool");
    }

    #[test]
    fn no_conflict_without_contradiction() {
        let tool = map(json!({"venv": {"enabled": true}}));
        let runtime = map(json!({"venv": {"required": true}}));
        check_cross_layer_conflicts(&[("t".into(), &tool), ("r".into(), &runtime)])
            .expect("compatible venv settings");
    }

    #[test]
    fn rules_extracted_from_config() {
        let config = map(json!({
            "validation": {"rules": [
                {"type": "shebang-required"},
                {"type": "regex", "pattern": "rm -rf", "action": "warn"},
                {"type": "syntax-check", "command": "python3 -m py_compile"},
            ]}
        }));
        let rules = extract_rules(&config);
        assert_eq!(rules.len(), 3);
        assert_eq!(rules[0].action, "block", "block is the default action");
        assert_eq!(rules[1].action, "warn");
        assert_eq!(syntax_check_commands(&rules), vec!["python3 -m py_compile"]);
    }

    #[test]
    fn shebang_block_rule_aborts() {
        let rules = vec![ValidationRule {
            rule_type: "shebang-required".into(),
            pattern: None,
            action: "block".into(),
            message: None,
            command: None,
        }];
        let mut files = BTreeMap::new();
        files.insert("run.sh".to_string(), "echo hi\n".to_string());
        let err = apply_static_rules("t", &rules, &files).expect_err("no shebang");
        assert_eq!(err.kind, kiwi_error::ErrorKind::InvalidItem);

        files.insert("run.sh".to_string(), "#!/bin/sh\necho hi\n".to_string());
        apply_static_rules("t", &rules, &files).expect("shebang present");
    }

    #[test]
    fn regex_warn_rule_collects_warning() {
        let rules = vec![ValidationRule {
            rule_type: "regex".into(),
            pattern: Some("TODO".into()),
            action: "warn".into(),
            message: Some("unfinished script".into()),
            command: None,
        }];
        let mut files = BTreeMap::new();
        files.insert("main.py".to_string(), "# TODO finish\n".to_string());
        let warnings = apply_static_rules("t", &rules, &files).expect("warn never aborts");
        assert_eq!(warnings, vec!["unfinished script"]);
    }

    #[test]
    fn regex_block_rule_aborts() {
        let rules = vec![ValidationRule {
            rule_type: "regex".into(),
            pattern: Some(r"rm\s+-rf\s+/".into()),
            action: "block".into(),
            message: None,
            command: None,
        }];
        let mut files = BTreeMap::new();
        files.insert("run.sh".to_string(), "#!/bin/sh\nrm -rf /\n".to_string());
        assert!(apply_static_rules("t", &rules, &files).is_err());
    }
}
