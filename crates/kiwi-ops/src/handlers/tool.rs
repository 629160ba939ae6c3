// SPDX-License-Identifier: MIT OR Apache-2.0
//! The tool handler: `run`, `create`, `update`, `publish`, `delete`.
//!
//! `run` is the kernel's load-bearing path: resolve the chain, merge and
//! validate config, check permissions, dispatch to a primitive, and wrap
//! everything in an `ExecutionResult`.

use super::{TypeHandler, str_param, unknown_action};
use crate::{ExecuteRequest, Shared};
use async_trait::async_trait;
use kiwi_chain::{Primitive, ResolvedChain, apply_static_rules, syntax_check_commands};
use kiwi_core::expand::expand_env;
use kiwi_core::{ExecutionResult, Item, ItemType, Origin, ToolManifest};
use kiwi_error::{KernelError, KernelResult};
use kiwi_exec::{HttpConfig, SubprocessConfig, subprocess};
use kiwi_policy::{AuditDecision, AuditEntry, Decision};
use kiwi_store::parse;
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Handles `execute(item_type=tool, …)`.
pub struct ToolHandler {
    shared: Arc<Shared>,
}

impl ToolHandler {
    /// Build over the shared kernel state.
    pub fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    async fn run(&self, req: &ExecuteRequest) -> KernelResult<Value> {
        let shared = &self.shared;
        let item = shared
            .store
            .get(&req.project_path, ItemType::Tool, &req.item_id, None)?;
        let chain = shared.resolver.resolve(&req.project_path, &req.item_id)?;

        let leaf = chain.leaf().clone();
        let params = validated_params(&req.item_id, &leaf, &req.parameters)?;

        self.check_permissions(req, &chain, &params).await?;

        // Loop detection is advisory: the warning rides on the result.
        let loop_warning = shared.session.loops.record(
            &req.item_id,
            &Value::Object(params.clone().into_iter().collect()),
        );
        if let Some(signal) = &loop_warning {
            shared
                .session
                .audit
                .record(
                    AuditEntry::new(&shared.session.id, "tool.run", AuditDecision::LoopDetected {
                        warning: signal.message.clone(),
                    })
                    .with_item(&req.item_id),
                )
                .await;
        }

        if req.dry_run {
            return Ok(json!({
                "status": "dry_run",
                "executor_chain": chain.ids,
                "merged_config": Value::Object(chain.merged_config.clone()),
            }));
        }

        let rules = chain.validation_rules();
        let mut warnings = apply_static_rules(&req.item_id, &rules, &item.files)?;
        if chain.primitive == Primitive::Subprocess {
            self.run_syntax_checks(&rules, &item).await?;
        }

        let mut result = match chain.primitive {
            Primitive::Subprocess => self.run_subprocess(&chain, &item, &params).await?,
            Primitive::HttpClient => self.run_http(&chain, &params).await?,
        };

        if let Some(signal) = loop_warning {
            result
                .metadata
                .insert("_loop_warning".to_string(), json!(signal.message));
        }
        if !warnings.is_empty() {
            result
                .metadata
                .insert("validation_warnings".to_string(), json!(std::mem::take(&mut warnings)));
        }

        shared
            .session
            .audit
            .record(
                AuditEntry::new(&shared.session.id, "tool.run", AuditDecision::Allowed)
                    .with_item(&req.item_id)
                    .with_duration(result.duration_ms),
            )
            .await;

        serde_json::to_value(&result)
            .map_err(|e| KernelError::execution_failed(format!("unserializable result: {e}")))
    }

    /// Permission checks for the load-bearing path. Capability tools check
    /// the resource they touch; runtime/script invocations check the
    /// tool-id allow-list.
    async fn check_permissions(
        &self,
        req: &ExecuteRequest,
        chain: &ResolvedChain,
        params: &BTreeMap<String, Value>,
    ) -> KernelResult<()> {
        let shared = &self.shared;
        let ctx = shared.session.active_context();
        let capability = chain
            .merged_config
            .get("capability")
            .and_then(Value::as_str);

        let (action, decision) = match capability {
            Some("filesystem.read") => {
                let path = str_param(params, "path")?;
                ("filesystem.read", ctx.check_read(path))
            }
            Some("filesystem.write") => {
                let path = str_param(params, "path")?;
                ("filesystem.write", ctx.check_write(path))
            }
            Some("shell") => {
                let command = str_param(params, "command")?;
                let base = command.split_whitespace().next().unwrap_or(command);
                ("shell.run", ctx.check_shell(base))
            }
            _ => ("tool.run", ctx.check_tool(&req.item_id)),
        };

        if let Err(e) = shared.session.rate.check(action) {
            shared
                .session
                .audit
                .record(
                    AuditEntry::new(&shared.session.id, action, AuditDecision::RateLimited {
                        pattern: e
                            .context
                            .get("pattern")
                            .and_then(Value::as_str)
                            .unwrap_or(action)
                            .to_string(),
                    })
                    .with_item(&req.item_id),
                )
                .await;
            return Err(e);
        }

        match decision {
            Decision::Allow => Ok(()),
            Decision::Deny { rule } => {
                shared
                    .session
                    .audit
                    .record(
                        AuditEntry::new(&shared.session.id, action, AuditDecision::Denied {
                            rule: rule.clone(),
                        })
                        .with_item(&req.item_id),
                    )
                    .await;
                Err(Decision::Deny { rule }.into_error())
            }
        }
    }

    async fn run_syntax_checks(
        &self,
        rules: &[kiwi_chain::ValidationRule],
        item: &Item,
    ) -> KernelResult<()> {
        let commands = syntax_check_commands(rules);
        if commands.is_empty() || item.files.is_empty() {
            return Ok(());
        }
        let Some(dir) = item.path.as_ref().and_then(|p| p.parent()) else {
            return Ok(());
        };

        for command in commands {
            let expanded = expand_env(&command);
            let mut argv = expanded.split_whitespace().map(String::from);
            let Some(program) = argv.next() else {
                continue;
            };
            let base_args: Vec<String> = argv.collect();

            for name in item.files.keys() {
                let mut args = base_args.clone();
                args.push(dir.join(name).display().to_string());
                let config = SubprocessConfig {
                    command: program.clone(),
                    args,
                    env: BTreeMap::new(),
                    cwd: Some(dir.display().to_string()),
                    timeout: 30.0,
                    capture_output: true,
                    input_data: None,
                };
                let out = subprocess::execute(&config, &BTreeMap::new()).await?;
                if !out.success {
                    return Err(KernelError::invalid_item(format!(
                        "syntax check failed for '{name}'"
                    ))
                    .with_context("command", expanded.clone())
                    .with_context("stderr", out.stderr));
                }
            }
        }
        Ok(())
    }

    async fn run_subprocess(
        &self,
        chain: &ResolvedChain,
        item: &Item,
        params: &BTreeMap<String, Value>,
    ) -> KernelResult<ExecutionResult> {
        let mut config_map = chain.merged_config.clone();

        // File-backed tools run from their own directory by default, and an
        // `entrypoint` lands at the end of argv if not already there.
        if let Some(dir) = item.path.as_ref().and_then(|p| p.parent()) {
            if !item.files.is_empty() && !config_map.contains_key("cwd") {
                config_map.insert("cwd".to_string(), json!(dir.display().to_string()));
            }
        }
        if let Some(entry) = config_map
            .get("entrypoint")
            .and_then(Value::as_str)
            .map(String::from)
        {
            let args = config_map
                .entry("args".to_string())
                .or_insert_with(|| json!([]));
            if let Value::Array(args) = args {
                if !args.iter().any(|a| a.as_str() == Some(&entry)) {
                    args.push(json!(entry));
                }
            }
        }

        let config = SubprocessConfig::from_config(&config_map)?;
        debug!(target: "kiwi.ops.tool", tool = %item.id, command = %config.command, "dispatching subprocess");
        let out = subprocess::execute(&config, params).await?;

        let mut result = if out.success {
            ExecutionResult::ok(json!(out.stdout), out.duration_ms, chain.ids.clone())
        } else {
            let error = KernelError::execution_failed(format!(
                "'{}' exited with code {}",
                item.id, out.return_code
            ))
            .with_context("return_code", out.return_code)
            .with_context("stderr", out.stderr.clone());
            ExecutionResult::failed(error, out.duration_ms, chain.ids.clone())
        };
        if !out.success {
            result
                .metadata
                .insert("stdout".to_string(), json!(out.stdout));
            result
                .metadata
                .insert("stderr".to_string(), json!(out.stderr));
        }
        Ok(result)
    }

    async fn run_http(
        &self,
        chain: &ResolvedChain,
        params: &BTreeMap<String, Value>,
    ) -> KernelResult<ExecutionResult> {
        let config = HttpConfig::from_config(&chain.merged_config)?;
        let out = kiwi_exec::http::execute(&config, params).await?;

        let mut result = if out.success {
            ExecutionResult::ok(out.body.clone(), out.duration_ms, chain.ids.clone())
        } else {
            let error = match &out.error {
                Some(detail) => KernelError::execution_failed(format!(
                    "http request failed: {detail}"
                )),
                None => KernelError::execution_failed(format!(
                    "http request returned status {}",
                    out.status_code
                ))
                .with_context("status_code", i64::from(out.status_code))
                .with_context("body", out.body.clone()),
            };
            ExecutionResult::failed(error, out.duration_ms, chain.ids.clone())
        };
        result
            .metadata
            .insert("status_code".to_string(), json!(out.status_code));
        Ok(result)
    }

    fn layer_of(params: &BTreeMap<String, Value>) -> Origin {
        match params.get("layer").and_then(Value::as_str) {
            Some("user") => Origin::User,
            _ => Origin::Project,
        }
    }

    fn create(&self, req: &ExecuteRequest, overwrite: bool) -> KernelResult<Value> {
        let params = &req.parameters;
        let source = str_param(params, "source")?;
        let category = str_param(params, "category")?;
        parse::parse_tool(&req.item_id, source)?;

        let layer = Self::layer_of(params);
        let exists = self
            .shared
            .store
            .get_from(layer, &req.project_path, ItemType::Tool, &req.item_id, None)
            .is_ok();
        if exists && !overwrite {
            return Err(KernelError::invalid_item(format!(
                "tool '{}' already exists; use action=update",
                req.item_id
            )));
        }
        if !exists && overwrite {
            return Err(KernelError::not_found(format!(
                "tool '{}' does not exist; use action=create",
                req.item_id
            )));
        }

        let files: BTreeMap<String, String> = params
            .get("files")
            .and_then(Value::as_object)
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        let path = self.shared.store.write_item(
            layer,
            &req.project_path,
            ItemType::Tool,
            category,
            &req.item_id,
            source,
            &files,
        )?;
        self.shared.resolver.clear_cache();
        Ok(json!({
            "status": if overwrite { "updated" } else { "created" },
            "path": path.display().to_string(),
        }))
    }

    async fn publish(&self, req: &ExecuteRequest) -> KernelResult<Value> {
        let item = self
            .shared
            .store
            .get(&req.project_path, ItemType::Tool, &req.item_id, None)?;
        // Publishing demands a verified signature even when local loads are
        // lenient.
        kiwi_signature::verify_required(
            &item.source,
            &req.item_id,
            kiwi_signature::VerifyMode::Strict,
        )
        .map_err(|e| e.with_suggestion("run `sign` before `publish`"))?;

        self.shared.registry.publish(&item).await
    }

    fn delete(&self, req: &ExecuteRequest) -> KernelResult<Value> {
        let layer = Self::layer_of(&req.parameters);
        self.shared
            .store
            .delete_item(layer, &req.project_path, ItemType::Tool, &req.item_id)?;
        self.shared.resolver.clear_cache();
        Ok(json!({"status": "deleted", "item_id": req.item_id}))
    }
}

#[async_trait]
impl TypeHandler for ToolHandler {
    async fn execute(&self, req: &ExecuteRequest) -> KernelResult<Value> {
        match req.action.as_str() {
            "run" => self.run(req).await,
            "create" => self.create(req, false),
            "update" => self.create(req, true),
            "publish" => self.publish(req).await,
            "delete" => self.delete(req),
            other => Err(unknown_action(ItemType::Tool, other, self.actions())),
        }
    }

    fn actions(&self) -> &'static [&'static str] {
        &["run", "create", "update", "publish", "delete"]
    }
}

/// Check supplied parameters against the leaf manifest's declarations and
/// apply defaults.
fn validated_params(
    tool_id: &str,
    manifest: &ToolManifest,
    supplied: &BTreeMap<String, Value>,
) -> KernelResult<BTreeMap<String, Value>> {
    let mut params = supplied.clone();
    for (name, spec) in &manifest.parameters {
        if !params.contains_key(name) {
            if let Some(default) = &spec.default {
                params.insert(name.clone(), default.clone());
            }
        }
    }

    if manifest.parameters.is_empty() {
        return Ok(params);
    }

    let schema = params_schema(manifest);
    let validator = jsonschema::validator_for(&schema).map_err(|e| {
        KernelError::invalid_item(format!("tool '{tool_id}': bad parameter schema: {e}"))
    })?;
    let instance = Value::Object(params.clone().into_iter().collect::<Map<String, Value>>());
    let errors: Vec<String> = validator
        .iter_errors(&instance)
        .map(|e| e.to_string())
        .collect();
    if !errors.is_empty() {
        return Err(KernelError::invalid_item(format!(
            "tool '{tool_id}': invalid parameters: {}",
            errors.join("; ")
        ))
        .with_context("errors", json!(errors)));
    }

    Ok(params)
}

fn params_schema(manifest: &ToolManifest) -> Value {
    let mut properties = Map::new();
    let mut required = Vec::new();
    for (name, spec) in &manifest.parameters {
        let mut prop = Map::new();
        prop.insert("type".to_string(), json!(spec.param_type));
        if let Some(choices) = &spec.choices {
            prop.insert("enum".to_string(), json!(choices));
        }
        properties.insert(name.clone(), Value::Object(prop));
        if spec.required && spec.default.is_none() {
            required.push(json!(name));
        }
    }
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
        "additionalProperties": true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiwi_core::{ManifestCommon, ParameterSpec, ToolType};

    fn manifest_with(params: &[(&str, ParameterSpec)]) -> ToolManifest {
        ToolManifest {
            common: ManifestCommon::default(),
            tool_type: ToolType::Script,
            executor: Some("python_runtime".into()),
            config: Map::new(),
            parameters: params
                .iter()
                .map(|(n, s)| (n.to_string(), s.clone()))
                .collect(),
        }
    }

    #[test]
    fn missing_required_parameter_is_invalid() {
        let manifest = manifest_with(&[(
            "name",
            ParameterSpec {
                required: true,
                ..ParameterSpec::default()
            },
        )]);
        let err = validated_params("greet", &manifest, &BTreeMap::new())
            .expect_err("missing required param");
        assert_eq!(err.kind, kiwi_error::ErrorKind::InvalidItem);
        assert!(err.message.contains("name"));
    }

    #[test]
    fn defaults_are_applied() {
        let manifest = manifest_with(&[(
            "count",
            ParameterSpec {
                param_type: "integer".into(),
                default: Some(json!(1)),
                ..ParameterSpec::default()
            },
        )]);
        let params = validated_params("t", &manifest, &BTreeMap::new()).expect("defaults");
        assert_eq!(params["count"], json!(1));
    }

    #[test]
    fn wrong_type_is_rejected() {
        let manifest = manifest_with(&[(
            "count",
            ParameterSpec {
                param_type: "integer".into(),
                required: true,
                ..ParameterSpec::default()
            },
        )]);
        let mut supplied = BTreeMap::new();
        supplied.insert("count".to_string(), json!("three"));
        assert!(validated_params("t", &manifest, &supplied).is_err());

        supplied.insert("count".to_string(), json!(3));
        validated_params("t", &manifest, &supplied).expect("integer accepted");
    }

    #[test]
    fn enum_constraint_is_enforced() {
        let manifest = manifest_with(&[(
            "mode",
            ParameterSpec {
                choices: Some(vec![json!("fast"), json!("safe")]),
                ..ParameterSpec::default()
            },
        )]);
        let mut supplied = BTreeMap::new();
        supplied.insert("mode".to_string(), json!("reckless"));
        assert!(validated_params("t", &manifest, &supplied).is_err());

        supplied.insert("mode".to_string(), json!("safe"));
        validated_params("t", &manifest, &supplied).expect("member accepted");
    }

    #[test]
    fn undeclared_parameters_pass_through() {
        let manifest = manifest_with(&[]);
        let mut supplied = BTreeMap::new();
        supplied.insert("extra".to_string(), json!("anything"));
        let params = validated_params("t", &manifest, &supplied).expect("no declarations");
        assert_eq!(params["extra"], json!("anything"));
    }
}
