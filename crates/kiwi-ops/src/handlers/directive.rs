// SPDX-License-Identifier: MIT OR Apache-2.0
//! The directive handler: `run`, `create`, `edit`, `delete`.
//!
//! Directives are data. `run` validates the inputs, enters the directive's
//! permission context, and hands the structured process spec back to the
//! LLM client — the kernel never interprets step transitions.

use super::{TypeHandler, opt_str_param, str_param, unknown_action};
use crate::{ExecuteRequest, Shared};
use async_trait::async_trait;
use kiwi_core::{DirectiveManifest, ItemType, Origin};
use kiwi_error::{KernelError, KernelResult};
use kiwi_policy::AuditDecision;
use kiwi_store::parse;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Handles `execute(item_type=directive, …)`.
pub struct DirectiveHandler {
    shared: Arc<Shared>,
}

impl DirectiveHandler {
    /// Build over the shared kernel state.
    pub fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    async fn run(&self, req: &ExecuteRequest) -> KernelResult<Value> {
        let item = self
            .shared
            .store
            .get(&req.project_path, ItemType::Directive, &req.item_id, None)?;
        let manifest = item
            .manifest
            .as_directive()
            .ok_or_else(|| KernelError::invalid_item("directive manifest expected"))?;

        let inputs = validated_inputs(&req.item_id, manifest, &req.parameters)?;

        // Materialize the directive's permission context for the rest of
        // the session; everything it spawns intersects against this.
        match self.shared.session.enter_context(
            &req.item_id,
            &manifest.common.permissions,
            self.shared.intersection,
        ) {
            Ok(dropped) if !dropped.is_empty() => {
                self.shared
                    .session
                    .log("directive.run", AuditDecision::PermissionsReduced { dropped })
                    .await;
            }
            Ok(_) => {}
            Err(refused) => {
                return Err(KernelError::permission_denied(format!(
                    "directive '{}' declares more than the current context grants",
                    req.item_id
                ))
                .with_context("dropped", json!(refused.dropped)));
            }
        }

        self.shared
            .session
            .log("directive.run", AuditDecision::Allowed)
            .await;

        if req.dry_run {
            return Ok(json!({
                "status": "dry_run",
                "directive": req.item_id,
                "inputs": manifest.inputs,
            }));
        }

        Ok(json!({
            "status": "ok",
            "directive": {
                "id": item.id,
                "version": item.version,
                "title": manifest.common.title,
                "description": manifest.common.description,
                "inputs": inputs,
                "process": manifest.steps,
                "outputs": manifest.outputs,
                "references": manifest.references,
                "permissions": manifest.common.permissions,
            },
        }))
    }

    fn create(&self, req: &ExecuteRequest, overwrite: bool) -> KernelResult<Value> {
        let params = &req.parameters;
        let category = str_param(params, "category")?;
        let source = match opt_str_param(params, "source") {
            Some(s) => s.to_string(),
            None if !overwrite => {
                let title = opt_str_param(params, "title").unwrap_or(&req.item_id);
                parse::directive_template(&req.item_id, title)
            }
            None => {
                return Err(KernelError::invalid_item(
                    "edit requires a 'source' parameter",
                ));
            }
        };
        parse::parse_directive(&req.item_id, &source)?;

        let layer = match opt_str_param(params, "layer") {
            Some("user") => Origin::User,
            _ => Origin::Project,
        };
        if overwrite {
            // Must already exist somewhere writable.
            self.shared.store.source_path(
                layer,
                &req.project_path,
                ItemType::Directive,
                &req.item_id,
            )?;
        }

        let path = self.shared.store.write_item(
            layer,
            &req.project_path,
            ItemType::Directive,
            category,
            &req.item_id,
            &source,
            &BTreeMap::new(),
        )?;
        Ok(json!({
            "status": if overwrite { "edited" } else { "created" },
            "path": path.display().to_string(),
        }))
    }

    fn delete(&self, req: &ExecuteRequest) -> KernelResult<Value> {
        let layer = match opt_str_param(&req.parameters, "layer") {
            Some("user") => Origin::User,
            _ => Origin::Project,
        };
        self.shared.store.delete_item(
            layer,
            &req.project_path,
            ItemType::Directive,
            &req.item_id,
        )?;
        Ok(json!({"status": "deleted", "item_id": req.item_id}))
    }
}

#[async_trait]
impl TypeHandler for DirectiveHandler {
    async fn execute(&self, req: &ExecuteRequest) -> KernelResult<Value> {
        match req.action.as_str() {
            "run" => self.run(req).await,
            "create" => self.create(req, false),
            "edit" => self.create(req, true),
            "delete" => self.delete(req),
            other => Err(unknown_action(ItemType::Directive, other, self.actions())),
        }
    }

    fn actions(&self) -> &'static [&'static str] {
        &["run", "create", "edit", "delete"]
    }
}

/// Validate supplied inputs against the directive's typed declarations.
fn validated_inputs(
    directive_id: &str,
    manifest: &DirectiveManifest,
    supplied: &BTreeMap<String, Value>,
) -> KernelResult<BTreeMap<String, Value>> {
    let mut inputs = supplied.clone();

    for input in &manifest.inputs {
        match inputs.get(&input.name) {
            None if input.required => {
                return Err(KernelError::invalid_item(format!(
                    "directive '{directive_id}': missing required input '{}'",
                    input.name
                ))
                .with_suggestion(format!(
                    "supply '{}' ({}) in parameters",
                    input.name, input.input_type
                )));
            }
            None => {}
            Some(value) => {
                let ok = match input.input_type.as_str() {
                    "string" => value.is_string(),
                    "number" => value.is_number(),
                    "integer" => value.is_i64() || value.is_u64(),
                    "boolean" => value.is_boolean(),
                    "array" => value.is_array(),
                    "object" => value.is_object(),
                    _ => true,
                };
                if !ok {
                    return Err(KernelError::invalid_item(format!(
                        "directive '{directive_id}': input '{}' must be a {}",
                        input.name, input.input_type
                    )));
                }
            }
        }
    }

    // Echo declared-but-unsupplied optional inputs as nulls so the client
    // sees the full input surface.
    for input in &manifest.inputs {
        inputs.entry(input.name.clone()).or_insert(Value::Null);
    }
    Ok(inputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiwi_core::DirectiveInput;

    fn manifest(inputs: Vec<DirectiveInput>) -> DirectiveManifest {
        DirectiveManifest {
            inputs,
            ..DirectiveManifest::default()
        }
    }

    fn input(name: &str, ty: &str, required: bool) -> DirectiveInput {
        DirectiveInput {
            name: name.into(),
            input_type: ty.into(),
            required,
            description: String::new(),
            constraints: None,
        }
    }

    #[test]
    fn missing_required_input_fails() {
        let m = manifest(vec![input("goal", "string", true)]);
        let err = validated_inputs("d", &m, &BTreeMap::new()).expect_err("required");
        assert!(err.message.contains("goal"));
    }

    #[test]
    fn type_mismatch_fails() {
        let m = manifest(vec![input("count", "integer", true)]);
        let mut supplied = BTreeMap::new();
        supplied.insert("count".to_string(), json!("five"));
        assert!(validated_inputs("d", &m, &supplied).is_err());

        supplied.insert("count".to_string(), json!(5));
        validated_inputs("d", &m, &supplied).expect("integer ok");
    }

    #[test]
    fn optional_inputs_are_echoed_as_null() {
        let m = manifest(vec![input("dry", "boolean", false)]);
        let out = validated_inputs("d", &m, &BTreeMap::new()).expect("optional");
        assert_eq!(out["dry"], Value::Null);
    }
}
