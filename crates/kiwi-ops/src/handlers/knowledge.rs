// SPDX-License-Identifier: MIT OR Apache-2.0
//! The knowledge handler: `read`, `create`, `update`, `delete`.
//!
//! Knowledge is retrieval-only; there is no "execute" beyond reading.

use super::{TypeHandler, opt_str_param, str_param, unknown_action};
use crate::{ExecuteRequest, Shared};
use async_trait::async_trait;
use kiwi_core::{ItemType, Origin};
use kiwi_error::KernelResult;
use kiwi_store::parse;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Handles `execute(item_type=knowledge, …)`.
pub struct KnowledgeHandler {
    shared: Arc<Shared>,
}

impl KnowledgeHandler {
    /// Build over the shared kernel state.
    pub fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    fn read(&self, req: &ExecuteRequest) -> KernelResult<Value> {
        let item = self
            .shared
            .store
            .get(&req.project_path, ItemType::Knowledge, &req.item_id, None)?;
        let (_, body) = parse::parse_knowledge(&req.item_id, &item.source)?;
        Ok(json!({
            "status": "ok",
            "manifest": item.manifest,
            "content": body,
            "origin": item.origin,
            "signature": item.signature,
        }))
    }

    fn write(&self, req: &ExecuteRequest, overwrite: bool) -> KernelResult<Value> {
        let params = &req.parameters;
        let source = str_param(params, "source")?;
        let category = str_param(params, "category")?;
        parse::parse_knowledge(&req.item_id, source)?;

        let layer = match opt_str_param(params, "layer") {
            Some("user") => Origin::User,
            _ => Origin::Project,
        };
        if overwrite {
            self.shared.store.source_path(
                layer,
                &req.project_path,
                ItemType::Knowledge,
                &req.item_id,
            )?;
        }

        let path = self.shared.store.write_item(
            layer,
            &req.project_path,
            ItemType::Knowledge,
            category,
            &req.item_id,
            source,
            &BTreeMap::new(),
        )?;
        Ok(json!({
            "status": if overwrite { "updated" } else { "created" },
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
            ItemType::Knowledge,
            &req.item_id,
        )?;
        Ok(json!({"status": "deleted", "item_id": req.item_id}))
    }
}

#[async_trait]
impl TypeHandler for KnowledgeHandler {
    async fn execute(&self, req: &ExecuteRequest) -> KernelResult<Value> {
        match req.action.as_str() {
            "read" => self.read(req),
            "create" => self.write(req, false),
            "update" => self.write(req, true),
            "delete" => self.delete(req),
            other => Err(unknown_action(ItemType::Knowledge, other, self.actions())),
        }
    }

    fn actions(&self) -> &'static [&'static str] {
        &["read", "create", "update", "delete"]
    }
}
