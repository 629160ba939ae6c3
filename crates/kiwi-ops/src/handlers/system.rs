// SPDX-License-Identifier: MIT OR Apache-2.0
//! The system handler: read-only environment inspection.
//!
//! Four virtual items exist — `paths`, `runtime`, `rag`, `mcp` — and none
//! of them lives on disk.

use super::{TypeHandler, unknown_action};
use crate::{ExecuteRequest, Shared};
use async_trait::async_trait;
use kiwi_core::ItemType;
use kiwi_error::{KernelError, KernelResult};
use kiwi_store::ContentStore;
use serde_json::{Value, json};
use std::sync::Arc;

/// Handles `execute(item_type=system, …)`.
pub struct SystemHandler {
    shared: Arc<Shared>,
}

impl SystemHandler {
    /// Build over the shared kernel state.
    pub fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    fn paths(&self, req: &ExecuteRequest) -> Value {
        let protected = self.shared.store.protected();
        json!({
            "project_root": ContentStore::project_root(&req.project_path).display().to_string(),
            "user_root": self.shared.store.user_root().display().to_string(),
            "bundled_items": kiwi_store::BUNDLED.len(),
            "protected_prefixes": {
                "tools": protected.tools,
                "knowledge": protected.knowledge,
            },
        })
    }

    fn runtime(&self) -> Value {
        json!({
            "kernel_version": env!("CARGO_PKG_VERSION"),
            "os": std::env::consts::OS,
            "arch": std::env::consts::ARCH,
            "pid": std::process::id(),
            "session": self.shared.session.id,
            "chain_cache_entries": self.shared.resolver.cached(),
        })
    }

    fn rag(&self) -> Value {
        json!({
            "vector_backend_available": self.shared.search.vector_available(),
            "embedding_url_configured": std::env::var("EMBEDDING_URL").is_ok(),
            "embedding_model": std::env::var("EMBEDDING_MODEL").ok(),
            "embedding_dims": std::env::var("EMBEDDING_DIMS")
                .ok()
                .and_then(|v| v.parse::<u32>().ok()),
            "vector_db_configured": std::env::var("VECTOR_DB_URL").is_ok(),
            "indexed_documents": self.shared.search.indexed(),
        })
    }

    fn mcp(&self) -> Value {
        json!({
            "operations": [
                {"name": "search", "summary": "rank items by keyword/hybrid relevance"},
                {"name": "load", "summary": "fetch an item with verified signature"},
                {"name": "execute", "summary": "run tools, return directive specs, manage items"},
                {"name": "sign", "summary": "canonicalize and re-emit the signature marker"},
                {"name": "help", "summary": "topic docs and stuck/escalate/checkpoint signals"},
            ],
        })
    }
}

#[async_trait]
impl TypeHandler for SystemHandler {
    async fn execute(&self, req: &ExecuteRequest) -> KernelResult<Value> {
        // Every system pseudo-item is read-only.
        if !matches!(req.action.as_str(), "run" | "read") {
            return Err(unknown_action(ItemType::System, &req.action, self.actions()));
        }
        let data = match req.item_id.as_str() {
            "paths" => self.paths(req),
            "runtime" => self.runtime(),
            "rag" => self.rag(),
            "mcp" => self.mcp(),
            other => {
                return Err(KernelError::not_found(format!(
                    "unknown system item '{other}'"
                ))
                .with_suggestion("system items: paths, runtime, rag, mcp"));
            }
        };
        Ok(json!({"status": "ok", "data": data}))
    }

    fn actions(&self) -> &'static [&'static str] {
        &["run", "read"]
    }
}
