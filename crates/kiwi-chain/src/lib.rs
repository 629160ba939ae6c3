// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! kiwi-chain
#![deny(unsafe_code)]

pub mod merge;
pub mod validate;

pub use merge::{deep_merge, merge_chain};
pub use validate::{
    ValidationRule, apply_static_rules, check_cross_layer_conflicts, check_terminal_contract,
    extract_rules, syntax_check_commands,
};

use kiwi_core::{ItemType, ToolManifest, ToolType};
use kiwi_error::{KernelError, KernelResult};
use kiwi_store::ContentStore;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// The two hard-coded execution capabilities. Adding a third is a
/// source-level change by design.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Primitive {
    /// Spawn a local process.
    Subprocess,
    /// Issue an HTTP request.
    HttpClient,
}

impl Primitive {
    /// Map a terminal tool id onto its primitive.
    pub fn from_tool_id(id: &str) -> Option<Self> {
        match id {
            "subprocess" => Some(Self::Subprocess),
            "http_client" => Some(Self::HttpClient),
            _ => None,
        }
    }
}

impl fmt::Display for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Subprocess => "subprocess",
            Self::HttpClient => "http_client",
        })
    }
}

/// A fully resolved executor chain.
#[derive(Debug, Clone)]
pub struct ResolvedChain {
    /// Ids leaf-first, primitive last (e.g. `["greet", "python_runtime", "subprocess"]`).
    pub ids: Vec<String>,
    /// The terminal primitive.
    pub primitive: Primitive,
    /// Config merged primitive→leaf (leaf wins).
    pub merged_config: Map<String, Value>,
    /// Manifests along the chain, leaf-first.
    pub manifests: Vec<Arc<ToolManifest>>,
}

impl ResolvedChain {
    /// The leaf tool's manifest.
    pub fn leaf(&self) -> &ToolManifest {
        &self.manifests[0]
    }

    /// Every validation rule declared along the chain, primitive-side first.
    pub fn validation_rules(&self) -> Vec<ValidationRule> {
        self.manifests
            .iter()
            .rev()
            .flat_map(|m| extract_rules(&m.config))
            .collect()
    }
}

/// Resolves `tool → runtime → primitive` chains with per-id memoization.
///
/// The cache is process-wide: many concurrent readers, brief exclusive
/// writes on insertion. A fresh kernel process starts empty.
pub struct ChainResolver {
    store: Arc<ContentStore>,
    cache: RwLock<HashMap<String, Arc<ToolManifest>>>,
}

impl ChainResolver {
    /// Create a resolver over a content store.
    pub fn new(store: Arc<ContentStore>) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Number of memoized manifests.
    pub fn cached(&self) -> usize {
        match self.cache.read() {
            Ok(g) => g.len(),
            Err(p) => p.into_inner().len(),
        }
    }

    /// Drop every memoized manifest (content changed on disk).
    pub fn clear_cache(&self) {
        match self.cache.write() {
            Ok(mut g) => g.clear(),
            Err(p) => p.into_inner().clear(),
        }
    }

    /// Preload several manifests with one multi-key store lookup, so first
    /// calls do not pay N sequential resolutions.
    pub fn preload(&self, project: &Path, ids: &[String]) -> usize {
        let loaded = self.store.get_many(project, ItemType::Tool, ids);
        let mut count = 0;
        let mut cache = match self.cache.write() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        for (id, result) in loaded {
            if let Ok(item) = result {
                if let Some(tool) = item.manifest.as_tool() {
                    cache.insert(id, Arc::new(tool.clone()));
                    count += 1;
                }
            }
        }
        debug!(target: "kiwi.chain", count, "runtime manifests preloaded");
        count
    }

    fn manifest(&self, project: &Path, id: &str) -> KernelResult<Arc<ToolManifest>> {
        if let Some(hit) = match self.cache.read() {
            Ok(g) => g.get(id).cloned(),
            Err(p) => p.into_inner().get(id).cloned(),
        } {
            return Ok(hit);
        }

        let item = self.store.get(project, ItemType::Tool, id, None)?;
        let tool = item.manifest.as_tool().cloned().ok_or_else(|| {
            KernelError::chain(format!("'{id}' resolved to a non-tool manifest"))
        })?;
        let arc = Arc::new(tool);
        match self.cache.write() {
            Ok(mut g) => {
                g.insert(id.to_string(), arc.clone());
            }
            Err(p) => {
                p.into_inner().insert(id.to_string(), arc.clone());
            }
        }
        Ok(arc)
    }

    /// Resolve the full chain for `tool_id` and merge+validate its config.
    pub fn resolve(&self, project: &Path, tool_id: &str) -> KernelResult<ResolvedChain> {
        let mut ids: Vec<String> = Vec::new();
        let mut manifests: Vec<Arc<ToolManifest>> = Vec::new();
        let mut current = tool_id.to_string();

        let primitive = loop {
            if ids.contains(&current) {
                ids.push(current.clone());
                return Err(KernelError::chain(format!(
                    "cycle detected in executor chain: {}",
                    ids.join(" -> ")
                ))
                .with_context("cycle", ids.join(" -> ")));
            }

            let manifest = self.manifest(project, &current)?;
            ids.push(current.clone());
            manifests.push(manifest.clone());

            if manifest.tool_type == ToolType::Primitive {
                break Primitive::from_tool_id(&current).ok_or_else(|| {
                    KernelError::chain(format!(
                        "chain terminates in unknown primitive '{current}'"
                    ))
                    .with_suggestion("only `subprocess` and `http_client` exist")
                })?;
            }

            current = manifest.executor.clone().ok_or_else(|| {
                // Parsing rejects this shape, but a stale cache entry could
                // still surface it.
                KernelError::chain(format!("tool '{current}' has no executor"))
            })?;
        };

        let merged_config = merge_chain(manifests.iter().rev().map(|m| &m.config));

        check_terminal_contract(primitive, &merged_config)?;
        let layers: Vec<(String, &Map<String, Value>)> = ids
            .iter()
            .zip(&manifests)
            .map(|(id, m)| (id.clone(), &m.config))
            .collect();
        check_cross_layer_conflicts(&layers)?;

        debug!(target: "kiwi.chain", chain = %ids.join(" -> "), "chain resolved");
        Ok(ResolvedChain {
            ids,
            primitive,
            merged_config,
            manifests,
        })
    }
}
