// SPDX-License-Identifier: MIT OR Apache-2.0
//! Remote registry seam.
//!
//! The registry backend (schema, transport, auth) lives outside the kernel;
//! anything implementing [`RegistryClient`] can plug in. The default is
//! [`NullRegistry`], which answers honestly: nothing configured.

use async_trait::async_trait;
use kiwi_core::{Item, ItemType};
use kiwi_error::{KernelError, KernelResult};
use kiwi_search::SearchHit;
use serde_json::Value;
use std::collections::BTreeMap;

/// An item fetched from the remote registry, still in source form.
#[derive(Debug, Clone)]
pub struct RegistryItem {
    /// Item kind.
    pub item_type: ItemType,
    /// Item id.
    pub id: String,
    /// Category path.
    pub category: String,
    /// Signed primary source.
    pub source: String,
    /// Extra files for multi-file tools.
    pub files: BTreeMap<String, String>,
}

/// Pluggable remote registry.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Query the remote index.
    async fn search(
        &self,
        query: &str,
        item_type: Option<ItemType>,
        limit: usize,
    ) -> KernelResult<Vec<SearchHit>>;

    /// Fetch one item's signed source.
    async fn fetch(&self, item_type: ItemType, id: &str) -> KernelResult<RegistryItem>;

    /// Publish a signed item.
    async fn publish(&self, item: &Item) -> KernelResult<Value>;

    /// Whether credentials/endpoint are configured
    /// (`LILUX_REGISTRY_TOKEN` in CI).
    fn is_configured(&self) -> bool;
}

/// No registry configured; local layers only.
pub struct NullRegistry;

#[async_trait]
impl RegistryClient for NullRegistry {
    async fn search(
        &self,
        _query: &str,
        _item_type: Option<ItemType>,
        _limit: usize,
    ) -> KernelResult<Vec<SearchHit>> {
        Ok(Vec::new())
    }

    async fn fetch(&self, item_type: ItemType, id: &str) -> KernelResult<RegistryItem> {
        Err(
            KernelError::not_found(format!("{item_type} '{id}': no registry configured"))
                .with_suggestion("set LILUX_REGISTRY_TOKEN and a registry endpoint"),
        )
    }

    async fn publish(&self, item: &Item) -> KernelResult<Value> {
        Err(KernelError::execution_failed(format!(
            "cannot publish '{}': no registry configured",
            item.id
        ))
        .with_suggestion("set LILUX_REGISTRY_TOKEN and a registry endpoint"))
    }

    fn is_configured(&self) -> bool {
        false
    }
}
