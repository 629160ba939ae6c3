// SPDX-License-Identifier: MIT OR Apache-2.0
//! Type-handler registry.
//!
//! The meta-operation layer does a table lookup on the item type rather
//! than a type-switch; registering a new item type is one handler plus one
//! registry entry.

mod directive;
mod knowledge;
mod system;
mod tool;

pub use directive::DirectiveHandler;
pub use knowledge::KnowledgeHandler;
pub use system::SystemHandler;
pub use tool::ToolHandler;

use crate::{ExecuteRequest, Shared};
use async_trait::async_trait;
use kiwi_core::ItemType;
use kiwi_error::{KernelError, KernelResult};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// One item type's `execute` implementation.
#[async_trait]
pub trait TypeHandler: Send + Sync {
    /// Run `action` against `item_id` with the request's parameters.
    async fn execute(&self, req: &ExecuteRequest) -> KernelResult<Value>;

    /// The actions this handler accepts, for error messages.
    fn actions(&self) -> &'static [&'static str];
}

/// Build the default handler table.
pub fn default_handlers(shared: Arc<Shared>) -> HashMap<ItemType, Arc<dyn TypeHandler>> {
    let mut table: HashMap<ItemType, Arc<dyn TypeHandler>> = HashMap::new();
    table.insert(
        ItemType::Directive,
        Arc::new(DirectiveHandler::new(shared.clone())),
    );
    table.insert(ItemType::Tool, Arc::new(ToolHandler::new(shared.clone())));
    table.insert(
        ItemType::Knowledge,
        Arc::new(KnowledgeHandler::new(shared.clone())),
    );
    table.insert(ItemType::System, Arc::new(SystemHandler::new(shared)));
    table
}

pub(crate) fn unknown_action(
    item_type: ItemType,
    action: &str,
    valid: &[&str],
) -> KernelError {
    KernelError::invalid_item(format!(
        "unknown action '{action}' for item type '{item_type}'"
    ))
    .with_suggestion(format!("valid actions: {}", valid.join(", ")))
}

pub(crate) fn str_param<'a>(
    params: &'a std::collections::BTreeMap<String, Value>,
    key: &str,
) -> KernelResult<&'a str> {
    params
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| KernelError::invalid_item(format!("missing required parameter '{key}'")))
}

pub(crate) fn opt_str_param<'a>(
    params: &'a std::collections::BTreeMap<String, Value>,
    key: &str,
) -> Option<&'a str> {
    params.get(key).and_then(Value::as_str)
}
