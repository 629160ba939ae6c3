// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! kiwi-core
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// `${VAR}` environment expansion and `{name}` parameter templating.
pub mod expand;
/// Parsed item manifests for the three content types.
pub mod manifest;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

pub use manifest::{
    DirectiveInput, DirectiveManifest, DirectiveOutput, DirectiveStep, ItemRef, KnowledgeKind,
    KnowledgeManifest, Manifest, ManifestCommon, ParameterSpec, Relationship, ToolManifest,
    ToolType,
};

use kiwi_error::KernelError;

/// Prefix under which runtime parameters are injected into subprocess
/// environments (`KIWI_PARAM_<UPPER>`).
pub const PARAM_ENV_PREFIX: &str = "KIWI_PARAM_";

/// Application tag embedded in every signature marker line.
pub const SIGNATURE_APP: &str = "kiwi-mcp";

/// The kind of a content item.
///
/// `System` is virtual: it never exists on disk and is served by the system
/// handler's read-only pseudo-items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    /// Declarative workflow spec, returned to the LLM for interpretation.
    Directive,
    /// Executable unit: script, http endpoint, runtime, or primitive.
    Tool,
    /// Markdown document with YAML frontmatter; retrieval-only.
    Knowledge,
    /// Virtual read-only environment inspection items.
    System,
}

impl ItemType {
    /// Directory name this type lives under inside a content root.
    ///
    /// `System` has no storage directory.
    pub fn dir_name(&self) -> Option<&'static str> {
        match self {
            Self::Directive => Some("directives"),
            Self::Tool => Some("tools"),
            Self::Knowledge => Some("knowledge"),
            Self::System => None,
        }
    }

    /// All storable item types, in lookup order.
    pub fn storable() -> [ItemType; 3] {
        [Self::Directive, Self::Tool, Self::Knowledge]
    }
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Directive => "directive",
            Self::Tool => "tool",
            Self::Knowledge => "knowledge",
            Self::System => "system",
        };
        f.write_str(s)
    }
}

/// Which layer an item was resolved from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// `<project>/.ai/`
    Project,
    /// `$USER_PATH` (default `~/.ai/`)
    User,
    /// Defaults embedded in the kernel binary.
    Bundled,
    /// Fetched from the remote registry.
    Registry,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Project => "project",
            Self::User => "user",
            Self::Bundled => "bundled",
            Self::Registry => "registry",
        };
        f.write_str(s)
    }
}

/// Unique item coordinate: `(type, id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
pub struct ItemKey {
    /// Item kind.
    pub item_type: ItemType,
    /// Stable identifier.
    pub id: String,
}

impl ItemKey {
    /// Build a key.
    pub fn new(item_type: ItemType, id: impl Into<String>) -> Self {
        Self {
            item_type,
            id: id.into(),
        }
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.item_type, self.id)
    }
}

/// Signature data parsed from an item's first-line marker.
///
/// The marker has the form
/// `<comment> kiwi-mcp:validated:<ISO-8601 UTC>:<hex sha256>[:sig=<base64>]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SignatureInfo {
    /// When the item was signed.
    pub timestamp: DateTime<Utc>,
    /// Lower-hex SHA-256 of the canonicalized content.
    pub hash: String,
    /// Optional base64 ed25519 signature over the content hash.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sig: Option<String>,
}

/// A fully resolved content item.
///
/// Items are immutable once signed; editing invalidates the signature. The
/// content store hands out read-only copies and never mutates sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    /// Stable identifier, unique per type.
    pub id: String,
    /// Semver-compatible version string.
    pub version: String,
    /// Item kind.
    pub item_type: ItemType,
    /// Category path segment under the type directory.
    pub category: String,
    /// Layer the item was resolved from.
    pub origin: Origin,
    /// Parsed manifest.
    pub manifest: Manifest,
    /// Raw source of the primary file (the signed form).
    pub source: String,
    /// Additional files for multi-file tools, relative path → content.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub files: BTreeMap<String, String>,
    /// Parsed signature marker, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<SignatureInfo>,
    /// Absolute path of the primary file (`None` for bundled items).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl Item {
    /// The `(type, id)` coordinate of this item.
    pub fn key(&self) -> ItemKey {
        ItemKey::new(self.item_type, self.id.clone())
    }
}

/// Outcome of running a tool through its executor chain.
///
/// This is the value returned by `execute(tool, run, …)`; primitive failures
/// surface here as `success=false` plus a structured error, never as a
/// transport fault.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Whether the terminal primitive reported success.
    pub success: bool,
    /// Primitive output: stdout text, parsed JSON body, or transformed value.
    pub output: serde_json::Value,
    /// Structured failure detail when `success` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<KernelError>,
    /// Wall-clock duration of the primitive call.
    pub duration_ms: u64,
    /// Resolved chain, leaf first (e.g. `["greet", "python_runtime", "subprocess"]`).
    pub executor_chain: Vec<String>,
    /// Non-fatal annotations (`_loop_warning`, retry counts, …).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl ExecutionResult {
    /// A successful result with the given output.
    pub fn ok(output: serde_json::Value, duration_ms: u64, chain: Vec<String>) -> Self {
        Self {
            success: true,
            output,
            error: None,
            duration_ms,
            executor_chain: chain,
            metadata: BTreeMap::new(),
        }
    }

    /// A failed result carrying a kernel error.
    pub fn failed(error: KernelError, duration_ms: u64, chain: Vec<String>) -> Self {
        Self {
            success: false,
            output: serde_json::Value::Null,
            error: Some(error),
            duration_ms,
            executor_chain: chain,
            metadata: BTreeMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Permission declarations (data model only; kiwi-policy compiles them)
// ---------------------------------------------------------------------------

/// A filesystem rule: glob over paths, resource is always `filesystem` today.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PathRule {
    /// Resource family; only `filesystem` is defined.
    #[serde(default = "PathRule::default_resource")]
    pub resource: String,
    /// Glob the rule applies to.
    pub path: String,
}

impl PathRule {
    fn default_resource() -> String {
        "filesystem".to_string()
    }

    /// Convenience constructor for filesystem rules.
    pub fn filesystem(path: impl Into<String>) -> Self {
        Self {
            resource: Self::default_resource(),
            path: path.into(),
        }
    }
}

/// Target of an `mcp` execute rule: a named external MCP server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct McpTarget {
    /// Server name.
    pub name: String,
    /// Permitted actions on that server.
    #[serde(default)]
    pub actions: Vec<String>,
}

/// One `execute` permission rule.
///
/// The serialized form keys on exactly one of `tool`, `shell`, `kiwi-mcp`,
/// or `mcp`, which is why the enum is untagged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum ExecuteRule {
    /// Permit running one tool by id (globs allowed).
    Tool {
        /// Tool id or glob.
        tool: String,
    },
    /// Permit shell commands from a comma-separated allow-list.
    Shell {
        /// Comma-separated command names (e.g. `"ls,cat,grep"`).
        shell: String,
    },
    /// Permit kernel meta-operations.
    KiwiMcp {
        /// Permitted actions: search, load, execute, sign, help.
        #[serde(rename = "kiwi-mcp")]
        kiwi_mcp: Vec<String>,
    },
    /// Permit calls against a named external MCP server.
    Mcp {
        /// The server and its permitted actions.
        mcp: McpTarget,
    },
}

/// One explicit `deny` rule.
///
/// An absent allow is already a deny; explicit denies document exclusions
/// and win over any matching allow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum DenyRule {
    /// Deny reads matching the rule.
    Read {
        /// The filesystem rule being denied.
        read: PathRule,
    },
    /// Deny writes matching the rule.
    Write {
        /// The filesystem rule being denied.
        write: PathRule,
    },
    /// Deny an execute rule.
    Execute {
        /// The execute rule being denied.
        execute: ExecuteRule,
    },
}

/// Declared permissions of an item, straight from its manifest.
///
/// An empty declaration grants nothing beyond meta-operation access; the
/// compiled form and all runtime checks live in `kiwi-policy`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
pub struct PermissionsDecl {
    /// Filesystem read rules.
    #[serde(default)]
    pub read: Vec<PathRule>,
    /// Filesystem write rules.
    #[serde(default)]
    pub write: Vec<PathRule>,
    /// Execute rules (tools, shell, kernel actions, external MCP).
    #[serde(default)]
    pub execute: Vec<ExecuteRule>,
    /// Explicit denies; these win over matching allows.
    #[serde(default)]
    pub deny: Vec<DenyRule>,
}

impl PermissionsDecl {
    /// True when no rule of any kind is declared.
    pub fn is_empty(&self) -> bool {
        self.read.is_empty()
            && self.write.is_empty()
            && self.execute.is_empty()
            && self.deny.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_type_dirs() {
        assert_eq!(ItemType::Directive.dir_name(), Some("directives"));
        assert_eq!(ItemType::Tool.dir_name(), Some("tools"));
        assert_eq!(ItemType::Knowledge.dir_name(), Some("knowledge"));
        assert_eq!(ItemType::System.dir_name(), None);
    }

    #[test]
    fn item_type_wire_form() {
        assert_eq!(
            serde_json::to_value(ItemType::Directive).unwrap(),
            serde_json::json!("directive")
        );
        let t: ItemType = serde_json::from_str("\"knowledge\"").unwrap();
        assert_eq!(t, ItemType::Knowledge);
    }

    #[test]
    fn item_key_display() {
        let key = ItemKey::new(ItemType::Tool, "greet");
        assert_eq!(key.to_string(), "tool/greet");
    }

    #[test]
    fn permissions_decl_from_yaml() {
        let yaml = r#"
read:
  - path: "src/**"
write:
  - path: "out/**"
execute:
  - tool: file_reader
  - shell: "ls,cat,grep"
  - kiwi-mcp: [search, load]
  - mcp:
      name: github
      actions: [search_issues]
deny:
  - read:
      path: "secrets/**"
"#;
        let decl: PermissionsDecl = serde_yaml::from_str(yaml).expect("parse permissions");
        assert_eq!(decl.read.len(), 1);
        assert_eq!(decl.read[0].resource, "filesystem");
        assert_eq!(decl.execute.len(), 4);
        assert!(matches!(
            decl.execute[0],
            ExecuteRule::Tool { ref tool } if tool == "file_reader"
        ));
        assert!(matches!(
            decl.execute[1],
            ExecuteRule::Shell { ref shell } if shell == "ls,cat,grep"
        ));
        assert!(matches!(decl.execute[3], ExecuteRule::Mcp { .. }));
        assert!(matches!(
            decl.deny[0],
            DenyRule::Read { ref read } if read.path == "secrets/**"
        ));
    }

    #[test]
    fn empty_permissions_decl() {
        let decl = PermissionsDecl::default();
        assert!(decl.is_empty());
        let decl: PermissionsDecl = serde_yaml::from_str("{}").unwrap();
        assert!(decl.is_empty());
    }

    #[test]
    fn execution_result_wire_form() {
        let ok = ExecutionResult::ok(
            serde_json::json!("Hello, world\n"),
            12,
            vec!["greet".into(), "python_runtime".into(), "subprocess".into()],
        );
        let v = serde_json::to_value(&ok).unwrap();
        assert_eq!(v["success"], true);
        assert_eq!(v["executor_chain"][2], "subprocess");
        assert!(v.get("error").is_none());
    }
}
