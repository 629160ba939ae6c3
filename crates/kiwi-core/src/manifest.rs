// SPDX-License-Identifier: MIT OR Apache-2.0
//! Parsed item manifests.
//!
//! A manifest is structured metadata extracted from an item's source form:
//! YAML for tools, XML-in-Markdown for directives, YAML frontmatter for
//! knowledge. Parsing lives in `kiwi-store`; these are the parsed shapes.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::{ItemType, PermissionsDecl};

/// Metadata shared by all three manifest kinds.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct ManifestCommon {
    /// Display title.
    #[serde(default)]
    pub title: String,
    /// One-paragraph description; the primary search field after the title.
    #[serde(default)]
    pub description: String,
    /// Freeform tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Category path segment; when absent the store derives it from the path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Author attribution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    /// Semver-compatible version string.
    #[serde(default = "ManifestCommon::default_version")]
    pub version: String,
    /// When the item was first created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// When the item was last validated (signed).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validated_at: Option<DateTime<Utc>>,
    /// Declared permissions.
    #[serde(default, skip_serializing_if = "PermissionsDecl::is_empty")]
    pub permissions: PermissionsDecl,
}

impl ManifestCommon {
    fn default_version() -> String {
        "0.1.0".to_string()
    }
}

// ---------------------------------------------------------------------------
// Tool
// ---------------------------------------------------------------------------

/// What kind of executable a tool is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ToolType {
    /// One of the two hard-coded execution capabilities.
    Primitive,
    /// Encodes how to run a language or transport; executor is a primitive.
    Runtime,
    /// A script executed through a runtime.
    Script,
    /// An HTTP endpoint executed through the http_client primitive.
    Http,
    /// An external MCP server launched through subprocess.
    McpServer,
}

/// A declared tool parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ParameterSpec {
    /// Parameter type: string, number, integer, boolean, object, array.
    #[serde(rename = "type", default = "ParameterSpec::default_type")]
    pub param_type: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Whether the caller must supply a value.
    #[serde(default)]
    pub required: bool,
    /// Default applied when the caller omits the parameter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Closed set of permitted values, when constrained.
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub choices: Option<Vec<Value>>,
}

impl ParameterSpec {
    fn default_type() -> String {
        "string".to_string()
    }
}

impl Default for ParameterSpec {
    fn default() -> Self {
        Self {
            param_type: Self::default_type(),
            description: String::new(),
            required: false,
            default: None,
            choices: None,
        }
    }
}

/// Manifest of an executable tool, parsed from `tool.yaml` / `<id>.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ToolManifest {
    /// Shared metadata.
    #[serde(flatten)]
    pub common: ManifestCommon,
    /// Executable kind.
    pub tool_type: ToolType,
    /// Id of the parent tool in the executor chain; absent only for primitives.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor: Option<String>,
    /// Type-specific execution config (command/args/env, method/url/…).
    #[serde(default)]
    pub config: serde_json::Map<String, Value>,
    /// Declared inputs, by parameter name.
    #[serde(default)]
    pub parameters: BTreeMap<String, ParameterSpec>,
}

// ---------------------------------------------------------------------------
// Directive
// ---------------------------------------------------------------------------

/// A typed, optionally required directive input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DirectiveInput {
    /// Input name.
    pub name: String,
    /// Input type (string, number, boolean, …).
    #[serde(rename = "type", default = "ParameterSpec::default_type")]
    pub input_type: String,
    /// Whether the input must be supplied to `run`.
    #[serde(default)]
    pub required: bool,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Optional structured constraints (ranges, patterns, enums).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<Value>,
}

/// One ordered step of a directive's process.
///
/// Steps are data: the kernel returns them for the LLM client to interpret
/// and never walks them itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DirectiveStep {
    /// 1-based position in the process.
    pub number: u32,
    /// Short step name.
    pub name: String,
    /// The instruction body.
    pub instruction: String,
}

/// A declared directive output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DirectiveOutput {
    /// Output name.
    pub name: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
}

/// Reference from one item to another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ItemRef {
    /// Referenced item kind.
    pub item_type: ItemType,
    /// Referenced item id.
    pub id: String,
}

/// Manifest of a declarative workflow, parsed from the directive's XML block.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct DirectiveManifest {
    /// Shared metadata.
    #[serde(flatten)]
    pub common: ManifestCommon,
    /// Typed inputs.
    #[serde(default)]
    pub inputs: Vec<DirectiveInput>,
    /// Ordered process steps.
    #[serde(default)]
    pub steps: Vec<DirectiveStep>,
    /// Declared outputs.
    #[serde(default)]
    pub outputs: Vec<DirectiveOutput>,
    /// References to other items the directive uses.
    #[serde(default)]
    pub references: Vec<ItemRef>,
}

// ---------------------------------------------------------------------------
// Knowledge
// ---------------------------------------------------------------------------

/// Zettel entry type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum KnowledgeKind {
    /// A definition or explanation of one idea.
    Concept,
    /// A reusable solution shape.
    Pattern,
    /// Step-by-step instructions.
    Procedure,
    /// A fill-in skeleton.
    Template,
    /// Symptom → cause → fix.
    Troubleshooting,
    /// External facts, lookup tables, defaults.
    #[default]
    Reference,
}

/// A typed link from one knowledge entry to another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Relationship {
    /// Link kind (e.g. `extends`, `contradicts`, `see_also`).
    pub kind: String,
    /// Target zettel id or item id.
    pub target: String,
}

/// Manifest of a knowledge document, parsed from YAML frontmatter.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct KnowledgeManifest {
    /// Shared metadata.
    #[serde(flatten)]
    pub common: ManifestCommon,
    /// Zettelkasten identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zettel_id: Option<String>,
    /// Entry type.
    #[serde(default)]
    pub entry_type: KnowledgeKind,
    /// Typed relationships to other entries.
    #[serde(default)]
    pub relationships: Vec<Relationship>,
}

// ---------------------------------------------------------------------------
// Manifest
// ---------------------------------------------------------------------------

/// Parsed manifest of any item type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Manifest {
    /// Directive workflow manifest.
    Directive(DirectiveManifest),
    /// Tool manifest.
    Tool(ToolManifest),
    /// Knowledge manifest.
    Knowledge(KnowledgeManifest),
}

impl Manifest {
    /// The shared metadata of any manifest kind.
    pub fn common(&self) -> &ManifestCommon {
        match self {
            Self::Directive(m) => &m.common,
            Self::Tool(m) => &m.common,
            Self::Knowledge(m) => &m.common,
        }
    }

    /// Mutable access to the shared metadata.
    pub fn common_mut(&mut self) -> &mut ManifestCommon {
        match self {
            Self::Directive(m) => &mut m.common,
            Self::Tool(m) => &mut m.common,
            Self::Knowledge(m) => &mut m.common,
        }
    }

    /// The item type this manifest belongs to.
    pub fn item_type(&self) -> ItemType {
        match self {
            Self::Directive(_) => ItemType::Directive,
            Self::Tool(_) => ItemType::Tool,
            Self::Knowledge(_) => ItemType::Knowledge,
        }
    }

    /// Declared permissions.
    pub fn permissions(&self) -> &PermissionsDecl {
        &self.common().permissions
    }

    /// Downcast to a tool manifest.
    pub fn as_tool(&self) -> Option<&ToolManifest> {
        match self {
            Self::Tool(m) => Some(m),
            _ => None,
        }
    }

    /// Downcast to a directive manifest.
    pub fn as_directive(&self) -> Option<&DirectiveManifest> {
        match self {
            Self::Directive(m) => Some(m),
            _ => None,
        }
    }

    /// Downcast to a knowledge manifest.
    pub fn as_knowledge(&self) -> Option<&KnowledgeManifest> {
        match self {
            Self::Knowledge(m) => Some(m),
            _ => None,
        }
    }
}
