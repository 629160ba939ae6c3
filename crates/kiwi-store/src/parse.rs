// SPDX-License-Identifier: MIT OR Apache-2.0
//! Manifest parsing for the three item source forms.
//!
//! Tools are plain YAML (the signature marker is a YAML comment), knowledge
//! documents carry YAML frontmatter between `---` fences, and directives
//! embed an XML block inside Markdown. All failures surface as
//! `invalid_item` kernel errors naming what was malformed.

use kiwi_core::{
    DenyRule, DirectiveInput, DirectiveManifest, DirectiveOutput, DirectiveStep, ExecuteRule,
    ItemRef, ItemType, KnowledgeManifest, ManifestCommon, McpTarget, PathRule, PermissionsDecl,
    ToolManifest, ToolType,
};
use kiwi_error::{KernelError, KernelResult};
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use std::collections::BTreeMap;

/// Marker tag used to drop the signature line before structural parsing.
const MARKER_TAG: &str = "kiwi-mcp:validated:";

/// Return `source` without its first line when that line is a signature
/// marker.
pub fn strip_marker_line(source: &str) -> &str {
    let first = source.lines().next().unwrap_or("");
    if first.contains(MARKER_TAG) {
        match source.split_once('\n') {
            Some((_, rest)) => rest,
            None => "",
        }
    } else {
        source
    }
}

/// Parse a tool manifest from its YAML source.
pub fn parse_tool(id: &str, source: &str) -> KernelResult<ToolManifest> {
    let manifest: ToolManifest = serde_yaml::from_str(source).map_err(|e| {
        KernelError::invalid_item(format!("tool '{id}': malformed YAML manifest: {e}"))
    })?;

    match (manifest.tool_type, &manifest.executor) {
        (ToolType::Primitive, Some(_)) => Err(KernelError::invalid_item(format!(
            "tool '{id}': primitives must not declare an executor"
        ))),
        (ToolType::Primitive, None) => Ok(manifest),
        (_, None) => Err(KernelError::invalid_item(format!(
            "tool '{id}': non-primitive tools must declare an executor"
        ))
        .with_suggestion("set `executor:` to a runtime id, e.g. `python_runtime`")),
        (_, Some(_)) => Ok(manifest),
    }
}

/// Parse a knowledge manifest and body from Markdown with YAML frontmatter.
pub fn parse_knowledge(id: &str, source: &str) -> KernelResult<(KnowledgeManifest, String)> {
    let content = strip_marker_line(source);
    // Frontmatter sits between the first two `---` fences.
    let parts: Vec<&str> = content.splitn(3, "---").collect();
    if parts.len() < 3 || !parts[0].trim().is_empty() {
        return Err(KernelError::invalid_item(format!(
            "knowledge '{id}': missing YAML frontmatter fences"
        ))
        .with_suggestion("start the document with `---` frontmatter `---`"));
    }

    let manifest: KnowledgeManifest = serde_yaml::from_str(parts[1]).map_err(|e| {
        KernelError::invalid_item(format!("knowledge '{id}': malformed frontmatter: {e}"))
    })?;
    Ok((manifest, parts[2].trim_start().to_string()))
}

/// Parse a directive manifest from its XML-in-Markdown source.
pub fn parse_directive(id: &str, source: &str) -> KernelResult<DirectiveManifest> {
    let content = strip_marker_line(source);

    let start = content.find("<directive").ok_or_else(|| {
        KernelError::invalid_item(format!("directive '{id}': no <directive> block"))
            .with_suggestion("wrap the workflow in a <directive>…</directive> XML block")
    })?;
    let end_tag = "</directive>";
    let end = content[start..].find(end_tag).ok_or_else(|| {
        KernelError::invalid_item(format!("directive '{id}': unterminated <directive> block"))
    })? + start
        + end_tag.len();
    let xml = &content[start..end];

    let mut manifest = parse_directive_xml(id, xml)?;

    // Fall back to the Markdown heading when the XML omits a title.
    if manifest.common.title.is_empty() {
        if let Some(heading) = content
            .lines()
            .find_map(|l| l.strip_prefix("# ").map(str::trim))
        {
            manifest.common.title = heading.to_string();
        }
    }
    Ok(manifest)
}

fn xml_err(id: &str, detail: impl std::fmt::Display) -> KernelError {
    KernelError::invalid_item(format!("directive '{id}': invalid XML: {detail}"))
}

fn attrs_of(id: &str, e: &BytesStart<'_>) -> KernelResult<BTreeMap<String, String>> {
    let mut map = BTreeMap::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|e| xml_err(id, e))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
        let value = attr
            .unescape_value()
            .map_err(|e| xml_err(id, e))?
            .to_string();
        map.insert(key, value);
    }
    Ok(map)
}

fn parse_directive_xml(id: &str, xml: &str) -> KernelResult<DirectiveManifest> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut manifest = DirectiveManifest::default();
    let mut path: Vec<String> = Vec::new();
    // Attributes of the element whose text body we are collecting.
    let mut pending_attrs: BTreeMap<String, String> = BTreeMap::new();
    let mut text = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                let attrs = attrs_of(id, e)?;
                if name == "directive" {
                    if let Some(v) = attrs.get("version") {
                        manifest.common.version = v.clone();
                    }
                }
                path.push(name);
                pending_attrs = attrs;
                text.clear();
            }
            Ok(Event::Empty(ref e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                let attrs = attrs_of(id, e)?;
                handle_leaf(id, &path, &name, &attrs, "", &mut manifest)?;
            }
            Ok(Event::Text(ref t)) => {
                let piece = t.unescape().map_err(|e| xml_err(id, e))?;
                if !text.is_empty() {
                    text.push(' ');
                }
                text.push_str(piece.trim());
            }
            Ok(Event::End(ref e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                path.pop();
                handle_leaf(id, &path, &name, &pending_attrs, text.trim(), &mut manifest)?;
                pending_attrs = BTreeMap::new();
                text.clear();
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(xml_err(id, e)),
        }
    }

    if manifest.steps.is_empty() {
        return Err(KernelError::invalid_item(format!(
            "directive '{id}': <process> declares no steps"
        )));
    }
    manifest.steps.sort_by_key(|s| s.number);
    Ok(manifest)
}

/// Route one closed element into the manifest. `parent` is the enclosing
/// element path after popping the element itself.
fn handle_leaf(
    id: &str,
    parent: &[String],
    name: &str,
    attrs: &BTreeMap<String, String>,
    text: &str,
    manifest: &mut DirectiveManifest,
) -> KernelResult<()> {
    let in_metadata = parent.last().is_some_and(|p| p == "metadata");
    let in_permissions = parent.last().is_some_and(|p| p == "permissions");

    match name {
        "title" if in_metadata => manifest.common.title = text.to_string(),
        "description" if in_metadata => manifest.common.description = text.to_string(),
        "category" if in_metadata => manifest.common.category = Some(text.to_string()),
        "author" if in_metadata => manifest.common.author = Some(text.to_string()),
        "tags" if in_metadata => {
            manifest.common.tags = text
                .split(',')
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect();
        }
        "input" => {
            let input_name = attrs
                .get("name")
                .cloned()
                .ok_or_else(|| xml_err(id, "<input> requires a name attribute"))?;
            manifest.inputs.push(DirectiveInput {
                name: input_name,
                input_type: attrs.get("type").cloned().unwrap_or_else(|| "string".into()),
                required: attrs.get("required").is_some_and(|v| v == "true"),
                description: text.to_string(),
                constraints: attrs
                    .get("constraints")
                    .map(|c| serde_json::Value::String(c.clone())),
            });
        }
        "step" => {
            let number = attrs
                .get("number")
                .and_then(|n| n.parse().ok())
                .unwrap_or(manifest.steps.len() as u32 + 1);
            manifest.steps.push(DirectiveStep {
                number,
                name: attrs.get("name").cloned().unwrap_or_default(),
                instruction: text.to_string(),
            });
        }
        "output" => {
            let output_name = attrs
                .get("name")
                .cloned()
                .ok_or_else(|| xml_err(id, "<output> requires a name attribute"))?;
            manifest.outputs.push(DirectiveOutput {
                name: output_name,
                description: text.to_string(),
            });
        }
        "reference" => {
            let ref_type = attrs
                .get("type")
                .cloned()
                .ok_or_else(|| xml_err(id, "<reference> requires a type attribute"))?;
            let item_type = parse_item_type(&ref_type)
                .ok_or_else(|| xml_err(id, format!("unknown reference type '{ref_type}'")))?;
            let ref_id = attrs
                .get("id")
                .cloned()
                .ok_or_else(|| xml_err(id, "<reference> requires an id attribute"))?;
            manifest.references.push(ItemRef {
                item_type,
                id: ref_id,
            });
        }
        "read" | "write" | "execute" | "deny" if in_permissions => {
            permission_rule(id, name, attrs, &mut manifest.common.permissions)?;
        }
        _ => {}
    }
    Ok(())
}

fn parse_item_type(s: &str) -> Option<ItemType> {
    match s {
        "directive" => Some(ItemType::Directive),
        "tool" => Some(ItemType::Tool),
        "knowledge" => Some(ItemType::Knowledge),
        _ => None,
    }
}

fn permission_rule(
    id: &str,
    name: &str,
    attrs: &BTreeMap<String, String>,
    decl: &mut PermissionsDecl,
) -> KernelResult<()> {
    match name {
        "read" => decl.read.push(path_rule(id, name, attrs)?),
        "write" => decl.write.push(path_rule(id, name, attrs)?),
        "execute" => decl.execute.push(execute_rule(id, attrs)?),
        "deny" => {
            let action = attrs.get("action").map(String::as_str);
            match (attrs.get("resource").map(String::as_str), action) {
                (Some("filesystem"), Some("read")) => decl.deny.push(DenyRule::Read {
                    read: path_rule(id, "deny", attrs)?,
                }),
                (Some("filesystem"), Some("write")) => decl.deny.push(DenyRule::Write {
                    write: path_rule(id, "deny", attrs)?,
                }),
                _ => decl.deny.push(DenyRule::Execute {
                    execute: execute_rule(id, attrs)?,
                }),
            }
        }
        _ => {}
    }
    Ok(())
}

fn path_rule(
    id: &str,
    element: &str,
    attrs: &BTreeMap<String, String>,
) -> KernelResult<PathRule> {
    let path = attrs
        .get("path")
        .cloned()
        .ok_or_else(|| xml_err(id, format!("<{element}> requires a path attribute")))?;
    Ok(PathRule {
        resource: attrs
            .get("resource")
            .cloned()
            .unwrap_or_else(|| "filesystem".into()),
        path,
    })
}

fn execute_rule(id: &str, attrs: &BTreeMap<String, String>) -> KernelResult<ExecuteRule> {
    let resource = attrs
        .get("resource")
        .cloned()
        .ok_or_else(|| xml_err(id, "<execute> requires a resource attribute"))?;
    match resource.as_str() {
        "tool" => Ok(ExecuteRule::Tool {
            tool: attrs
                .get("id")
                .cloned()
                .ok_or_else(|| xml_err(id, "execute tool rule requires an id"))?,
        }),
        "shell" => Ok(ExecuteRule::Shell {
            shell: attrs
                .get("commands")
                .cloned()
                .ok_or_else(|| xml_err(id, "execute shell rule requires commands"))?,
        }),
        "kiwi-mcp" => Ok(ExecuteRule::KiwiMcp {
            kiwi_mcp: split_list(attrs.get("actions")),
        }),
        "mcp" => Ok(ExecuteRule::Mcp {
            mcp: McpTarget {
                name: attrs
                    .get("name")
                    .cloned()
                    .ok_or_else(|| xml_err(id, "execute mcp rule requires a name"))?,
                actions: split_list(attrs.get("actions")),
            },
        }),
        other => Err(xml_err(id, format!("unknown execute resource '{other}'"))),
    }
}

fn split_list(value: Option<&String>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Build a [`ManifestCommon`]-bearing manifest's skeleton for authoring
/// helpers (`execute(action=create)`).
pub fn directive_template(id: &str, title: &str) -> String {
    format!(
        r#"# {title}

<directive id="{id}" version="0.1.0">
  <metadata>
    <title>{title}</title>
    <description>Describe what this directive accomplishes.</description>
  </metadata>
  <inputs>
    <input name="goal" type="string" required="true">What the run should achieve.</input>
  </inputs>
  <process>
    <step number="1" name="plan">Outline the approach before acting.</step>
    <step number="2" name="act">Carry out the plan step by step.</step>
  </process>
  <outputs>
    <output name="summary">One-paragraph result summary.</output>
  </outputs>
  <permissions>
  </permissions>
</directive>
"#
    )
}
