// SPDX-License-Identifier: MIT OR Apache-2.0
//! The `help` operation: topic documentation plus the agent's
//! control-signal channel (stuck / escalate / checkpoint).

use chrono::Utc;
use kiwi_error::{KernelError, KernelResult};
use serde_json::{Value, json};
use std::path::Path;
use uuid::Uuid;

/// Attempts at which a `stuck` signal escalates to human intervention.
pub const STUCK_ESCALATION_THRESHOLD: u32 = 3;

/// Static documentation, keyed by topic.
pub fn topic(name: &str) -> KernelResult<&'static str> {
    match name {
        "overview" => Ok(OVERVIEW),
        "search" => Ok(SEARCH),
        "load" => Ok(LOAD),
        "execute" => Ok(EXECUTE),
        "sign" => Ok(SIGN),
        "commands" => Ok(COMMANDS),
        "agents_md" => Ok(AGENTS_MD),
        other => Err(KernelError::not_found(format!("unknown help topic '{other}'"))
            .with_suggestion(
                "topics: overview, search, load, execute, sign, commands, agents_md",
            )),
    }
}

/// Write an intervention-queue entry and return its id.
pub fn enqueue_intervention(
    queue_dir: &Path,
    kind: &str,
    payload: Value,
) -> KernelResult<String> {
    let id = format!("{kind}-{}", Uuid::new_v4());
    std::fs::create_dir_all(queue_dir).map_err(|e| {
        KernelError::execution_failed(format!("cannot create intervention queue: {e}"))
    })?;
    let entry = json!({
        "id": id,
        "kind": kind,
        "created_at": Utc::now().to_rfc3339(),
        "payload": payload,
    });
    let path = queue_dir.join(format!("{id}.json"));
    let body = serde_json::to_string_pretty(&entry)
        .map_err(|e| KernelError::execution_failed(format!("unserializable signal: {e}")))?;
    std::fs::write(&path, body)
        .map_err(|e| KernelError::execution_failed(format!("cannot write queue entry: {e}")))?;
    Ok(id)
}

const OVERVIEW: &str = "\
kiwi-mcp is an agent-execution kernel. Five operations cover everything:
search finds items (directives, tools, knowledge), load fetches them,
execute runs them, sign validates them, and help is this channel. Tools
reduce to one of two primitives (subprocess, http_client) through their
executor chains; directives are returned as data for you to interpret;
knowledge is retrieval-only.";

const SEARCH: &str = "\
search(item_type, query, source=all, limit=20, strategy=auto, project_path)
Keyword search is always available; hybrid blends a vector backend in when
one is configured (EMBEDDING_URL). source=local searches project, user,
and bundled layers; source=registry queries the remote index. Results
carry search_type and quality so you can judge recall.";

const LOAD: &str = "\
load(item_type, item_id, source, destination?, project_path)
Fetches an item's manifest, content, and signature. destination=project
or user copies it into that layer (signature verified first; protected
prefixes are never copied). Registry loads always verify their signature.";

const EXECUTE: &str = "\
execute(item_type, action, item_id, parameters?, project_path, dry_run?)
tool: run|create|update|publish|delete. directive: run|create|edit|delete
(run returns the structured process spec for you to interpret). knowledge:
read|create|update|delete. system: read-only pseudo-items paths, runtime,
rag, mcp. dry_run=true on a tool returns the resolved chain and merged
config without executing.";

const SIGN: &str = "\
sign(item_type, item_id, project_path)
Canonicalizes the item, computes its SHA-256, and rewrites the first-line
marker. Run it after every edit and before publish. Signing is idempotent
on unchanged content.";

const COMMANDS: &str = "\
Control signals through help(action=…):
  stuck      — report being blocked; escalates to a human past 3 attempts.
  escalate   — request a human decision, supplying options.
  checkpoint — snapshot session state and get a checkpoint id.";

const AGENTS_MD: &str = "\
Project conventions live in the project layer (<project>/.ai/). Prefer
project items over user items over bundled ones; protected kernel content
(primitives, runtimes, core tools, kernel knowledge) always comes from the
bundled layer and cannot be shadowed.";

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn all_documented_topics_resolve() {
        for t in ["overview", "search", "load", "execute", "sign", "commands", "agents_md"] {
            assert!(topic(t).is_ok(), "missing topic {t}");
        }
    }

    #[test]
    fn unknown_topic_lists_the_valid_ones() {
        let err = topic("nope").expect_err("unknown topic");
        assert!(err.suggestion.expect("suggestion").contains("overview"));
    }

    #[test]
    fn intervention_entries_land_in_the_queue() {
        let tmp = TempDir::new().expect("tempdir");
        let id = enqueue_intervention(
            tmp.path(),
            "escalate",
            serde_json::json!({"reason": "ambiguous requirement", "options": ["a", "b"]}),
        )
        .expect("enqueue");
        let path = tmp.path().join(format!("{id}.json"));
        assert!(path.is_file());
        let entry: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(entry["kind"], "escalate");
        assert_eq!(entry["payload"]["options"][0], "a");
    }
}
