// SPDX-License-Identifier: MIT OR Apache-2.0
//! Append-only JSONL audit trail, partitioned by date and session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

/// The decision a recorded call ended with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditDecision {
    /// The call proceeded.
    Allowed,
    /// A permission check rejected the call.
    Denied {
        /// The rule that matched (or was absent).
        rule: String,
    },
    /// The session rate limit fired.
    RateLimited {
        /// The pattern whose limit was exceeded.
        pattern: String,
    },
    /// The loop detector flagged the call (non-fatal).
    LoopDetected {
        /// The warning message attached to the result.
        warning: String,
    },
    /// Child permissions were reduced during intersection.
    PermissionsReduced {
        /// The rules the parent could not grant.
        dropped: Vec<String>,
    },
    /// An agent control signal (stuck, escalate, checkpoint).
    Signal {
        /// The signal kind.
        kind: String,
    },
}

/// One recorded call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// When the call was recorded.
    pub timestamp: DateTime<Utc>,
    /// Connection-scoped session id.
    pub session: String,
    /// Directive/tool id the call belongs to, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
    /// Action name (`tool.run`, `filesystem.write`, `help.stuck`, …).
    pub action: String,
    /// Digest or echo of the call parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// The decision.
    pub decision: AuditDecision,
    /// Execution time, when the call ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl AuditEntry {
    /// Start building an entry for `action` in `session`.
    pub fn new(session: &str, action: &str, decision: AuditDecision) -> Self {
        Self {
            timestamp: Utc::now(),
            session: session.to_string(),
            item_id: None,
            action: action.to_string(),
            params: None,
            decision,
            duration_ms: None,
        }
    }

    /// Attach the owning item id.
    #[must_use]
    pub fn with_item(mut self, item_id: impl Into<String>) -> Self {
        self.item_id = Some(item_id.into());
        self
    }

    /// Attach call parameters (or their digest).
    #[must_use]
    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }

    /// Attach the execution time.
    #[must_use]
    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }
}

/// Append-only audit writer.
///
/// Entries land in `<dir>/<YYYY-MM-DD>/<session>.jsonl`. Concurrent writers
/// are serialized per log; a failed append is logged and dropped rather than
/// failing the audited call.
pub struct AuditLog {
    dir: PathBuf,
    session: String,
    writer: Mutex<()>,
}

impl AuditLog {
    /// Create a log rooted at `dir` for the given session.
    pub fn new(dir: impl Into<PathBuf>, session: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            session: session.into(),
            writer: Mutex::new(()),
        }
    }

    /// The session this log writes under.
    pub fn session(&self) -> &str {
        &self.session
    }

    /// Path of today's log file.
    pub fn current_path(&self) -> PathBuf {
        let date = Utc::now().format("%Y-%m-%d").to_string();
        self.dir.join(date).join(format!("{}.jsonl", self.session))
    }

    /// Append one entry.
    pub async fn record(&self, entry: AuditEntry) {
        let path = self.current_path();
        let line = match serde_json::to_string(&entry) {
            Ok(s) => s,
            Err(e) => {
                warn!(target: "kiwi.policy.audit", error = %e, "unserializable audit entry");
                return;
            }
        };

        let _guard = self.writer.lock().await;
        if let Err(e) = append_line(&path, &line).await {
            warn!(target: "kiwi.policy.audit", error = %e, path = %path.display(), "audit append failed");
        }
    }

    /// Read back every entry for this session today, oldest first.
    pub async fn entries(&self) -> Vec<AuditEntry> {
        let path = self.current_path();
        let Ok(content) = tokio::fs::read_to_string(&path).await else {
            return Vec::new();
        };
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect()
    }
}

async fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.write_all(b"\n").await?;
    file.flush().await?;
    Ok(())
}
