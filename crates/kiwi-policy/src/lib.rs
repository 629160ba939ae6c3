// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! kiwi-policy
#![deny(unsafe_code)]

pub mod audit;
pub mod loopdetect;
pub mod ratelimit;

pub use audit::{AuditDecision, AuditEntry, AuditLog};
pub use loopdetect::{LoopDetector, LoopSignal};
pub use ratelimit::{RateLimitConfig, RateLimiter};

use globset::{Glob, GlobSet, GlobSetBuilder};
use kiwi_core::{DenyRule, ExecuteRule, PermissionsDecl};
use kiwi_error::{AnnealingHint, KernelError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Outcome of a single permission check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Decision {
    /// The call is permitted.
    Allow,
    /// The call is rejected; `rule` names what matched (or what was absent).
    Deny {
        /// Human-readable rule text, stable enough for assertions.
        rule: String,
    },
}

impl Decision {
    /// True only for [`Decision::Allow`].
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }

    /// Convert a denial into a `permission_denied` kernel error with an
    /// annealing hint; panics never — an `Allow` converts to a generic error.
    pub fn into_error(self) -> KernelError {
        match self {
            Self::Allow => KernelError::permission_denied("call was allowed"),
            Self::Deny { rule } => {
                let hint = AnnealingHint::new(
                    "add_permission",
                    format!("declare a permission covering: {rule}"),
                );
                KernelError::permission_denied(rule.clone())
                    .with_context("rule", rule)
                    .with_hint(hint)
            }
        }
    }
}

/// What to do when a child declares more than its parent can grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntersectionPolicy {
    /// Drop ungrantable rules silently (with an audit entry).
    #[default]
    Reduce,
    /// Refuse to spawn the child at all.
    Refuse,
}

/// A child declared strictly more than its parent could grant and the
/// intersection policy is [`IntersectionPolicy::Refuse`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("child permissions exceed parent grant: {dropped:?}")]
pub struct IntersectionRefused {
    /// The rules the parent could not grant.
    pub dropped: Vec<String>,
}

#[derive(Debug, Clone, Default)]
struct GlobRules {
    patterns: Vec<String>,
    set: Option<GlobSet>,
}

impl GlobRules {
    fn compile(patterns: Vec<String>) -> Result<Self, KernelError> {
        if patterns.is_empty() {
            return Ok(Self {
                patterns,
                set: None,
            });
        }
        let mut b = GlobSetBuilder::new();
        for p in &patterns {
            b.add(Glob::new(p).map_err(|e| {
                KernelError::invalid_item(format!("invalid permission glob '{p}': {e}"))
            })?);
        }
        let set = b.build().map_err(|e| {
            KernelError::invalid_item(format!("failed to compile permission globs: {e}"))
        })?;
        Ok(Self {
            patterns,
            set: Some(set),
        })
    }

    fn matches(&self, candidate: &str) -> bool {
        self.set
            .as_ref()
            .is_some_and(|s| s.is_match(Path::new(candidate)))
    }

    /// Whether this rule set could grant `pattern`. Glob-containment is
    /// undecidable in general; we probe with the pattern's metacharacters
    /// replaced by a concrete segment, which is exact for the equal-pattern
    /// and broader-parent cases that occur in practice.
    fn grants_pattern(&self, pattern: &str) -> bool {
        if self.patterns.iter().any(|p| p == pattern) {
            return true;
        }
        self.matches(&probe_for(pattern))
    }
}

fn probe_for(pattern: &str) -> String {
    pattern
        .replace("**", "x/x")
        .replace('*', "x")
        .replace('?', "x")
}

/// The set of rules effective during one execution session.
///
/// Compiled once when a meta-operation materializes the owning item's
/// declaration; every primitive call is checked against it.
#[derive(Debug, Clone)]
pub struct PermissionContext {
    /// Item the context was built from, for audit messages.
    pub owner: String,
    unrestricted: bool,
    read_allow: GlobRules,
    write_allow: GlobRules,
    read_deny: GlobRules,
    write_deny: GlobRules,
    tool_allow: GlobRules,
    tool_deny: GlobRules,
    shell_allow: BTreeSet<String>,
    shell_deny: BTreeSet<String>,
    kiwi_allow: BTreeSet<String>,
    kiwi_deny: BTreeSet<String>,
    mcp_allow: BTreeMap<String, BTreeSet<String>>,
    mcp_deny: BTreeMap<String, BTreeSet<String>>,
}

impl PermissionContext {
    /// The operator's root context: everything is permitted.
    ///
    /// Permissions bind items, not the MCP client driving the kernel; a
    /// client-initiated `execute` starts from this context and narrows as
    /// items spawn items.
    pub fn unrestricted() -> Self {
        Self {
            owner: "client".to_string(),
            unrestricted: true,
            read_allow: GlobRules::default(),
            write_allow: GlobRules::default(),
            read_deny: GlobRules::default(),
            write_deny: GlobRules::default(),
            tool_allow: GlobRules::default(),
            tool_deny: GlobRules::default(),
            shell_allow: BTreeSet::new(),
            shell_deny: BTreeSet::new(),
            kiwi_allow: BTreeSet::new(),
            kiwi_deny: BTreeSet::new(),
            mcp_allow: BTreeMap::new(),
            mcp_deny: BTreeMap::new(),
        }
    }

    /// Compile an item's declaration into a context.
    pub fn from_decl(owner: &str, decl: &PermissionsDecl) -> Result<Self, KernelError> {
        let mut read_allow = Vec::new();
        let mut write_allow = Vec::new();
        for r in &decl.read {
            read_allow.push(r.path.clone());
        }
        for r in &decl.write {
            write_allow.push(r.path.clone());
        }

        let mut tool_allow = Vec::new();
        let mut shell_allow = BTreeSet::new();
        let mut kiwi_allow = BTreeSet::new();
        let mut mcp_allow: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for rule in &decl.execute {
            collect_execute(
                rule,
                &mut tool_allow,
                &mut shell_allow,
                &mut kiwi_allow,
                &mut mcp_allow,
            );
        }

        let mut read_deny = Vec::new();
        let mut write_deny = Vec::new();
        let mut tool_deny = Vec::new();
        let mut shell_deny = BTreeSet::new();
        let mut kiwi_deny = BTreeSet::new();
        let mut mcp_deny: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for deny in &decl.deny {
            match deny {
                DenyRule::Read { read } => read_deny.push(read.path.clone()),
                DenyRule::Write { write } => write_deny.push(write.path.clone()),
                DenyRule::Execute { execute } => collect_execute(
                    execute,
                    &mut tool_deny,
                    &mut shell_deny,
                    &mut kiwi_deny,
                    &mut mcp_deny,
                ),
            }
        }

        Ok(Self {
            owner: owner.to_string(),
            unrestricted: false,
            read_allow: GlobRules::compile(read_allow)?,
            write_allow: GlobRules::compile(write_allow)?,
            read_deny: GlobRules::compile(read_deny)?,
            write_deny: GlobRules::compile(write_deny)?,
            tool_allow: GlobRules::compile(tool_allow)?,
            tool_deny: GlobRules::compile(tool_deny)?,
            shell_allow,
            shell_deny,
            kiwi_allow,
            kiwi_deny,
            mcp_allow,
            mcp_deny,
        })
    }

    /// Check a filesystem read.
    pub fn check_read(&self, path: &str) -> Decision {
        if self.unrestricted {
            return Decision::Allow;
        }
        if self.read_deny.matches(path) {
            return Decision::Deny {
                rule: format!("filesystem read denied: {path}"),
            };
        }
        if self.read_allow.matches(path) {
            Decision::Allow
        } else {
            Decision::Deny {
                rule: format!("filesystem read not permitted: {path}"),
            }
        }
    }

    /// Check a filesystem write.
    pub fn check_write(&self, path: &str) -> Decision {
        if self.unrestricted {
            return Decision::Allow;
        }
        if self.write_deny.matches(path) {
            return Decision::Deny {
                rule: format!("filesystem write denied: {path}"),
            };
        }
        if self.write_allow.matches(path) {
            Decision::Allow
        } else {
            Decision::Deny {
                rule: format!("filesystem write not permitted: {path}"),
            }
        }
    }

    /// Check a shell invocation by base command (the first argv element).
    pub fn check_shell(&self, command: &str) -> Decision {
        if self.unrestricted {
            return Decision::Allow;
        }
        let base = command
            .rsplit('/')
            .next()
            .unwrap_or(command)
            .trim()
            .to_string();
        if self.shell_deny.contains(&base) {
            return Decision::Deny {
                rule: format!("shell command denied: {base}"),
            };
        }
        if self.shell_allow.contains(&base) {
            Decision::Allow
        } else {
            Decision::Deny {
                rule: format!("shell command not in allow-list: {base}"),
            }
        }
    }

    /// Check spawning another tool by id.
    pub fn check_tool(&self, tool_id: &str) -> Decision {
        if self.unrestricted {
            return Decision::Allow;
        }
        if self.tool_deny.matches(tool_id) {
            return Decision::Deny {
                rule: format!("tool execution denied: {tool_id}"),
            };
        }
        if self.tool_allow.matches(tool_id) {
            Decision::Allow
        } else {
            Decision::Deny {
                rule: format!("tool not in allow-list: {tool_id}"),
            }
        }
    }

    /// Check a kernel meta-operation (search, load, execute, sign, help).
    ///
    /// Unlike filesystem and shell rules, an item that declares no
    /// `kiwi-mcp` rule at all has not opted into constraining meta-ops;
    /// its resource rules still apply to everything those ops touch.
    pub fn check_kiwi_action(&self, action: &str) -> Decision {
        if self.unrestricted {
            return Decision::Allow;
        }
        if self.kiwi_deny.contains(action) {
            return Decision::Deny {
                rule: format!("kiwi-mcp action denied: {action}"),
            };
        }
        if self.kiwi_allow.is_empty() || self.kiwi_allow.contains(action) {
            Decision::Allow
        } else {
            Decision::Deny {
                rule: format!("kiwi-mcp action not permitted: {action}"),
            }
        }
    }

    /// Check a call against a named external MCP server.
    pub fn check_mcp(&self, server: &str, action: &str) -> Decision {
        if self.unrestricted {
            return Decision::Allow;
        }
        if let Some(denied) = self.mcp_deny.get(server) {
            if denied.is_empty() || denied.contains(action) {
                return Decision::Deny {
                    rule: format!("mcp call denied: {server}.{action}"),
                };
            }
        }
        match self.mcp_allow.get(server) {
            Some(actions) if actions.is_empty() || actions.contains(action) => Decision::Allow,
            _ => Decision::Deny {
                rule: format!("mcp call not permitted: {server}.{action}"),
            },
        }
    }

    /// Outbound HTTP is allowed unless the item declares outbound rules;
    /// no item can yet, so this always allows.
    pub fn check_http(&self, _url: &str) -> Decision {
        Decision::Allow
    }

    /// Intersect a child declaration with this (parent) context.
    ///
    /// Each child rule survives only when this context could grant it; the
    /// rest are dropped and returned for auditing. With
    /// [`IntersectionPolicy::Refuse`] any drop aborts the spawn instead.
    pub fn spawn_child(
        &self,
        owner: &str,
        decl: &PermissionsDecl,
        policy: IntersectionPolicy,
    ) -> Result<(Self, Vec<String>), IntersectionRefused> {
        let child = match Self::from_decl(owner, decl) {
            Ok(c) => c,
            Err(_) => {
                return Err(IntersectionRefused {
                    dropped: vec!["invalid permission declaration".to_string()],
                });
            }
        };

        if self.unrestricted {
            return Ok((child, Vec::new()));
        }

        let mut dropped = Vec::new();

        let read_allow = retain_grantable(
            &child.read_allow.patterns,
            |p| self.read_allow.grants_pattern(p) && !self.read_deny.matches(&probe_for(p)),
            "read",
            &mut dropped,
        );
        let write_allow = retain_grantable(
            &child.write_allow.patterns,
            |p| self.write_allow.grants_pattern(p) && !self.write_deny.matches(&probe_for(p)),
            "write",
            &mut dropped,
        );
        let tool_allow = retain_grantable(
            &child.tool_allow.patterns,
            |p| self.tool_allow.grants_pattern(p) && !self.tool_deny.matches(&probe_for(p)),
            "execute tool",
            &mut dropped,
        );

        let shell_allow: BTreeSet<String> = child
            .shell_allow
            .iter()
            .filter(|c| {
                let keep = self.shell_allow.contains(*c) && !self.shell_deny.contains(*c);
                if !keep {
                    dropped.push(format!("execute shell: {c}"));
                }
                keep
            })
            .cloned()
            .collect();

        // An undeclared kiwi-mcp rule set inherits the parent's restriction
        // rather than widening back to allow-all.
        let kiwi_allow: BTreeSet<String> = if child.kiwi_allow.is_empty() {
            self.kiwi_allow.clone()
        } else {
            child
                .kiwi_allow
                .iter()
                .filter(|a| {
                    let keep = (self.kiwi_allow.is_empty() || self.kiwi_allow.contains(*a))
                        && !self.kiwi_deny.contains(*a);
                    if !keep {
                        dropped.push(format!("execute kiwi-mcp: {a}"));
                    }
                    keep
                })
                .cloned()
                .collect()
        };

        let mut mcp_allow = BTreeMap::new();
        for (server, actions) in &child.mcp_allow {
            match self.mcp_allow.get(server) {
                Some(parent_actions) => {
                    let kept: BTreeSet<String> = actions
                        .iter()
                        .filter(|a| {
                            let keep = parent_actions.is_empty() || parent_actions.contains(*a);
                            if !keep {
                                dropped.push(format!("execute mcp: {server}.{a}"));
                            }
                            keep
                        })
                        .cloned()
                        .collect();
                    if !kept.is_empty() || actions.is_empty() {
                        mcp_allow.insert(server.clone(), kept);
                    }
                }
                None => dropped.push(format!("execute mcp: {server}")),
            }
        }

        if !dropped.is_empty() && policy == IntersectionPolicy::Refuse {
            return Err(IntersectionRefused { dropped });
        }

        // Child denies are preserved verbatim: denies only ever narrow.
        // Retained patterns already compiled once in `from_decl`, so the
        // recompilation cannot fail.
        let effective = Self {
            owner: owner.to_string(),
            unrestricted: false,
            read_allow: GlobRules::compile(read_allow).unwrap_or_default(),
            write_allow: GlobRules::compile(write_allow).unwrap_or_default(),
            read_deny: child.read_deny,
            write_deny: child.write_deny,
            tool_allow: GlobRules::compile(tool_allow).unwrap_or_default(),
            tool_deny: child.tool_deny,
            shell_allow,
            shell_deny: child.shell_deny,
            kiwi_allow,
            kiwi_deny: child.kiwi_deny,
            mcp_allow,
            mcp_deny: child.mcp_deny,
        };

        Ok((effective, dropped))
    }

    /// The allow-rule patterns currently in effect, for subset assertions.
    pub fn allow_patterns(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        for p in &self.read_allow.patterns {
            out.insert(format!("read:{p}"));
        }
        for p in &self.write_allow.patterns {
            out.insert(format!("write:{p}"));
        }
        for p in &self.tool_allow.patterns {
            out.insert(format!("tool:{p}"));
        }
        for c in &self.shell_allow {
            out.insert(format!("shell:{c}"));
        }
        for a in &self.kiwi_allow {
            out.insert(format!("kiwi:{a}"));
        }
        for (s, actions) in &self.mcp_allow {
            for a in actions {
                out.insert(format!("mcp:{s}.{a}"));
            }
        }
        out
    }
}

fn retain_grantable<F>(
    patterns: &[String],
    grantable: F,
    kind: &str,
    dropped: &mut Vec<String>,
) -> Vec<String>
where
    F: Fn(&str) -> bool,
{
    patterns
        .iter()
        .filter(|p| {
            let keep = grantable(p);
            if !keep {
                dropped.push(format!("{kind}: {p}"));
            }
            keep
        })
        .cloned()
        .collect()
}

fn collect_execute(
    rule: &ExecuteRule,
    tools: &mut Vec<String>,
    shell: &mut BTreeSet<String>,
    kiwi: &mut BTreeSet<String>,
    mcp: &mut BTreeMap<String, BTreeSet<String>>,
) {
    match rule {
        ExecuteRule::Tool { tool } => tools.push(tool.clone()),
        ExecuteRule::Shell { shell: list } => {
            for cmd in list.split(',') {
                let cmd = cmd.trim();
                if !cmd.is_empty() {
                    shell.insert(cmd.to_string());
                }
            }
        }
        ExecuteRule::KiwiMcp { kiwi_mcp } => {
            for a in kiwi_mcp {
                kiwi.insert(a.clone());
            }
        }
        ExecuteRule::Mcp { mcp: target } => {
            mcp.entry(target.name.clone())
                .or_default()
                .extend(target.actions.iter().cloned());
        }
    }
}
