// SPDX-License-Identifier: MIT OR Apache-2.0
//! Connection-scoped session state.
//!
//! The kernel serves exactly one MCP client, so loop-detector and
//! rate-limit counters live on one session created at startup; each
//! meta-operation invocation gets its own audit identity within it.

use kiwi_core::PermissionsDecl;
use kiwi_policy::{
    AuditDecision, AuditEntry, AuditLog, IntersectionPolicy, LoopDetector, PermissionContext,
    RateLimiter,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use uuid::Uuid;

/// Per-connection execution state.
pub struct Session {
    /// Session id; partitions the audit log.
    pub id: String,
    /// Sliding-window loop detector.
    pub loops: LoopDetector,
    /// Per-session action counters.
    pub rate: RateLimiter,
    /// Append-only audit trail.
    pub audit: AuditLog,
    active: Mutex<PermissionContext>,
    stuck_counts: Mutex<HashMap<String, u32>>,
}

impl Session {
    /// Create a session logging under `<log_dir>/<date>/<session>.jsonl`.
    pub fn new(log_dir: &Path) -> Self {
        let id = format!("sess-{}", Uuid::new_v4());
        Self {
            audit: AuditLog::new(log_dir, &id),
            id,
            loops: LoopDetector::default(),
            rate: RateLimiter::with_defaults(),
            active: Mutex::new(PermissionContext::unrestricted()),
            stuck_counts: Mutex::new(HashMap::new()),
        }
    }

    /// The permission context currently in effect.
    pub fn active_context(&self) -> PermissionContext {
        match self.active.lock() {
            Ok(g) => g.clone(),
            Err(p) => p.into_inner().clone(),
        }
    }

    /// Enter an item's permission context by intersecting its declaration
    /// with the currently active context. Returns the dropped rules, which
    /// the caller audits.
    pub fn enter_context(
        &self,
        owner: &str,
        decl: &PermissionsDecl,
        policy: IntersectionPolicy,
    ) -> Result<Vec<String>, kiwi_policy::IntersectionRefused> {
        let parent = self.active_context();
        let (child, dropped) = parent.spawn_child(owner, decl, policy)?;
        match self.active.lock() {
            Ok(mut g) => *g = child,
            Err(p) => *p.into_inner() = child,
        }
        Ok(dropped)
    }

    /// Reset to the operator's unrestricted context.
    pub fn reset_context(&self) {
        match self.active.lock() {
            Ok(mut g) => *g = PermissionContext::unrestricted(),
            Err(p) => *p.into_inner() = PermissionContext::unrestricted(),
        }
    }

    /// Bump the stuck counter for a reason; returns the new count.
    pub fn record_stuck(&self, reason: &str) -> u32 {
        let mut counts = match self.stuck_counts.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        let c = counts.entry(reason.to_string()).or_insert(0);
        *c += 1;
        *c
    }

    /// Convenience audit append.
    pub async fn log(&self, action: &str, decision: AuditDecision) {
        self.audit
            .record(AuditEntry::new(&self.id, action, decision))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiwi_core::PathRule;
    use tempfile::TempDir;

    #[test]
    fn session_starts_unrestricted() {
        let tmp = TempDir::new().expect("tempdir");
        let s = Session::new(tmp.path());
        assert!(s.active_context().check_read("/anything").is_allowed());
    }

    #[test]
    fn entering_a_context_narrows_and_reset_restores() {
        let tmp = TempDir::new().expect("tempdir");
        let s = Session::new(tmp.path());

        let decl = PermissionsDecl {
            read: vec![PathRule::filesystem("src/**")],
            ..PermissionsDecl::default()
        };
        let dropped = s
            .enter_context("safe", &decl, IntersectionPolicy::Reduce)
            .expect("enter context");
        assert!(dropped.is_empty());
        assert!(s.active_context().check_read("src/lib.rs").is_allowed());
        assert!(!s.active_context().check_read("config/secret.yaml").is_allowed());

        s.reset_context();
        assert!(s.active_context().check_read("config/secret.yaml").is_allowed());
    }

    #[test]
    fn nested_contexts_intersect() {
        let tmp = TempDir::new().expect("tempdir");
        let s = Session::new(tmp.path());

        let outer = PermissionsDecl {
            read: vec![PathRule::filesystem("src/**")],
            ..PermissionsDecl::default()
        };
        s.enter_context("outer", &outer, IntersectionPolicy::Reduce)
            .expect("outer");

        let inner = PermissionsDecl {
            read: vec![
                PathRule::filesystem("src/**"),
                PathRule::filesystem("/etc/**"),
            ],
            ..PermissionsDecl::default()
        };
        let dropped = s
            .enter_context("inner", &inner, IntersectionPolicy::Reduce)
            .expect("inner");
        assert_eq!(dropped.len(), 1);
        assert!(!s.active_context().check_read("/etc/passwd").is_allowed());
    }

    #[test]
    fn stuck_counter_increments_per_reason() {
        let tmp = TempDir::new().expect("tempdir");
        let s = Session::new(tmp.path());
        assert_eq!(s.record_stuck("tests failing"), 1);
        assert_eq!(s.record_stuck("tests failing"), 2);
        assert_eq!(s.record_stuck("other"), 1);
    }
}
