// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-session rate limiting over action patterns.

use globset::Glob;
use kiwi_error::{AnnealingHint, KernelError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

/// One pattern → limit pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateRule {
    /// Action pattern (glob syntax, e.g. `mcp.*`).
    pub pattern: String,
    /// Maximum calls per session.
    pub max_calls: u32,
}

/// Rate-limit configuration: a set of action patterns with per-session caps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// The rules, most specific (longest pattern) winning on overlap.
    pub rules: Vec<RateRule>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            rules: vec![
                RateRule {
                    pattern: "filesystem.write".into(),
                    max_calls: 100,
                },
                RateRule {
                    pattern: "shell.run".into(),
                    max_calls: 50,
                },
                RateRule {
                    pattern: "mcp.*".into(),
                    max_calls: 200,
                },
            ],
        }
    }
}

struct CompiledRule {
    pattern: String,
    matcher: globset::GlobMatcher,
    max_calls: u32,
}

/// Session-scoped action counters.
///
/// The counter fires on call `limit+1`: the first `limit` calls pass, the
/// next one returns a `resource_limit` failure.
pub struct RateLimiter {
    rules: Vec<CompiledRule>,
    counts: Mutex<HashMap<String, u32>>,
}

impl RateLimiter {
    /// Compile a configuration; invalid glob patterns are invalid items.
    pub fn new(config: &RateLimitConfig) -> Result<Self, KernelError> {
        let mut rules = Vec::with_capacity(config.rules.len());
        for rule in &config.rules {
            let matcher = Glob::new(&rule.pattern)
                .map_err(|e| {
                    KernelError::invalid_item(format!(
                        "invalid rate-limit pattern '{}': {e}",
                        rule.pattern
                    ))
                })?
                .compile_matcher();
            rules.push(CompiledRule {
                pattern: rule.pattern.clone(),
                matcher,
                max_calls: rule.max_calls,
            });
        }
        // Longest pattern first so the most specific rule decides.
        rules.sort_by(|a, b| b.pattern.len().cmp(&a.pattern.len()));
        Ok(Self {
            rules,
            counts: Mutex::new(HashMap::new()),
        })
    }

    /// A limiter with the default rule set.
    pub fn with_defaults() -> Self {
        // The default patterns are valid by construction.
        Self::new(&RateLimitConfig::default()).unwrap_or_else(|_| Self {
            rules: Vec::new(),
            counts: Mutex::new(HashMap::new()),
        })
    }

    /// Record one call of `action`, failing once the matching limit is
    /// exceeded. Actions with no matching rule are unlimited.
    pub fn check(&self, action: &str) -> Result<(), KernelError> {
        let Some(rule) = self.rules.iter().find(|r| r.matcher.is_match(action)) else {
            return Ok(());
        };

        let mut counts = match self.counts.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let count = counts.entry(action.to_string()).or_insert(0);
        *count += 1;
        if *count > rule.max_calls {
            return Err(KernelError::resource_limit(format!(
                "rate limit exceeded for '{action}': {} calls permitted per session",
                rule.max_calls
            ))
            .with_context("pattern", rule.pattern.clone())
            .with_context("max_calls", rule.max_calls)
            .with_hint(AnnealingHint::new(
                "raise_rate_limit",
                format!(
                    "batch '{action}' calls, or raise the session limit for '{}'",
                    rule.pattern
                ),
            )));
        }
        Ok(())
    }

    /// Current count for an action, for inspection and tests.
    pub fn count(&self, action: &str) -> u32 {
        match self.counts.lock() {
            Ok(g) => g.get(action).copied().unwrap_or(0),
            Err(poisoned) => poisoned.into_inner().get(action).copied().unwrap_or(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(pattern: &str, max: u32) -> RateLimiter {
        RateLimiter::new(&RateLimitConfig {
            rules: vec![RateRule {
                pattern: pattern.into(),
                max_calls: max,
            }],
        })
        .expect("compile limiter")
    }

    #[test]
    fn fires_on_limit_plus_one_not_limit() {
        let rl = limiter("shell.run", 3);
        for _ in 0..3 {
            rl.check("shell.run").expect("within limit");
        }
        let err = rl.check("shell.run").expect_err("limit+1 fails");
        assert_eq!(err.kind, kiwi_error::ErrorKind::ResourceLimit);
        assert_eq!(err.context["max_calls"], 3);
    }

    #[test]
    fn wildcard_patterns_cover_action_families() {
        let rl = limiter("mcp.*", 2);
        rl.check("mcp.search").expect("first");
        rl.check("mcp.search").expect("second");
        assert!(rl.check("mcp.search").is_err());
        // Each concrete action has its own counter under the shared rule.
        rl.check("mcp.load").expect("different action starts fresh");
    }

    #[test]
    fn unmatched_actions_are_unlimited() {
        let rl = limiter("shell.run", 1);
        for _ in 0..10 {
            rl.check("filesystem.read").expect("no rule, no limit");
        }
    }

    #[test]
    fn most_specific_pattern_wins() {
        let rl = RateLimiter::new(&RateLimitConfig {
            rules: vec![
                RateRule {
                    pattern: "mcp.*".into(),
                    max_calls: 100,
                },
                RateRule {
                    pattern: "mcp.execute".into(),
                    max_calls: 1,
                },
            ],
        })
        .expect("compile limiter");

        rl.check("mcp.execute").expect("first call passes");
        assert!(rl.check("mcp.execute").is_err(), "specific limit of 1 wins");
    }

    #[test]
    fn defaults_match_spec() {
        let cfg = RateLimitConfig::default();
        let find = |p: &str| cfg.rules.iter().find(|r| r.pattern == p).map(|r| r.max_calls);
        assert_eq!(find("filesystem.write"), Some(100));
        assert_eq!(find("shell.run"), Some(50));
        assert_eq!(find("mcp.*"), Some(200));
    }

    #[test]
    fn error_carries_annealing_hint() {
        let rl = limiter("filesystem.write", 0);
        let err = rl.check("filesystem.write").expect_err("zero limit");
        assert_eq!(err.hints[0].kind, "raise_rate_limit");
    }
}
