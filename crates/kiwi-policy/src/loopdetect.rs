// SPDX-License-Identifier: MIT OR Apache-2.0
//! Sliding-window loop detection over repeated tool calls.
//!
//! The detector never aborts execution: a triggered signal is attached to
//! the call result as a `_loop_warning` hint and the agent is expected to
//! react (e.g. via `help(action=stuck)`).

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::sync::Mutex;

/// A triggered loop signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopSignal {
    /// Human-readable warning, e.g. `"Same call repeated 3 times"`.
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CallFingerprint {
    tool_id: String,
    params_digest: String,
}

/// Sliding window of recent `(tool_id, params-hash)` pairs.
///
/// Signals when the last `repeat_threshold` calls are identical, or when the
/// last four calls form an A-B-A-B alternation.
pub struct LoopDetector {
    window_size: usize,
    repeat_threshold: usize,
    window: Mutex<VecDeque<CallFingerprint>>,
}

impl Default for LoopDetector {
    fn default() -> Self {
        Self::new(10, 3)
    }
}

impl LoopDetector {
    /// Create a detector with a given window size and repeat threshold.
    pub fn new(window_size: usize, repeat_threshold: usize) -> Self {
        Self {
            window_size: window_size.max(4),
            repeat_threshold: repeat_threshold.max(2),
            window: Mutex::new(VecDeque::new()),
        }
    }

    /// Record a call and report any loop signal it completes.
    pub fn record(&self, tool_id: &str, params: &Value) -> Option<LoopSignal> {
        let fp = CallFingerprint {
            tool_id: tool_id.to_string(),
            params_digest: digest_params(params),
        };

        let mut window = match self.window.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        window.push_back(fp);
        while window.len() > self.window_size {
            window.pop_front();
        }

        if window.len() >= self.repeat_threshold {
            let tail = window
                .iter()
                .rev()
                .take(self.repeat_threshold)
                .collect::<Vec<_>>();
            if tail.windows(2).all(|w| w[0] == w[1]) {
                return Some(LoopSignal {
                    message: format!("Same call repeated {} times", self.repeat_threshold),
                });
            }
        }

        if window.len() >= 4 {
            let last: Vec<_> = window.iter().rev().take(4).collect();
            // last = [B, A, B, A] read backwards: alternation with A != B.
            if last[0] == last[2] && last[1] == last[3] && last[0] != last[1] {
                return Some(LoopSignal {
                    message: "Alternating call pattern detected".to_string(),
                });
            }
        }

        None
    }

    /// Forget all recorded calls (session reset).
    pub fn clear(&self) {
        match self.window.lock() {
            Ok(mut g) => g.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
    }
}

fn digest_params(params: &Value) -> String {
    // serde_json object maps preserve insertion order, so serialize through
    // a sorted form to make the digest order-insensitive.
    let canonical = to_canonical(params);
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

fn to_canonical(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by_key(|(k, _)| k.as_str());
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), to_canonical(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(to_canonical).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn identical_calls_trigger_on_third() {
        let det = LoopDetector::default();
        let params = json!({"x": 1});
        assert!(det.record("retry", &params).is_none());
        assert!(det.record("retry", &params).is_none());
        let signal = det.record("retry", &params).expect("third repeat signals");
        assert_eq!(signal.message, "Same call repeated 3 times");
    }

    #[test]
    fn different_params_do_not_trigger() {
        let det = LoopDetector::default();
        assert!(det.record("retry", &json!({"x": 1})).is_none());
        assert!(det.record("retry", &json!({"x": 2})).is_none());
        assert!(det.record("retry", &json!({"x": 3})).is_none());
    }

    #[test]
    fn different_tools_do_not_trigger_repeat() {
        let det = LoopDetector::default();
        let p = json!({});
        assert!(det.record("a", &p).is_none());
        assert!(det.record("b", &p).is_none());
        assert!(det.record("c", &p).is_none());
    }

    #[test]
    fn abab_alternation_triggers_on_fourth() {
        let det = LoopDetector::default();
        let p = json!({});
        assert!(det.record("a", &p).is_none());
        assert!(det.record("b", &p).is_none());
        assert!(det.record("a", &p).is_none());
        let signal = det.record("b", &p).expect("A-B-A-B signals");
        assert_eq!(signal.message, "Alternating call pattern detected");
    }

    #[test]
    fn abcd_does_not_trigger() {
        let det = LoopDetector::default();
        let p = json!({});
        for id in ["a", "b", "c", "d"] {
            assert!(det.record(id, &p).is_none());
        }
    }

    #[test]
    fn params_digest_is_key_order_insensitive() {
        let det = LoopDetector::default();
        assert!(det.record("t", &json!({"a": 1, "b": 2})).is_none());
        assert!(det.record("t", &json!({"b": 2, "a": 1})).is_none());
        assert!(
            det.record("t", &json!({"a": 1, "b": 2})).is_some(),
            "key order must not defeat the detector"
        );
    }

    #[test]
    fn window_is_bounded() {
        let det = LoopDetector::new(4, 3);
        let p = json!({});
        for i in 0..20 {
            det.record(&format!("tool-{i}"), &p);
        }
        // Old entries were evicted; three fresh repeats still signal.
        assert!(det.record("fresh", &p).is_none());
        assert!(det.record("fresh", &p).is_none());
        assert!(det.record("fresh", &p).is_some());
    }

    #[test]
    fn clear_resets_state() {
        let det = LoopDetector::default();
        let p = json!({});
        det.record("t", &p);
        det.record("t", &p);
        det.clear();
        assert!(det.record("t", &p).is_none());
    }
}
