// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! kiwi-error
#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// ErrorKind
// ---------------------------------------------------------------------------

/// Machine-readable, stable error code.
///
/// Each variant serialises to a `snake_case` string that is guaranteed not to
/// change across patch releases; clients switch on it, never on the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Item or version absent in every searched layer.
    NotFound,
    /// Manifest failed schema or required-field validation.
    InvalidItem,
    /// Hash mismatch, or a missing signature on a path that requires one.
    SignatureInvalid,
    /// Executor chain cycle, non-primitive terminal, or unresolvable reference.
    ChainError,
    /// A runtime permission check rejected the call.
    PermissionDenied,
    /// The terminal primitive reported failure.
    ExecutionFailed,
    /// Rate limit, timeout, or loop detector fired.
    ResourceLimit,
}

impl ErrorKind {
    /// Stable `&'static str` representation of the code (e.g. `"not_found"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::InvalidItem => "invalid_item",
            Self::SignatureInvalid => "signature_invalid",
            Self::ChainError => "chain_error",
            Self::PermissionDenied => "permission_denied",
            Self::ExecutionFailed => "execution_failed",
            Self::ResourceLimit => "resource_limit",
        }
    }

    /// Whether errors of this kind carry annealing hints by default.
    ///
    /// Denials and resource-limit events are the two families the client is
    /// expected to react to with manifest edits.
    pub fn is_annealable(&self) -> bool {
        matches!(self, Self::PermissionDenied | Self::ResourceLimit)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// AnnealingHint
// ---------------------------------------------------------------------------

/// Structured remediation data attached to denials and resource limits.
///
/// A hint names what to change (`kind` + `detail`) and, when the kernel can
/// compute one, a concrete proposed manifest edit the client may apply
/// verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnealingHint {
    /// Short hint family, e.g. `add_permission`, `raise_rate_limit`,
    /// `configure_env`, `vary_parameters`.
    pub kind: String,
    /// Human-readable description of the proposed change.
    pub detail: String,
    /// Optional machine-applicable edit (manifest fragment).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposed_edit: Option<Value>,
}

impl AnnealingHint {
    /// Create a hint without a machine-applicable edit.
    pub fn new(kind: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            detail: detail.into(),
            proposed_edit: None,
        }
    }

    /// Attach a concrete manifest fragment to this hint.
    #[must_use]
    pub fn with_edit(mut self, edit: Value) -> Self {
        self.proposed_edit = Some(edit);
        self
    }
}

// ---------------------------------------------------------------------------
// KernelError
// ---------------------------------------------------------------------------

/// A kernel failure as a value.
///
/// Construct with [`KernelError::new`] (or a kind-specific shorthand) and
/// enrich fluently:
///
/// ```
/// use kiwi_error::{ErrorKind, KernelError};
///
/// let err = KernelError::not_found("tool 'greet' not found in any layer")
///     .with_suggestion("run `search` to list available tools")
///     .with_context("item_id", "greet");
/// assert_eq!(err.kind, ErrorKind::NotFound);
/// assert_eq!(err.to_json()["code"], "not_found");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelError {
    /// Stable error code.
    #[serde(rename = "code")]
    pub kind: ErrorKind,
    /// Human-readable description of the failure.
    pub message: String,
    /// Likely remedy, when one is actionable ("run `sign` before `publish`").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    /// Arbitrary structured context (expected/got hashes, matched rule, …).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, Value>,
    /// Annealing hints for denials and resource limits.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hints: Vec<AnnealingHint>,
}

impl KernelError {
    /// Create an error with the given kind and message.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            suggestion: None,
            context: BTreeMap::new(),
            hints: Vec::new(),
        }
    }

    /// Shorthand for [`ErrorKind::NotFound`].
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    /// Shorthand for [`ErrorKind::InvalidItem`].
    pub fn invalid_item(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidItem, message)
    }

    /// Shorthand for [`ErrorKind::SignatureInvalid`].
    pub fn signature_invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::SignatureInvalid, message)
    }

    /// Shorthand for [`ErrorKind::ChainError`].
    pub fn chain(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ChainError, message)
    }

    /// Shorthand for [`ErrorKind::PermissionDenied`].
    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PermissionDenied, message)
    }

    /// Shorthand for [`ErrorKind::ExecutionFailed`].
    pub fn execution_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ExecutionFailed, message)
    }

    /// Shorthand for [`ErrorKind::ResourceLimit`].
    pub fn resource_limit(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ResourceLimit, message)
    }

    /// Attach a remediation suggestion.
    #[must_use]
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    /// Attach a key-value context entry.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Attach an annealing hint.
    #[must_use]
    pub fn with_hint(mut self, hint: AnnealingHint) -> Self {
        self.hints.push(hint);
        self
    }

    /// The JSON wire form returned inside meta-operation responses.
    ///
    /// Always contains `code` and `message`; `suggestion`, `context`, and
    /// `hints` appear only when populated.
    pub fn to_json(&self) -> Value {
        // Serialization of this struct cannot fail: every field is itself a
        // serde_json value or string.
        serde_json::to_value(self).unwrap_or_else(|_| {
            serde_json::json!({
                "code": self.kind.as_str(),
                "message": self.message,
            })
        })
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for KernelError {}

/// Result alias used across the kernel crates.
pub type KernelResult<T> = Result<T, KernelError>;

#[cfg(test)]
mod tests {
    use super::{AnnealingHint, ErrorKind, KernelError};
    use serde_json::json;

    #[test]
    fn codes_are_stable_snake_case() {
        let cases = [
            (ErrorKind::NotFound, "not_found"),
            (ErrorKind::InvalidItem, "invalid_item"),
            (ErrorKind::SignatureInvalid, "signature_invalid"),
            (ErrorKind::ChainError, "chain_error"),
            (ErrorKind::PermissionDenied, "permission_denied"),
            (ErrorKind::ExecutionFailed, "execution_failed"),
            (ErrorKind::ResourceLimit, "resource_limit"),
        ];
        for (kind, expected) in cases {
            assert_eq!(kind.as_str(), expected);
            let wire = serde_json::to_value(kind).expect("serialize kind");
            assert_eq!(wire, json!(expected), "serde form matches as_str");
        }
    }

    #[test]
    fn display_includes_code_and_message() {
        let err = KernelError::chain("cycle detected: a -> b -> a");
        assert_eq!(err.to_string(), "chain_error: cycle detected: a -> b -> a");
    }

    #[test]
    fn wire_form_omits_empty_fields() {
        let err = KernelError::not_found("no such item");
        let v = err.to_json();
        assert_eq!(v["code"], "not_found");
        assert_eq!(v["message"], "no such item");
        assert!(v.get("suggestion").is_none());
        assert!(v.get("context").is_none());
        assert!(v.get("hints").is_none());
    }

    #[test]
    fn wire_form_carries_context_and_suggestion() {
        let err = KernelError::signature_invalid("content hash mismatch")
            .with_suggestion("re-run `sign` after editing the item")
            .with_context("expected_hash", "aa")
            .with_context("got_hash", "bb");
        let v = err.to_json();
        assert_eq!(v["suggestion"], "re-run `sign` after editing the item");
        assert_eq!(v["context"]["expected_hash"], "aa");
        assert_eq!(v["context"]["got_hash"], "bb");
    }

    #[test]
    fn annealing_hint_roundtrip() {
        let err = KernelError::permission_denied("filesystem read not permitted: secrets.yaml")
            .with_hint(
                AnnealingHint::new("add_permission", "allow reads under config/")
                    .with_edit(json!({"read": {"resource": "filesystem", "path": "config/**"}})),
            );
        let v = err.to_json();
        assert_eq!(v["hints"][0]["kind"], "add_permission");
        assert_eq!(
            v["hints"][0]["proposed_edit"]["read"]["path"],
            "config/**"
        );

        let back: KernelError = serde_json::from_value(v).expect("deserialize error");
        assert_eq!(back, err);
    }

    #[test]
    fn annealable_kinds() {
        assert!(ErrorKind::PermissionDenied.is_annealable());
        assert!(ErrorKind::ResourceLimit.is_annealable());
        assert!(!ErrorKind::NotFound.is_annealable());
        assert!(!ErrorKind::ExecutionFailed.is_annealable());
    }
}
