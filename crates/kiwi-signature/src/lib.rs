// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! kiwi-signature
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod keys;

pub use keys::{KeyStore, KeyStoreError};

use chrono::{DateTime, SecondsFormat, Utc};
use kiwi_core::{SIGNATURE_APP, SignatureInfo};
use kiwi_error::KernelError;
use sha2::{Digest, Sha256};

/// Marker tag that follows the comment prefix on the first line.
const MARKER_TAG: &str = "kiwi-mcp:validated:";

/// Comment syntax wrapped around the marker, chosen by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommentStyle {
    /// `# …` — YAML, Python, shell.
    Hash,
    /// `// …` — Rust, JavaScript, TypeScript.
    Slashes,
    /// `<!-- … -->` — Markdown, HTML.
    Html,
}

impl CommentStyle {
    /// Pick the comment style for a file name or extension.
    pub fn for_path(path: &str) -> Self {
        let ext = path.rsplit('.').next().unwrap_or("");
        match ext {
            "md" | "markdown" | "html" | "htm" => Self::Html,
            "rs" | "js" | "ts" | "mjs" => Self::Slashes,
            _ => Self::Hash,
        }
    }

    fn render(&self, body: &str) -> String {
        match self {
            Self::Hash => format!("# {body}"),
            Self::Slashes => format!("// {body}"),
            Self::Html => format!("<!-- {body} -->"),
        }
    }
}

/// Result of verifying an item source against its embedded marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    /// Marker present and the content hash matches.
    Valid(SignatureInfo),
    /// No marker on the first line.
    Unsigned,
    /// Marker present but the recomputed hash differs.
    Mismatch {
        /// Hash embedded in the marker.
        expected_hash: String,
        /// Hash recomputed from the current content.
        got_hash: String,
        /// The parsed marker.
        info: SignatureInfo,
    },
}

impl Verification {
    /// True only for [`Verification::Valid`].
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid(_))
    }
}

/// How strictly a load path treats verification failures.
///
/// Registry loads are always [`VerifyMode::Strict`]. Local layers default to
/// [`VerifyMode::Lenient`]: unsigned work-in-progress items load, but a
/// marker that no longer matches its content is a tamper and fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VerifyMode {
    /// Unsigned items and mismatches both fail with `signature_invalid`.
    Strict,
    /// Unsigned items pass; mismatches fail.
    #[default]
    Lenient,
    /// Log a warning and continue; for local experimentation only.
    Warn,
}

/// Produce the canonical form of an item source.
///
/// The signature line (when present) is dropped, trailing whitespace is
/// stripped from every line, and the result ends with exactly one newline.
/// The content hash is SHA-256 over the UTF-8 bytes of this form.
pub fn canonicalize(source: &str) -> String {
    let mut lines = source.lines();
    let mut first = lines.next();
    if first.is_some_and(|l| l.contains(MARKER_TAG)) {
        first = lines.next();
    }

    let mut out = String::with_capacity(source.len());
    if let Some(line) = first {
        out.push_str(line.trim_end());
        out.push('\n');
    }
    for line in lines {
        out.push_str(line.trim_end());
        out.push('\n');
    }
    // Collapse trailing blank lines to the single final newline.
    while out.ends_with("\n\n") {
        out.pop();
    }
    out
}

/// Lower-hex SHA-256 of the canonical form of `source`.
pub fn content_hash(source: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonicalize(source).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Parse the marker from a source's first line.
///
/// Returns `None` when the first line carries no marker; malformed markers
/// (bad timestamp, non-hex hash) also return `None` so that callers treat
/// the item as unsigned rather than crashing on garbage.
pub fn parse_marker(source: &str) -> Option<SignatureInfo> {
    let first = source.lines().next()?;
    let at = first.find(MARKER_TAG)?;
    let mut rest = first[at + MARKER_TAG.len()..].trim_end();
    // HTML comments close the line.
    rest = rest.trim_end_matches("-->").trim_end();

    let sig = match rest.find(":sig=") {
        Some(pos) => {
            let s = rest[pos + 5..].to_string();
            rest = &rest[..pos];
            Some(s)
        }
        None => None,
    };

    // The timestamp itself contains colons, so split from the right: the
    // final segment is the 64-char hex hash.
    let (ts, hash) = rest.rsplit_once(':')?;
    if hash.len() != 64 || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let timestamp = DateTime::parse_from_rfc3339(ts).ok()?.with_timezone(&Utc);

    Some(SignatureInfo {
        timestamp,
        hash: hash.to_ascii_lowercase(),
        sig,
    })
}

/// Render a marker line for the given signature data.
pub fn render_marker(style: CommentStyle, info: &SignatureInfo) -> String {
    let ts = info
        .timestamp
        .to_rfc3339_opts(SecondsFormat::Secs, true);
    let mut body = format!("{SIGNATURE_APP}:validated:{ts}:{}", info.hash);
    if let Some(sig) = &info.sig {
        body.push_str(":sig=");
        body.push_str(sig);
    }
    style.render(&body)
}

/// Sign an item source: canonicalize, hash, and re-emit with a fresh marker
/// as the first line. Any existing marker is replaced.
///
/// When `keys` and `namespace` are supplied, an ed25519 signature over the
/// content hash is appended as `sig=<base64>`.
pub fn sign_source(
    source: &str,
    style: CommentStyle,
    keys: Option<(&KeyStore, &str)>,
) -> Result<String, KernelError> {
    let canonical = canonicalize(source);
    let hash = content_hash(source);

    let sig = match keys {
        Some((store, namespace)) => Some(store.sign_hash(namespace, &hash).map_err(|e| {
            KernelError::signature_invalid(format!("signing failed: {e}"))
                .with_context("namespace", namespace)
        })?),
        None => None,
    };

    let info = SignatureInfo {
        timestamp: Utc::now(),
        hash,
        sig,
    };

    let mut out = render_marker(style, &info);
    out.push('\n');
    out.push_str(&canonical);
    Ok(out)
}

/// Verify a source against its embedded marker.
pub fn verify_source(source: &str) -> Verification {
    let Some(info) = parse_marker(source) else {
        return Verification::Unsigned;
    };
    let got = content_hash(source);
    if got == info.hash {
        Verification::Valid(info)
    } else {
        Verification::Mismatch {
            expected_hash: info.hash.clone(),
            got_hash: got,
            info,
        }
    }
}

/// Verify under a mode, converting failures to `signature_invalid` errors.
///
/// In [`VerifyMode::Warn`], mismatches and missing markers log through
/// `tracing` and return `Ok(None)`.
pub fn verify_required(
    source: &str,
    item_id: &str,
    mode: VerifyMode,
) -> Result<Option<SignatureInfo>, KernelError> {
    match verify_source(source) {
        Verification::Valid(info) => Ok(Some(info)),
        Verification::Unsigned => match mode {
            VerifyMode::Strict => Err(KernelError::signature_invalid(format!(
                "item '{item_id}' has no signature marker"
            ))
            .with_suggestion("run `sign` before loading from a verified path")),
            VerifyMode::Lenient | VerifyMode::Warn => {
                tracing::warn!(target: "kiwi.signature", item_id, "unsigned item accepted");
                Ok(None)
            }
        },
        Verification::Mismatch {
            expected_hash,
            got_hash,
            ..
        } => match mode {
            VerifyMode::Strict | VerifyMode::Lenient => {
                Err(KernelError::signature_invalid(format!(
                    "content hash mismatch for '{item_id}'"
                ))
                .with_context("expected_hash", expected_hash)
                .with_context("got_hash", got_hash)
                .with_suggestion("re-run `sign` after editing the item, or re-fetch it"))
            }
            VerifyMode::Warn => {
                tracing::warn!(
                    target: "kiwi.signature",
                    item_id,
                    %expected_hash,
                    %got_hash,
                    "tampered item accepted in warn mode"
                );
                Ok(None)
            }
        },
    }
}
