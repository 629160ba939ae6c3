// SPDX-License-Identifier: MIT OR Apache-2.0
//! Defaults compiled into the kernel binary.
//!
//! The bundled layer is the lowest-priority root and the authoritative
//! source for protected prefixes. Content ships signed; the markers are
//! regenerated whenever an asset changes.

/// One bundled file: path relative to a content root, plus its content.
pub struct BundledFile {
    /// Root-relative path, e.g. `tools/primitives/subprocess.yaml`.
    pub path: &'static str,
    /// Signed source text.
    pub content: &'static str,
}

macro_rules! bundled {
    ($path:literal) => {
        BundledFile {
            path: $path,
            content: include_str!(concat!("../assets/", $path)),
        }
    };
}

/// Every file in the bundled layer.
pub const BUNDLED: &[BundledFile] = &[
    bundled!("tools/primitives/subprocess.yaml"),
    bundled!("tools/primitives/http_client.yaml"),
    bundled!("tools/runtimes/python_runtime.yaml"),
    bundled!("tools/runtimes/bash_runtime.yaml"),
    bundled!("tools/runtimes/node_runtime.yaml"),
    bundled!("knowledge/kernel/executor-chains.md"),
    bundled!("knowledge/kernel/signatures.md"),
    bundled!("knowledge/rye/getting-started.md"),
    bundled!("directives/kernel/author-tool.md"),
];

/// Ids of the runtime chains preloaded at server startup.
pub const PRELOAD_RUNTIMES: &[&str] = &["python_runtime", "bash_runtime", "node_runtime"];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_bundled_file_is_signed_and_valid() {
        for file in BUNDLED {
            let v = kiwi_signature::verify_source(file.content);
            assert!(
                v.is_valid(),
                "bundled asset {} failed verification: {v:?}",
                file.path
            );
        }
    }

    #[test]
    fn preload_runtimes_exist_in_bundle() {
        for id in PRELOAD_RUNTIMES {
            assert!(
                BUNDLED
                    .iter()
                    .any(|f| f.path.ends_with(&format!("{id}.yaml"))),
                "missing bundled runtime {id}"
            );
        }
    }
}
