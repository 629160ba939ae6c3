// SPDX-License-Identifier: MIT OR Apache-2.0
//! Property tests over the kernel's cross-crate invariants: chain
//! termination, config-merge idempotence, signature round-trips and tamper
//! detection, protected-prefix shadowing, phrase boosting, IDF of
//! universal terms, and the rate-limit boundary.

use kiwi_chain::{ChainResolver, deep_merge};
use kiwi_core::{Item, ItemType, Manifest, ManifestCommon, Origin, ToolManifest, ToolType};
use kiwi_policy::ratelimit::{RateLimitConfig, RateLimiter, RateRule};
use kiwi_search::KeywordIndex;
use kiwi_signature::{CommentStyle, Verification, canonicalize, content_hash, sign_source};
use kiwi_store::ContentStore;
use proptest::prelude::*;
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

// ===========================================================================
// Generators
// ===========================================================================

fn text_body() -> impl Strategy<Value = String> {
    // Printable lines with occasional trailing whitespace and blank lines.
    proptest::collection::vec("[ -~]{0,60}( *)", 1..20)
        .prop_map(|lines| format!("{}\n", lines.join("\n")))
}

fn json_scalar() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<bool>().prop_map(Value::from),
        any::<i32>().prop_map(Value::from),
        "[a-z]{1,8}".prop_map(Value::from),
    ]
}

fn config_map(depth: u32) -> BoxedStrategy<Map<String, Value>> {
    let leaf = proptest::collection::btree_map("[a-z]{1,6}", json_scalar(), 0..5)
        .prop_map(|m| m.into_iter().collect::<Map<String, Value>>());
    if depth == 0 {
        return leaf.boxed();
    }
    proptest::collection::btree_map(
        "[a-z]{1,6}",
        prop_oneof![
            json_scalar(),
            proptest::collection::vec(json_scalar(), 0..4).prop_map(Value::Array),
            config_map(depth - 1).prop_map(Value::Object),
        ],
        0..5,
    )
    .prop_map(|m| m.into_iter().collect::<Map<String, Value>>())
    .boxed()
}

// ===========================================================================
// Signature properties
// ===========================================================================

proptest! {
    /// Freshly signed content verifies; the marker's hash is the canonical
    /// hash of the signed form.
    #[test]
    fn sign_then_verify_holds(body in text_body()) {
        let signed = sign_source(&body, CommentStyle::Hash, None).expect("sign");
        prop_assert!(kiwi_signature::verify_source(&signed).is_valid());
        let marker = kiwi_signature::parse_marker(&signed).expect("marker");
        prop_assert_eq!(marker.hash, content_hash(&signed));
    }

    /// Signing is idempotent on the content hash.
    #[test]
    fn sign_is_idempotent(body in text_body()) {
        let once = sign_source(&body, CommentStyle::Hash, None).expect("sign once");
        let twice = sign_source(&once, CommentStyle::Hash, None).expect("sign twice");
        prop_assert_eq!(content_hash(&once), content_hash(&twice));
        prop_assert_eq!(canonicalize(&once), canonicalize(&twice));
    }

    /// Canonicalization is a projection: applying it twice changes nothing.
    #[test]
    fn canonicalize_is_idempotent(body in text_body()) {
        let c1 = canonicalize(&body);
        prop_assert_eq!(canonicalize(&c1), c1);
    }

    /// Any visible edit outside the marker line breaks verification.
    #[test]
    fn edits_break_verification(body in text_body(), extra in "[a-zA-Z0-9]{1,10}") {
        let signed = sign_source(&body, CommentStyle::Hash, None).expect("sign");
        let tampered = format!("{signed}{extra}\n");
        match kiwi_signature::verify_source(&tampered) {
            Verification::Mismatch { expected_hash, got_hash, .. } => {
                prop_assert_ne!(expected_hash, got_hash);
            }
            other => prop_assert!(false, "expected mismatch, got {:?}", other),
        }
    }
}

// ===========================================================================
// Deep-merge properties
// ===========================================================================

proptest! {
    /// Merging a config into itself is the identity.
    #[test]
    fn merge_self_is_identity(config in config_map(2)) {
        let mut merged = config.clone();
        deep_merge(&mut merged, &config);
        prop_assert_eq!(merged, config);
    }

    /// Merging twice equals merging once.
    #[test]
    fn merge_is_idempotent(base in config_map(2), overlay in config_map(2)) {
        let mut once = base.clone();
        deep_merge(&mut once, &overlay);
        let mut twice = once.clone();
        deep_merge(&mut twice, &overlay);
        prop_assert_eq!(once, twice);
    }

    /// Every key of the overlay is present afterwards, and scalar overlay
    /// values win verbatim.
    #[test]
    fn overlay_keys_always_win(base in config_map(1), overlay in config_map(0)) {
        let mut merged = base.clone();
        deep_merge(&mut merged, &overlay);
        for (k, v) in &overlay {
            prop_assert_eq!(merged.get(k), Some(v));
        }
    }
}

// ===========================================================================
// Chain properties
// ===========================================================================

fn write_tool(project: &Path, category: &str, id: &str, yaml: &str) {
    let dir = project.join(".ai").join("tools").join(category);
    std::fs::create_dir_all(&dir).expect("mkdir");
    std::fs::write(dir.join(format!("{id}.yaml")), yaml).expect("write tool");
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// A linear chain of any depth terminates in a primitive with no
    /// duplicate ids, and the merged config carries the leaf's overrides.
    #[test]
    fn chains_terminate_in_a_primitive(depth in 1usize..6) {
        let tmp = TempDir::new().expect("tempdir");
        let project = tmp.path().join("proj");
        std::fs::create_dir_all(&project).expect("mk project");

        // link0 -> link1 -> … -> subprocess
        for i in 0..depth {
            let executor = if i + 1 == depth {
                "subprocess".to_string()
            } else {
                format!("link{}", i + 1)
            };
            let tool_type = if i + 1 == depth { "runtime" } else { "script" };
            write_tool(
                &project,
                "generated",
                &format!("link{i}"),
                &format!(
                    "title: L{i}\ndescription: d\ntool_type: {tool_type}\nexecutor: {executor}\nconfig:\n  command: sh\n  depth{i}: {i}\n"
                ),
            );
        }

        let store = Arc::new(ContentStore::new(tmp.path().join("user-ai")));
        let resolver = ChainResolver::new(store);
        let chain = resolver.resolve(&project, "link0").expect("resolve");

        prop_assert_eq!(chain.ids.last().map(String::as_str), Some("subprocess"));
        prop_assert_eq!(chain.ids.len(), depth + 1);
        let mut unique = chain.ids.clone();
        unique.sort();
        unique.dedup();
        prop_assert_eq!(unique.len(), chain.ids.len(), "no duplicates in the chain");

        for i in 0..depth {
            prop_assert_eq!(
                chain.merged_config.get(&format!("depth{i}")),
                Some(&json!(i))
            );
        }
    }
}

// ===========================================================================
// Protected-prefix property
// ===========================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    /// Whatever sits at the project root under a protected prefix, the
    /// bundled variant is what loads.
    #[test]
    fn protected_ids_always_resolve_bundled(title in "[A-Za-z ]{1,20}") {
        let tmp = TempDir::new().expect("tempdir");
        let project = tmp.path().join("proj");
        std::fs::create_dir_all(&project).expect("mk project");
        write_tool(
            &project,
            "primitives",
            "subprocess",
            &format!("title: {title}\ndescription: shadow\ntool_type: primitive\n"),
        );

        let store = ContentStore::new(tmp.path().join("user-ai"));
        let item = store
            .get(&project, ItemType::Tool, "subprocess", None)
            .expect("protected load");
        prop_assert_eq!(item.origin, Origin::Bundled);
        prop_assert_eq!(item.manifest.common().title.as_str(), "Subprocess");
    }
}

// ===========================================================================
// Search properties
// ===========================================================================

fn indexed_tool(id: &str, title: &str, description: &str) -> Item {
    Item {
        id: id.into(),
        version: "1.0.0".into(),
        item_type: ItemType::Tool,
        category: "demo".into(),
        origin: Origin::Project,
        manifest: Manifest::Tool(ToolManifest {
            common: ManifestCommon {
                title: title.into(),
                description: description.into(),
                ..ManifestCommon::default()
            },
            tool_type: ToolType::Script,
            executor: Some("bash_runtime".into()),
            config: Map::new(),
            parameters: BTreeMap::new(),
        }),
        source: String::new(),
        files: BTreeMap::new(),
        signature: None,
        path: None,
    }
}

#[test]
fn phrase_hit_scores_at_least_1_5x_the_scattered_hit() {
    let mut index = KeywordIndex::new();
    index.index_item(&indexed_tool("phrase", "rotate access tokens", "x"));
    index.index_item(&indexed_tool("scattered", "tokens that rotate access", "x"));
    // Padding so the query terms are not universal.
    for i in 0..6 {
        index.index_item(&indexed_tool(&format!("pad{i}"), "unrelated entry", "x"));
    }

    let hits = index.search("rotate access tokens", None, 10);
    let phrase = hits.iter().find(|h| h.id == "phrase").expect("phrase doc");
    let scattered = hits
        .iter()
        .find(|h| h.id == "scattered")
        .expect("scattered doc");
    assert!(
        phrase.score >= scattered.score * 1.5 - f64::EPSILON,
        "phrase {} vs scattered {}",
        phrase.score,
        scattered.score
    );
}

#[test]
fn universal_terms_have_near_zero_idf() {
    let mut index = KeywordIndex::new();
    for i in 0..50 {
        index.index_item(&indexed_tool(&format!("t{i}"), "kernel helper", "x"));
    }
    assert!(index.idf("kernel") < 0.02);
    assert!(index.search("kernel", None, 50).is_empty());
}

// ===========================================================================
// Rate-limit boundary
// ===========================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// The counter fires on call `limit + 1`, never earlier.
    #[test]
    fn rate_limit_boundary(limit in 1u32..40) {
        let limiter = RateLimiter::new(&RateLimitConfig {
            rules: vec![RateRule {
                pattern: "shell.run".into(),
                max_calls: limit,
            }],
        })
        .expect("compile limiter");

        for call in 1..=limit {
            prop_assert!(limiter.check("shell.run").is_ok(), "call {call} within limit");
        }
        prop_assert!(limiter.check("shell.run").is_err(), "call limit+1 fires");
    }
}

// ===========================================================================
// Permission subset property
// ===========================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// A child context's allow set is always contained in its parent's.
    #[test]
    fn child_contexts_are_subsets(
        parent_globs in proptest::collection::vec("[a-z]{1,6}/\\*\\*", 1..4),
        child_globs in proptest::collection::vec("[a-z]{1,6}/\\*\\*", 1..4),
    ) {
        use kiwi_core::{PathRule, PermissionsDecl};
        use kiwi_policy::{IntersectionPolicy, PermissionContext};

        let parent_decl = PermissionsDecl {
            read: parent_globs.iter().map(|g| PathRule::filesystem(g.clone())).collect(),
            ..PermissionsDecl::default()
        };
        let child_decl = PermissionsDecl {
            read: child_globs.iter().map(|g| PathRule::filesystem(g.clone())).collect(),
            ..PermissionsDecl::default()
        };

        let parent = PermissionContext::from_decl("parent", &parent_decl).expect("parent");
        let (child, _) = parent
            .spawn_child("child", &child_decl, IntersectionPolicy::Reduce)
            .expect("spawn");
        prop_assert!(child.allow_patterns().is_subset(&parent.allow_patterns()));
    }
}

// ===========================================================================
// Store round-trip
// ===========================================================================

#[test]
fn write_sign_load_roundtrip() {
    let tmp = TempDir::new().expect("tempdir");
    let project: PathBuf = tmp.path().join("proj");
    std::fs::create_dir_all(&project).expect("mk project");
    let store = ContentStore::new(tmp.path().join("user-ai"));

    let source = "title: Round\ndescription: trip\ntool_type: script\nexecutor: bash_runtime\n";
    let signed = sign_source(source, CommentStyle::Hash, None).expect("sign");
    store
        .write_item(
            Origin::Project,
            &project,
            ItemType::Tool,
            "demo",
            "round",
            &signed,
            &BTreeMap::new(),
        )
        .expect("write");

    let item = store
        .get(&project, ItemType::Tool, "round", None)
        .expect("load");
    assert_eq!(item.signature.expect("signature").hash, content_hash(&signed));
    assert_eq!(item.manifest.common().title, "Round");
}
