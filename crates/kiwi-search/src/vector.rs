// SPDX-License-Identifier: MIT OR Apache-2.0
//! Vector backend plugin seam.
//!
//! Concrete vector databases stay outside the kernel; anything implementing
//! [`VectorBackend`] can plug in. The in-memory cosine backend below is the
//! reference implementation and the test double.

use async_trait::async_trait;
use kiwi_core::ItemType;
use kiwi_error::{KernelError, KernelResult};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Mutex;

/// One vector search result, scores normalized to `[0, 1]`.
#[derive(Debug, Clone)]
pub struct VectorHit {
    /// Item id.
    pub id: String,
    /// Item kind.
    pub item_type: ItemType,
    /// Cosine-similarity-derived score in `[0, 1]`.
    pub score: f64,
    /// Short text preview stored alongside the embedding.
    pub preview: String,
    /// Metadata stored alongside the embedding.
    pub metadata: BTreeMap<String, Value>,
}

/// Pluggable embedding/vector-store backend.
#[async_trait]
pub trait VectorBackend: Send + Sync {
    /// Embed `content` and persist it under `(item_type, id)`.
    async fn embed_and_store(
        &self,
        id: &str,
        item_type: ItemType,
        content: &str,
        metadata: &BTreeMap<String, Value>,
    ) -> KernelResult<()>;

    /// Semantic search over stored embeddings.
    async fn search(
        &self,
        query: &str,
        item_type: Option<ItemType>,
        limit: usize,
    ) -> KernelResult<Vec<VectorHit>>;

    /// Whether the backend is currently reachable.
    fn is_available(&self) -> bool;
}

/// Dimension-mismatch failure shared by all backends.
///
/// Dimensions are recorded on first insertion; queries and later insertions
/// whose embedding width differs fail with both values attached.
pub fn dimension_mismatch(expected: usize, observed: usize) -> KernelError {
    KernelError::execution_failed(format!(
        "embedding dimension mismatch: expected {expected}, observed {observed}"
    ))
    .with_context("expected_dims", expected as i64)
    .with_context("observed_dims", observed as i64)
    .with_suggestion("re-index after changing EMBEDDING_MODEL or EMBEDDING_DIMS")
}

struct StoredEmbedding {
    id: String,
    item_type: ItemType,
    vector: Vec<f64>,
    preview: String,
    metadata: BTreeMap<String, Value>,
}

struct MemoryState {
    dims: Option<usize>,
    rows: Vec<StoredEmbedding>,
}

/// In-memory cosine-similarity backend with a deterministic bag-of-words
/// embedding. Reference implementation; also used by the test suite.
pub struct MemoryVectorBackend {
    dims: usize,
    state: Mutex<MemoryState>,
}

impl MemoryVectorBackend {
    /// Create a backend embedding into `dims` buckets.
    pub fn new(dims: usize) -> Self {
        Self {
            dims: dims.max(8),
            state: Mutex::new(MemoryState {
                dims: None,
                rows: Vec::new(),
            }),
        }
    }

    fn embed(&self, text: &str) -> Vec<f64> {
        let mut v = vec![0.0; self.dims];
        for token in crate::keyword::tokenize(text) {
            let bucket = (fxhash(&token) as usize) % self.dims;
            v[bucket] += 1.0;
        }
        let norm: f64 = v.iter().map(|x| x * x).sum::<f64>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

// FNV-1a; stable across runs, unlike the std hasher.
fn fxhash(s: &str) -> u64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for b in s.bytes() {
        h ^= u64::from(b);
        h = h.wrapping_mul(0x0000_0100_0000_01b3);
    }
    h
}

fn cosine(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[async_trait]
impl VectorBackend for MemoryVectorBackend {
    async fn embed_and_store(
        &self,
        id: &str,
        item_type: ItemType,
        content: &str,
        metadata: &BTreeMap<String, Value>,
    ) -> KernelResult<()> {
        let vector = self.embed(content);
        let mut state = match self.state.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        match state.dims {
            None => state.dims = Some(vector.len()),
            Some(expected) if expected != vector.len() => {
                return Err(dimension_mismatch(expected, vector.len()));
            }
            Some(_) => {}
        }
        state.rows.retain(|r| !(r.id == id && r.item_type == item_type));
        state.rows.push(StoredEmbedding {
            id: id.to_string(),
            item_type,
            vector,
            preview: content.chars().take(160).collect(),
            metadata: metadata.clone(),
        });
        Ok(())
    }

    async fn search(
        &self,
        query: &str,
        item_type: Option<ItemType>,
        limit: usize,
    ) -> KernelResult<Vec<VectorHit>> {
        let vector = self.embed(query);
        let state = match self.state.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        if let Some(expected) = state.dims {
            if expected != vector.len() {
                return Err(dimension_mismatch(expected, vector.len()));
            }
        }

        let mut hits: Vec<VectorHit> = state
            .rows
            .iter()
            .filter(|r| item_type.is_none_or(|t| r.item_type == t))
            .map(|r| VectorHit {
                id: r.id.clone(),
                item_type: r.item_type,
                score: cosine(&r.vector, &vector).clamp(0.0, 1.0),
                preview: r.preview.clone(),
                metadata: r.metadata.clone(),
            })
            .filter(|h| h.score > 0.0)
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    fn is_available(&self) -> bool {
        true
    }
}
