// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! kiwi-search
#![deny(unsafe_code)]

pub mod keyword;
pub mod vector;

pub use keyword::{DEFAULT_MIN_SCORE, FieldWeights, KeywordIndex, tokenize};
pub use vector::{MemoryVectorBackend, VectorBackend, VectorHit, dimension_mismatch};

use chrono::{DateTime, Utc};
use kiwi_core::{Item, ItemType};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tracing::warn;

/// Which engine produced a result (or answered a query).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchKind {
    /// BM25 keyword scoring only.
    Keyword,
    /// Vector backend only.
    Vector,
    /// Blended keyword + vector (+ recency).
    Hybrid,
}

/// Requested strategy; `Auto` picks hybrid when a vector backend is up.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, schemars::JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Pick the best available engine.
    #[default]
    Auto,
    /// Force keyword.
    Keyword,
    /// Force vector (degrades to keyword when unavailable).
    Vector,
    /// Force hybrid (degrades to keyword when unavailable).
    Hybrid,
}

/// Result-quality annotation surfaced to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    /// Semantic engines participated.
    High,
    /// Keyword-only; still trustworthy, less recall.
    Good,
}

/// One ranked search result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    /// Item id.
    pub id: String,
    /// Item kind.
    pub item_type: ItemType,
    /// Engine-specific (keyword) or blended (hybrid) score.
    pub score: f64,
    /// Item title.
    pub title: String,
    /// Short preview text.
    pub preview: String,
    /// On-disk path when the item is file-backed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Category, origin, tags, version.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
    /// Which engine produced this particular hit.
    pub search_type: SearchKind,
    /// Timestamp used for the recency term.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Hybrid blend weights: `α·vector + β·keyword + γ·recency`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HybridWeights {
    /// Vector contribution (α).
    pub vector: f64,
    /// Keyword contribution (β).
    pub keyword: f64,
    /// Recency contribution (γ).
    pub recency: f64,
}

impl Default for HybridWeights {
    fn default() -> Self {
        Self {
            vector: 0.7,
            keyword: 0.2,
            recency: 0.1,
        }
    }
}

/// Strategy router over the keyword index and the optional vector backend.
pub struct SearchRouter {
    index: RwLock<KeywordIndex>,
    vector: Option<Arc<dyn VectorBackend>>,
    weights: HybridWeights,
}

impl Default for SearchRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl SearchRouter {
    /// Keyword-only router.
    pub fn new() -> Self {
        Self {
            index: RwLock::new(KeywordIndex::new()),
            vector: None,
            weights: HybridWeights::default(),
        }
    }

    /// Attach a vector backend.
    #[must_use]
    pub fn with_vector(mut self, backend: Arc<dyn VectorBackend>) -> Self {
        self.vector = Some(backend);
        self
    }

    /// Override the hybrid blend weights.
    #[must_use]
    pub fn with_weights(mut self, weights: HybridWeights) -> Self {
        self.weights = weights;
        self
    }

    /// Whether a vector backend is configured and reachable.
    pub fn vector_available(&self) -> bool {
        self.vector.as_ref().is_some_and(|v| v.is_available())
    }

    /// Replace the keyword index with a fresh snapshot of `items`, and feed
    /// the vector backend when one is attached. Embedding failures degrade
    /// to keyword-only; they never fail the reindex.
    pub async fn reindex(&self, items: &[Item]) {
        {
            let mut index = match self.index.write() {
                Ok(g) => g,
                Err(p) => p.into_inner(),
            };
            index.clear();
            for item in items {
                index.index_item(item);
            }
        }

        if let Some(backend) = &self.vector {
            if backend.is_available() {
                for item in items {
                    let common = item.manifest.common();
                    let content = format!(
                        "{}\n{}\n{}",
                        common.title,
                        common.description,
                        common.tags.join(" ")
                    );
                    let meta = BTreeMap::new();
                    if let Err(e) = backend
                        .embed_and_store(&item.id, item.item_type, &content, &meta)
                        .await
                    {
                        warn!(target: "kiwi.search", id = %item.id, error = %e, "embedding failed");
                    }
                }
            }
        }
    }

    /// Number of documents in the keyword index.
    pub fn indexed(&self) -> usize {
        match self.index.read() {
            Ok(g) => g.len(),
            Err(p) => p.into_inner().len(),
        }
    }

    /// Run a query under the requested strategy.
    ///
    /// Returns the hits plus which engine actually answered and a quality
    /// annotation. Vector failures are silent degradations by design.
    pub async fn search(
        &self,
        query: &str,
        item_type: Option<ItemType>,
        limit: usize,
        strategy: Strategy,
    ) -> (Vec<SearchHit>, SearchKind, Quality) {
        let effective = match strategy {
            Strategy::Keyword => SearchKind::Keyword,
            Strategy::Vector if self.vector_available() => SearchKind::Vector,
            Strategy::Hybrid | Strategy::Auto if self.vector_available() => SearchKind::Hybrid,
            _ => SearchKind::Keyword,
        };

        match effective {
            SearchKind::Keyword => (self.keyword_search(query, item_type, limit), SearchKind::Keyword, Quality::Good),
            SearchKind::Vector => match self.vector_search(query, item_type, limit).await {
                Ok(hits) => (hits, SearchKind::Vector, Quality::High),
                Err(e) => {
                    warn!(target: "kiwi.search", error = %e, "vector search failed; degrading to keyword");
                    (self.keyword_search(query, item_type, limit), SearchKind::Keyword, Quality::Good)
                }
            },
            SearchKind::Hybrid => {
                let keyword_hits = self.keyword_search(query, item_type, limit.max(limit * 2));
                match self.vector_search(query, item_type, limit.max(limit * 2)).await {
                    Ok(vector_hits) => {
                        let blended = self.blend(keyword_hits, vector_hits, limit);
                        (blended, SearchKind::Hybrid, Quality::High)
                    }
                    Err(e) => {
                        warn!(target: "kiwi.search", error = %e, "vector backend errored; keyword results only");
                        let mut hits = keyword_hits;
                        hits.truncate(limit);
                        (hits, SearchKind::Keyword, Quality::Good)
                    }
                }
            }
        }
    }

    fn keyword_search(
        &self,
        query: &str,
        item_type: Option<ItemType>,
        limit: usize,
    ) -> Vec<SearchHit> {
        match self.index.read() {
            Ok(g) => g.search(query, item_type, limit),
            Err(p) => p.into_inner().search(query, item_type, limit),
        }
    }

    async fn vector_search(
        &self,
        query: &str,
        item_type: Option<ItemType>,
        limit: usize,
    ) -> kiwi_error::KernelResult<Vec<SearchHit>> {
        let Some(backend) = &self.vector else {
            return Ok(Vec::new());
        };
        let hits = backend.search(query, item_type, limit).await?;
        Ok(hits
            .into_iter()
            .map(|h| SearchHit {
                id: h.id,
                item_type: h.item_type,
                score: h.score,
                title: String::new(),
                preview: h.preview,
                path: None,
                metadata: h.metadata,
                search_type: SearchKind::Vector,
                timestamp: None,
            })
            .collect())
    }

    /// Union the two result sets, deduplicated by `(type, id)`, with scores
    /// blended as `α·vector + β·keyword + γ·recency`.
    fn blend(
        &self,
        keyword: Vec<SearchHit>,
        vector: Vec<SearchHit>,
        limit: usize,
    ) -> Vec<SearchHit> {
        let max_keyword = keyword
            .iter()
            .map(|h| h.score)
            .fold(0.0_f64, f64::max)
            .max(f64::EPSILON);

        let mut merged: BTreeMap<(ItemType, String), SearchHit> = BTreeMap::new();

        for hit in keyword {
            let key = (hit.item_type, hit.id.clone());
            let normalized = hit.score / max_keyword;
            let recency = recency_score(hit.timestamp);
            let mut out = hit;
            out.score = self.weights.keyword * normalized + self.weights.recency * recency;
            out.search_type = SearchKind::Keyword;
            merged.insert(key, out);
        }

        for hit in vector {
            let key = (hit.item_type, hit.id.clone());
            match merged.get_mut(&key) {
                Some(existing) => {
                    existing.score += self.weights.vector * hit.score;
                    existing.search_type = SearchKind::Hybrid;
                }
                None => {
                    let mut out = hit;
                    out.score *= self.weights.vector;
                    out.search_type = SearchKind::Hybrid;
                    merged.insert(key, out);
                }
            }
        }

        let mut hits: Vec<SearchHit> = merged.into_values().collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(limit);
        hits
    }
}

/// Recency decays exponentially with a 30-day half-life-ish constant;
/// undated items contribute nothing.
fn recency_score(timestamp: Option<DateTime<Utc>>) -> f64 {
    match timestamp {
        Some(ts) => {
            let age_days = (Utc::now() - ts).num_seconds().max(0) as f64 / 86_400.0;
            (-age_days / 30.0).exp()
        }
        None => 0.0,
    }
}
