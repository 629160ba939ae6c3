// SPDX-License-Identifier: MIT OR Apache-2.0
//! BM25-style keyword index over item manifests.
//!
//! Scoring uses k₁ = 1.5, b = 0.75 with the +1-smoothed IDF
//! `ln(1 + (N − df + 0.5) / (df + 0.5))`, weighted term frequencies per
//! field boost, and a 1.5× multiplier for exact-phrase matches.

use chrono::{DateTime, Utc};
use kiwi_core::{Item, ItemType, Manifest};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

use crate::{SearchHit, SearchKind};

const K1: f64 = 1.5;
const B: f64 = 0.75;
const PHRASE_MULTIPLIER: f64 = 1.5;

/// Default minimum score below which results are dropped.
pub const DEFAULT_MIN_SCORE: f64 = 0.1;

/// Per-field boost weights.
#[derive(Debug, Clone)]
pub struct FieldWeights {
    /// `title` and `name` fields.
    pub title: f64,
    /// `description` field.
    pub description: f64,
    /// `category` and `tags` fields.
    pub category: f64,
    /// Body content.
    pub content: f64,
}

impl Default for FieldWeights {
    fn default() -> Self {
        Self {
            title: 3.0,
            description: 2.0,
            category: 1.5,
            content: 1.0,
        }
    }
}

/// Lowercase `[a-z0-9_]{2,}` tokens of `text`.
pub fn tokenize(text: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    lower
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|t| t.len() >= 2)
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone)]
struct Doc {
    id: String,
    item_type: ItemType,
    title: String,
    preview: String,
    path: Option<String>,
    metadata: BTreeMap<String, Value>,
    /// term → boost-weighted frequency.
    tf: HashMap<String, f64>,
    /// boost-weighted document length.
    len: f64,
    /// lowercased concatenation of all fields, for phrase matching.
    full_text: String,
    /// timestamp used by the hybrid recency term.
    timestamp: Option<DateTime<Utc>>,
}

/// In-memory keyword index. Process-wide: built once per content snapshot
/// and replaced wholesale on reindex.
#[derive(Debug, Default)]
pub struct KeywordIndex {
    docs: Vec<Doc>,
    /// term → number of documents containing it.
    df: HashMap<String, usize>,
    weights: FieldWeights,
    min_score: f64,
}

impl KeywordIndex {
    /// Empty index with default weights and threshold.
    pub fn new() -> Self {
        Self {
            docs: Vec::new(),
            df: HashMap::new(),
            weights: FieldWeights::default(),
            min_score: DEFAULT_MIN_SCORE,
        }
    }

    /// Override field weights.
    #[must_use]
    pub fn with_weights(mut self, weights: FieldWeights) -> Self {
        self.weights = weights;
        self
    }

    /// Override the minimum score threshold.
    #[must_use]
    pub fn with_min_score(mut self, min_score: f64) -> Self {
        self.min_score = min_score;
        self
    }

    /// Number of indexed documents.
    pub fn len(&self) -> usize {
        self.docs.len()
    }

    /// True when nothing is indexed.
    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Drop every document.
    pub fn clear(&mut self) {
        self.docs.clear();
        self.df.clear();
    }

    /// Add one item to the index.
    pub fn index_item(&mut self, item: &Item) {
        let common = item.manifest.common();

        let mut fields: Vec<(f64, String)> = vec![
            (self.weights.title, common.title.clone()),
            (self.weights.title, item.id.replace(['-', '_'], " ")),
            (self.weights.description, common.description.clone()),
            (self.weights.category, item.category.clone()),
            (self.weights.category, common.tags.join(" ")),
        ];
        fields.push((self.weights.content, content_of(item)));

        let mut tf: HashMap<String, f64> = HashMap::new();
        let mut len = 0.0;
        let mut full_text = String::new();
        for (weight, text) in &fields {
            for token in tokenize(text) {
                *tf.entry(token).or_insert(0.0) += weight;
                len += weight;
            }
            full_text.push_str(&text.to_lowercase());
            full_text.push('\n');
        }

        for term in tf.keys() {
            *self.df.entry(term.clone()).or_insert(0) += 1;
        }

        let timestamp = common.validated_at.or(common.created_at);
        let preview = if common.description.is_empty() {
            common.title.clone()
        } else {
            truncate(&common.description, 160)
        };

        self.docs.push(Doc {
            id: item.id.clone(),
            item_type: item.item_type,
            title: common.title.clone(),
            preview,
            path: item.path.as_ref().map(|p| p.display().to_string()),
            metadata: doc_metadata(item),
            tf,
            len,
            full_text,
            timestamp,
        });
    }

    /// IDF of a term over the currently indexed set.
    ///
    /// A term present in every document scores `ln(1 + 0.5/(N+0.5))` — near
    /// zero, so universal terms do not rank.
    pub fn idf(&self, term: &str) -> f64 {
        let n = self.docs.len() as f64;
        if n == 0.0 {
            return 0.0;
        }
        let df = self.df.get(term).copied().unwrap_or(0) as f64;
        (1.0 + (n - df + 0.5) / (df + 0.5)).ln()
    }

    fn avg_len(&self) -> f64 {
        if self.docs.is_empty() {
            return 1.0;
        }
        let total: f64 = self.docs.iter().map(|d| d.len).sum();
        (total / self.docs.len() as f64).max(1.0)
    }

    /// BM25 score of one document for the tokenized query.
    fn score(&self, doc: &Doc, terms: &[String], phrase: &str, avg_len: f64) -> f64 {
        let mut score = 0.0;
        for term in terms {
            let Some(&tf) = doc.tf.get(term) else {
                continue;
            };
            let idf = self.idf(term);
            let norm = tf * (K1 + 1.0) / (tf + K1 * (1.0 - B + B * doc.len / avg_len));
            score += idf * norm;
        }
        if score > 0.0 && !phrase.is_empty() && doc.full_text.contains(phrase) {
            score *= PHRASE_MULTIPLIER;
        }
        score
    }

    /// Ranked search. `item_type` filters results; `limit` caps them.
    pub fn search(
        &self,
        query: &str,
        item_type: Option<ItemType>,
        limit: usize,
    ) -> Vec<SearchHit> {
        let terms = tokenize(query);
        if terms.is_empty() {
            return Vec::new();
        }
        let phrase = query.trim().to_lowercase();
        let avg_len = self.avg_len();

        let mut hits: Vec<SearchHit> = self
            .docs
            .iter()
            .filter(|d| item_type.is_none_or(|t| d.item_type == t))
            .filter_map(|d| {
                let score = self.score(d, &terms, &phrase, avg_len);
                if score < self.min_score {
                    return None;
                }
                Some(SearchHit {
                    id: d.id.clone(),
                    item_type: d.item_type,
                    score,
                    title: d.title.clone(),
                    preview: d.preview.clone(),
                    path: d.path.clone(),
                    metadata: d.metadata.clone(),
                    search_type: SearchKind::Keyword,
                    timestamp: d.timestamp,
                })
            })
            .collect();

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

fn content_of(item: &Item) -> String {
    match &item.manifest {
        // Knowledge and directives carry prose bodies worth indexing.
        Manifest::Knowledge(_) | Manifest::Directive(_) => item.source.clone(),
        // Tool YAML is mostly config; index parameter descriptions instead.
        Manifest::Tool(t) => t
            .parameters
            .values()
            .map(|p| p.description.as_str())
            .collect::<Vec<_>>()
            .join(" "),
    }
}

fn doc_metadata(item: &Item) -> BTreeMap<String, Value> {
    let common = item.manifest.common();
    let mut m = BTreeMap::new();
    m.insert("category".into(), Value::String(item.category.clone()));
    m.insert("origin".into(), Value::String(item.origin.to_string()));
    m.insert("version".into(), Value::String(item.version.clone()));
    if !common.tags.is_empty() {
        m.insert(
            "tags".into(),
            Value::Array(common.tags.iter().cloned().map(Value::String).collect()),
        );
    }
    m
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut cut = max;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…", &s[..cut])
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiwi_core::{ManifestCommon, Origin, ToolManifest, ToolType};
    use std::collections::BTreeMap as Map;

    fn tool(id: &str, title: &str, description: &str, tags: &[&str]) -> Item {
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
                    tags: tags.iter().map(|s| s.to_string()).collect(),
                    ..ManifestCommon::default()
                },
                tool_type: ToolType::Script,
                executor: Some("python_runtime".into()),
                config: serde_json::Map::new(),
                parameters: Map::new(),
            }),
            source: String::new(),
            files: Map::new(),
            signature: None,
            path: None,
        }
    }

    fn index(items: &[Item]) -> KeywordIndex {
        let mut idx = KeywordIndex::new();
        for item in items {
            idx.index_item(item);
        }
        idx
    }

    #[test]
    fn tokenizer_drops_short_and_non_word_tokens() {
        assert_eq!(tokenize("The HTTP_client, v2!"), vec!["the", "http_client", "v2"]);
        assert_eq!(tokenize("a b c"), Vec::<String>::new());
    }

    #[test]
    fn title_match_outranks_description_match() {
        let idx = index(&[
            tool("auth_tool", "Authentication helper", "does things", &[]),
            tool("other", "Helper", "authentication for services", &[]),
        ]);
        let hits = idx.search("authentication", None, 10);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "auth_tool", "title boost must win");
        assert!(hits[0].score > hits[1].score);
    }

    #[test]
    fn phrase_match_multiplies_score() {
        let idx = index(&[
            tool("a", "token refresh flow", "rotates tokens", &[]),
            tool("b", "flow of refresh token", "rotates tokens", &[]),
        ]);
        let hits = idx.search("token refresh", None, 10);
        let a = hits.iter().find(|h| h.id == "a").expect("a found");
        let b = hits.iter().find(|h| h.id == "b").expect("b found");
        assert!(
            a.score >= b.score * 1.49,
            "phrase hit {} must be ≥1.5× non-phrase {}",
            a.score,
            b.score
        );
    }

    #[test]
    fn universal_term_has_near_zero_idf() {
        let items: Vec<Item> = (0..10)
            .map(|i| tool(&format!("t{i}"), "shared kernel", "unique", &[]))
            .collect();
        let idx = index(&items);
        assert!(idx.idf("shared") < 0.05, "idf = {}", idx.idf("shared"));
        assert!(idx.idf("missing_term") > 1.0);
    }

    #[test]
    fn universal_term_does_not_rank() {
        let mut items: Vec<Item> = (0..10)
            .map(|i| tool(&format!("t{i}"), "shared widget", "x", &[]))
            .collect();
        items.push(tool("special", "shared rare_feature", "x", &[]));
        let idx = index(&items);

        let hits = idx.search("shared", None, 20);
        assert!(
            hits.is_empty(),
            "universal term should fall below the threshold, got {hits:?}"
        );
        let hits = idx.search("rare_feature", None, 20);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "special");
    }

    #[test]
    fn type_filter_restricts_results() {
        let mut knowledge = tool("k", "authentication notes", "notes", &[]);
        knowledge.item_type = ItemType::Knowledge;
        let idx = index(&[tool("t", "authentication tool", "x", &[]), knowledge]);

        let hits = idx.search("authentication", Some(ItemType::Tool), 10);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "t");
    }

    #[test]
    fn results_sorted_descending_and_limited() {
        let items: Vec<Item> = (0..5)
            .map(|i| {
                tool(
                    &format!("t{i}"),
                    if i == 0 { "exact match term" } else { "term" },
                    "body",
                    &[],
                )
            })
            .collect();
        let idx = index(&items);
        let hits = idx.search("term", None, 3);
        assert_eq!(hits.len(), 3);
        assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn tags_and_category_are_searchable() {
        let idx = index(&[tool("t", "thing", "does stuff", &["observability"])]);
        let hits = idx.search("observability", None, 10);
        assert_eq!(hits.len(), 1);
        let hits = idx.search("demo", None, 10);
        assert_eq!(hits.len(), 1, "category field is indexed");
    }

    #[test]
    fn empty_query_returns_nothing() {
        let idx = index(&[tool("t", "thing", "stuff", &[])]);
        assert!(idx.search("", None, 10).is_empty());
        assert!(idx.search("!!", None, 10).is_empty());
    }
}
