//! In-memory semantic index over tool intent text.
//!
//! Linear-scan cosine similarity over IDF-weighted term maps. A single
//! writer lock guards updates; queries take the read side. The registry
//! persists each tool's raw term map so the index can be rebuilt at
//! startup, and IDF is always derived from the live corpus (scores may
//! shift as tools are delisted — accepted).

mod embedder;

pub use embedder::{BagOfWordsEmbedder, Embedder, tokenize};

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct IndexInner {
    /// Raw term-frequency map per tool.
    docs: HashMap<Uuid, HashMap<String, f32>>,
    /// Number of documents containing each term.
    doc_freq: HashMap<String, usize>,
}

impl IndexInner {
    fn add(&mut self, id: Uuid, terms: HashMap<String, f32>) {
        self.drop_doc(id);
        for term in terms.keys() {
            *self.doc_freq.entry(term.clone()).or_insert(0) += 1;
        }
        self.docs.insert(id, terms);
    }

    fn drop_doc(&mut self, id: Uuid) {
        if let Some(old) = self.docs.remove(&id) {
            for term in old.keys() {
                if let Some(count) = self.doc_freq.get_mut(term) {
                    *count -= 1;
                    if *count == 0 {
                        self.doc_freq.remove(term);
                    }
                }
            }
        }
    }

    /// Smoothed inverse document frequency.
    fn idf(&self, term: &str) -> f32 {
        let n = self.docs.len() as f32;
        let df = self.doc_freq.get(term).copied().unwrap_or(0) as f32;
        ((1.0 + n) / (1.0 + df)).ln() + 1.0
    }

    fn weighted<'t>(&self, terms: &'t HashMap<String, f32>) -> HashMap<&'t str, f32> {
        terms
            .iter()
            .map(|(t, tf)| (t.as_str(), tf * self.idf(t)))
            .collect()
    }
}

/// The embedding index.
pub struct EmbeddingIndex {
    embedder: Arc<dyn Embedder>,
    inner: RwLock<IndexInner>,
}

impl EmbeddingIndex {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            inner: RwLock::new(IndexInner::default()),
        }
    }

    /// Embed and index a tool's intent text. Replaces any existing entry.
    pub async fn index(&self, tool_id: Uuid, intent_text: &str) -> HashMap<String, f32> {
        let terms = self.embedder.embed(intent_text);
        self.inner.write().await.add(tool_id, terms.clone());
        terms
    }

    /// Restore a previously persisted term map without re-embedding.
    pub async fn restore(&self, tool_id: Uuid, terms: HashMap<String, f32>) {
        self.inner.write().await.add(tool_id, terms);
    }

    /// Remove a tool (delisting).
    pub async fn remove(&self, tool_id: Uuid) {
        self.inner.write().await.drop_doc(tool_id);
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.docs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.docs.is_empty()
    }

    /// Top-k tools by cosine similarity to the query text.
    ///
    /// Deterministic: ties are broken by tool id.
    pub async fn query(&self, text: &str, k: usize) -> Vec<(Uuid, f64)> {
        let query_terms = self.embedder.embed(text);
        if query_terms.is_empty() || k == 0 {
            return Vec::new();
        }

        let inner = self.inner.read().await;
        let query_weighted = inner.weighted(&query_terms);

        let mut scored: Vec<(Uuid, f64)> = inner
            .docs
            .iter()
            .map(|(id, terms)| {
                let doc_weighted = inner.weighted(terms);
                (*id, cosine_similarity(&query_weighted, &doc_weighted) as f64)
            })
            .filter(|(_, sim)| *sim > 0.0)
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(k);
        scored
    }
}

fn cosine_similarity(a: &HashMap<&str, f32>, b: &HashMap<&str, f32>) -> f32 {
    let mut dot = 0.0f32;
    for (term, wa) in a {
        if let Some(wb) = b.get(term) {
            dot += wa * wb;
        }
    }
    let na: f32 = a.values().map(|w| w * w).sum::<f32>().sqrt();
    let nb: f32 = b.values().map(|w| w * w).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na * nb)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> EmbeddingIndex {
        EmbeddingIndex::new(Arc::new(BagOfWordsEmbedder))
    }

    #[tokio::test]
    async fn query_finds_the_relevant_tool() {
        let idx = index();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        idx.index(a, "add two numbers together").await;
        idx.index(b, "fetch weather forecast data").await;

        let hits = idx.query("sum two numbers", 5).await;
        assert_eq!(hits[0].0, a);
    }

    #[tokio::test]
    async fn removed_tool_disappears_from_results() {
        let idx = index();
        let a = Uuid::new_v4();
        idx.index(a, "reverse a string").await;
        assert_eq!(idx.query("reverse string", 5).await.len(), 1);

        idx.remove(a).await;
        assert!(idx.query("reverse string", 5).await.is_empty());
        assert!(idx.is_empty().await);
    }

    #[tokio::test]
    async fn reindex_replaces_previous_entry() {
        let idx = index();
        let a = Uuid::new_v4();
        idx.index(a, "parse json documents").await;
        idx.index(a, "compute prime numbers").await;

        assert_eq!(idx.len().await, 1);
        assert!(idx.query("parse json", 5).await.is_empty());
        assert_eq!(idx.query("prime numbers", 5).await[0].0, a);
    }

    #[tokio::test]
    async fn query_is_idempotent() {
        let idx = index();
        idx.index(Uuid::new_v4(), "sort a list of numbers").await;
        idx.index(Uuid::new_v4(), "sort strings alphabetically").await;

        let first = idx.query("sort numbers", 5).await;
        let second = idx.query("sort numbers", 5).await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn unrelated_query_returns_empty() {
        let idx = index();
        idx.index(Uuid::new_v4(), "add two numbers").await;
        assert!(idx.query("quantum chromodynamics", 5).await.is_empty());
    }

    #[tokio::test]
    async fn restore_round_trips_terms() {
        let idx = index();
        let a = Uuid::new_v4();
        let terms = idx.index(a, "hash text with sha256").await;

        let rebuilt = index();
        rebuilt.restore(a, terms).await;
        assert_eq!(rebuilt.query("sha256 hash", 5).await[0].0, a);
    }
}
