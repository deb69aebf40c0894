//! Pluggable text embedding for the discovery index.
//!
//! The default embedder is a deterministic bag-of-words: no model weights,
//! no network, identical inputs always produce identical term maps. IDF
//! weighting happens in the index, which knows the corpus.

use std::collections::HashMap;

/// Produces a sparse term-weight map for a piece of intent text.
pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> HashMap<String, f32>;
}

/// Deterministic bag-of-words embedder: lowercase alphanumeric tokens of
/// length ≥ 2, weighted by in-document frequency.
#[derive(Debug, Default, Clone)]
pub struct BagOfWordsEmbedder;

impl Embedder for BagOfWordsEmbedder {
    fn embed(&self, text: &str) -> HashMap<String, f32> {
        let mut counts: HashMap<String, f32> = HashMap::new();
        for token in tokenize(text) {
            *counts.entry(token).or_insert(0.0) += 1.0;
        }
        counts
    }
}

/// Lowercase alphanumeric tokens, minimum length 2.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    for c in text.chars() {
        if c.is_alphanumeric() {
            current.extend(c.to_lowercase());
        } else if !current.is_empty() {
            if current.chars().count() >= 2 {
                tokens.push(std::mem::take(&mut current));
            } else {
                current.clear();
            }
        }
    }
    if current.chars().count() >= 2 {
        tokens.push(current);
    }
    tokens
}
