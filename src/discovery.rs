//! Intent-based tool discovery.
//!
//! Combines the embedding index's similarity candidates with registry
//! state: trust and fitness filters first, then a composite rank of
//! `0.7·similarity + 0.3·fitness`. An empty candidate set stays empty —
//! unrelated tools are never substituted.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::error::RegistryError;
use crate::index::EmbeddingIndex;
use crate::models::{DiscoveryHit, TrustLevel};
use crate::registry::ToolRegistry;

/// Similarity weight in the composite ranking score.
const SIMILARITY_WEIGHT: f64 = 0.7;
/// Fitness weight in the composite ranking score.
const FITNESS_WEIGHT: f64 = 0.3;
/// Candidates fetched from the index per requested result.
const CANDIDATE_FACTOR: usize = 4;

/// Discovery options.
#[derive(Debug, Clone)]
pub struct DiscoverOptions {
    pub k: usize,
    pub min_fitness: f64,
    pub min_trust: TrustLevel,
    pub include_delisted: bool,
    pub tags: Option<Vec<String>>,
}

impl Default for DiscoverOptions {
    fn default() -> Self {
        Self {
            k: 5,
            min_fitness: 0.0,
            min_trust: TrustLevel::Verified,
            include_delisted: false,
            tags: None,
        }
    }
}

/// The discovery engine.
pub struct Discovery {
    registry: Arc<ToolRegistry>,
    index: Arc<EmbeddingIndex>,
}

impl Discovery {
    pub fn new(registry: Arc<ToolRegistry>, index: Arc<EmbeddingIndex>) -> Self {
        Self { registry, index }
    }

    /// Ranked tools matching a natural-language intent.
    pub async fn discover(
        &self,
        intent: &str,
        opts: &DiscoverOptions,
    ) -> Result<Vec<DiscoveryHit>, RegistryError> {
        if opts.k == 0 {
            return Ok(Vec::new());
        }

        let candidates = self
            .index
            .query(intent, opts.k.saturating_mul(CANDIDATE_FACTOR))
            .await;

        let mut ranked = Vec::new();
        for (tool_id, similarity) in candidates {
            // The index is eventually consistent with the registry; a
            // candidate may have vanished between the two reads.
            let Ok(tool) = self.registry.get(tool_id).await else {
                continue;
            };

            if tool.delisted && !opts.include_delisted {
                continue;
            }
            if tool.trust_level < opts.min_trust {
                continue;
            }
            if tool.fitness_score < opts.min_fitness {
                continue;
            }
            if let Some(ref wanted) = opts.tags
                && !wanted.iter().all(|t| tool.tags.contains(t))
            {
                continue;
            }

            ranked.push((
                SIMILARITY_WEIGHT * similarity + FITNESS_WEIGHT * tool.fitness_score,
                similarity,
                tool,
            ));
        }

        ranked.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(Ordering::Equal)
                .then_with(|| {
                    b.2.fitness_score
                        .partial_cmp(&a.2.fitness_score)
                        .unwrap_or(Ordering::Equal)
                })
                .then_with(|| a.2.created_at.cmp(&b.2.created_at))
        });
        ranked.truncate(opts.k);

        Ok(ranked
            .into_iter()
            .map(|(_, similarity, tool)| DiscoveryHit {
                id: tool.id,
                name: tool.name,
                description: tool.description,
                fitness: tool.fitness_score,
                trust_level: tool.trust_level,
                similarity,
            })
            .collect())
    }
}
