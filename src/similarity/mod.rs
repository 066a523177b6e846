//! C8: similarity calculator (spec §4.4).
//!
//! Grounded on `graph_store::cosine_similarity_unit` for the semantic axis
//! and on `domain::ids::canonicalize` for name canonicalization, both
//! already built for this crate, plus the pack's use of `strsim` for
//! lexical ratios.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use strsim::normalized_levenshtein;

use crate::config::SimilarityWeights;
use crate::domain::ids::canonicalize;
use crate::domain::Entity;
use crate::graph_store::cosine_similarity_unit;

#[derive(Debug, Clone, Copy, Default)]
pub struct AxisScores {
    pub semantic: f32,
    pub lexical: f32,
    pub contextual: f32,
}

#[derive(Debug, Clone, Copy)]
pub struct SimilarityResult {
    pub total: f32,
    pub axes: AxisScores,
    pub confidence: f32,
}

/// Representation embedded on demand when an entity has no vector yet
/// (spec §4.4 "Missing embeddings are generated on demand via C1").
pub fn embedding_representation(entity: &Entity) -> String {
    format!("<{}> type:<{}> description:<{}>", entity.name, entity.entity_type, entity.description)
}

fn stopwords() -> &'static HashSet<&'static str> {
    static WORDS: std::sync::OnceLock<HashSet<&'static str>> = std::sync::OnceLock::new();
    WORDS.get_or_init(|| {
        ["the", "a", "an", "and", "or", "of", "in", "on", "to", "is", "are", "was", "were", "with", "for", "at", "by"]
            .into_iter()
            .collect()
    })
}

fn keyword_set(text: &str) -> HashSet<String> {
    text.split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
        .filter(|w| !w.is_empty() && !stopwords().contains(w.as_str()))
        .collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f32 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count() as f32;
    let union = a.union(b).count() as f32;
    if union == 0.0 {
        0.0
    } else {
        intersection / union
    }
}

/// Maximum normalized-Levenshtein ratio between canonicalized names,
/// including each side's aliases (spec §4.4 "Lexical").
fn lexical_score(a: &Entity, b: &Entity) -> f32 {
    let names_a: Vec<String> = a.all_names().into_iter().map(canonicalize).collect();
    let names_b: Vec<String> = b.all_names().into_iter().map(canonicalize).collect();
    let mut best = 0.0f32;
    for na in &names_a {
        for nb in &names_b {
            let ratio = normalized_levenshtein(na, nb) as f32;
            if ratio > best {
                best = ratio;
            }
        }
    }
    best
}

fn description_ratio(a: &Entity, b: &Entity) -> f32 {
    if a.description.is_empty() && b.description.is_empty() {
        return 0.0;
    }
    normalized_levenshtein(&a.description.to_lowercase(), &b.description.to_lowercase()) as f32
}

/// `0.5*(type match) + 0.3*(description ratio) + 0.2*(keyword Jaccard over
/// source_text_excerpt)` (spec §4.4 "Contextual").
fn contextual_score(a: &Entity, b: &Entity) -> f32 {
    let type_match = if a.entity_type == b.entity_type { 1.0 } else { 0.0 };
    let description = description_ratio(a, b);
    let keywords_a = keyword_set(&a.source_text_excerpt);
    let keywords_b = keyword_set(&b.source_text_excerpt);
    let keyword_overlap = jaccard(&keywords_a, &keywords_b);
    0.5 * type_match + 0.3 * description + 0.2 * keyword_overlap
}

fn mean_and_stddev(values: &[f32]) -> (f32, f32) {
    let mean = values.iter().sum::<f32>() / values.len() as f32;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / values.len() as f32;
    (mean, variance.sqrt())
}

/// `0.7*(1 - min(sigma/0.5, 1)) + 0.3*mean` over the three axis scores
/// (spec §4.4 "Confidence").
fn confidence_from_axes(axes: &AxisScores) -> f32 {
    let values = [axes.semantic, axes.lexical, axes.contextual];
    let (mean, stddev) = mean_and_stddev(&values);
    0.7 * (1.0 - (stddev / 0.5).min(1.0)) + 0.3 * mean
}

/// Order-independent cache key: concatenate both `(name,type)` pairs,
/// sorted lexicographically (spec §4.4 "Results are cached...").
fn cache_key(a: &Entity, b: &Entity) -> String {
    let left = format!("{}|{}", canonicalize(&a.name), a.entity_type);
    let right = format!("{}|{}", canonicalize(&b.name), b.entity_type);
    if left <= right {
        format!("{left}::{right}")
    } else {
        format!("{right}::{left}")
    }
}

/// A bounded, order-independent similarity cache; on overflow the older
/// half is dropped (spec §4.4 "Cache size is bounded...").
pub struct SimilarityCache {
    entries: Mutex<HashMap<String, (SimilarityResult, u64)>>,
    capacity: usize,
    clock: std::sync::atomic::AtomicU64,
}

impl SimilarityCache {
    pub fn new(capacity: usize) -> Self {
        Self { entries: Mutex::new(HashMap::new()), capacity, clock: std::sync::atomic::AtomicU64::new(0) }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, std::sync::atomic::Ordering::SeqCst)
    }

    pub fn get(&self, a: &Entity, b: &Entity) -> Option<SimilarityResult> {
        self.entries.lock().unwrap().get(&cache_key(a, b)).map(|(result, _)| *result)
    }

    pub fn insert(&self, a: &Entity, b: &Entity, result: SimilarityResult) {
        let key = cache_key(a, b);
        let tick = self.tick();
        let mut entries = self.entries.lock().unwrap();
        entries.insert(key, (result, tick));
        if entries.len() > self.capacity {
            let mut by_age: Vec<(String, u64)> = entries.iter().map(|(k, (_, t))| (k.clone(), *t)).collect();
            by_age.sort_by_key(|(_, t)| *t);
            let drop_count = entries.len() / 2;
            for (key, _) in by_age.into_iter().take(drop_count) {
                entries.remove(&key);
            }
        }
    }
}

/// Computes the weighted similarity between two entities, assuming both
/// already carry an embedding (callers are responsible for the C1
/// on-demand embedding step, spec §4.4).
pub fn similarity(a: &Entity, b: &Entity, weights: &SimilarityWeights) -> SimilarityResult {
    let semantic = match (&a.embedding, &b.embedding) {
        (Some(ea), Some(eb)) => cosine_similarity_unit(ea, eb),
        _ => 0.0,
    };
    let lexical = lexical_score(a, b);
    let contextual = contextual_score(a, b);
    let axes = AxisScores { semantic, lexical, contextual };
    let total = weights.semantic * semantic + weights.lexical * lexical + weights.contextual * contextual;
    let confidence = confidence_from_axes(&axes);
    SimilarityResult { total, axes, confidence }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeSet;

    fn entity(name: &str, entity_type: &str, description: &str, embedding: Vec<f32>) -> Entity {
        let now = Utc::now();
        Entity {
            id: format!("e_{name}"),
            name: name.to_string(),
            entity_type: entity_type.to_string(),
            description: description.to_string(),
            properties: Default::default(),
            confidence: 0.9,
            source_text_excerpt: description.to_string(),
            start_char: None,
            end_char: None,
            aliases: BTreeSet::new(),
            embedding: Some(embedding),
            quality_score: 0.9,
            importance_score: 0.0,
            merged_from: BTreeSet::new(),
            chunk_ids: BTreeSet::new(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn identical_entities_score_near_one() {
        let a = entity("Apple Inc.", "organization", "makes phones", vec![1.0, 0.0]);
        let b = entity("Apple Inc.", "organization", "makes phones", vec![1.0, 0.0]);
        let weights = SimilarityWeights { semantic: 0.4, lexical: 0.3, contextual: 0.3 };
        let result = similarity(&a, &b, &weights);
        assert!(result.total > 0.95, "expected near-1 similarity, got {}", result.total);
    }

    #[test]
    fn different_types_lower_contextual_score() {
        let a = entity("Apple Inc.", "organization", "makes phones", vec![1.0, 0.0]);
        let b = entity("Apple Inc.", "person", "makes phones", vec![1.0, 0.0]);
        let weights = SimilarityWeights { semantic: 0.4, lexical: 0.3, contextual: 0.3 };
        let result = similarity(&a, &b, &weights);
        assert!(result.axes.contextual < 1.0);
    }

    #[test]
    fn cache_is_order_independent() {
        let cache = SimilarityCache::new(10);
        let a = entity("A", "t", "d", vec![1.0]);
        let b = entity("B", "t", "d", vec![1.0]);
        let result = SimilarityResult { total: 0.5, axes: AxisScores::default(), confidence: 0.5 };
        cache.insert(&a, &b, result);
        assert!(cache.get(&b, &a).is_some());
    }

    #[test]
    fn cache_drops_older_half_on_overflow() {
        let cache = SimilarityCache::new(2);
        for i in 0..4 {
            let a = entity(&format!("A{i}"), "t", "d", vec![1.0]);
            let b = entity(&format!("B{i}"), "t", "d", vec![1.0]);
            cache.insert(&a, &b, SimilarityResult { total: 0.1, axes: AxisScores::default(), confidence: 0.1 });
        }
        assert!(cache.entries.lock().unwrap().len() <= 2);
    }
}
