//! C9: merge decision engine (spec §4.5).
//!
//! A pure function over a [`similarity::SimilarityResult`] plus the pair of
//! entities; returns a structured decision record, never applies anything
//! (the merger, C12, is the only component that mutates the graph).

use crate::config::SimilarityThresholds;
use crate::domain::{Entity, PropertyValue};
use crate::similarity::SimilarityResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionClass {
    AutoMerge,
    Conditional,
    Reject,
    ConflictDetected,
}

#[derive(Debug, Clone)]
pub struct Conflict {
    pub kind: String,
    pub severity: f32,
    pub detail: String,
}

#[derive(Debug, Clone)]
pub struct Decision {
    pub class: DecisionClass,
    pub confidence: f32,
    pub reasoning: String,
    pub conflicts: Vec<Conflict>,
}

const ANTONYM_PAIRS: &[(&str, &str)] = &[
    ("public", "private"),
    ("active", "inactive"),
    ("founded", "dissolved"),
    ("alive", "deceased"),
    ("domestic", "foreign"),
];

/// Initial class from total similarity (spec §4.5 step 1).
fn initial_class(total: f32, thresholds: &SimilarityThresholds) -> DecisionClass {
    if total >= thresholds.high {
        DecisionClass::AutoMerge
    } else if total >= thresholds.medium {
        DecisionClass::Conditional
    } else {
        DecisionClass::Reject
    }
}

/// Detects the four conflict kinds of spec §4.5 step 2.
fn scan_conflicts(a: &Entity, b: &Entity) -> Vec<Conflict> {
    let mut conflicts = Vec::new();

    if a.entity_type != b.entity_type {
        conflicts.push(Conflict { kind: "type_mismatch".into(), severity: 0.8, detail: format!("{} vs {}", a.entity_type, b.entity_type) });
    }

    let da = a.description.to_lowercase();
    let db = b.description.to_lowercase();
    for (x, y) in ANTONYM_PAIRS {
        if (da.contains(x) && db.contains(y)) || (da.contains(y) && db.contains(x)) {
            conflicts.push(Conflict { kind: "description_contradiction".into(), severity: 0.6, detail: format!("{x} vs {y}") });
        }
    }

    for (key, value_a) in &a.properties {
        if let Some(value_b) = b.properties.get(key) {
            if let Some(severity) = property_conflict_severity(value_a, value_b) {
                conflicts.push(Conflict { kind: "property_mismatch".into(), severity, detail: key.clone() });
            }
        }
    }

    let confidence_gap = (a.confidence - b.confidence).abs();
    if confidence_gap > 0.4 {
        conflicts.push(Conflict { kind: "confidence_gap".into(), severity: 0.5 * confidence_gap, detail: format!("gap={confidence_gap:.2}") });
    }

    conflicts
}

fn property_conflict_severity(a: &PropertyValue, b: &PropertyValue) -> Option<f32> {
    match (a, b) {
        (PropertyValue::Number(x), PropertyValue::Number(y)) => {
            let denom = x.abs().max(y.abs()).max(1e-9);
            let ratio = ((x - y).abs() / denom) as f32;
            (ratio > 0.5).then_some(ratio)
        }
        (PropertyValue::String(x), PropertyValue::String(y)) => (x.to_lowercase() != y.to_lowercase()).then_some(0.4),
        _ => None,
    }
}

fn mean_severity(conflicts: &[Conflict]) -> f32 {
    if conflicts.is_empty() {
        0.0
    } else {
        conflicts.iter().map(|c| c.severity).sum::<f32>() / conflicts.len() as f32
    }
}

/// Decides whether, and with what confidence, `a` and `b` should merge
/// (spec §4.5 steps 1-4).
pub fn decide(a: &Entity, b: &Entity, similarity: &SimilarityResult, thresholds: &SimilarityThresholds) -> Decision {
    let conflicts = scan_conflicts(a, b);
    let mut class = initial_class(similarity.total, thresholds);

    let type_mismatch_severity = conflicts.iter().filter(|c| c.kind == "type_mismatch").map(|c| c.severity).fold(0.0, f32::max);
    let mean = mean_severity(&conflicts);

    if type_mismatch_severity > 0.7 {
        class = DecisionClass::ConflictDetected;
    } else if mean > 0.6 {
        class = match class {
            DecisionClass::AutoMerge => DecisionClass::Conditional,
            DecisionClass::Conditional => DecisionClass::Reject,
            other => other,
        };
    } else if mean > 0.3 {
        if class == DecisionClass::AutoMerge {
            class = DecisionClass::Conditional;
        }
    }

    let multiplier = match class {
        DecisionClass::AutoMerge => 1.0,
        DecisionClass::Conditional => 0.8,
        DecisionClass::Reject => 0.3,
        DecisionClass::ConflictDetected => 0.1,
    };
    let confidence = similarity.confidence * (1.0 - 0.5 * mean) * multiplier;

    let reasoning = format!(
        "total_similarity={:.3}, mean_conflict_severity={:.3}, class={:?}, {} conflict(s) detected",
        similarity.total,
        mean,
        class,
        conflicts.len()
    );

    Decision { class, confidence, reasoning, conflicts }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::similarity::AxisScores;
    use chrono::Utc;
    use std::collections::BTreeSet;

    fn entity(entity_type: &str, description: &str, confidence: f32) -> Entity {
        let now = Utc::now();
        Entity {
            id: "e".into(),
            name: "Name".into(),
            entity_type: entity_type.into(),
            description: description.into(),
            properties: Default::default(),
            confidence,
            source_text_excerpt: String::new(),
            start_char: None,
            end_char: None,
            aliases: BTreeSet::new(),
            embedding: None,
            quality_score: confidence,
            importance_score: 0.0,
            merged_from: BTreeSet::new(),
            chunk_ids: BTreeSet::new(),
            created_at: now,
            updated_at: now,
        }
    }

    fn thresholds() -> SimilarityThresholds {
        SimilarityThresholds { high: 0.85, medium: 0.65, low: 0.5 }
    }

    fn perfect_similarity() -> SimilarityResult {
        SimilarityResult { total: 0.95, axes: AxisScores { semantic: 1.0, lexical: 1.0, contextual: 1.0 }, confidence: 1.0 }
    }

    #[test]
    fn high_similarity_with_no_conflicts_auto_merges() {
        let a = entity("organization", "a technology company", 0.9);
        let b = entity("organization", "a technology company", 0.9);
        let decision = decide(&a, &b, &perfect_similarity(), &thresholds());
        assert_eq!(decision.class, DecisionClass::AutoMerge);
    }

    #[test]
    fn severe_type_mismatch_forces_conflict_detected() {
        let a = entity("organization", "x", 0.9);
        let b = entity("person", "x", 0.9);
        let decision = decide(&a, &b, &perfect_similarity(), &thresholds());
        assert_eq!(decision.class, DecisionClass::ConflictDetected);
    }

    #[test]
    fn large_confidence_gap_downgrades_auto_merge() {
        let a = entity("organization", "x", 0.95);
        let b = entity("organization", "x", 0.1);
        let decision = decide(&a, &b, &perfect_similarity(), &thresholds());
        assert_ne!(decision.class, DecisionClass::AutoMerge);
    }
}
