//! The `Relation` record (spec §3).

use serde::{Deserialize, Serialize};

use super::property::PropertyMap;

/// Minimum confidence retained after filtering, spec §3 `Relation`.
pub const MIN_RELATION_CONFIDENCE: f32 = 0.5;

/// A directed, typed claim `(source, type, target)` grounded in a chunk
/// (spec §3 `Relation`, GLOSSARY).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relation {
    pub id: String,
    pub source_id: String,
    pub source_name: String,
    pub target_id: String,
    pub target_name: String,
    pub relation_type: String,
    pub description: String,
    pub properties: PropertyMap,
    pub confidence: f32,
    pub source_text_excerpt: String,
    pub chunk_id: String,
}

impl Relation {
    /// Validates the invariants of spec §3: distinct endpoints, minimum
    /// confidence.
    pub fn is_valid(&self) -> bool {
        self.source_id != self.target_id && self.confidence >= MIN_RELATION_CONFIDENCE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Relation {
        Relation {
            id: "r1".into(),
            source_id: "e1".into(),
            source_name: "Apple".into(),
            target_id: "e2".into(),
            target_name: "Tim Cook".into(),
            relation_type: "employs".into(),
            description: String::new(),
            properties: PropertyMap::new(),
            confidence: 0.7,
            source_text_excerpt: "Apple employs Tim Cook".into(),
            chunk_id: "c1".into(),
        }
    }

    #[test]
    fn rejects_self_loop() {
        let mut r = base();
        r.target_id = r.source_id.clone();
        assert!(!r.is_valid());
    }

    #[test]
    fn rejects_low_confidence() {
        let mut r = base();
        r.confidence = 0.2;
        assert!(!r.is_valid());
    }
}
