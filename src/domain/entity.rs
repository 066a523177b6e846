//! The `Entity` record (spec §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::property::PropertyMap;

/// Minimum name length, invariant of spec §3 `Entity`.
pub const MIN_NAME_LEN: usize = 2;
/// Maximum name length, invariant of spec §3 `Entity`.
pub const MAX_NAME_LEN: usize = 100;
/// Minimum confidence retained after validation, spec §3 `Entity`.
pub const MIN_ENTITY_CONFIDENCE: f32 = 0.3;

/// A typed claim of a real-world object occurring in one or more chunks
/// (spec §3 `Entity`, GLOSSARY).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub name: String,
    pub entity_type: String,
    pub description: String,
    pub properties: PropertyMap,
    pub confidence: f32,
    pub source_text_excerpt: String,
    pub start_char: Option<usize>,
    pub end_char: Option<usize>,
    pub aliases: BTreeSet<String>,
    pub embedding: Option<Vec<f32>>,
    pub quality_score: f32,
    pub importance_score: f32,
    pub merged_from: BTreeSet<String>,
    pub chunk_ids: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entity {
    /// Validates the name-length and confidence invariants of spec §3.
    /// Returns `false` if the entity should be dropped by the extractor.
    pub fn is_valid(&self) -> bool {
        let len = self.name.chars().count();
        (MIN_NAME_LEN..=MAX_NAME_LEN).contains(&len) && self.confidence >= MIN_ENTITY_CONFIDENCE
    }

    /// All chunk ids this entity is known to appear in. Per spec §9 Open
    /// Questions, `chunk_ids` is canonical; any legacy id-parsing path is
    /// a fallback only, and is not implemented here since it has no
    /// concrete consumer in this crate.
    pub fn all_chunk_ids(&self) -> &BTreeSet<String> {
        &self.chunk_ids
    }

    pub fn all_names(&self) -> Vec<&str> {
        let mut names = vec![self.name.as_str()];
        names.extend(self.aliases.iter().map(|s| s.as_str()));
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_entity() -> Entity {
        Entity {
            id: "e1".into(),
            name: "Apple Inc.".into(),
            entity_type: "organization".into(),
            description: "A technology company".into(),
            properties: PropertyMap::new(),
            confidence: 0.9,
            source_text_excerpt: "Apple Inc. makes phones".into(),
            start_char: Some(0),
            end_char: Some(10),
            aliases: BTreeSet::new(),
            embedding: None,
            quality_score: 0.8,
            importance_score: 0.5,
            merged_from: BTreeSet::new(),
            chunk_ids: BTreeSet::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn rejects_short_name() {
        let mut e = base_entity();
        e.name = "A".into();
        assert!(!e.is_valid());
    }

    #[test]
    fn rejects_low_confidence() {
        let mut e = base_entity();
        e.confidence = 0.1;
        assert!(!e.is_valid());
    }

    #[test]
    fn accepts_valid_entity() {
        assert!(base_entity().is_valid());
    }
}
