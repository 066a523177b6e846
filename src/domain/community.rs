//! The `Community` record (spec §3, §4.9).

use serde::{Deserialize, Serialize};

/// A cluster of entities at a given hierarchy level (spec §3 `Community`, GLOSSARY).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Community {
    pub id: String,
    pub level: u32,
    pub cluster_id: u32,
    pub weight: u64,
    pub rank: u64,
    pub title: Option<String>,
    pub summary: Option<String>,
    pub embedding: Option<Vec<f32>>,
}

impl Community {
    pub fn new(level: u32, cluster_id: u32) -> Self {
        Self {
            id: format!("{}-{}", level, cluster_id),
            level,
            cluster_id,
            weight: 0,
            rank: 0,
            title: None,
            summary: None,
            embedding: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_format_matches_spec() {
        let c = Community::new(0, 3);
        assert_eq!(c.id, "0-3");
    }
}
