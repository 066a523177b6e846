//! `GraphFragment`: the result of processing one document (spec §3, §4.7).

use serde::{Deserialize, Serialize};

use super::property::PropertyMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    pub label: String,
    pub properties: PropertyMap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EdgeType {
    PartOf,
    FirstChunk,
    NextChunk,
    HasEntity,
    Relationship,
}

impl EdgeType {
    pub fn as_label(&self) -> &'static str {
        match self {
            EdgeType::PartOf => "PART_OF",
            EdgeType::FirstChunk => "FIRST_CHUNK",
            EdgeType::NextChunk => "NEXT_CHUNK",
            EdgeType::HasEntity => "HAS_ENTITY",
            EdgeType::Relationship => "RELATIONSHIP",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEdge {
    pub id: String,
    pub source_id: String,
    pub target_id: String,
    pub edge_type: EdgeType,
    pub properties: PropertyMap,
}

/// Nodes + edges produced for a single document (spec §3 `GraphFragment`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphFragment {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

/// Errors surfaced by [`GraphFragment::validate`] (spec §4.7 "deterministic validator").
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FragmentValidationError {
    #[error("edge {edge_id} references unknown node {node_id}")]
    DanglingEdge { edge_id: String, node_id: String },
    #[error("duplicate node id {0}")]
    DuplicateNode(String),
    #[error("duplicate edge id {0}")]
    DuplicateEdge(String),
}

impl GraphFragment {
    /// Every edge references a node present in the fragment; node ids are
    /// unique; edge ids are unique (spec §4.7, tested by spec §8 "Fragment
    /// integrity").
    pub fn validate(&self) -> Result<(), FragmentValidationError> {
        use std::collections::HashSet;

        let mut node_ids = HashSet::with_capacity(self.nodes.len());
        for node in &self.nodes {
            if !node_ids.insert(node.id.as_str()) {
                return Err(FragmentValidationError::DuplicateNode(node.id.clone()));
            }
        }

        let mut edge_ids = HashSet::with_capacity(self.edges.len());
        for edge in &self.edges {
            if !edge_ids.insert(edge.id.as_str()) {
                return Err(FragmentValidationError::DuplicateEdge(edge.id.clone()));
            }
            if !node_ids.contains(edge.source_id.as_str()) {
                return Err(FragmentValidationError::DanglingEdge {
                    edge_id: edge.id.clone(),
                    node_id: edge.source_id.clone(),
                });
            }
            if !node_ids.contains(edge.target_id.as_str()) {
                return Err(FragmentValidationError::DanglingEdge {
                    edge_id: edge.id.clone(),
                    node_id: edge.target_id.clone(),
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str) -> GraphNode {
        GraphNode { id: id.to_string(), label: "Entity".into(), properties: PropertyMap::new() }
    }

    fn edge(id: &str, src: &str, dst: &str) -> GraphEdge {
        GraphEdge {
            id: id.to_string(),
            source_id: src.to_string(),
            target_id: dst.to_string(),
            edge_type: EdgeType::Relationship,
            properties: PropertyMap::new(),
        }
    }

    #[test]
    fn valid_fragment_passes() {
        let frag = GraphFragment { nodes: vec![node("a"), node("b")], edges: vec![edge("e1", "a", "b")] };
        assert!(frag.validate().is_ok());
    }

    #[test]
    fn dangling_edge_is_rejected() {
        let frag = GraphFragment { nodes: vec![node("a")], edges: vec![edge("e1", "a", "missing")] };
        assert!(matches!(frag.validate(), Err(FragmentValidationError::DanglingEdge { .. })));
    }

    #[test]
    fn duplicate_node_is_rejected() {
        let frag = GraphFragment { nodes: vec![node("a"), node("a")], edges: vec![] };
        assert!(matches!(frag.validate(), Err(FragmentValidationError::DuplicateNode(_))));
    }
}
