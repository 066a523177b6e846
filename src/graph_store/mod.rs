//! C3: vector+graph store adapter (spec §2, §6 "Vector+graph store").
//!
//! Covers the operation set spec §6 names: `createNode`, `createEdge`,
//! `upsertNode`, `batchCreate`, `vectorKNN`, `fullText`, `traversal`. An
//! in-memory implementation backs the fragment/merger/community unit tests
//! without a live Neo4j instance.

pub mod memory;
pub mod neo4j;

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::{GraphEdge, GraphNode, PropertyMap};
use crate::errors::StoreError;

#[derive(Debug, Clone)]
pub struct KnnMatch {
    pub node_id: String,
    pub score: f32,
    pub properties: PropertyMap,
}

#[derive(Debug, Clone, Default)]
pub struct BatchCounts {
    pub nodes_created: usize,
    pub edges_created: usize,
}

#[derive(Debug, Clone)]
pub struct TraversalRow(pub serde_json::Map<String, Value>);

#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn create_node(&self, label: &str, properties: PropertyMap) -> Result<String, StoreError>;

    async fn create_edge(
        &self,
        src_id: &str,
        dst_id: &str,
        edge_type: &str,
        properties: PropertyMap,
    ) -> Result<String, StoreError>;

    /// Upsert-by-id-property: creates the node if absent, otherwise merges
    /// `properties` onto the existing node (spec §6, idempotent per §4.1).
    async fn upsert_node(&self, label: &str, id_prop: &str, properties: PropertyMap) -> Result<(), StoreError>;

    async fn batch_create(&self, nodes: Vec<GraphNode>, edges: Vec<GraphEdge>) -> Result<BatchCounts, StoreError>;

    async fn vector_knn(
        &self,
        label: &str,
        property: &str,
        query_vec: &[f32],
        k: usize,
        min_score: f32,
    ) -> Result<Vec<KnnMatch>, StoreError>;

    async fn full_text(&self, label: &str, property: &str, query: &str, k: usize) -> Result<Vec<KnnMatch>, StoreError>;

    /// A generic traversal, parameterized by an opaque query string (Cypher
    /// or an equivalent) plus bound parameters (spec §6).
    async fn traversal(&self, query: &str, params: PropertyMap) -> Result<Vec<TraversalRow>, StoreError>;

    /// Rewires every edge incident to `from_id` onto `to_id`, dropping
    /// self-loops and de-duplicating parallel edges (spec §4.8 step 3).
    async fn rewire_edges(&self, from_id: &str, to_id: &str) -> Result<(), StoreError>;

    /// Deletes a node and all edges incident to it (used by the merger,
    /// spec §4.8 step 3).
    async fn delete_node(&self, node_id: &str) -> Result<(), StoreError>;

    /// Fetches a node's full property map by id, or `None` if absent.
    async fn get_node(&self, node_id: &str) -> Result<Option<PropertyMap>, StoreError>;

    /// Deletes every node (and incident edges) carrying `label` (used by the
    /// community detector to drop the prior hierarchy, spec §4.9 step 1).
    async fn drop_label(&self, label: &str) -> Result<(), StoreError>;

    /// Removes `property` from every node carrying `label` (spec §4.9 step 1).
    async fn clear_property(&self, label: &str, property: &str) -> Result<(), StoreError>;

    /// Ensures a vector index over `label(embedding)`, creating it if absent
    /// (spec §4.9 step 8, §4.10).
    async fn ensure_vector_index(&self, label: &str, dimension: usize) -> Result<(), StoreError>;

    /// Ensures a full-text index over `label(property)`, creating it if
    /// absent (spec §4.9 step 8).
    async fn ensure_full_text_index(&self, label: &str, property: &str) -> Result<(), StoreError>;
}

/// Cosine similarity, remapped from `[-1, 1]` to `[0, 1]` (spec §4.4
/// "Semantic" axis). Shared by the graph store's KNN fallback and the
/// similarity calculator.
pub fn cosine_similarity_unit(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || b.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    let cosine = (dot / (norm_a * norm_b)).clamp(-1.0, 1.0);
    (cosine + 1.0) / 2.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_vectors_have_unit_similarity() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity_unit(&v, &v) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn opposite_vectors_have_zero_similarity() {
        let a = vec![1.0, 0.0];
        let b = vec![-1.0, 0.0];
        assert!(cosine_similarity_unit(&a, &b).abs() < 1e-5);
    }
}
