//! An in-process `GraphStore` used by unit tests and by examples that don't
//! need a live Neo4j instance.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use super::{BatchCounts, GraphStore, KnnMatch, TraversalRow};
use crate::domain::{GraphEdge, GraphNode, PropertyMap, PropertyValue};
use crate::errors::StoreError;

#[derive(Debug, Clone)]
struct StoredEdge {
    id: String,
    src: String,
    dst: String,
    edge_type: String,
    properties: PropertyMap,
}

#[derive(Default)]
pub struct InMemoryGraphStore {
    nodes: Mutex<HashMap<String, (String, PropertyMap)>>,
    edges: Mutex<HashMap<String, StoredEdge>>,
}

impl InMemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn embedding_of(props: &PropertyMap) -> Option<Vec<f32>> {
        match props.get("embedding") {
            Some(PropertyValue::List(values)) => {
                Some(values.iter().filter_map(|v| v.as_f64().map(|f| f as f32)).collect())
            }
            _ => None,
        }
    }

    /// Snapshot of `(node_id, properties)` pairs whose stored label matches.
    pub fn nodes_with_label(&self, label: &str) -> Vec<(String, PropertyMap)> {
        self.nodes
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, (l, _))| l == label)
            .map(|(id, (_, props))| (id.clone(), props.clone()))
            .collect()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.lock().unwrap().len()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.lock().unwrap().len()
    }
}

#[async_trait]
impl GraphStore for InMemoryGraphStore {
    async fn create_node(&self, label: &str, properties: PropertyMap) -> Result<String, StoreError> {
        let id = properties
            .get("id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        self.nodes.lock().unwrap().insert(id.clone(), (label.to_string(), properties));
        Ok(id)
    }

    async fn create_edge(
        &self,
        src_id: &str,
        dst_id: &str,
        edge_type: &str,
        properties: PropertyMap,
    ) -> Result<String, StoreError> {
        let id = format!("{}_{}", edge_type, Uuid::new_v4());
        self.edges.lock().unwrap().insert(
            id.clone(),
            StoredEdge { id: id.clone(), src: src_id.to_string(), dst: dst_id.to_string(), edge_type: edge_type.to_string(), properties },
        );
        Ok(id)
    }

    async fn upsert_node(&self, label: &str, id_prop: &str, properties: PropertyMap) -> Result<(), StoreError> {
        let id = properties
            .get(id_prop)
            .and_then(|v| v.as_str())
            .ok_or_else(|| StoreError::Graph(format!("upsert_node: missing id property {id_prop}")))?
            .to_string();
        let mut nodes = self.nodes.lock().unwrap();
        match nodes.get_mut(&id) {
            Some((_, existing)) => {
                for (k, v) in properties {
                    existing.insert(k, v);
                }
            }
            None => {
                nodes.insert(id, (label.to_string(), properties));
            }
        }
        Ok(())
    }

    async fn batch_create(&self, nodes: Vec<GraphNode>, edges: Vec<GraphEdge>) -> Result<BatchCounts, StoreError> {
        let mut counts = BatchCounts::default();
        {
            let mut store = self.nodes.lock().unwrap();
            for node in nodes {
                store.insert(node.id.clone(), (node.label.clone(), node.properties.clone()));
                counts.nodes_created += 1;
            }
        }
        {
            let mut store = self.edges.lock().unwrap();
            for edge in edges {
                store.insert(
                    edge.id.clone(),
                    StoredEdge {
                        id: edge.id.clone(),
                        src: edge.source_id.clone(),
                        dst: edge.target_id.clone(),
                        edge_type: edge.edge_type.as_label().to_string(),
                        properties: edge.properties.clone(),
                    },
                );
                counts.edges_created += 1;
            }
        }
        Ok(counts)
    }

    async fn vector_knn(
        &self,
        label: &str,
        _property: &str,
        query_vec: &[f32],
        k: usize,
        min_score: f32,
    ) -> Result<Vec<KnnMatch>, StoreError> {
        let mut scored: Vec<KnnMatch> = self
            .nodes
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, (l, _))| l == label)
            .filter_map(|(id, (_, props))| {
                let embedding = Self::embedding_of(props)?;
                let score = super::cosine_similarity_unit(query_vec, &embedding);
                (score >= min_score).then(|| KnnMatch { node_id: id.clone(), score, properties: props.clone() })
            })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }

    async fn full_text(&self, label: &str, property: &str, query: &str, k: usize) -> Result<Vec<KnnMatch>, StoreError> {
        let needle = query.to_lowercase();
        let mut matches: Vec<KnnMatch> = self
            .nodes
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, (l, _))| l == label)
            .filter_map(|(id, (_, props))| {
                let text = props.get(property)?.as_str()?.to_lowercase();
                text.contains(&needle).then(|| KnnMatch { node_id: id.clone(), score: 1.0, properties: props.clone() })
            })
            .collect();
        matches.truncate(k);
        Ok(matches)
    }

    async fn traversal(&self, _query: &str, _params: PropertyMap) -> Result<Vec<TraversalRow>, StoreError> {
        // Arbitrary Cypher traversal has no in-memory equivalent; callers
        // that need generic traversal in tests should use the node/edge
        // accessor methods directly instead.
        Ok(Vec::new())
    }

    async fn rewire_edges(&self, from_id: &str, to_id: &str) -> Result<(), StoreError> {
        InMemoryGraphStore::rewire_edges(self, from_id, to_id);
        Ok(())
    }

    async fn delete_node(&self, node_id: &str) -> Result<(), StoreError> {
        self.nodes.lock().unwrap().remove(node_id);
        self.edges.lock().unwrap().retain(|_, e| e.src != node_id && e.dst != node_id);
        Ok(())
    }

    async fn get_node(&self, node_id: &str) -> Result<Option<PropertyMap>, StoreError> {
        Ok(self.nodes.lock().unwrap().get(node_id).map(|(_, props)| props.clone()))
    }

    async fn drop_label(&self, label: &str) -> Result<(), StoreError> {
        let ids: Vec<String> =
            self.nodes.lock().unwrap().iter().filter(|(_, (l, _))| l == label).map(|(id, _)| id.clone()).collect();
        for id in ids {
            self.delete_node(&id).await?;
        }
        Ok(())
    }

    async fn clear_property(&self, label: &str, property: &str) -> Result<(), StoreError> {
        let mut nodes = self.nodes.lock().unwrap();
        for (_, (node_label, props)) in nodes.iter_mut() {
            if node_label == label {
                props.remove(property);
            }
        }
        Ok(())
    }

    async fn ensure_vector_index(&self, _label: &str, _dimension: usize) -> Result<(), StoreError> {
        // No real index infrastructure in-memory; `vector_knn` already
        // scans every node of the label.
        Ok(())
    }

    async fn ensure_full_text_index(&self, _label: &str, _property: &str) -> Result<(), StoreError> {
        Ok(())
    }
}

impl InMemoryGraphStore {
    /// Edges incident to `node_id`, as `(other_id, edge_type, is_outgoing)`.
    pub fn edges_incident(&self, node_id: &str) -> Vec<(String, String, bool)> {
        self.edges
            .lock()
            .unwrap()
            .values()
            .filter_map(|e| {
                if e.src == node_id {
                    Some((e.dst.clone(), e.edge_type.clone(), true))
                } else if e.dst == node_id {
                    Some((e.src.clone(), e.edge_type.clone(), false))
                } else {
                    None
                }
            })
            .collect()
    }

    /// Rewires every edge incident to `from` so the endpoint matching `from`
    /// becomes `to`, collapsing duplicates of the same `(other, type,
    /// direction)` triple (spec §4.8 step 3).
    pub fn rewire_edges(&self, from: &str, to: &str) {
        let mut edges = self.edges.lock().unwrap();
        let mut seen: std::collections::HashSet<(String, String, bool)> = std::collections::HashSet::new();
        let mut to_delete = Vec::new();

        for (id, edge) in edges.iter_mut() {
            let touches_from_as_src = edge.src == from;
            let touches_from_as_dst = edge.dst == from;
            if !touches_from_as_src && !touches_from_as_dst {
                continue;
            }
            let other = if touches_from_as_src { edge.dst.clone() } else { edge.src.clone() };
            if other == to {
                // Self-loop after rewire would be created; drop instead.
                to_delete.push(id.clone());
                continue;
            }
            let key = (other.clone(), edge.edge_type.clone(), touches_from_as_src);
            if !seen.insert(key) {
                to_delete.push(id.clone());
                continue;
            }
            if touches_from_as_src {
                edge.src = to.to_string();
            }
            if touches_from_as_dst {
                edge.dst = to.to_string();
            }
        }
        for id in to_delete {
            edges.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::property::PropertyValue;

    fn props_with_embedding(v: Vec<f32>) -> PropertyMap {
        let mut p = PropertyMap::new();
        p.insert("embedding".into(), PropertyValue::List(v.into_iter().map(|f| PropertyValue::Number(f as f64)).collect()));
        p
    }

    #[tokio::test]
    async fn vector_knn_ranks_by_similarity() {
        let store = InMemoryGraphStore::new();
        store.create_node("Entity", {
            let mut p = props_with_embedding(vec![1.0, 0.0]);
            p.insert("id".into(), "a".into());
            p
        }).await.unwrap();
        store.create_node("Entity", {
            let mut p = props_with_embedding(vec![0.0, 1.0]);
            p.insert("id".into(), "b".into());
            p
        }).await.unwrap();

        let results = store.vector_knn("Entity", "embedding", &[1.0, 0.0], 5, 0.0).await.unwrap();
        assert_eq!(results[0].node_id, "a");
    }

    #[tokio::test]
    async fn rewire_edges_collapses_duplicates() {
        let store = InMemoryGraphStore::new();
        store.create_edge("dup1", "other", "MENTIONS", PropertyMap::new()).await.unwrap();
        store.create_edge("dup2", "other", "MENTIONS", PropertyMap::new()).await.unwrap();
        store.rewire_edges("dup2", "dup1");
        let incident = store.edges_incident("dup1");
        assert_eq!(incident.len(), 1);
    }

    #[tokio::test]
    async fn delete_node_removes_incident_edges() {
        let store = InMemoryGraphStore::new();
        store.create_edge("a", "b", "REL", PropertyMap::new()).await.unwrap();
        store.delete_node("a").await.unwrap();
        assert_eq!(store.edge_count(), 0);
    }
}
