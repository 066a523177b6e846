//! C12: graph merger (spec §4.8).
//!
//! Applies the merge operations C10 decided on to the shared graph store.
//! Grounded on `graph_store::memory::InMemoryGraphStore::rewire_edges` (the
//! edge-rewiring primitive it defines) and on a transaction-per-write
//! style for the live Neo4j backend.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{info, warn};

use crate::domain::ids::entity_node_id;
use crate::domain::{PropertyMap, PropertyValue};
use crate::errors::StoreError;
use crate::graph_store::GraphStore;

/// One merge decided by the unification agent (C10), ids already resolved
/// against the store at fragment-write time.
#[derive(Debug, Clone)]
pub struct MergeOperation {
    pub primary_id: String,
    pub primary_name: String,
    pub primary_entity_type: String,
    pub duplicate_ids: Vec<String>,
    pub merged_name: String,
    pub merged_description: String,
}

#[derive(Debug, Clone, Default)]
pub struct MergeOutcome {
    pub primary_id: String,
    pub duplicates_merged: usize,
    pub duplicates_already_absent: usize,
}

/// Serializes merge operations that touch overlapping node ids (spec §5
/// "Shared resources" (b)): a per-node lock, held for the duration of one
/// operation, taken in sorted id order to avoid deadlock across concurrent
/// operations with partially overlapping node sets.
#[derive(Default)]
pub struct NodeLockRegistry {
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl NodeLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, node_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks.entry(node_id.to_string()).or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))).clone()
    }

    /// Acquires every lock for `node_ids`, sorted, and holds them until the
    /// returned guards are dropped.
    async fn acquire_all(&self, node_ids: &[String]) -> Vec<tokio::sync::OwnedMutexGuard<()>> {
        let mut sorted = node_ids.to_vec();
        sorted.sort();
        sorted.dedup();
        let mut guards = Vec::with_capacity(sorted.len());
        for id in &sorted {
            let lock = self.lock_for(id);
            guards.push(lock.lock_owned().await);
        }
        guards
    }
}

pub struct GraphMerger<'a> {
    store: &'a dyn GraphStore,
    locks: &'a NodeLockRegistry,
    alias_max: usize,
}

impl<'a> GraphMerger<'a> {
    pub fn new(store: &'a dyn GraphStore, locks: &'a NodeLockRegistry, alias_max: usize) -> Self {
        Self { store, locks, alias_max }
    }

    /// Applies one merge operation (spec §4.8 steps 1-4), idempotently.
    pub async fn apply(&self, op: &MergeOperation) -> Result<MergeOutcome, StoreError> {
        let mut touched = op.duplicate_ids.clone();
        touched.push(op.primary_id.clone());
        let _guards = self.locks.acquire_all(&touched).await;

        let primary_id = self.resolve_primary(op).await?;
        self.update_primary(op, &primary_id).await?;

        let mut outcome = MergeOutcome { primary_id: primary_id.clone(), ..Default::default() };
        for duplicate_id in &op.duplicate_ids {
            if duplicate_id == &primary_id {
                continue;
            }
            match self.store.get_node(duplicate_id).await? {
                None => {
                    outcome.duplicates_already_absent += 1;
                    continue;
                }
                Some(_) => {
                    self.store.rewire_edges(duplicate_id, &primary_id).await?;
                    self.store.delete_node(duplicate_id).await?;
                    outcome.duplicates_merged += 1;
                }
            }
        }

        info!(primary_id, merged = outcome.duplicates_merged, "merge operation applied");
        Ok(outcome)
    }

    /// Step 1: prefer an existing node at the canonical `(name, type)` id
    /// over a freshly-extracted primary id (spec §4.8 "stable id preservation").
    async fn resolve_primary(&self, op: &MergeOperation) -> Result<String, StoreError> {
        let canonical_id = entity_node_id(&op.primary_name, &op.primary_entity_type);
        if canonical_id != op.primary_id {
            if let Some(_existing) = self.store.get_node(&canonical_id).await? {
                return Ok(canonical_id);
            }
        }
        Ok(op.primary_id.clone())
    }

    /// Step 2: merges names/aliases/confidence onto the primary node.
    async fn update_primary(&self, op: &MergeOperation, primary_id: &str) -> Result<(), StoreError> {
        let existing = self.store.get_node(primary_id).await?.unwrap_or_default();

        let mut alias_set: Vec<String> = Vec::new();
        if let Some(PropertyValue::List(items)) = existing.get("aliases") {
            alias_set.extend(items.iter().filter_map(|v| v.as_str().map(str::to_string)));
        }
        if let Some(name) = existing.get("name").and_then(|v| v.as_str()) {
            if name != op.merged_name {
                alias_set.push(name.to_string());
            }
        }
        for duplicate_id in &op.duplicate_ids {
            if let Some(duplicate) = self.store.get_node(duplicate_id).await? {
                if let Some(name) = duplicate.get("name").and_then(|v| v.as_str()) {
                    if name != op.merged_name {
                        alias_set.push(name.to_string());
                    }
                }
                if let Some(PropertyValue::List(items)) = duplicate.get("aliases") {
                    alias_set.extend(items.iter().filter_map(|v| v.as_str().map(str::to_string)));
                }
            }
        }

        alias_set.sort();
        alias_set.dedup();
        alias_set.sort_by_key(|a| a.len());
        alias_set.truncate(self.alias_max);
        if alias_set.len() == self.alias_max {
            warn!(primary_id, alias_max = self.alias_max, "alias list truncated at configured cap");
        }

        let prior_confidence = existing.get("confidence").and_then(|v| v.as_f64()).unwrap_or(0.5);
        let prior_merge_count = existing.get("merge_count").and_then(|v| v.as_f64()).unwrap_or(0.0);

        let mut properties = PropertyMap::new();
        properties.insert("id".into(), primary_id.to_string().into());
        properties.insert("name".into(), op.merged_name.clone().into());
        properties.insert("description".into(), op.merged_description.clone().into());
        properties.insert(
            "aliases".into(),
            PropertyValue::List(alias_set.into_iter().map(PropertyValue::String).collect()),
        );
        properties.insert("merge_count".into(), (prior_merge_count + 1.0).into());
        properties.insert("confidence".into(), (prior_confidence + 0.1).min(1.0).into());
        properties.insert("updated_at".into(), chrono::Utc::now().to_rfc3339().into());

        self.store.upsert_node("Entity", "id", properties).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph_store::memory::InMemoryGraphStore;

    fn node_props(id: &str, name: &str, confidence: f64) -> PropertyMap {
        let mut p = PropertyMap::new();
        p.insert("id".into(), id.into());
        p.insert("name".into(), name.into());
        p.insert("description".into(), "a company".into());
        p.insert("confidence".into(), confidence.into());
        p
    }

    #[tokio::test]
    async fn merge_rewires_edges_and_deletes_duplicate() {
        let store = InMemoryGraphStore::new();
        store.create_node("Entity", node_props("primary", "Apple", 0.8)).await.unwrap();
        store.create_node("Entity", node_props("dup", "Apple Inc", 0.7)).await.unwrap();
        store.create_node("Entity", node_props("other", "Tim Cook", 0.9)).await.unwrap();
        store.create_edge("dup", "other", "RELATIONSHIP", PropertyMap::new()).await.unwrap();

        let locks = NodeLockRegistry::new();
        let merger = GraphMerger::new(&store, &locks, 20);
        let op = MergeOperation {
            primary_id: "primary".into(),
            primary_name: "Apple".into(),
            primary_entity_type: "organization".into(),
            duplicate_ids: vec!["dup".into()],
            merged_name: "Apple".into(),
            merged_description: "a technology company".into(),
        };
        let outcome = merger.apply(&op).await.unwrap();
        assert_eq!(outcome.duplicates_merged, 1);
        assert!(store.get_node("dup").await.unwrap().is_none());
        let incident = store.edges_incident("primary");
        assert_eq!(incident.len(), 1);
    }

    #[tokio::test]
    async fn reapplying_merge_is_idempotent() {
        let store = InMemoryGraphStore::new();
        store.create_node("Entity", node_props("primary", "Apple", 0.8)).await.unwrap();
        let locks = NodeLockRegistry::new();
        let merger = GraphMerger::new(&store, &locks, 20);
        let op = MergeOperation {
            primary_id: "primary".into(),
            primary_name: "Apple".into(),
            primary_entity_type: "organization".into(),
            duplicate_ids: vec!["already_gone".into()],
            merged_name: "Apple".into(),
            merged_description: "a technology company".into(),
        };
        merger.apply(&op).await.unwrap();
        let second = merger.apply(&op).await.unwrap();
        assert_eq!(second.duplicates_already_absent, 1);
        assert_eq!(second.duplicates_merged, 0);
    }

    #[tokio::test]
    async fn aliases_are_capped_and_sorted_by_length() {
        let store = InMemoryGraphStore::new();
        store.create_node("Entity", node_props("primary", "Apple", 0.8)).await.unwrap();
        for (i, name) in ["A Very Long Alternate Corporate Name", "Apple", "AAPL"].iter().enumerate() {
            let id = format!("dup{i}");
            store.create_node("Entity", node_props(&id, name, 0.6)).await.unwrap();
        }
        let locks = NodeLockRegistry::new();
        let merger = GraphMerger::new(&store, &locks, 2);
        let op = MergeOperation {
            primary_id: "primary".into(),
            primary_name: "Apple".into(),
            primary_entity_type: "organization".into(),
            duplicate_ids: vec!["dup0".into(), "dup1".into(), "dup2".into()],
            merged_name: "Apple".into(),
            merged_description: "a technology company".into(),
        };
        merger.apply(&op).await.unwrap();
        let primary = store.get_node("primary").await.unwrap().unwrap();
        let PropertyValue::List(aliases) = primary.get("aliases").unwrap() else { panic!("expected list") };
        assert_eq!(aliases.len(), 2);
    }
}
