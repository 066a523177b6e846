//! C11: graph fragment builder (spec §4.7).
//!
//! Builds an in-memory `GraphFragment` (Document/Chunk/Entity nodes and
//! PART_OF/FIRST_CHUNK/NEXT_CHUNK/HAS_ENTITY/RELATIONSHIP edges): the
//! pipeline constructs the fragment, validates it, and only then hands it
//! to the graph store (C3) for a single batched write.

use std::collections::HashMap;

use chrono::Utc;

use crate::domain::ids::{entity_node_id, relation_edge_id};
use crate::domain::{Chunk, Document, Entity, GraphEdge, GraphFragment, GraphNode, PropertyMap, Relation};
use crate::extractor::ExtractionResult;

/// Per-chunk extraction results, keyed by the owning chunk.
pub struct ChunkExtraction<'a> {
    pub chunk: &'a Chunk,
    pub extraction: &'a ExtractionResult,
}

/// Builds the fragment for one document: one Document node, one Chunk node
/// per chunk plus `FIRST_CHUNK`/`NEXT_CHUNK`/`PART_OF` edges, one Entity
/// node per unique `(canonicalized name, type)` plus `HAS_ENTITY` edges,
/// and one `RELATIONSHIP` edge per extracted relation (spec §4.7).
pub fn build_fragment(document: &Document, chunks: &[Chunk], extractions: &[ChunkExtraction<'_>]) -> GraphFragment {
    let mut fragment = GraphFragment::default();
    let document_node_id = format!("document_{}", document.id);

    fragment.nodes.push(document_node(document, &document_node_id));

    for (i, chunk) in chunks.iter().enumerate() {
        fragment.nodes.push(chunk_node(chunk));
        fragment.edges.push(GraphEdge {
            id: format!("part_of_{}", chunk.id),
            source_id: chunk.id.clone(),
            target_id: document_node_id.clone(),
            edge_type: crate::domain::EdgeType::PartOf,
            properties: PropertyMap::new(),
        });
        if i == 0 {
            fragment.edges.push(GraphEdge {
                id: format!("first_chunk_{}", chunk.id),
                source_id: document_node_id.clone(),
                target_id: chunk.id.clone(),
                edge_type: crate::domain::EdgeType::FirstChunk,
                properties: PropertyMap::new(),
            });
        }
        if i > 0 {
            let prev = &chunks[i - 1];
            fragment.edges.push(GraphEdge {
                id: format!("next_chunk_{}_{}", prev.id, chunk.id),
                source_id: prev.id.clone(),
                target_id: chunk.id.clone(),
                edge_type: crate::domain::EdgeType::NextChunk,
                properties: PropertyMap::new(),
            });
        }
    }

    let mut entities_by_node_id: HashMap<String, Entity> = HashMap::new();
    let mut extraction_id_to_node_id: HashMap<String, String> = HashMap::new();

    for item in extractions {
        for entity in &item.extraction.entities {
            let node_id = entity_node_id(&entity.name, &entity.entity_type);
            extraction_id_to_node_id.insert(entity.id.clone(), node_id.clone());

            entities_by_node_id
                .entry(node_id)
                .and_modify(|existing| merge_entity_mentions(existing, entity))
                .or_insert_with(|| entity.clone());
        }
    }

    for (node_id, entity) in &entities_by_node_id {
        fragment.nodes.push(GraphNode { id: node_id.clone(), label: "Entity".to_string(), properties: entity_properties(entity) });
        for chunk_id in &entity.chunk_ids {
            fragment.edges.push(GraphEdge {
                id: format!("has_entity_{chunk_id}_{node_id}"),
                source_id: chunk_id.clone(),
                target_id: node_id.clone(),
                edge_type: crate::domain::EdgeType::HasEntity,
                properties: PropertyMap::new(),
            });
        }
    }

    for item in extractions {
        for relation in &item.extraction.relations {
            let (Some(source_node), Some(target_node)) =
                (extraction_id_to_node_id.get(&relation.source_id), extraction_id_to_node_id.get(&relation.target_id))
            else {
                continue;
            };
            let edge_id = relation_edge_id(source_node, target_node, &relation.relation_type);
            fragment.edges.push(GraphEdge {
                id: edge_id,
                source_id: source_node.clone(),
                target_id: target_node.clone(),
                edge_type: crate::domain::EdgeType::Relationship,
                properties: relation_properties(relation),
            });
        }
    }

    fragment
}

fn document_node(document: &Document, node_id: &str) -> GraphNode {
    let mut properties = PropertyMap::new();
    properties.insert("postgresql_id".into(), document.id.to_string().into());
    properties.insert("file_type".into(), document.file_type.clone().into());
    properties.insert("file_size".into(), document.location.as_ref().map(|l| l.size as f64).unwrap_or(0.0).into());
    properties.insert("created_at".into(), document.created_at.to_rfc3339().into());
    GraphNode { id: node_id.to_string(), label: "Document".to_string(), properties }
}

fn chunk_node(chunk: &Chunk) -> GraphNode {
    let mut properties = PropertyMap::new();
    properties.insert("document_id".into(), chunk.document_id.to_string().into());
    properties.insert("index".into(), (chunk.index as f64).into());
    properties.insert("text".into(), chunk.text.clone().into());
    properties.insert("start_char".into(), (chunk.start_char as f64).into());
    properties.insert("end_char".into(), (chunk.end_char as f64).into());
    properties.insert("word_count".into(), (chunk.word_count as f64).into());
    properties.insert("paragraph_count".into(), (chunk.paragraph_count as f64).into());
    properties.insert("chunk_type".into(), format!("{:?}", chunk.chunk_type).to_lowercase().into());
    if let Some(title) = &chunk.section_title {
        properties.insert("section_title".into(), title.clone().into());
    }
    if let Some(level) = chunk.heading_level {
        properties.insert("heading_level".into(), (level as f64).into());
    }
    properties.insert("created_at".into(), chunk.created_at.to_rfc3339().into());
    if let Some(embedding) = &chunk.embedding {
        properties.insert(
            "embedding".into(),
            crate::domain::PropertyValue::List(embedding.iter().map(|v| crate::domain::PropertyValue::Number(*v as f64)).collect()),
        );
    }
    GraphNode { id: chunk.id.clone(), label: "Chunk".to_string(), properties }
}

fn entity_properties(entity: &Entity) -> PropertyMap {
    let mut properties = entity.properties.clone();
    properties.insert("id".into(), entity.id.clone().into());
    properties.insert("name".into(), entity.name.clone().into());
    properties.insert("type".into(), entity.entity_type.clone().into());
    properties.insert("description".into(), entity.description.clone().into());
    properties.insert("confidence".into(), (entity.confidence as f64).into());
    properties.insert("source_text_excerpt".into(), entity.source_text_excerpt.clone().into());
    properties.insert(
        "chunk_ids".into(),
        crate::domain::PropertyValue::List(entity.chunk_ids.iter().map(|c| crate::domain::PropertyValue::String(c.clone())).collect()),
    );
    properties.insert(
        "aliases".into(),
        crate::domain::PropertyValue::List(entity.aliases.iter().map(|a| crate::domain::PropertyValue::String(a.clone())).collect()),
    );
    properties.insert("quality_score".into(), (entity.quality_score as f64).into());
    properties.insert("importance_score".into(), (entity.importance_score as f64).into());
    properties.insert("created_at".into(), entity.created_at.to_rfc3339().into());
    properties
}

fn relation_properties(relation: &Relation) -> PropertyMap {
    let mut properties = relation.properties.clone();
    properties.insert("relationship_type".into(), relation.relation_type.clone().into());
    properties.insert("description".into(), relation.description.clone().into());
    properties.insert("confidence".into(), (relation.confidence as f64).into());
    properties
}

/// Merges a second mention of the same canonical entity into `existing`:
/// unions `chunk_ids`, keeps the higher confidence description.
fn merge_entity_mentions(existing: &mut Entity, other: &Entity) {
    existing.chunk_ids.extend(other.chunk_ids.iter().cloned());
    if other.confidence > existing.confidence {
        existing.description = other.description.clone();
        existing.confidence = other.confidence;
    }
    existing.updated_at = Utc::now();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ChunkType;

    fn sample_document() -> Document {
        Document::new(1, 1, "a.txt", "text/plain")
    }

    fn sample_chunk(id: &str, index: usize) -> Chunk {
        crate::domain::chunk::new_chunk(id.to_string(), 1, index, 0, 10, "some text".into(), ChunkType::Content, None, None)
    }

    fn sample_entity(id: &str, chunk_id: &str) -> Entity {
        let now = Utc::now();
        Entity {
            id: id.to_string(),
            name: "Apple Inc.".into(),
            entity_type: "organization".into(),
            description: "tech company".into(),
            properties: PropertyMap::new(),
            confidence: 0.9,
            source_text_excerpt: "Apple Inc.".into(),
            start_char: None,
            end_char: None,
            aliases: Default::default(),
            embedding: None,
            quality_score: 0.9,
            importance_score: 0.0,
            merged_from: Default::default(),
            chunk_ids: std::iter::once(chunk_id.to_string()).collect(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn fragment_validates_and_links_chunks() {
        let document = sample_document();
        let chunks = vec![sample_chunk("c0", 0), sample_chunk("c1", 1)];
        let extractions = vec![];
        let fragment = build_fragment(&document, &chunks, &extractions);
        assert!(fragment.validate().is_ok());
        assert!(fragment.edges.iter().any(|e| e.edge_type == crate::domain::EdgeType::FirstChunk));
        assert!(fragment.edges.iter().any(|e| e.edge_type == crate::domain::EdgeType::NextChunk));
    }

    #[test]
    fn duplicate_entity_mentions_collapse_to_one_node() {
        let document = sample_document();
        let chunks = vec![sample_chunk("c0", 0), sample_chunk("c1", 1)];
        let e1 = sample_entity("c0_entity_0", "c0");
        let e2 = sample_entity("c1_entity_0", "c1");
        let extraction0 = ExtractionResult { entities: vec![e1], relations: vec![] };
        let extraction1 = ExtractionResult { entities: vec![e2], relations: vec![] };
        let extractions = vec![
            ChunkExtraction { chunk: &chunks[0], extraction: &extraction0 },
            ChunkExtraction { chunk: &chunks[1], extraction: &extraction1 },
        ];
        let fragment = build_fragment(&document, &chunks, &extractions);
        let entity_nodes: Vec<_> = fragment.nodes.iter().filter(|n| n.label == "Entity").collect();
        assert_eq!(entity_nodes.len(), 1);
        let has_entity_edges = fragment.edges.iter().filter(|e| e.edge_type == crate::domain::EdgeType::HasEntity).count();
        assert_eq!(has_entity_edges, 2);
    }

    #[test]
    fn dangling_relation_endpoints_are_skipped() {
        let document = sample_document();
        let chunks = vec![sample_chunk("c0", 0)];
        let relation = Relation {
            id: "r".into(),
            source_id: "missing_1".into(),
            source_name: "A".into(),
            target_id: "missing_2".into(),
            target_name: "B".into(),
            relation_type: "causes".into(),
            description: String::new(),
            properties: PropertyMap::new(),
            confidence: 0.9,
            source_text_excerpt: String::new(),
            chunk_id: "c0".into(),
        };
        let extraction0 = ExtractionResult { entities: vec![], relations: vec![relation] };
        let extractions = vec![ChunkExtraction { chunk: &chunks[0], extraction: &extraction0 }];
        let fragment = build_fragment(&document, &chunks, &extractions);
        assert!(fragment.validate().is_ok());
        assert!(fragment.edges.iter().all(|e| e.edge_type != crate::domain::EdgeType::Relationship));
    }
}
