//! C14: pipeline orchestrator (spec §4.1).
//!
//! Two weighted, observable, step-sequenced pipelines driving the
//! `Task`/`TaskStep` model, plus a third pipeline for the explicit
//! entity-unification trigger (spec §6 "separate endpoint"). Every step
//! records its outcome on the `Task` and hands it to a `TaskUpdateSink` so
//! callers (the task service, C15) can persist and fan it out without this
//! module knowing how.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tracing::info;

use crate::chunker::{self, ChunkParams, ChunkStrategy};
use crate::config::{AppConfig, UnificationMode};
use crate::domain::{Chunk, Document, DocumentStatus, Entity, ObjectLocation, PropertyMap, PropertyValue, Task, TaskStatus, TaskStep};
use crate::embedding::EmbeddingClient;
use crate::errors::{CoreError, StoreError};
use crate::extractor::{ExtractionResult, Extractor};
use crate::fragment::{build_fragment, ChunkExtraction};
use crate::graph_store::{GraphStore, TraversalRow};
use crate::llm::LlmClient;
use crate::merger::{GraphMerger, MergeOperation, NodeLockRegistry};
use crate::metadata_store::MetadataStore;
use crate::object_store::{object_key, ObjectStore};
use crate::text_extract::{self, DocumentKind};
use crate::unification::{CandidateEntity, UnificationAgent, UnificationOutcome};

fn store_err(e: StoreError) -> CoreError {
    CoreError::ExternalPermanent(e.to_string())
}

/// A per-task cooperative cancellation flag (spec §5 "Cancellation is
/// cooperative"). Cloning shares the same underlying flag.
#[derive(Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Receives every `Task` state change as it happens, so the caller can
/// persist it and fan it out to subscribers (spec §6 "streaming progress
/// interface"). The pipeline itself has no opinion on how updates are
/// stored or broadcast.
#[async_trait]
pub trait TaskUpdateSink: Send + Sync {
    async fn publish(&self, task: &Task) -> Result<(), CoreError>;
}

/// The collaborators every pipeline needs, borrowed for the duration of one
/// run.
pub struct PipelineRunner<'a> {
    pub object_store: &'a dyn ObjectStore,
    pub metadata_store: &'a dyn MetadataStore,
    pub graph_store: &'a dyn GraphStore,
    pub embedding: &'a dyn EmbeddingClient,
    pub llm: &'a dyn LlmClient,
    pub cfg: &'a AppConfig,
    pub locks: &'a NodeLockRegistry,
}

impl<'a> PipelineRunner<'a> {
    pub fn new(
        object_store: &'a dyn ObjectStore,
        metadata_store: &'a dyn MetadataStore,
        graph_store: &'a dyn GraphStore,
        embedding: &'a dyn EmbeddingClient,
        llm: &'a dyn LlmClient,
        cfg: &'a AppConfig,
        locks: &'a NodeLockRegistry,
    ) -> Self {
        Self { object_store, metadata_store, graph_store, embedding, llm, cfg, locks }
    }

    fn merger(&self) -> GraphMerger<'_> {
        GraphMerger::new(self.graph_store, self.locks, self.cfg.alias_max)
    }
}

macro_rules! check_cancel {
    ($task:expr, $sink:expr, $cancel:expr, $idx:expr) => {
        if $cancel.is_cancelled() {
            cancel_remaining($task, $sink, $idx).await;
            return Ok(());
        }
    };
}

async fn start_step(task: &mut Task, sink: &dyn TaskUpdateSink, index: usize) -> Result<(), CoreError> {
    task.steps[index].mark_running();
    task.status = TaskStatus::Running;
    if task.started_at.is_none() {
        task.started_at = Some(chrono::Utc::now());
    }
    sink.publish(task).await
}

async fn complete_step(task: &mut Task, sink: &dyn TaskUpdateSink, index: usize) -> Result<(), CoreError> {
    task.steps[index].mark_completed();
    task.recompute_progress();
    task.recompute_status();
    if task.status == TaskStatus::Completed {
        task.completed_at = Some(chrono::Utc::now());
    }
    sink.publish(task).await
}

async fn fail_step(task: &mut Task, sink: &dyn TaskUpdateSink, index: usize, error: &CoreError) {
    task.steps[index].mark_failed(error.kind(), error.to_string(), &format!("{error:?}"));
    task.recompute_progress();
    task.recompute_status();
    task.error = Some(error.to_string());
    task.completed_at = Some(chrono::Utc::now());
    let _ = sink.publish(task).await;
}

async fn cancel_remaining(task: &mut Task, sink: &dyn TaskUpdateSink, from_index: usize) {
    for step in task.steps.iter_mut().skip(from_index) {
        if matches!(step.status, TaskStatus::Pending | TaskStatus::Running) {
            step.mark_cancelled();
        }
    }
    task.recompute_progress();
    task.recompute_status();
    task.completed_at = Some(chrono::Utc::now());
    let _ = sink.publish(task).await;
}

async fn step_ok<T>(task: &mut Task, sink: &dyn TaskUpdateSink, index: usize, result: Result<T, CoreError>) -> Result<T, CoreError> {
    match result {
        Ok(value) => Ok(value),
        Err(error) => {
            fail_step(task, sink, index, &error).await;
            Err(error)
        }
    }
}

// --- RAG pipeline (spec §4.1, weights 5/10/30/15/30/10) ---

pub fn rag_steps() -> Vec<TaskStep> {
    vec![
        TaskStep::new("validate", "Validates the upload and creates the document record", "validate", 5.0),
        TaskStep::new("upload-bytes", "Stores the original bytes in the object store", "upload_bytes", 10.0),
        TaskStep::new("extract-text", "Extracts plain text from the source bytes", "extract_text", 30.0),
        TaskStep::new("preprocess", "Normalizes whitespace and line endings", "preprocess", 15.0),
        TaskStep::new("embed", "Chunks and embeds the document for retrieval", "embed", 30.0),
        TaskStep::new("store-vectors", "Writes chunk nodes and ensures the retrieval indexes", "store_vectors", 10.0),
    ]
}

pub fn new_rag_task(id: String, owner_id: i64) -> Task {
    Task::new(id, owner_id, "rag_ingest", "Document ingestion", rag_steps())
}

pub struct RagPipelineInput {
    pub document_id: i64,
    pub owner_id: i64,
    pub display_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
    pub metadata: PropertyMap,
}

/// Runs the RAG ingestion pipeline for one document (spec §4.1). Returns
/// `Ok(())` on completion, cancellation, or a step failure already recorded
/// on `task`; only a `sink.publish` failure escapes as `Err`.
pub async fn run_rag_pipeline(
    runner: &PipelineRunner<'_>,
    task: &mut Task,
    sink: &dyn TaskUpdateSink,
    cancel: &CancellationFlag,
    input: RagPipelineInput,
) -> Result<(), CoreError> {
    check_cancel!(task, sink, cancel, 0);
    start_step(task, sink, 0).await?;
    let validation = if input.bytes.is_empty() {
        Err(CoreError::InputInvalid("document bytes are empty".into()))
    } else if input.display_name.trim().is_empty() {
        Err(CoreError::InputInvalid("display name is required".into()))
    } else {
        Ok(())
    };
    step_ok(task, sink, 0, validation).await?;
    let mut document = Document::new(input.document_id, input.owner_id, input.display_name.clone(), input.content_type.clone());
    document.metadata = input.metadata.clone();
    step_ok(task, sink, 0, runner.metadata_store.create_document(document.clone()).await).await?;
    task.document_id = Some(document.id);
    complete_step(task, sink, 0).await?;

    check_cancel!(task, sink, cancel, 1);
    start_step(task, sink, 1).await?;
    let bucket = "documents";
    let key = object_key(document.owner_id, &document.display_name);
    let put_result = step_ok(task, sink, 1, runner.object_store.put(bucket, &key, &input.bytes, &input.content_type).await).await?;
    document.location = Some(ObjectLocation {
        bucket: bucket.to_string(),
        object_key: put_result.key.clone(),
        etag: put_result.etag.clone(),
        size: put_result.size,
        content_type: input.content_type.clone(),
    });
    document.status = DocumentStatus::Running;
    step_ok(task, sink, 1, runner.metadata_store.update_document(document.clone()).await).await?;
    complete_step(task, sink, 1).await?;

    check_cancel!(task, sink, cancel, 2);
    start_step(task, sink, 2).await?;
    let kind = DocumentKind::from_content_type(&input.content_type);
    let raw_text = step_ok(task, sink, 2, text_extract::extract_text(&input.bytes, kind)).await?;
    complete_step(task, sink, 2).await?;

    check_cancel!(task, sink, cancel, 3);
    start_step(task, sink, 3).await?;
    let preprocessed = text_extract::preprocess(&raw_text);
    complete_step(task, sink, 3).await?;

    check_cancel!(task, sink, cancel, 4);
    start_step(task, sink, 4).await?;
    let mut chunks = chunker::chunk_text(document.id, &preprocessed, ChunkStrategy::Fixed, ChunkParams::default(), &[]);
    if !chunks.is_empty() {
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = step_ok(
            task,
            sink,
            4,
            runner.embedding.embed(&texts, true, runner.cfg.embedding_call_policy.max_retries).await,
        )
        .await?;
        for (chunk, vector) in chunks.iter_mut().zip(vectors) {
            chunk.embedding = Some(vector);
        }
    }
    complete_step(task, sink, 4).await?;

    check_cancel!(task, sink, cancel, 5);
    start_step(task, sink, 5).await?;
    for chunk in &chunks {
        step_ok(task, sink, 5, runner.graph_store.upsert_node("Chunk", "id", chunk_vector_properties(chunk)).await.map_err(store_err)).await?;
    }
    step_ok(task, sink, 5, runner.graph_store.ensure_vector_index("Chunk", runner.cfg.vector_dimension).await.map_err(store_err)).await?;
    step_ok(task, sink, 5, runner.graph_store.ensure_full_text_index("Chunk", "text").await.map_err(store_err)).await?;
    document.status = DocumentStatus::Completed;
    step_ok(task, sink, 5, runner.metadata_store.update_document(document.clone()).await).await?;
    complete_step(task, sink, 5).await?;

    info!(document_id = document.id, chunks = chunks.len(), "RAG ingestion complete");
    Ok(())
}

fn chunk_vector_properties(chunk: &Chunk) -> PropertyMap {
    let mut props = PropertyMap::new();
    props.insert("id".into(), chunk.id.clone().into());
    props.insert("document_id".into(), chunk.document_id.to_string().into());
    props.insert("index".into(), (chunk.index as f64).into());
    props.insert("text".into(), chunk.text.clone().into());
    if let Some(embedding) = &chunk.embedding {
        props.insert("embedding".into(), PropertyValue::List(embedding.iter().map(|v| PropertyValue::Number(*v as f64)).collect()));
    }
    props
}

// --- Graph pipeline (spec §4.1, weights ~8/8/15/20/19/15/15) ---

pub fn graph_steps() -> Vec<TaskStep> {
    vec![
        TaskStep::new("parse", "Fetches the stored document and extracts plain text", "parse", 8.0),
        TaskStep::new("chunk", "Splits the document into bounded-length chunks", "chunk", 8.0),
        TaskStep::new("embed-chunks", "Embeds each chunk for entity unification", "embed_chunks", 15.0),
        TaskStep::new("extract", "Extracts entities and relations from each chunk", "extract", 20.0),
        TaskStep::new("unify", "Collapses near-duplicate entities within the document", "unify", 19.0),
        TaskStep::new("build-fragment", "Builds the graph fragment for this document", "build_fragment", 15.0),
        TaskStep::new("write-graph", "Writes the fragment to the graph store", "write_graph", 15.0),
    ]
}

pub fn new_graph_task(id: String, owner_id: i64, document_id: i64) -> Task {
    let mut task = Task::new(id, owner_id, "graph_ingest", "Knowledge graph construction", graph_steps());
    task.document_id = Some(document_id);
    task
}

pub struct GraphPipelineInput {
    pub document_id: i64,
}

/// Runs the knowledge-graph construction pipeline over an already-stored
/// document (spec §4.1, §4.7, §4.8). Idempotent: node/edge ids are
/// deterministic hashes of content, so re-running for the same document id
/// upserts rather than duplicates (spec §4.1 "at-least-once").
pub async fn run_graph_pipeline(
    runner: &PipelineRunner<'_>,
    task: &mut Task,
    sink: &dyn TaskUpdateSink,
    cancel: &CancellationFlag,
    input: GraphPipelineInput,
) -> Result<(), CoreError> {
    check_cancel!(task, sink, cancel, 0);
    start_step(task, sink, 0).await?;
    let document = step_ok(task, sink, 0, runner.metadata_store.get_document(input.document_id).await).await?;
    let document = step_ok(
        task,
        sink,
        0,
        document.ok_or_else(|| CoreError::InputInvalid(format!("document {} not found", input.document_id))),
    )
    .await?;
    let location = step_ok(
        task,
        sink,
        0,
        document
            .location
            .clone()
            .ok_or_else(|| CoreError::InputInvalid(format!("document {} has no stored content", input.document_id))),
    )
    .await?;
    let bytes = step_ok(task, sink, 0, runner.object_store.get(&location.bucket, &location.object_key).await).await?;
    let kind = DocumentKind::from_content_type(&location.content_type);
    let raw_text = step_ok(task, sink, 0, text_extract::extract_text(&bytes, kind)).await?;
    let preprocessed = text_extract::preprocess(&raw_text);
    task.document_id = Some(document.id);
    complete_step(task, sink, 0).await?;

    check_cancel!(task, sink, cancel, 1);
    start_step(task, sink, 1).await?;
    let mut chunks = chunker::chunk_text(document.id, &preprocessed, ChunkStrategy::Paragraph, ChunkParams::default(), &[]);
    complete_step(task, sink, 1).await?;

    check_cancel!(task, sink, cancel, 2);
    start_step(task, sink, 2).await?;
    if !chunks.is_empty() {
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = step_ok(
            task,
            sink,
            2,
            runner.embedding.embed(&texts, true, runner.cfg.embedding_call_policy.max_retries).await,
        )
        .await?;
        for (chunk, vector) in chunks.iter_mut().zip(vectors) {
            chunk.embedding = Some(vector);
        }
    }
    complete_step(task, sink, 2).await?;

    check_cancel!(task, sink, cancel, 3);
    start_step(task, sink, 3).await?;
    let extractor = Extractor::new(runner.llm, runner.cfg);
    let mut indexed: Vec<(usize, ExtractionResult)> = stream::iter(chunks.iter().enumerate())
        .map(|(i, chunk)| {
            let extractor = &extractor;
            async move { (i, extractor.extract(chunk).await) }
        })
        .buffer_unordered(runner.cfg.extraction_parallelism.max(1))
        .collect()
        .await;
    indexed.sort_by_key(|(i, _)| *i);
    let mut extraction_results: Vec<ExtractionResult> = indexed.into_iter().map(|(_, r)| r).collect();
    complete_step(task, sink, 3).await?;

    check_cancel!(task, sink, cancel, 4);
    start_step(task, sink, 4).await?;
    let mut candidates: Vec<CandidateEntity> = Vec::new();
    let mut locations: Vec<(usize, usize)> = Vec::new();
    for (ci, extraction) in extraction_results.iter().enumerate() {
        for (ei, entity) in extraction.entities.iter().enumerate() {
            candidates.push(CandidateEntity { entity: entity.clone(), from_graph: false });
            locations.push((ci, ei));
        }
    }
    let mut merge_group_count = 0usize;
    let mut independent_count = 0usize;
    let mut uncertain_count = 0usize;
    let mut merges_applied_within_doc = 0usize;
    if !candidates.is_empty() {
        let outcome = UnificationAgent::new(runner.llm, runner.embedding, runner.cfg).run(candidates.clone()).await;
        merge_group_count = outcome.merge_groups.len();
        independent_count = outcome.independent_indices.len();
        uncertain_count = outcome.uncertain_indices.len();
        for group in &outcome.merge_groups {
            let canonical_type = candidates[group.primary_index].entity.entity_type.clone();
            for &dup_idx in &group.duplicate_indices {
                if dup_idx == group.primary_index {
                    continue;
                }
                let (ci, ei) = locations[dup_idx];
                let alias = extraction_results[ci].entities[ei].name.clone();
                let dup_entity = &mut extraction_results[ci].entities[ei];
                dup_entity.name = group.merged_name.clone();
                dup_entity.entity_type = canonical_type.clone();
                dup_entity.aliases.insert(alias);
                merges_applied_within_doc += 1;
            }
            let (pci, pei) = locations[group.primary_index];
            let primary_entity = &mut extraction_results[pci].entities[pei];
            primary_entity.name = group.merged_name.clone();
            primary_entity.description = group.merged_description.clone();
        }
    }
    task.steps[4].detail.insert("merge_groups".into(), (merge_group_count as f64).into());
    task.steps[4].detail.insert("independent_entities".into(), (independent_count as f64).into());
    task.steps[4].detail.insert("uncertain_entities".into(), (uncertain_count as f64).into());
    task.steps[4].detail.insert("entities_merged_within_document".into(), (merges_applied_within_doc as f64).into());
    complete_step(task, sink, 4).await?;

    check_cancel!(task, sink, cancel, 5);
    start_step(task, sink, 5).await?;
    let chunk_extractions: Vec<ChunkExtraction<'_>> =
        chunks.iter().zip(extraction_results.iter()).map(|(chunk, extraction)| ChunkExtraction { chunk, extraction }).collect();
    let fragment = build_fragment(&document, &chunks, &chunk_extractions);
    step_ok(task, sink, 5, fragment.validate().map_err(|e| CoreError::Logic(format!("{e:?}")))).await?;
    complete_step(task, sink, 5).await?;

    check_cancel!(task, sink, cancel, 6);
    start_step(task, sink, 6).await?;
    let node_count = fragment.nodes.len();
    let edge_count = fragment.edges.len();
    let counts =
        step_ok(task, sink, 6, runner.graph_store.batch_create(fragment.nodes, fragment.edges).await.map_err(store_err)).await?;
    task.steps[6].detail.insert("nodes_created".into(), (counts.nodes_created as f64).into());
    task.steps[6].detail.insert("edges_created".into(), (counts.edges_created as f64).into());
    complete_step(task, sink, 6).await?;

    info!(document_id = document.id, nodes = node_count, edges = edge_count, "graph construction complete");
    Ok(())
}

// --- Entity unification pipeline (spec §4.6, §6 "trigger unification") ---

pub fn unification_steps() -> Vec<TaskStep> {
    vec![
        TaskStep::new("gather-candidates", "Collects candidate entities for the requested scope", "gather_candidates", 20.0),
        TaskStep::new("analyze", "Runs the unification agent over the candidate set", "analyze", 50.0),
        TaskStep::new("apply-merges", "Applies decided merges to the graph store", "apply_merges", 30.0),
    ]
}

pub fn new_unification_task(id: String, owner_id: i64, document_id: Option<i64>) -> Task {
    let mut task = Task::new(id, owner_id, "entity_unification", "Entity unification", unification_steps());
    task.document_id = document_id;
    task
}

pub struct UnificationTaskInput {
    pub document_id: Option<i64>,
    pub mode: UnificationMode,
}

const GLOBAL_SAMPLE_LIMIT: usize = 200;

/// Builds the generic graph-store traversal for each unification mode
/// (spec §4.6 "Batching" / §6 mode selection): `incremental` scopes to one
/// document's mentioned entities, `sampling` takes a bounded sample across
/// the whole graph, `global_semantic` considers every entity.
fn unification_query(input: &UnificationTaskInput) -> (String, PropertyMap) {
    match input.mode {
        UnificationMode::Incremental => {
            let mut params = PropertyMap::new();
            params.insert("document_id".into(), input.document_id.unwrap_or_default().to_string().into());
            (
                "MATCH (d:Document {postgresql_id: $document_id})<-[:PART_OF]-(:Chunk)-[:HAS_ENTITY]->(e:Entity) RETURN DISTINCT e".to_string(),
                params,
            )
        }
        UnificationMode::Sampling => (format!("MATCH (e:Entity) RETURN e LIMIT {GLOBAL_SAMPLE_LIMIT}"), PropertyMap::new()),
        UnificationMode::GlobalSemantic => ("MATCH (e:Entity) RETURN e".to_string(), PropertyMap::new()),
    }
}

fn row_to_candidate(row: &TraversalRow) -> Option<CandidateEntity> {
    let obj = &row.0;
    let id = obj.get("id")?.as_str()?.to_string();
    let name = obj.get("name")?.as_str()?.to_string();
    let entity_type = obj.get("type")?.as_str()?.to_string();
    let description = obj.get("description").and_then(|v| v.as_str()).unwrap_or_default().to_string();
    let confidence = obj.get("confidence").and_then(|v| v.as_f64()).unwrap_or(0.7) as f32;
    let now = chrono::Utc::now();
    Some(CandidateEntity {
        entity: Entity {
            id,
            name,
            entity_type,
            description,
            properties: PropertyMap::new(),
            confidence,
            source_text_excerpt: String::new(),
            start_char: None,
            end_char: None,
            aliases: Default::default(),
            embedding: None,
            quality_score: 0.0,
            importance_score: 0.0,
            merged_from: Default::default(),
            chunk_ids: Default::default(),
            created_at: now,
            updated_at: now,
        },
        from_graph: true,
    })
}

/// Runs the entity-unification pipeline triggered explicitly by a client
/// (spec §6 "separate endpoint ... for a document id + mode"), as opposed
/// to the graph pipeline's implicit within-document unify step.
pub async fn run_unification_pipeline(
    runner: &PipelineRunner<'_>,
    task: &mut Task,
    sink: &dyn TaskUpdateSink,
    cancel: &CancellationFlag,
    input: UnificationTaskInput,
) -> Result<(), CoreError> {
    check_cancel!(task, sink, cancel, 0);
    start_step(task, sink, 0).await?;
    let (query, params) = unification_query(&input);
    let rows = step_ok(task, sink, 0, runner.graph_store.traversal(&query, params).await.map_err(store_err)).await?;
    let candidates: Vec<CandidateEntity> = rows.iter().filter_map(row_to_candidate).collect();
    task.steps[0].detail.insert("candidates_found".into(), (candidates.len() as f64).into());
    complete_step(task, sink, 0).await?;

    check_cancel!(task, sink, cancel, 1);
    start_step(task, sink, 1).await?;
    let outcome = if candidates.is_empty() {
        UnificationOutcome::default()
    } else {
        UnificationAgent::new(runner.llm, runner.embedding, runner.cfg).run(candidates.clone()).await
    };
    task.steps[1].detail.insert("merge_groups".into(), (outcome.merge_groups.len() as f64).into());
    task.steps[1].detail.insert("independent_entities".into(), (outcome.independent_indices.len() as f64).into());
    task.steps[1].detail.insert("uncertain_entities".into(), (outcome.uncertain_indices.len() as f64).into());
    complete_step(task, sink, 1).await?;

    check_cancel!(task, sink, cancel, 2);
    start_step(task, sink, 2).await?;
    let mut applied = 0usize;
    for group in &outcome.merge_groups {
        let primary = &candidates[group.primary_index];
        let duplicate_ids: Vec<String> =
            group.duplicate_indices.iter().filter(|&&i| i != group.primary_index).map(|&i| candidates[i].entity.id.clone()).collect();
        if duplicate_ids.is_empty() {
            continue;
        }
        let op = MergeOperation {
            primary_id: primary.entity.id.clone(),
            primary_name: primary.entity.name.clone(),
            primary_entity_type: primary.entity.entity_type.clone(),
            duplicate_ids,
            merged_name: group.merged_name.clone(),
            merged_description: group.merged_description.clone(),
        };
        step_ok(task, sink, 2, runner.merger().apply(&op).await.map_err(store_err)).await?;
        applied += 1;
    }
    task.steps[2].detail.insert("merge_operations_applied".into(), (applied as f64).into());
    complete_step(task, sink, 2).await?;

    info!(mode = ?input.mode, candidates = candidates.len(), merges = applied, "entity unification complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::embedding::build_embedding_client;
    use crate::graph_store::memory::InMemoryGraphStore;
    use crate::llm::build_llm_client;
    use crate::metadata_store::{InMemoryMetadataStore, MetadataStore};
    use crate::object_store::InMemoryObjectStore;

    struct NullSink;

    #[async_trait]
    impl TaskUpdateSink for NullSink {
        async fn publish(&self, _task: &Task) -> Result<(), CoreError> {
            Ok(())
        }
    }

    fn rag_input(document_id: i64) -> RagPipelineInput {
        RagPipelineInput {
            document_id,
            owner_id: 1,
            display_name: "report.txt".into(),
            content_type: "text/plain".into(),
            bytes: b"Apple Inc. was founded by Steve Jobs.\n\nApple makes the iPhone.".to_vec(),
            metadata: PropertyMap::new(),
        }
    }

    #[tokio::test]
    async fn rag_pipeline_completes_and_marks_document_completed() {
        let cfg = AppConfig::for_tests();
        let object_store = InMemoryObjectStore::new();
        let metadata_store = InMemoryMetadataStore::new();
        let graph_store = InMemoryGraphStore::new();
        let embedding = build_embedding_client(&cfg);
        let llm = build_llm_client(&cfg);
        let locks = NodeLockRegistry::new();
        let runner = PipelineRunner::new(&object_store, &metadata_store, &graph_store, embedding.as_ref(), llm.as_ref(), &cfg, &locks);

        let mut task = new_rag_task("t1".into(), 1);
        let cancel = CancellationFlag::new();
        run_rag_pipeline(&runner, &mut task, &NullSink, &cancel, rag_input(1)).await.unwrap();

        assert_eq!(task.status, TaskStatus::Completed);
        assert!((task.progress - 100.0).abs() < 1e-6);
        let document = metadata_store.get_document(1).await.unwrap().unwrap();
        assert_eq!(document.status, DocumentStatus::Completed);
        assert!(graph_store.node_count() > 0);
    }

    #[tokio::test]
    async fn rag_pipeline_fails_fast_on_empty_bytes() {
        let cfg = AppConfig::for_tests();
        let object_store = InMemoryObjectStore::new();
        let metadata_store = InMemoryMetadataStore::new();
        let graph_store = InMemoryGraphStore::new();
        let embedding = build_embedding_client(&cfg);
        let llm = build_llm_client(&cfg);
        let locks = NodeLockRegistry::new();
        let runner = PipelineRunner::new(&object_store, &metadata_store, &graph_store, embedding.as_ref(), llm.as_ref(), &cfg, &locks);

        let mut task = new_rag_task("t2".into(), 1);
        let cancel = CancellationFlag::new();
        let mut input = rag_input(2);
        input.bytes.clear();
        let err = run_rag_pipeline(&runner, &mut task, &NullSink, &cancel, input).await;
        assert!(err.is_err());
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.steps[0].status, TaskStatus::Failed);
        assert_eq!(task.steps[1].status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn graph_pipeline_writes_nodes_after_rag_ingestion() {
        let cfg = AppConfig::for_tests();
        let object_store = InMemoryObjectStore::new();
        let metadata_store = InMemoryMetadataStore::new();
        let graph_store = InMemoryGraphStore::new();
        let embedding = build_embedding_client(&cfg);
        let llm = build_llm_client(&cfg);
        let locks = NodeLockRegistry::new();
        let runner = PipelineRunner::new(&object_store, &metadata_store, &graph_store, embedding.as_ref(), llm.as_ref(), &cfg, &locks);

        let mut rag_task = new_rag_task("t3".into(), 1);
        let cancel = CancellationFlag::new();
        run_rag_pipeline(&runner, &mut rag_task, &NullSink, &cancel, rag_input(3)).await.unwrap();

        let mut graph_task = new_graph_task("t4".into(), 1, 3);
        run_graph_pipeline(&runner, &mut graph_task, &NullSink, &cancel, GraphPipelineInput { document_id: 3 }).await.unwrap();

        assert_eq!(graph_task.status, TaskStatus::Completed);
        assert!(graph_task.steps[6].detail.contains_key("nodes_created"));
    }

    #[tokio::test]
    async fn cancellation_before_first_step_cancels_every_step() {
        let cfg = AppConfig::for_tests();
        let object_store = InMemoryObjectStore::new();
        let metadata_store = InMemoryMetadataStore::new();
        let graph_store = InMemoryGraphStore::new();
        let embedding = build_embedding_client(&cfg);
        let llm = build_llm_client(&cfg);
        let locks = NodeLockRegistry::new();
        let runner = PipelineRunner::new(&object_store, &metadata_store, &graph_store, embedding.as_ref(), llm.as_ref(), &cfg, &locks);

        let mut task = new_rag_task("t5".into(), 1);
        let cancel = CancellationFlag::new();
        cancel.cancel();
        run_rag_pipeline(&runner, &mut task, &NullSink, &cancel, rag_input(5)).await.unwrap();

        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(task.steps.iter().all(|s| s.status == TaskStatus::Cancelled));
    }

    #[tokio::test]
    async fn unification_pipeline_with_no_candidates_completes_trivially() {
        let cfg = AppConfig::for_tests();
        let object_store = InMemoryObjectStore::new();
        let metadata_store = InMemoryMetadataStore::new();
        let graph_store = InMemoryGraphStore::new();
        let embedding = build_embedding_client(&cfg);
        let llm = build_llm_client(&cfg);
        let locks = NodeLockRegistry::new();
        let runner = PipelineRunner::new(&object_store, &metadata_store, &graph_store, embedding.as_ref(), llm.as_ref(), &cfg, &locks);

        let mut task = new_unification_task("t6".into(), 1, Some(1));
        let cancel = CancellationFlag::new();
        let input = UnificationTaskInput { document_id: Some(1), mode: UnificationMode::Incremental };
        run_unification_pipeline(&runner, &mut task, &NullSink, &cancel, input).await.unwrap();

        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.steps[2].detail.get("merge_operations_applied").and_then(|v| v.as_f64()), Some(0.0));
    }
}
