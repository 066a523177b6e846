//! Shared application state: the full store/client/service set the API
//! handlers need.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use anyhow::Context;

use crate::config::AppConfig;
use crate::embedding::{build_embedding_client, EmbeddingClient};
use crate::graph_store::neo4j::{connect_from_config, ensure_schema, ensure_vector_indexes, Neo4jGraphStore};
use crate::graph_store::GraphStore;
use crate::llm::{build_llm_client, LlmClient};
use crate::merger::NodeLockRegistry;
use crate::metadata_store::{InMemoryMetadataStore, MetadataStore};
use crate::object_store::{FsObjectStore, ObjectStore};
use crate::task::{PipelineCollaborators, TaskService};

/// The full set of collaborators an axum handler needs, cloned into every
/// request via `State<AppState>` (cheap — every field is `Arc`-backed).
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub object_store: Arc<dyn ObjectStore>,
    pub metadata_store: Arc<dyn MetadataStore>,
    pub graph_store: Arc<dyn GraphStore>,
    pub task_service: TaskService,
    next_document_id: Arc<AtomicI64>,
}

impl AppState {
    /// Connects to Neo4j, ensures constraints and the chunk vector index
    /// exist, and wires every collaborator together.
    pub async fn connect(config: AppConfig) -> anyhow::Result<Self> {
        let graph = connect_from_config(&config).await.context("connecting to Neo4j")?;
        ensure_schema(&graph).await.context("ensuring Neo4j schema")?;
        ensure_vector_indexes(&graph, config.vector_dimension).await.context("ensuring vector indexes")?;

        let graph_store: Arc<dyn GraphStore> = Arc::new(Neo4jGraphStore::new(graph));
        let object_store: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(config.object_store_dir.clone()));
        let metadata_store: Arc<dyn MetadataStore> = Arc::new(InMemoryMetadataStore::default());
        let embedding: Arc<dyn EmbeddingClient> = Arc::from(build_embedding_client(&config));
        let llm: Arc<dyn LlmClient> = Arc::from(build_llm_client(&config));
        let config = Arc::new(config);

        let collaborators = PipelineCollaborators {
            object_store: object_store.clone(),
            metadata_store: metadata_store.clone(),
            graph_store: graph_store.clone(),
            embedding,
            llm,
            cfg: config.clone(),
            locks: Arc::new(NodeLockRegistry::new()),
        };

        Ok(Self {
            config,
            object_store,
            metadata_store,
            graph_store,
            task_service: TaskService::new(collaborators),
            next_document_id: Arc::new(AtomicI64::new(1)),
        })
    }

    pub fn next_document_id(&self) -> i64 {
        self.next_document_id.fetch_add(1, Ordering::SeqCst)
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        use crate::embedding::build_embedding_client;
        use crate::graph_store::memory::InMemoryGraphStore;
        use crate::llm::build_llm_client;
        use crate::object_store::InMemoryObjectStore;

        let config = AppConfig::for_tests();
        let object_store: Arc<dyn ObjectStore> = Arc::new(InMemoryObjectStore::new());
        let metadata_store: Arc<dyn MetadataStore> = Arc::new(InMemoryMetadataStore::default());
        let graph_store: Arc<dyn GraphStore> = Arc::new(InMemoryGraphStore::new());
        let embedding: Arc<dyn EmbeddingClient> = Arc::from(build_embedding_client(&config));
        let llm: Arc<dyn LlmClient> = Arc::from(build_llm_client(&config));
        let config = Arc::new(config);

        let collaborators = PipelineCollaborators {
            object_store: object_store.clone(),
            metadata_store: metadata_store.clone(),
            graph_store: graph_store.clone(),
            embedding,
            llm,
            cfg: config.clone(),
            locks: Arc::new(NodeLockRegistry::new()),
        };

        Self {
            config,
            object_store,
            metadata_store,
            graph_store,
            task_service: TaskService::new(collaborators),
            next_document_id: Arc::new(AtomicI64::new(1)),
        }
    }
}
