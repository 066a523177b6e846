//! C15: task service.
//!
//! A task registry backed by `MetadataStore`, broadcasting every `Task`
//! snapshot over a `tokio::sync::broadcast` channel (spec §6 "streaming
//! progress interface") and tracking cooperative cancellation per task id
//! (spec §5).

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{broadcast, Semaphore};
use tracing::error;
use uuid::Uuid;

use crate::config::{AppConfig, UnificationMode};
use crate::domain::Task;
use crate::embedding::EmbeddingClient;
use crate::errors::CoreError;
use crate::graph_store::GraphStore;
use crate::llm::LlmClient;
use crate::merger::NodeLockRegistry;
use crate::metadata_store::MetadataStore;
use crate::object_store::ObjectStore;
use crate::pipeline::{
    self, CancellationFlag, GraphPipelineInput, PipelineRunner, RagPipelineInput, TaskUpdateSink, UnificationTaskInput,
};

const BROADCAST_CAPACITY: usize = 256;

/// A `Task` snapshot, broadcast to every subscriber each time a step
/// changes. A lagging subscriber misses intermediate updates but can
/// always re-fetch the latest one via `TaskService::get`.
pub type TaskEvent = Task;

/// The full store/client set (C1-C12) the pipelines (C14) are wired
/// against, cloned into an owned set for each background task run.
#[derive(Clone)]
pub struct PipelineCollaborators {
    pub object_store: Arc<dyn ObjectStore>,
    pub metadata_store: Arc<dyn MetadataStore>,
    pub graph_store: Arc<dyn GraphStore>,
    pub embedding: Arc<dyn EmbeddingClient>,
    pub llm: Arc<dyn LlmClient>,
    pub cfg: Arc<AppConfig>,
    pub locks: Arc<NodeLockRegistry>,
}

/// Starts pipelines as background tasks, tracks their cancellation flags,
/// persists every state change, and fans it out to subscribers.
#[derive(Clone)]
pub struct TaskService {
    collaborators: PipelineCollaborators,
    events: broadcast::Sender<TaskEvent>,
    cancellations: Arc<DashMap<String, CancellationFlag>>,
    in_flight: Arc<Semaphore>,
}

impl TaskService {
    pub fn new(collaborators: PipelineCollaborators) -> Self {
        let (events, _) = broadcast::channel(BROADCAST_CAPACITY);
        let in_flight = Arc::new(Semaphore::new(collaborators.cfg.task_queue_capacity));
        Self { collaborators, events, cancellations: Arc::new(DashMap::new()), in_flight }
    }

    /// Claims one slot of `cfg.task_queue_capacity` (spec §5 "Backpressure":
    /// new submissions are rejected once the bounded queue is full instead
    /// of being spawned unconditionally). The returned permit is held for
    /// the lifetime of the background pipeline run.
    fn admit(&self) -> Result<tokio::sync::OwnedSemaphorePermit, CoreError> {
        Arc::clone(&self.in_flight).try_acquire_owned().map_err(|_| {
            CoreError::Capacity(format!("task queue at capacity ({} tasks in flight)", self.collaborators.cfg.task_queue_capacity))
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    pub async fn get(&self, task_id: &str) -> Result<Option<Task>, CoreError> {
        self.collaborators.metadata_store.get_task(task_id).await
    }

    pub async fn list_by_owner(&self, owner_id: i64, offset: usize, limit: usize) -> Result<Vec<Task>, CoreError> {
        self.collaborators.metadata_store.list_tasks_by_owner(owner_id, offset, limit).await
    }

    /// Requests cancellation of a running task (spec §5 "cooperative
    /// cancellation"). Returns `false` if the task id isn't tracked, either
    /// unknown or already finished and evicted.
    pub fn cancel(&self, task_id: &str) -> bool {
        match self.cancellations.get(task_id) {
            Some(flag) => {
                flag.cancel();
                true
            }
            None => false,
        }
    }

    fn register(&self, task_id: &str) -> CancellationFlag {
        let flag = CancellationFlag::new();
        self.cancellations.insert(task_id.to_string(), flag.clone());
        flag
    }

    fn unregister(&self, task_id: &str) {
        self.cancellations.remove(task_id);
    }

    fn runner(&self) -> OwnedRunnerParts {
        OwnedRunnerParts { collaborators: self.collaborators.clone() }
    }

    pub fn new_task_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Creates and persists a `rag_ingest` task, then runs it to completion
    /// on a background task. Returns the task's initial (pending) snapshot
    /// immediately; the caller polls or subscribes for progress.
    pub async fn start_rag(&self, owner_id: i64, input: RagPipelineInput) -> Result<Task, CoreError> {
        let permit = self.admit()?;
        let task_id = Self::new_task_id();
        let mut task = pipeline::new_rag_task(task_id.clone(), owner_id);
        self.collaborators.metadata_store.create_task(task.clone()).await?;
        let initial = task.clone();

        let flag = self.register(&task_id);
        let sink = self.clone();
        let parts = self.runner();
        tokio::spawn(async move {
            let _permit = permit;
            let runner = parts.as_runner();
            if let Err(error) = pipeline::run_rag_pipeline(&runner, &mut task, &sink, &flag, input).await {
                error!(task_id = %task.id, %error, "rag pipeline aborted before completion");
            }
            sink.unregister(&task.id);
        });

        Ok(initial)
    }

    /// Creates and persists a `graph_ingest` task over an already-ingested
    /// document, runs it in the background, and returns its initial
    /// snapshot.
    pub async fn start_graph(&self, owner_id: i64, document_id: i64) -> Result<Task, CoreError> {
        let permit = self.admit()?;
        let task_id = Self::new_task_id();
        let mut task = pipeline::new_graph_task(task_id.clone(), owner_id, document_id);
        self.collaborators.metadata_store.create_task(task.clone()).await?;
        let initial = task.clone();

        let flag = self.register(&task_id);
        let sink = self.clone();
        let parts = self.runner();
        tokio::spawn(async move {
            let _permit = permit;
            let runner = parts.as_runner();
            let input = GraphPipelineInput { document_id };
            if let Err(error) = pipeline::run_graph_pipeline(&runner, &mut task, &sink, &flag, input).await {
                error!(task_id = %task.id, %error, "graph pipeline aborted before completion");
            }
            sink.unregister(&task.id);
        });

        Ok(initial)
    }

    /// Creates and persists an `entity_unification` task (spec §6 "trigger
    /// unification" endpoint) and runs it in the background.
    pub async fn start_unification(&self, owner_id: i64, document_id: Option<i64>, mode: UnificationMode) -> Result<Task, CoreError> {
        let permit = self.admit()?;
        let task_id = Self::new_task_id();
        let mut task = pipeline::new_unification_task(task_id.clone(), owner_id, document_id);
        self.collaborators.metadata_store.create_task(task.clone()).await?;
        let initial = task.clone();

        let flag = self.register(&task_id);
        let sink = self.clone();
        let parts = self.runner();
        tokio::spawn(async move {
            let _permit = permit;
            let runner = parts.as_runner();
            let input = UnificationTaskInput { document_id, mode };
            if let Err(error) = pipeline::run_unification_pipeline(&runner, &mut task, &sink, &flag, input).await {
                error!(task_id = %task.id, %error, "unification pipeline aborted before completion");
            }
            sink.unregister(&task.id);
        });

        Ok(initial)
    }
}

#[async_trait]
impl TaskUpdateSink for TaskService {
    async fn publish(&self, task: &Task) -> Result<(), CoreError> {
        self.collaborators.metadata_store.update_task(task.clone()).await?;
        // A send error just means nobody is currently subscribed; the task's
        // state is already durably persisted above.
        let _ = self.events.send(task.clone());
        Ok(())
    }
}

/// Holds the `Arc`-owned collaborators for the lifetime of one spawned
/// pipeline run, so `PipelineRunner`'s borrowed references stay valid for
/// as long as the `'static` future that owns this struct runs.
struct OwnedRunnerParts {
    collaborators: PipelineCollaborators,
}

impl OwnedRunnerParts {
    fn as_runner(&self) -> PipelineRunner<'_> {
        PipelineRunner::new(
            self.collaborators.object_store.as_ref(),
            self.collaborators.metadata_store.as_ref(),
            self.collaborators.graph_store.as_ref(),
            self.collaborators.embedding.as_ref(),
            self.collaborators.llm.as_ref(),
            self.collaborators.cfg.as_ref(),
            self.collaborators.locks.as_ref(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::domain::TaskStatus;
    use crate::embedding::build_embedding_client;
    use crate::graph_store::memory::InMemoryGraphStore;
    use crate::llm::build_llm_client;
    use crate::metadata_store::InMemoryMetadataStore;
    use crate::object_store::InMemoryObjectStore;
    use std::time::Duration;
    use tokio::time::timeout;

    fn test_service() -> TaskService {
        let cfg = AppConfig::for_tests();
        let collaborators = PipelineCollaborators {
            object_store: Arc::new(InMemoryObjectStore::new()),
            metadata_store: Arc::new(InMemoryMetadataStore::default()),
            graph_store: Arc::new(InMemoryGraphStore::new()),
            embedding: Arc::from(build_embedding_client(&cfg)),
            llm: Arc::from(build_llm_client(&cfg)),
            cfg: Arc::new(cfg),
            locks: Arc::new(NodeLockRegistry::new()),
        };
        TaskService::new(collaborators)
    }

    fn rag_input() -> RagPipelineInput {
        RagPipelineInput {
            document_id: 1,
            owner_id: 7,
            display_name: "notes.txt".into(),
            content_type: "text/plain".into(),
            bytes: b"Ada Lovelace wrote the first algorithm.".to_vec(),
            metadata: Default::default(),
        }
    }

    #[tokio::test]
    async fn start_rag_returns_pending_snapshot_then_completes_in_background() {
        let service = test_service();
        let mut events = service.subscribe();
        let initial = service.start_rag(7, rag_input()).await.unwrap();
        assert_eq!(initial.status, TaskStatus::Pending);

        let completed = timeout(Duration::from_secs(5), async {
            loop {
                let event = events.recv().await.unwrap();
                if event.id == initial.id && event.status == TaskStatus::Completed {
                    return event;
                }
            }
        })
        .await
        .expect("task did not complete in time");

        assert!((completed.progress - 100.0).abs() < 1e-3);
        let stored = service.get(&initial.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn cancel_unknown_task_returns_false() {
        let service = test_service();
        assert!(!service.cancel("nonexistent"));
    }

    #[tokio::test]
    async fn start_rag_is_rejected_once_the_task_queue_is_full() {
        let mut cfg = AppConfig::for_tests();
        cfg.task_queue_capacity = 0;
        let collaborators = PipelineCollaborators {
            object_store: Arc::new(InMemoryObjectStore::new()),
            metadata_store: Arc::new(InMemoryMetadataStore::default()),
            graph_store: Arc::new(InMemoryGraphStore::new()),
            embedding: Arc::from(build_embedding_client(&cfg)),
            llm: Arc::from(build_llm_client(&cfg)),
            cfg: Arc::new(cfg),
            locks: Arc::new(NodeLockRegistry::new()),
        };
        let service = TaskService::new(collaborators);

        let err = service.start_rag(7, rag_input()).await.expect_err("queue has zero capacity");
        assert_eq!(err.kind(), crate::errors::ErrorKind::Capacity);
    }

    #[tokio::test]
    async fn cancelling_immediately_still_lets_the_task_reach_a_terminal_state() {
        let service = test_service();
        let initial = service.start_rag(7, rag_input()).await.unwrap();
        service.cancel(&initial.id);

        let mut events = service.subscribe();
        let terminal = timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(event) = events.recv().await {
                    if event.id == initial.id
                        && matches!(event.status, TaskStatus::Completed | TaskStatus::Cancelled | TaskStatus::Failed)
                    {
                        return event;
                    }
                } else {
                    let stored = service.get(&initial.id).await.unwrap().unwrap();
                    return stored;
                }
            }
        })
        .await
        .expect("task never reached a terminal state");
        assert_ne!(terminal.status, TaskStatus::Running);
    }
}
