//! C5: metadata store adapter (spec §2, §6 "Metadata store").
//!
//! The relational store itself is out of scope (spec §1); this module
//! specifies the operations the core invokes: create/update/get Document,
//! create/update/get Task, append/update TaskStep, list tasks by owner with
//! pagination, soft-delete document. An in-memory adapter backs tests and
//! single-node runs.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::domain::{Document, Task, TaskStep};
use crate::errors::CoreError;

#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn create_document(&self, document: Document) -> Result<(), CoreError>;
    async fn update_document(&self, document: Document) -> Result<(), CoreError>;
    async fn get_document(&self, id: i64) -> Result<Option<Document>, CoreError>;
    async fn soft_delete_document(&self, id: i64) -> Result<(), CoreError>;

    async fn create_task(&self, task: Task) -> Result<(), CoreError>;
    async fn update_task(&self, task: Task) -> Result<(), CoreError>;
    async fn get_task(&self, id: &str) -> Result<Option<Task>, CoreError>;
    async fn append_step(&self, task_id: &str, step: TaskStep) -> Result<(), CoreError>;
    async fn update_step(&self, task_id: &str, index: usize, step: TaskStep) -> Result<(), CoreError>;

    /// Lists tasks owned by `owner_id`, newest first, paginated by
    /// `(offset, limit)` (spec §6 "list tasks by owner with pagination").
    async fn list_tasks_by_owner(&self, owner_id: i64, offset: usize, limit: usize) -> Result<Vec<Task>, CoreError>;
}

#[derive(Default)]
pub struct InMemoryMetadataStore {
    documents: Mutex<HashMap<i64, Document>>,
    tasks: Mutex<HashMap<String, Task>>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn create_document(&self, document: Document) -> Result<(), CoreError> {
        self.documents.lock().unwrap().insert(document.id, document);
        Ok(())
    }

    async fn update_document(&self, document: Document) -> Result<(), CoreError> {
        self.documents.lock().unwrap().insert(document.id, document);
        Ok(())
    }

    async fn get_document(&self, id: i64) -> Result<Option<Document>, CoreError> {
        Ok(self.documents.lock().unwrap().get(&id).cloned())
    }

    async fn soft_delete_document(&self, id: i64) -> Result<(), CoreError> {
        let mut docs = self.documents.lock().unwrap();
        match docs.get_mut(&id) {
            Some(doc) => {
                doc.soft_delete();
                Ok(())
            }
            None => Err(CoreError::InputInvalid(format!("no such document: {id}"))),
        }
    }

    async fn create_task(&self, task: Task) -> Result<(), CoreError> {
        self.tasks.lock().unwrap().insert(task.id.clone(), task);
        Ok(())
    }

    async fn update_task(&self, task: Task) -> Result<(), CoreError> {
        self.tasks.lock().unwrap().insert(task.id.clone(), task);
        Ok(())
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>, CoreError> {
        Ok(self.tasks.lock().unwrap().get(id).cloned())
    }

    async fn append_step(&self, task_id: &str, step: TaskStep) -> Result<(), CoreError> {
        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks.get_mut(task_id).ok_or_else(|| CoreError::InputInvalid(format!("no such task: {task_id}")))?;
        task.steps.push(step);
        Ok(())
    }

    async fn update_step(&self, task_id: &str, index: usize, step: TaskStep) -> Result<(), CoreError> {
        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks.get_mut(task_id).ok_or_else(|| CoreError::InputInvalid(format!("no such task: {task_id}")))?;
        if index >= task.steps.len() {
            return Err(CoreError::Logic(format!("step index {index} out of range for task {task_id}")));
        }
        task.steps[index] = step;
        Ok(())
    }

    async fn list_tasks_by_owner(&self, owner_id: i64, offset: usize, limit: usize) -> Result<Vec<Task>, CoreError> {
        let tasks = self.tasks.lock().unwrap();
        let mut owned: Vec<Task> = tasks.values().filter(|t| t.owner_id == owner_id).cloned().collect();
        owned.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(owned.into_iter().skip(offset).take(limit).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DocumentStatus;

    #[tokio::test]
    async fn soft_delete_marks_status() {
        let store = InMemoryMetadataStore::new();
        store.create_document(Document::new(1, 9, "a.txt", "text/plain")).await.unwrap();
        store.soft_delete_document(1).await.unwrap();
        let doc = store.get_document(1).await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Deleted);
    }

    #[tokio::test]
    async fn list_tasks_by_owner_paginates_newest_first() {
        let store = InMemoryMetadataStore::new();
        for i in 0..5 {
            let task = Task::new(format!("t{i}"), 1, "rag", "ingest", vec![]);
            store.create_task(task).await.unwrap();
        }
        let page = store.list_tasks_by_owner(1, 0, 2).await.unwrap();
        assert_eq!(page.len(), 2);
    }
}
