//! `Task` and `TaskStep` (spec §3, §4.1, §7).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::property::PropertyMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStep {
    pub name: String,
    pub description: String,
    pub step_type: String,
    pub weight: f32,
    pub status: TaskStatus,
    pub progress: f32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub detail: PropertyMap,
}

impl TaskStep {
    pub fn new(name: impl Into<String>, description: impl Into<String>, step_type: impl Into<String>, weight: f32) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            step_type: step_type.into(),
            weight,
            status: TaskStatus::Pending,
            progress: 0.0,
            started_at: None,
            completed_at: None,
            error: None,
            detail: PropertyMap::new(),
        }
    }

    pub fn mark_running(&mut self) {
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn mark_completed(&mut self) {
        self.status = TaskStatus::Completed;
        self.progress = 100.0;
        self.completed_at = Some(Utc::now());
    }

    /// Records an error kind, message, and truncated stack trace (spec §7 "Propagation").
    pub fn mark_failed(&mut self, kind: crate::errors::ErrorKind, message: impl Into<String>, stack: &str) {
        self.status = TaskStatus::Failed;
        self.completed_at = Some(Utc::now());
        let message = message.into();
        self.error = Some(message.clone());
        self.detail.insert("error_kind".into(), format!("{:?}", kind).into());
        self.detail.insert("error_message".into(), message.into());
        const MAX_STACK: usize = 2000;
        let truncated: String = stack.chars().take(MAX_STACK).collect();
        self.detail.insert("stack_trace".into(), truncated.into());
    }

    pub fn mark_cancelled(&mut self) {
        self.status = TaskStatus::Cancelled;
        self.completed_at = Some(Utc::now());
        self.error = Some("cancelled by user".to_string());
    }
}

/// A durable, observable unit of work (spec §3 `Task`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub owner_id: i64,
    pub task_type: String,
    pub name: String,
    pub description: String,
    pub status: TaskStatus,
    pub progress: f32,
    pub document_id: Option<i64>,
    pub steps: Vec<TaskStep>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub metadata: PropertyMap,
}

impl Task {
    pub fn new(id: String, owner_id: i64, task_type: impl Into<String>, name: impl Into<String>, steps: Vec<TaskStep>) -> Self {
        Self {
            id,
            owner_id,
            task_type: task_type.into(),
            name: name.into(),
            description: String::new(),
            status: TaskStatus::Pending,
            progress: 0.0,
            document_id: None,
            steps,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
            metadata: PropertyMap::new(),
        }
    }

    /// Task progress equals the weighted sum of its steps' progress
    /// (spec §3 invariant; spec §8 "Progress monotonicity").
    pub fn recompute_progress(&mut self) {
        let total_weight: f32 = self.steps.iter().map(|s| s.weight).sum();
        if total_weight <= 0.0 {
            self.progress = 0.0;
            return;
        }
        let weighted: f32 = self.steps.iter().map(|s| s.weight * s.progress / 100.0).sum();
        self.progress = (weighted / total_weight * 100.0).clamp(0.0, 100.0);
    }

    /// Status is `completed` iff all steps are `completed`; `failed` if any
    /// step is `failed` (spec §3 invariant).
    pub fn recompute_status(&mut self) {
        if self.steps.iter().any(|s| s.status == TaskStatus::Failed) {
            self.status = TaskStatus::Failed;
        } else if self.steps.iter().any(|s| s.status == TaskStatus::Cancelled) {
            self.status = TaskStatus::Cancelled;
        } else if !self.steps.is_empty() && self.steps.iter().all(|s| s.status == TaskStatus::Completed) {
            self.status = TaskStatus::Completed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_is_weighted_sum() {
        let mut task = Task::new(
            "t1".into(),
            1,
            "rag",
            "ingest",
            vec![TaskStep::new("a", "", "a", 30.0), TaskStep::new("b", "", "b", 70.0)],
        );
        task.steps[0].progress = 100.0;
        task.steps[1].progress = 0.0;
        task.recompute_progress();
        assert!((task.progress - 30.0).abs() < 1e-6);

        task.steps[1].progress = 100.0;
        task.recompute_progress();
        assert!((task.progress - 100.0).abs() < 1e-6);
    }

    #[test]
    fn status_completed_iff_all_steps_completed() {
        let mut task = Task::new("t1".into(), 1, "rag", "ingest", vec![TaskStep::new("a", "", "a", 100.0)]);
        task.steps[0].mark_completed();
        task.recompute_status();
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[test]
    fn status_failed_if_any_step_failed() {
        let mut task = Task::new(
            "t1".into(),
            1,
            "rag",
            "ingest",
            vec![TaskStep::new("a", "", "a", 50.0), TaskStep::new("b", "", "b", 50.0)],
        );
        task.steps[0].mark_completed();
        task.steps[1].mark_failed(crate::errors::ErrorKind::ExternalTransient, "boom", "");
        task.recompute_status();
        assert_eq!(task.status, TaskStatus::Failed);
    }
}
