//! Delayed scheduling
//!
//! One-shot scheduling of a task at a future instant: the row is created
//! `enqueued` with a future `date_enqueued`, and ready-task selection only
//! considers due rows.

use chrono::{DateTime, Utc};
use taskmill_storage::{QueuedTask, TaskState};
use tracing::info;

use crate::error::QueueError;
use crate::tasks::{QueuedTasks, TaskCall};

/// When a scheduled task should run.
#[derive(Debug, Clone, Copy)]
pub enum RunAt {
    /// At a specific instant.
    At(DateTime<Utc>),
    /// After a delay from now.
    After(std::time::Duration),
}

impl RunAt {
    fn resolve(self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Self::At(at) => at,
            Self::After(delay) => {
                now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX)
            }
        }
    }
}

/// Service scheduling tasks for future execution.
#[derive(Clone)]
pub struct Scheduler {
    tasks: QueuedTasks,
}

impl Scheduler {
    pub fn new(tasks: QueuedTasks) -> Self {
        Self { tasks }
    }

    /// Schedule a task for future execution. Validation and creation hooks
    /// apply exactly as for immediate submission.
    pub async fn schedule(&self, call: TaskCall, run_at: RunAt) -> Result<QueuedTask, QueueError> {
        let at = run_at.resolve(Utc::now());
        let default_name = format!("scheduled:{}", call.path());
        let call = call.with_default_name(default_name).scheduled_for(at);

        let task = self.tasks.add_task_blocking(call, None).await?;
        info!(task_id = task.id, name = %task.name, run_at = %at, "scheduled task");
        Ok(task)
    }

    /// Cancel a scheduled task.
    ///
    /// An `enqueued` row is deleted; an in-flight or waiting row is marked
    /// cancelled. Returns false for missing or already-terminal tasks.
    pub async fn cancel(&self, task_id: i64) -> Result<bool, QueueError> {
        let Some(task) = self.tasks.get_task(task_id).await? else {
            return Ok(false);
        };

        match task.state {
            TaskState::Done | TaskState::Failed | TaskState::Cancelled => Ok(false),
            TaskState::Enqueued => {
                self.tasks.store().delete_task(task_id).await?;
                Ok(true)
            }
            TaskState::Doing | TaskState::Waiting | TaskState::Stopped => {
                self.tasks.store().mark_cancelled(task_id).await?;
                Ok(true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions::FunctionRegistry;
    use crate::hooks::HookRegistry;
    use serde_json::json;
    use std::sync::Arc;
    use taskmill_storage::{InMemoryTaskStore, TaskStore};

    fn fixture() -> (Scheduler, Arc<InMemoryTaskStore>) {
        let store = Arc::new(InMemoryTaskStore::new());
        let functions = Arc::new(FunctionRegistry::new());
        functions.register("jobs", "cleanup", |_a, _k| async move { Ok(json!(null)) });
        let tasks = QueuedTasks::new(
            store.clone() as Arc<dyn TaskStore>,
            Arc::new(HookRegistry::new()),
            functions,
        );
        (Scheduler::new(tasks), store)
    }

    #[tokio::test]
    async fn scheduled_task_is_not_due_until_its_instant() {
        let (scheduler, store) = fixture();
        let task = scheduler
            .schedule(
                TaskCall::new("jobs", "cleanup"),
                RunAt::After(std::time::Duration::from_secs(3600)),
            )
            .await
            .unwrap();

        assert_eq!(task.state, TaskState::Enqueued);
        assert_eq!(task.name, "scheduled:jobs.cleanup");
        assert!(store.list_due_enqueued(Utc::now()).await.unwrap().is_empty());

        let later = Utc::now() + chrono::Duration::seconds(7200);
        let due = store.list_due_enqueued(later).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, task.id);
    }

    #[tokio::test]
    async fn explicit_instant_is_respected() {
        let (scheduler, store) = fixture();
        let at = Utc::now() + chrono::Duration::minutes(5);
        let task = scheduler
            .schedule(TaskCall::new("jobs", "cleanup").name("nightly"), RunAt::At(at))
            .await
            .unwrap();

        assert_eq!(task.name, "nightly");
        let stored = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.date_enqueued, Some(at));
    }

    #[tokio::test]
    async fn unknown_function_is_rejected() {
        let (scheduler, _store) = fixture();
        let err = scheduler
            .schedule(TaskCall::new("no", "where"), RunAt::After(Default::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Validation(_)));
    }

    #[tokio::test]
    async fn cancel_deletes_pending_and_reports_terminal() {
        let (scheduler, store) = fixture();
        let task = scheduler
            .schedule(
                TaskCall::new("jobs", "cleanup"),
                RunAt::After(std::time::Duration::from_secs(60)),
            )
            .await
            .unwrap();

        assert!(scheduler.cancel(task.id).await.unwrap());
        assert!(store.get_task(task.id).await.unwrap().is_none());

        // Missing ids report false.
        assert!(!scheduler.cancel(task.id).await.unwrap());

        let done = scheduler
            .schedule(TaskCall::new("jobs", "cleanup"), RunAt::At(Utc::now()))
            .await
            .unwrap();
        store.mark_doing(done.id).await.unwrap();
        store.mark_done(done.id).await.unwrap();
        assert!(!scheduler.cancel(done.id).await.unwrap());
    }

    #[tokio::test]
    async fn cancel_marks_running_rows_cancelled() {
        let (scheduler, store) = fixture();
        let task = scheduler
            .schedule(TaskCall::new("jobs", "cleanup"), RunAt::At(Utc::now()))
            .await
            .unwrap();
        store.mark_doing(task.id).await.unwrap();

        assert!(scheduler.cancel(task.id).await.unwrap());
        assert_eq!(
            store.get_task(task.id).await.unwrap().unwrap().state,
            TaskState::Cancelled
        );
    }
}
