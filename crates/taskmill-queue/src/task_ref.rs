//! Task references
//!
//! A `TaskRef` is the in-process handle returned by non-blocking
//! submission. The referenced row may not exist yet; its id resolves once
//! the creation queue inserts it.

use std::sync::Arc;

use taskmill_storage::{QueuedTask, TaskState, TaskStore};
use tokio::sync::watch;
use tracing::debug;

use crate::error::QueueError;

#[derive(Clone, Debug)]
pub(crate) enum CreationState {
    Pending,
    Created(i64),
    Failed(String),
}

struct RefInner {
    store: Arc<dyn TaskStore>,
    rx: watch::Receiver<CreationState>,
}

/// Reference to a queued task that allows control operations.
#[derive(Clone)]
pub struct TaskRef {
    inner: Arc<RefInner>,
}

impl TaskRef {
    pub(crate) fn new(store: Arc<dyn TaskStore>) -> (Self, watch::Sender<CreationState>) {
        let (tx, rx) = watch::channel(CreationState::Pending);
        (
            Self {
                inner: Arc::new(RefInner { store, rx }),
            },
            tx,
        )
    }

    /// Build a ref for an already-inserted task.
    pub fn resolved(store: Arc<dyn TaskStore>, task_id: i64) -> Self {
        let (tx, rx) = watch::channel(CreationState::Created(task_id));
        drop(tx);
        Self {
            inner: Arc::new(RefInner { store, rx }),
        }
    }

    /// Task id, or `None` while the row has not been created yet.
    pub fn id(&self) -> Option<i64> {
        match &*self.inner.rx.borrow() {
            CreationState::Created(id) => Some(*id),
            _ => None,
        }
    }

    /// Wait for the row to be created and return its id.
    pub async fn task_id(&self) -> Result<i64, QueueError> {
        let mut rx = self.inner.rx.clone();
        loop {
            match &*rx.borrow_and_update() {
                CreationState::Created(id) => return Ok(*id),
                CreationState::Failed(e) => return Err(QueueError::CreationFailed(e.clone())),
                CreationState::Pending => {}
            }
            if rx.changed().await.is_err() {
                // Sender dropped without resolving; re-check the final value.
                match &*rx.borrow() {
                    CreationState::Created(id) => return Ok(*id),
                    CreationState::Failed(e) => return Err(QueueError::CreationFailed(e.clone())),
                    CreationState::Pending => {
                        return Err(QueueError::CreationFailed(
                            "task creation was abandoned".to_string(),
                        ))
                    }
                }
            }
        }
    }

    /// Cancel this task in the background: an `enqueued` row is deleted
    /// before it ever runs, a `doing` row is marked cancelled. Anything
    /// else (including a missing row) is a silent no-op.
    pub fn cancel(&self) {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.cancel_inner().await {
                debug!(error = %e, "background cancel did not apply");
            }
        });
    }

    async fn cancel_inner(&self) -> Result<(), QueueError> {
        let task_id = self.task_id().await?;
        let Some(task) = self.inner.store.get_task(task_id).await? else {
            return Ok(());
        };
        match task.state {
            TaskState::Enqueued => {
                self.inner.store.delete_task(task_id).await?;
            }
            TaskState::Doing => {
                self.inner.store.mark_cancelled(task_id).await?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Stop this task in the background if it is running.
    pub fn stop(&self) {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.stop_inner().await {
                debug!(error = %e, "background stop did not apply");
            }
        });
    }

    async fn stop_inner(&self) -> Result<(), QueueError> {
        let task_id = self.task_id().await?;
        if let Some(task) = self.inner.store.get_task(task_id).await? {
            if task.state == TaskState::Doing {
                self.inner.store.mark_stopped(task_id).await?;
            }
        }
        Ok(())
    }

    /// Current state of the referenced task.
    pub async fn state(&self) -> Result<TaskState, QueueError> {
        let task_id = self.task_id().await?;
        let task = self
            .inner
            .store
            .get_task(task_id)
            .await?
            .ok_or(QueueError::TaskNotFound(task_id))?;
        Ok(task.state)
    }

    /// Poll until the task reaches a terminal state.
    ///
    /// Returns the final row on success; a failed task surfaces as
    /// `TaskFailed` and a cancelled one as `TaskCancelled`. A row that
    /// disappears mid-wait (e.g. auto-removal) is `TaskNotFound`.
    pub async fn wait(&self) -> Result<QueuedTask, QueueError> {
        let task_id = self.task_id().await?;
        loop {
            let task = self
                .inner
                .store
                .get_task(task_id)
                .await?
                .ok_or(QueueError::TaskNotFound(task_id))?;
            match task.state {
                TaskState::Done => return Ok(task),
                TaskState::Failed => {
                    return Err(QueueError::TaskFailed {
                        id: task_id,
                        message: task
                            .exception_message
                            .unwrap_or_else(|| "unknown failure".to_string()),
                    })
                }
                TaskState::Cancelled => return Err(QueueError::TaskCancelled(task_id)),
                _ => tokio::time::sleep(std::time::Duration::from_millis(100)).await,
            }
        }
    }
}

impl std::fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRef").field("id", &self.id()).finish()
    }
}
