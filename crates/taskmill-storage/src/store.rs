//! TaskStore trait definition

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::models::*;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Task not found
    #[error("task not found: {0}")]
    TaskNotFound(i64),

    /// Server record not found
    #[error("server not found: {0}")]
    ServerNotFound(String),

    /// Transient conflict (serialization failure or deadlock); safe to retry
    #[error("transient database error: {0}")]
    Retryable(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// True for serialization conflicts (SQLSTATE 40001) and deadlocks
    /// (40P01); the worker's terminal-write retry loop keys off this.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

/// Stream of task notifications from the `queue_new_task` channel.
///
/// Backed by a Postgres `LISTEN` connection in production and by a
/// broadcast channel in the in-memory store.
pub struct NotificationStream {
    inner: NotificationSource,
}

pub(crate) enum NotificationSource {
    Postgres(sqlx::postgres::PgListener),
    Memory(broadcast::Receiver<TaskNotification>),
}

impl NotificationStream {
    pub(crate) fn from_listener(listener: sqlx::postgres::PgListener) -> Self {
        Self {
            inner: NotificationSource::Postgres(listener),
        }
    }

    pub(crate) fn from_receiver(rx: broadcast::Receiver<TaskNotification>) -> Self {
        Self {
            inner: NotificationSource::Memory(rx),
        }
    }

    /// Receive the next notification. Returns `None` when the underlying
    /// channel is closed. Malformed payloads are skipped.
    pub async fn recv(&mut self) -> Option<TaskNotification> {
        match &mut self.inner {
            NotificationSource::Postgres(listener) => loop {
                match listener.recv().await {
                    Ok(notification) => {
                        match serde_json::from_str::<TaskNotification>(notification.payload()) {
                            Ok(parsed) => return Some(parsed),
                            Err(e) => {
                                tracing::warn!(error = %e, "Skipping malformed notification payload");
                            }
                        }
                    }
                    Err(e) => {
                        // PgListener reconnects internally; back off and retry.
                        tracing::warn!(error = %e, "Notification listener error, retrying");
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    }
                }
            },
            NotificationSource::Memory(rx) => loop {
                match rx.recv().await {
                    Ok(n) => return Some(n),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Notification stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            },
        }
    }
}

/// Durable store for tasks, task logs, and worker records.
///
/// All task state transitions are single-row writes keyed by id, with the
/// associated date fields and `execution_time` computed in the same write.
#[async_trait]
pub trait TaskStore: Send + Sync {
    // ---- tasks ----

    /// Insert a task row with initial state `enqueued`.
    ///
    /// `date_enqueued` defaults to now when unset; a future value delays
    /// selection until the task is due.
    async fn create_task(&self, new: NewTask) -> Result<QueuedTask, StoreError>;

    async fn get_task(&self, id: i64) -> Result<Option<QueuedTask>, StoreError>;

    /// Delete a task row. Children are removed by the cascade constraint.
    /// Returns false when no row matched.
    async fn delete_task(&self, id: i64) -> Result<bool, StoreError>;

    /// Count of rows in state `enqueued`.
    async fn pending_count(&self) -> Result<i64, StoreError>;

    async fn counts_by_state(&self) -> Result<TaskStateCounts, StoreError>;

    /// Rows in state `enqueued` that are due (`date_enqueued <= now`),
    /// ordered by `date_enqueued` ascending (FIFO).
    async fn list_due_enqueued(&self, now: DateTime<Utc>) -> Result<Vec<QueuedTask>, StoreError>;

    async fn list_children(&self, parent_id: i64) -> Result<Vec<QueuedTask>, StoreError>;

    /// Whether any row with this name is in `{enqueued, waiting, doing}`.
    /// The cron scheduler's duplicate-suppression query.
    async fn has_active_by_name(&self, name: &str) -> Result<bool, StoreError>;

    /// Delete all `enqueued` rows; returns the number removed.
    async fn clear_pending(&self) -> Result<u64, StoreError>;

    // ---- state transitions ----

    /// `enqueued -> doing`: sets `date_started`, clears every other date
    /// field and the failure snapshot.
    async fn mark_doing(&self, id: i64) -> Result<(), StoreError>;

    /// Terminal success: sets `date_done`, `date_ended`, `execution_time`.
    async fn mark_done(&self, id: i64) -> Result<(), StoreError>;

    /// Terminal failure: sets the failure snapshot plus `date_failed`,
    /// `date_ended`, `execution_time`.
    async fn mark_failed(&self, id: i64, failure: &TaskFailure) -> Result<(), StoreError>;

    /// Terminal cancellation: sets `date_cancelled`, `date_ended`,
    /// `execution_time`.
    async fn mark_cancelled(&self, id: i64) -> Result<(), StoreError>;

    /// `doing -> stopped` (resumable): sets `date_stopped`, `date_ended`,
    /// `execution_time`.
    async fn mark_stopped(&self, id: i64) -> Result<(), StoreError>;

    async fn mark_waiting(&self, id: i64) -> Result<(), StoreError>;

    /// `stopped -> enqueued` on the same row: resets all execution fields
    /// and stamps a fresh `date_enqueued`.
    async fn requeue(&self, id: i64) -> Result<QueuedTask, StoreError>;

    /// Replace the persisted execution context of a task.
    async fn update_context(&self, id: i64, context: &serde_json::Value)
        -> Result<(), StoreError>;

    // ---- task logs ----

    async fn insert_log(&self, log: NewTaskLog) -> Result<(), StoreError>;

    async fn list_logs(&self, task_id: i64) -> Result<Vec<QueuedTaskLog>, StoreError>;

    // ---- worker records ----

    /// Upsert keyed on server name: marks the server running with a fresh
    /// heartbeat and `started_at`.
    async fn register_server(
        &self,
        server_name: &str,
        max_workers: i32,
        version: Option<&str>,
    ) -> Result<WorkerRecord, StoreError>;

    /// Heartbeat write: refresh counts and `last_heartbeat`.
    async fn update_server_stats(
        &self,
        server_name: &str,
        active_workers: i32,
        idle_workers: i32,
        is_running: bool,
    ) -> Result<(), StoreError>;

    /// Final write on shutdown: running false, zero counts.
    async fn mark_server_stopped(&self, server_name: &str) -> Result<(), StoreError>;

    async fn get_server(&self, server_name: &str) -> Result<Option<WorkerRecord>, StoreError>;

    async fn list_servers(&self) -> Result<Vec<WorkerRecord>, StoreError>;

    /// Aggregate over servers with `is_running` and a heartbeat within the
    /// last two minutes.
    async fn fleet_view(&self) -> Result<FleetView, StoreError>;

    // ---- notification plumbing ----

    /// Idempotently install the trigger that publishes on `channel` for
    /// every insert/update landing a row in state `enqueued`. No-op for
    /// stores that notify natively.
    async fn install_notify_trigger(&self, channel: &str) -> Result<(), StoreError>;

    /// Open a subscription to `channel`.
    async fn subscribe(&self, channel: &str) -> Result<NotificationStream, StoreError>;
}
