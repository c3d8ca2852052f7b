//! Task-aware logging
//!
//! A logger that emits through `tracing` and, when a task scope is active,
//! mirrors the record into `queued_task_logs` as a best-effort background
//! write. Outside a task scope it behaves like a plain tracing logger.

use std::sync::Arc;

use taskmill_storage::{NewTaskLog, TaskLogLevel, TaskStore};
use tracing::error;

use crate::context;

/// Logger that mirrors records to the task log table.
#[derive(Clone)]
pub struct TaskLogger {
    name: String,
    store: Arc<dyn TaskStore>,
}

impl TaskLogger {
    pub fn new(name: impl Into<String>, store: Arc<dyn TaskStore>) -> Self {
        Self {
            name: name.into(),
            store,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn debug(&self, message: &str) {
        self.log(TaskLogLevel::Debug, message, None);
    }

    pub fn info(&self, message: &str) {
        self.log(TaskLogLevel::Info, message, None);
    }

    pub fn warning(&self, message: &str) {
        self.log(TaskLogLevel::Warning, message, None);
    }

    pub fn error(&self, message: &str) {
        self.log(TaskLogLevel::Error, message, None);
    }

    pub fn critical(&self, message: &str) {
        self.log(TaskLogLevel::Critical, message, None);
    }

    /// Emit a record, optionally with an auxiliary info payload.
    pub fn log(&self, level: TaskLogLevel, message: &str, info: Option<String>) {
        match level {
            TaskLogLevel::Debug => tracing::debug!(logger = %self.name, "{message}"),
            TaskLogLevel::Info => tracing::info!(logger = %self.name, "{message}"),
            TaskLogLevel::Warning => tracing::warn!(logger = %self.name, "{message}"),
            TaskLogLevel::Error | TaskLogLevel::Critical => {
                tracing::error!(logger = %self.name, "{message}")
            }
        }

        let Some(task_id) = context::current_task_id() else {
            return;
        };

        let store = Arc::clone(&self.store);
        let log = NewTaskLog {
            task_id,
            log_type: level,
            name: Some(self.name.clone()),
            message: Some(message.to_string()),
            info,
        };
        // Database logging must never break task execution.
        tokio::spawn(async move {
            if let Err(e) = store.insert_log(log).await {
                error!(task_id, error = %e, "failed to write task log");
            }
        });
    }
}
