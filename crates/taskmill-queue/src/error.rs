//! Queue error taxonomy

use taskmill_storage::StoreError;

/// Errors surfaced by the queue services.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Rejected synchronously at the submission boundary: unknown function,
    /// non-serializable payload, malformed call.
    #[error("validation error: {0}")]
    Validation(String),

    /// Task id does not exist.
    #[error("task not found: {0}")]
    TaskNotFound(i64),

    /// The awaited task ended in `failed`.
    #[error("task {id} failed: {message}")]
    TaskFailed { id: i64, message: String },

    /// The awaited task ended in `cancelled`.
    #[error("task {0} was cancelled")]
    TaskCancelled(i64),

    /// Deferred creation did not produce a row.
    #[error("task creation failed: {0}")]
    CreationFailed(String),

    /// Underlying store error.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failure raised by a task body or by callable resolution.
///
/// `kind` becomes `exception_name` on the failed row, `message` becomes
/// `exception_message`, and `detail` becomes `exception_info`.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct TaskError {
    pub kind: String,
    pub message: String,
    pub detail: Option<String>,
}

impl TaskError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(e: anyhow::Error) -> Self {
        Self {
            kind: "TaskError".to_string(),
            message: e.to_string(),
            detail: Some(format!("{e:?}")),
        }
    }
}

impl From<String> for TaskError {
    fn from(message: String) -> Self {
        Self::new("TaskError", message)
    }
}

impl From<&str> for TaskError {
    fn from(message: &str) -> Self {
        Self::new("TaskError", message)
    }
}
