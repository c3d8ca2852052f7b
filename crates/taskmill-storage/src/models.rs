//! Row types for the queued task tables

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Lifecycle state of a queued task.
///
/// `done`, `failed` and `cancelled` are terminal. `stopped` is resumable via
/// retry. `waiting` is excluded from ready-task selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "queued_task_state", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Enqueued,
    Waiting,
    Doing,
    Stopped,
    Done,
    Failed,
    Cancelled,
}

impl TaskState {
    /// Terminal states cannot transition further (except by retry-cloning).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }

    /// Active states occupy the duplicate-suppression window used by the
    /// cron scheduler.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Enqueued | Self::Waiting | Self::Doing)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Enqueued => "enqueued",
            Self::Waiting => "waiting",
            Self::Doing => "doing",
            Self::Stopped => "stopped",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Severity of a task log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "queued_task_log_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TaskLogLevel {
    Critical,
    Error,
    Warning,
    Info,
    Debug,
}

impl std::fmt::Display for TaskLogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Critical => "critical",
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Info => "info",
            Self::Debug => "debug",
        };
        write!(f, "{s}")
    }
}

/// A task row from `queued_tasks`.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct QueuedTask {
    pub id: i64,
    pub name: String,
    pub module_name: Option<String>,
    pub function_name: Option<String>,
    #[serde(skip_serializing)]
    pub serialized_function: Option<Vec<u8>>,
    pub state: TaskState,
    /// JSON array of positional arguments.
    pub args: serde_json::Value,
    /// JSON object of named arguments.
    pub kwargs: serde_json::Value,
    /// JSON object restored into ambient task context before execution.
    /// Keys starting with `_` carry framework-level context.
    pub context: serde_json::Value,
    pub parent_task_id: Option<i64>,
    pub exception_name: Option<String>,
    pub exception_message: Option<String>,
    pub exception_info: Option<String>,
    pub execution_time: f64,
    pub auto_remove: bool,
    pub date_enqueued: Option<DateTime<Utc>>,
    pub date_started: Option<DateTime<Utc>>,
    pub date_stopped: Option<DateTime<Utc>>,
    pub date_ended: Option<DateTime<Utc>>,
    pub date_done: Option<DateTime<Utc>>,
    pub date_cancelled: Option<DateTime<Utc>>,
    pub date_failed: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueuedTask {
    pub fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    /// Dotted path of the stored callable, when the (module, function)
    /// form is present.
    pub fn function_path(&self) -> Option<String> {
        match (&self.module_name, &self.function_name) {
            (Some(m), Some(f)) => Some(format!("{m}.{f}")),
            _ => None,
        }
    }

    pub fn can_be_restarted(&self) -> bool {
        matches!(self.state, TaskState::Stopped | TaskState::Failed)
    }

    pub fn can_be_cancelled(&self) -> bool {
        self.state.is_active()
    }
}

/// Input for inserting a task row.
///
/// Exactly one of `(module_name, function_name)` or `serialized_function`
/// must be set; `create_task` enforces this.
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub name: Option<String>,
    pub module_name: Option<String>,
    pub function_name: Option<String>,
    pub serialized_function: Option<Vec<u8>>,
    pub args: serde_json::Value,
    pub kwargs: serde_json::Value,
    pub context: serde_json::Value,
    pub parent_task_id: Option<i64>,
    pub auto_remove: bool,
    /// When set in the future, the task is not selected until due.
    pub date_enqueued: Option<DateTime<Utc>>,
}

impl NewTask {
    pub fn new(module_name: impl Into<String>, function_name: impl Into<String>) -> Self {
        Self {
            module_name: Some(module_name.into()),
            function_name: Some(function_name.into()),
            args: serde_json::Value::Array(vec![]),
            kwargs: serde_json::Value::Object(serde_json::Map::new()),
            context: serde_json::Value::Object(serde_json::Map::new()),
            ..Default::default()
        }
    }

    /// Name fallback: `module.function` when no explicit name is given.
    pub fn resolved_name(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        match (&self.module_name, &self.function_name) {
            (Some(m), Some(f)) => format!("{m}.{f}"),
            _ => "local_function".to_string(),
        }
    }
}

/// Failure snapshot persisted on a failed task row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub exception_name: String,
    pub exception_message: String,
    pub exception_info: Option<String>,
}

impl TaskFailure {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            exception_name: name.into(),
            exception_message: message.into(),
            exception_info: None,
        }
    }

    pub fn with_info(mut self, info: impl Into<String>) -> Self {
        self.exception_info = Some(info.into());
        self
    }
}

/// A log row from `queued_task_logs`.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct QueuedTaskLog {
    pub id: i64,
    pub task_id: i64,
    pub log_type: TaskLogLevel,
    pub logged_at: DateTime<Utc>,
    pub name: Option<String>,
    pub message: Option<String>,
    pub info: Option<String>,
}

/// Input for appending a task log entry.
#[derive(Debug, Clone)]
pub struct NewTaskLog {
    pub task_id: i64,
    pub log_type: TaskLogLevel,
    pub name: Option<String>,
    pub message: Option<String>,
    pub info: Option<String>,
}

/// A worker record row from `queued_task_workers`.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct WorkerRecord {
    pub id: i64,
    pub server_name: String,
    pub max_workers: i32,
    pub active_workers: i32,
    pub idle_workers: i32,
    pub is_running: bool,
    pub last_heartbeat: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub version: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkerRecord {
    pub fn total_workers(&self) -> i32 {
        self.active_workers + self.idle_workers
    }

    /// A server is alive when it is running and its heartbeat is no older
    /// than two minutes.
    pub fn is_alive(&self, now: DateTime<Utc>) -> bool {
        self.is_running && (now - self.last_heartbeat).num_seconds() < 120
    }
}

/// Aggregate fleet view over alive servers.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FleetView {
    pub servers: usize,
    pub max_workers: i64,
    pub active_workers: i64,
    pub idle_workers: i64,
    pub total_workers: i64,
    pub servers_detail: Vec<WorkerRecord>,
}

/// Per-state task counts for status surfaces.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskStateCounts {
    pub total: i64,
    pub enqueued: i64,
    pub waiting: i64,
    pub doing: i64,
    pub stopped: i64,
    pub done: i64,
    pub failed: i64,
    pub cancelled: i64,
}

/// Payload published on the notification channel when a row enters
/// `enqueued`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskNotification {
    pub task_id: i64,
    pub state: String,
    pub module_name: Option<String>,
    pub function_name: Option<String>,
    pub created_at: String,
}
