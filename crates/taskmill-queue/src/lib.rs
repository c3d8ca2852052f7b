//! # Taskmill queue runtime
//!
//! A PostgreSQL-backed distributed task queue:
//!
//! - **Durable tasks**: every task is a row with a seven-state lifecycle,
//!   payload, parent link, timing, and failure snapshot
//! - **Instant wake-up**: a database trigger publishes on NOTIFY for every
//!   row landing in `enqueued`; polling is the fallback
//! - **Dependency ordering**: children run only after their parent is
//!   done; a parent's failure or cancellation cascades to descendants
//! - **Cron scheduling**: registered definitions materialize tasks at
//!   minute boundaries with per-name duplicate suppression
//! - **Fleet visibility**: every manager heartbeats a server record that
//!   monitoring aggregates into a global view
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    QueueWorkerManager                    │
//! │  (listener, fallback poll, heartbeat, cron scheduler)    │
//! └──────────────────────────────────────────────────────────┘
//!               │ ready tasks              │ heartbeats
//!               ▼                          ▼
//! ┌──────────────────────────┐   ┌────────────────────────┐
//! │        WorkerPool        │   │       TaskStore        │
//! │  (bounded, idle reaper)  │   │  (queued_tasks, logs,  │
//! └──────────────────────────┘   │    worker records)     │
//!               │ run_task       └────────────────────────┘
//!               ▼                          ▲
//! ┌──────────────────────────┐             │ rows
//! │       QueueWorker        │─────────────┘
//! │ (hooks, task scope, body)│
//! └──────────────────────────┘
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod functions;
pub mod hooks;
pub mod logging;
pub mod manager;
pub mod ops;
pub mod pool;
pub mod scheduler;
pub mod task_ref;
pub mod tasks;
pub mod worker;

pub use config::QueueConfig;
pub use context::{
    clear_context, current_task, current_task_id, get_context, get_context_or, get_full_context,
    set_context, set_full_context, TaskScope,
};
pub use error::{QueueError, TaskError};
pub use functions::{FunctionRegistry, TaskArgs, TaskFnResult, TaskFunction, TaskKwargs};
pub use hooks::HookRegistry;
pub use logging::TaskLogger;
pub use manager::{ManagerSnapshot, QueueWorkerManager};
pub use pool::{PoolStats, WorkerPool};
pub use scheduler::{cron_matches, CronScheduler, RunAt, ScheduledTaskDef, ScheduledTaskRegistry, Scheduler};
pub use task_ref::TaskRef;
pub use tasks::{QueuedTasks, TaskCall};
pub use worker::{QueueWorker, RunStatus, TaskRunReport};
