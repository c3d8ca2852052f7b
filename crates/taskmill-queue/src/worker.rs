//! Queue worker
//!
//! Executes one assigned task to a terminal state per attempt: parent
//! recheck, pre-run hooks, callable resolution, body execution inside the
//! ambient task scope, a second parent recheck, then the terminal write
//! under a bounded retry loop. `run_task` never propagates an error; it
//! always returns a report.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde_json::Value;
use taskmill_storage::{QueuedTask, StoreError, TaskFailure, TaskState, TaskStore};
use tracing::{debug, info, warn};

use crate::context::{self, TaskScope};
use crate::error::TaskError;
use crate::functions::{FunctionRegistry, TaskArgs, TaskKwargs};
use crate::hooks::HookRegistry;

const TERMINAL_WRITE_ATTEMPTS: u32 = 3;
const TERMINAL_WRITE_BASE_DELAY: Duration = Duration::from_millis(50);

/// Outcome of one task attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    Error,
}

/// Result of `QueueWorker::run_task`.
#[derive(Debug, Clone)]
pub struct TaskRunReport {
    pub task_id: i64,
    pub worker_id: String,
    pub status: RunStatus,
    pub error: Option<String>,
}

impl TaskRunReport {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }
}

/// Individual worker that executes a single task at a time.
pub struct QueueWorker {
    worker_id: String,
    store: Arc<dyn TaskStore>,
    hooks: Arc<HookRegistry>,
    functions: Arc<FunctionRegistry>,
}

impl QueueWorker {
    pub fn new(
        worker_id: String,
        store: Arc<dyn TaskStore>,
        hooks: Arc<HookRegistry>,
        functions: Arc<FunctionRegistry>,
    ) -> Self {
        Self {
            worker_id,
            store,
            hooks,
            functions,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Execute a single queued task.
    pub async fn run_task(&self, task: QueuedTask) -> TaskRunReport {
        let task_id = task.id;
        info!(
            worker_id = %self.worker_id,
            task_id,
            name = %task.name,
            "worker starting task"
        );

        // First check: the parent must still be done before we start.
        if let Some(parent_id) = task.parent_task_id {
            match self.check_parent(parent_id).await {
                Ok(()) => {}
                Err(parent_state) => {
                    warn!(
                        task_id,
                        parent_id,
                        parent_state = %parent_state,
                        "parent not ready, aborting child"
                    );
                    let failure = TaskFailure::new(
                        "ParentTaskNotReady",
                        format!("Parent task {parent_id} is {parent_state}"),
                    )
                    .with_info("Parent task is not in 'done' state, cannot execute child");
                    self.write_failure(task_id, &failure).await;
                    return self.error_report(task_id, format!("Parent task {parent_id} not ready"));
                }
            }
        }

        if let Err(e) = self.store.mark_doing(task_id).await {
            warn!(task_id, error = %e, "could not mark task doing");
            return self.error_report(task_id, e.to_string());
        }

        self.hooks.trigger_pre_run(&task).await;

        let outcome = self.execute_task_function(&task).await;

        match outcome {
            Ok(result) => {
                // Second check: the parent may have failed while we ran.
                if let Some(parent_id) = task.parent_task_id {
                    if let Err(parent_state) = self.check_parent(parent_id).await {
                        warn!(
                            task_id,
                            parent_id,
                            parent_state = %parent_state,
                            "parent changed state during execution, failing child"
                        );
                        let failure = TaskFailure::new(
                            "ParentTaskFailed",
                            format!("Parent task {parent_id} is {parent_state}"),
                        )
                        .with_info(format!(
                            "Parent task changed state to {parent_state} during child execution"
                        ));
                        self.write_failure(task_id, &failure).await;
                        self.hooks
                            .trigger_post_run(
                                &task,
                                None,
                                Some(&TaskError::new(
                                    "ParentTaskFailed",
                                    format!("Parent task {parent_id} failed"),
                                )),
                            )
                            .await;
                        return self
                            .error_report(task_id, format!("Parent task {parent_id} failed"));
                    }
                }

                let write = if task.auto_remove {
                    let store = Arc::clone(&self.store);
                    self.write_with_retry(move || {
                        let store = Arc::clone(&store);
                        async move { store.delete_task(task_id).await.map(|_| ()) }
                    })
                    .await
                } else {
                    let store = Arc::clone(&self.store);
                    self.write_with_retry(move || {
                        let store = Arc::clone(&store);
                        async move { store.mark_done(task_id).await }
                    })
                    .await
                };
                if let Err(e) = write {
                    warn!(task_id, error = %e, "failed to persist success state");
                }

                self.hooks.trigger_post_run(&task, Some(&result), None).await;

                info!(worker_id = %self.worker_id, task_id, "worker completed task");
                TaskRunReport {
                    task_id,
                    worker_id: self.worker_id.clone(),
                    status: RunStatus::Success,
                    error: None,
                }
            }
            Err(task_error) => {
                let failure = TaskFailure {
                    exception_name: task_error.kind.clone(),
                    exception_message: task_error.message.clone(),
                    exception_info: task_error.detail.clone(),
                };
                self.write_failure(task_id, &failure).await;

                self.hooks.trigger_post_run(&task, None, Some(&task_error)).await;

                warn!(
                    worker_id = %self.worker_id,
                    task_id,
                    error = %task_error,
                    "worker failed task"
                );
                self.error_report(task_id, task_error.to_string())
            }
        }
    }

    fn error_report(&self, task_id: i64, error: String) -> TaskRunReport {
        TaskRunReport {
            task_id,
            worker_id: self.worker_id.clone(),
            status: RunStatus::Error,
            error: Some(error),
        }
    }

    /// Ok when the parent exists and is done; otherwise the observed state
    /// (or `not_found`).
    async fn check_parent(&self, parent_id: i64) -> Result<(), String> {
        match self.store.get_task(parent_id).await {
            Ok(Some(parent)) if parent.state == TaskState::Done => Ok(()),
            Ok(Some(parent)) => Err(parent.state.to_string()),
            Ok(None) => Err("not_found".to_string()),
            Err(e) => Err(format!("unreadable ({e})")),
        }
    }

    /// Resolve the stored callable and run it inside the task scope.
    async fn execute_task_function(&self, task: &QueuedTask) -> Result<Value, TaskError> {
        if task.serialized_function.is_some() {
            return Err(TaskError::new(
                "UnsupportedPayload",
                "serialized callables cannot be executed by this runtime",
            ));
        }

        let (module, function) = match (&task.module_name, &task.function_name) {
            (Some(m), Some(f)) => (m.clone(), f.clone()),
            _ => {
                return Err(TaskError::new(
                    "InvalidPayload",
                    "task has neither a callable pair nor a serialized function",
                ))
            }
        };

        let task_fn = self.functions.resolve(&module, &function).ok_or_else(|| {
            TaskError::new(
                "FunctionNotRegistered",
                format!("task function '{module}.{function}' is not registered"),
            )
        })?;

        let args: TaskArgs = match &task.args {
            Value::Array(items) => items.clone(),
            Value::Null => vec![],
            other => {
                return Err(TaskError::new(
                    "TypeError",
                    format!("task args must be a JSON array, got {other}"),
                ))
            }
        };
        let kwargs: TaskKwargs = match &task.kwargs {
            Value::Object(map) => map.clone(),
            Value::Null => TaskKwargs::new(),
            other => {
                return Err(TaskError::new(
                    "TypeError",
                    format!("task kwargs must be a JSON object, got {other}"),
                ))
            }
        };

        debug!(task_id = task.id, function = %task_fn.path(), "executing task function");

        let scope = TaskScope::new(task.clone(), Some(Arc::clone(&self.store)));
        context::enter(scope, task_fn.invoke(args, kwargs)).await
    }

    async fn write_failure(&self, task_id: i64, failure: &TaskFailure) {
        let store = Arc::clone(&self.store);
        let failure = failure.clone();
        let result = self
            .write_with_retry(move || {
                let store = Arc::clone(&store);
                let failure = failure.clone();
                async move { store.mark_failed(task_id, &failure).await }
            })
            .await;
        if let Err(e) = result {
            warn!(task_id, error = %e, "failed to persist failure state");
        }
    }

    /// Run a small terminal write with up to 3 attempts.
    ///
    /// Retry only fires on detectable transient conditions (serialization
    /// conflict, deadlock); the delay is 50 ms doubled per attempt plus
    /// jitter. The last error is surfaced at warning level by callers.
    async fn write_with_retry<F, Fut>(&self, op: F) -> Result<(), StoreError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<(), StoreError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match op().await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < TERMINAL_WRITE_ATTEMPTS - 1 => {
                    let jitter = rand::thread_rng().gen_range(0..50);
                    let delay = TERMINAL_WRITE_BASE_DELAY * 2u32.pow(attempt)
                        + Duration::from_millis(jitter);
                    debug!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "transient db error on terminal write, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
