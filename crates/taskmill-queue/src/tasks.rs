//! Task submission API
//!
//! Translates caller requests into durable task rows. Non-blocking
//! submission goes through an in-process creation queue with a single
//! consumer, so a caller may pass the handle of a parent task that has not
//! been inserted yet: requests without a parent are created first, in
//! submission order, then requests with a parent await the parent's
//! resolved id.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use taskmill_storage::{NewTask, QueuedTask, TaskState, TaskStore};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::error::QueueError;
use crate::functions::FunctionRegistry;
use crate::hooks::HookRegistry;
use crate::task_ref::{CreationState, TaskRef};

/// A task invocation under construction.
///
/// Payload values go through `serde_json::to_value` at the builder
/// boundary, so non-serializable arguments fail synchronously.
#[derive(Debug, Clone)]
pub struct TaskCall {
    module: String,
    function: String,
    args: Vec<Value>,
    kwargs: Map<String, Value>,
    context: Map<String, Value>,
    name: Option<String>,
    auto_remove: bool,
    date_enqueued: Option<DateTime<Utc>>,
}

impl TaskCall {
    pub fn new(module: impl Into<String>, function: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            function: function.into(),
            args: vec![],
            kwargs: Map::new(),
            context: Map::new(),
            name: None,
            auto_remove: false,
            date_enqueued: None,
        }
    }

    pub fn path(&self) -> String {
        format!("{}.{}", self.module, self.function)
    }

    /// Append a positional argument.
    pub fn arg<T: Serialize>(mut self, value: T) -> Result<Self, QueueError> {
        let value = serde_json::to_value(value)
            .map_err(|e| QueueError::Validation(format!("non-serializable argument: {e}")))?;
        self.args.push(value);
        Ok(self)
    }

    /// Set a named argument.
    pub fn kwarg<T: Serialize>(mut self, key: &str, value: T) -> Result<Self, QueueError> {
        let value = serde_json::to_value(value).map_err(|e| {
            QueueError::Validation(format!("non-serializable argument '{key}': {e}"))
        })?;
        self.kwargs.insert(key.to_string(), value);
        Ok(self)
    }

    /// Seed a key of the execution context.
    pub fn context_value<T: Serialize>(mut self, key: &str, value: T) -> Result<Self, QueueError> {
        let value = serde_json::to_value(value).map_err(|e| {
            QueueError::Validation(format!("non-serializable context value '{key}': {e}"))
        })?;
        self.context.insert(key.to_string(), value);
        Ok(self)
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Delete the row after successful execution.
    pub fn auto_remove(mut self, auto_remove: bool) -> Self {
        self.auto_remove = auto_remove;
        self
    }

    /// Delay selection until the given instant.
    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.date_enqueued = Some(at);
        self
    }

    /// Set a name only when the caller has not chosen one.
    pub(crate) fn with_default_name(mut self, name: String) -> Self {
        self.name.get_or_insert(name);
        self
    }

    fn into_new_task(self, parent_task_id: Option<i64>) -> NewTask {
        NewTask {
            name: self.name,
            module_name: Some(self.module),
            function_name: Some(self.function),
            serialized_function: None,
            args: Value::Array(self.args),
            kwargs: Value::Object(self.kwargs),
            context: Value::Object(self.context),
            parent_task_id,
            auto_remove: self.auto_remove,
            date_enqueued: self.date_enqueued,
        }
    }
}

struct CreationRequest {
    call: TaskCall,
    parent: Option<TaskRef>,
    tx: watch::Sender<CreationState>,
}

struct QueuedTasksInner {
    store: Arc<dyn TaskStore>,
    hooks: Arc<HookRegistry>,
    functions: Arc<FunctionRegistry>,
    creation_queue: parking_lot::Mutex<Vec<CreationRequest>>,
    consumer: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

/// Queued task management service.
#[derive(Clone)]
pub struct QueuedTasks {
    inner: Arc<QueuedTasksInner>,
}

impl QueuedTasks {
    pub fn new(
        store: Arc<dyn TaskStore>,
        hooks: Arc<HookRegistry>,
        functions: Arc<FunctionRegistry>,
    ) -> Self {
        Self {
            inner: Arc::new(QueuedTasksInner {
                store,
                hooks,
                functions,
                creation_queue: parking_lot::Mutex::new(Vec::new()),
                consumer: parking_lot::Mutex::new(None),
            }),
        }
    }

    pub fn store(&self) -> Arc<dyn TaskStore> {
        Arc::clone(&self.inner.store)
    }

    pub fn functions(&self) -> Arc<FunctionRegistry> {
        Arc::clone(&self.inner.functions)
    }

    pub fn hooks(&self) -> Arc<HookRegistry> {
        Arc::clone(&self.inner.hooks)
    }

    fn validate_call(&self, call: &TaskCall) -> Result<(), QueueError> {
        if !self.inner.functions.contains(&call.module, &call.function) {
            return Err(QueueError::Validation(format!(
                "task function '{}' is not registered",
                call.path()
            )));
        }
        Ok(())
    }

    /// Enqueue a task without blocking on the insert.
    ///
    /// Returns a `TaskRef` whose id resolves once the creation queue
    /// processes the request. `parent` may be a ref whose own row has not
    /// been inserted yet.
    pub fn add_task(
        &self,
        call: TaskCall,
        parent: Option<&TaskRef>,
    ) -> Result<TaskRef, QueueError> {
        self.validate_call(&call)?;

        let (task_ref, tx) = TaskRef::new(Arc::clone(&self.inner.store));
        self.inner.creation_queue.lock().push(CreationRequest {
            call,
            parent: parent.cloned(),
            tx,
        });
        self.ensure_consumer();
        Ok(task_ref)
    }

    fn ensure_consumer(&self) {
        let mut consumer = self.inner.consumer.lock();
        let running = consumer.as_ref().is_some_and(|h| !h.is_finished());
        if !running {
            let inner = Arc::clone(&self.inner);
            *consumer = Some(tokio::spawn(process_creation_queue(inner)));
        }
    }

    /// Synchronous variant: create the row immediately and return it.
    pub async fn add_task_blocking(
        &self,
        call: TaskCall,
        parent_task_id: Option<i64>,
    ) -> Result<QueuedTask, QueueError> {
        self.validate_call(&call)?;

        if let Some(parent_id) = parent_task_id {
            if self.inner.store.get_task(parent_id).await?.is_none() {
                return Err(QueueError::Validation(format!(
                    "parent task {parent_id} not found"
                )));
            }
        }

        self.create_task(call.into_new_task(parent_task_id)).await
    }

    /// Typed low-level insert: runs pre-create hooks, inserts, runs
    /// post-create hooks.
    pub async fn create_task(&self, new: NewTask) -> Result<QueuedTask, QueueError> {
        if new.serialized_function.is_some() {
            return Err(QueueError::Validation(
                "serialized callables are not supported; submit a registered \
                 (module, function) pair instead"
                    .to_string(),
            ));
        }
        if new.module_name.is_none() || new.function_name.is_none() {
            return Err(QueueError::Validation(
                "a task requires both module_name and function_name".to_string(),
            ));
        }

        let new = self.inner.hooks.trigger_pre_create(new).await;
        let task = self.inner.store.create_task(new).await?;
        self.inner.hooks.trigger_post_create(&task).await;
        Ok(task)
    }

    /// Retry a task by id.
    ///
    /// A `stopped` task is re-enqueued in place. A terminal task is cloned
    /// with a fresh payload copy and a `_retry` name suffix. Retrying an
    /// `enqueued` or `doing` task is rejected.
    pub async fn retry_task(&self, task_id: i64) -> Result<QueuedTask, QueueError> {
        let task = self
            .inner
            .store
            .get_task(task_id)
            .await?
            .ok_or(QueueError::TaskNotFound(task_id))?;

        match task.state {
            TaskState::Enqueued => Err(QueueError::Validation(format!(
                "task {task_id} is already enqueued"
            ))),
            TaskState::Doing => Err(QueueError::Validation(format!(
                "task {task_id} is currently running"
            ))),
            TaskState::Stopped => Ok(self.inner.store.requeue(task_id).await?),
            _ => {
                // Clones bypass hooks; the original creation already ran them.
                let clone = self
                    .inner
                    .store
                    .create_task(NewTask {
                        name: Some(format!("{}_retry", task.name)),
                        module_name: task.module_name,
                        function_name: task.function_name,
                        serialized_function: task.serialized_function,
                        args: task.args,
                        kwargs: task.kwargs,
                        context: task.context,
                        parent_task_id: task.parent_task_id,
                        auto_remove: task.auto_remove,
                        date_enqueued: None,
                    })
                    .await?;
                Ok(clone)
            }
        }
    }

    /// Cancel a task by id. A missing id is a silent no-op.
    pub async fn cancel_task(&self, task_id: i64) -> Result<(), QueueError> {
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

    pub async fn get_task(&self, task_id: i64) -> Result<Option<QueuedTask>, QueueError> {
        Ok(self.inner.store.get_task(task_id).await?)
    }

    pub async fn pending_count(&self) -> Result<i64, QueueError> {
        Ok(self.inner.store.pending_count().await?)
    }

    async fn create_for_request(
        inner: &Arc<QueuedTasksInner>,
        call: TaskCall,
        parent_task_id: Option<i64>,
    ) -> Result<i64, QueueError> {
        if let Some(parent_id) = parent_task_id {
            if inner.store.get_task(parent_id).await?.is_none() {
                return Err(QueueError::Validation(format!(
                    "parent task {parent_id} not found"
                )));
            }
        }

        let new = inner.hooks.trigger_pre_create(call.into_new_task(parent_task_id)).await;
        let task = inner.store.create_task(new).await?;
        inner.hooks.trigger_post_create(&task).await;
        Ok(task.id)
    }
}

/// Single consumer for the creation queue.
///
/// Each drained batch is processed in two passes so that a parent handle
/// submitted in the same batch resolves before any of its children insert.
async fn process_creation_queue(inner: Arc<QueuedTasksInner>) {
    loop {
        let requests: Vec<CreationRequest> = {
            let mut queue = inner.creation_queue.lock();
            std::mem::take(&mut *queue)
        };
        if requests.is_empty() {
            break;
        }

        let (no_parent, with_parent): (Vec<_>, Vec<_>) =
            requests.into_iter().partition(|r| r.parent.is_none());

        for request in no_parent {
            match QueuedTasks::create_for_request(&inner, request.call, None).await {
                Ok(task_id) => {
                    debug!(task_id, "created task (no parent)");
                    let _ = request.tx.send(CreationState::Created(task_id));
                }
                Err(e) => {
                    error!(error = %e, "failed to create task");
                    let _ = request.tx.send(CreationState::Failed(e.to_string()));
                }
            }
        }

        for request in with_parent {
            let parent = request.parent.expect("partitioned on parent presence");
            match parent.task_id().await {
                Ok(parent_id) => {
                    match QueuedTasks::create_for_request(&inner, request.call, Some(parent_id))
                        .await
                    {
                        Ok(task_id) => {
                            debug!(task_id, parent_id, "created task");
                            let _ = request.tx.send(CreationState::Created(task_id));
                        }
                        Err(e) => {
                            error!(error = %e, "failed to create task with parent");
                            let _ = request.tx.send(CreationState::Failed(e.to_string()));
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "parent task creation failed");
                    let _ = request
                        .tx
                        .send(CreationState::Failed(format!("parent not created: {e}")));
                }
            }
        }
    }
}
