//! Task function registry
//!
//! Tasks reference their callable by a (module, function) name pair. This
//! registry is the lookup table those pairs resolve against: functions are
//! registered once at startup, and the worker rejects rows naming anything
//! unregistered. Closure payloads are not supported; submission refuses
//! them.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use crate::error::TaskError;

/// Positional arguments, decoded from the task row's JSON array.
pub type TaskArgs = Vec<Value>;

/// Named arguments, decoded from the task row's JSON object.
pub type TaskKwargs = serde_json::Map<String, Value>;

/// Result of a task body.
pub type TaskFnResult = Result<Value, TaskError>;

type BoxedTaskFuture = Pin<Box<dyn Future<Output = TaskFnResult> + Send>>;
type BoxedTaskFn = Arc<dyn Fn(TaskArgs, TaskKwargs) -> BoxedTaskFuture + Send + Sync>;

/// A registered task function.
pub struct TaskFunction {
    module: String,
    name: String,
    f: BoxedTaskFn,
}

impl TaskFunction {
    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Dotted path, `module.function`.
    pub fn path(&self) -> String {
        format!("{}.{}", self.module, self.name)
    }

    pub(crate) fn invoke(&self, args: TaskArgs, kwargs: TaskKwargs) -> BoxedTaskFuture {
        (self.f)(args, kwargs)
    }
}

impl std::fmt::Debug for TaskFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskFunction")
            .field("module", &self.module)
            .field("name", &self.name)
            .finish()
    }
}

/// Registry of task functions keyed by dotted path.
#[derive(Default)]
pub struct FunctionRegistry {
    functions: RwLock<HashMap<String, Arc<TaskFunction>>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an async task function.
    ///
    /// Re-registering a path replaces the previous entry.
    pub fn register<F, Fut>(&self, module: &str, name: &str, f: F) -> Arc<TaskFunction>
    where
        F: Fn(TaskArgs, TaskKwargs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskFnResult> + Send + 'static,
    {
        let boxed: BoxedTaskFn = Arc::new(move |args, kwargs| Box::pin(f(args, kwargs)));
        self.insert(module, name, boxed)
    }

    /// Register a blocking (synchronous) task function.
    ///
    /// The body runs on the blocking thread pool so it never stalls the
    /// event loop.
    pub fn register_blocking<F>(&self, module: &str, name: &str, f: F) -> Arc<TaskFunction>
    where
        F: Fn(TaskArgs, TaskKwargs) -> TaskFnResult + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let boxed: BoxedTaskFn = Arc::new(move |args, kwargs| {
            let f = Arc::clone(&f);
            Box::pin(async move {
                tokio::task::spawn_blocking(move || f(args, kwargs))
                    .await
                    .map_err(|e| TaskError::new("JoinError", e.to_string()))?
            })
        });
        self.insert(module, name, boxed)
    }

    fn insert(&self, module: &str, name: &str, f: BoxedTaskFn) -> Arc<TaskFunction> {
        let function = Arc::new(TaskFunction {
            module: module.to_string(),
            name: name.to_string(),
            f,
        });
        let path = function.path();
        let previous = self
            .functions
            .write()
            .insert(path.clone(), Arc::clone(&function));
        if previous.is_some() {
            tracing::warn!(path, "task function re-registered, overwriting");
        } else {
            tracing::debug!(path, "registered task function");
        }
        function
    }

    pub fn resolve(&self, module: &str, name: &str) -> Option<Arc<TaskFunction>> {
        self.functions.read().get(&format!("{module}.{name}")).cloned()
    }

    pub fn contains(&self, module: &str, name: &str) -> bool {
        self.functions.read().contains_key(&format!("{module}.{name}"))
    }

    pub fn len(&self) -> usize {
        self.functions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.read().is_empty()
    }
}
