//! Task lifecycle hook registry
//!
//! Four ordered hook lists surround task create and run. Hooks run in
//! registration order; a hook's error is logged with the hook name and
//! never re-raised.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use taskmill_storage::{NewTask, QueuedTask};
use tracing::{debug, error};

use crate::error::TaskError;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

type PreCreateHook = Arc<dyn Fn(NewTask) -> BoxFuture<Result<NewTask, String>> + Send + Sync>;
type TaskHook = Arc<dyn Fn(QueuedTask) -> BoxFuture<Result<(), String>> + Send + Sync>;
type PostRunHook = Arc<
    dyn Fn(QueuedTask, Option<Value>, Option<TaskError>) -> BoxFuture<Result<(), String>>
        + Send
        + Sync,
>;

struct Named<H> {
    name: String,
    hook: H,
}

/// Registry for task lifecycle hooks.
#[derive(Default)]
pub struct HookRegistry {
    pre_create: RwLock<Vec<Named<PreCreateHook>>>,
    post_create: RwLock<Vec<Named<TaskHook>>>,
    pre_run: RwLock<Vec<Named<TaskHook>>>,
    post_run: RwLock<Vec<Named<PostRunHook>>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook that runs after the task is built and before the
    /// first insert. The hook may rewrite the task (e.g. stamp framework
    /// context keys); on error the unmodified task is kept.
    pub fn on_pre_create<F, Fut>(&self, name: &str, f: F)
    where
        F: Fn(NewTask) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<NewTask, String>> + Send + 'static,
    {
        let hook: PreCreateHook = Arc::new(move |task| Box::pin(f(task)));
        self.pre_create.write().push(Named {
            name: name.to_string(),
            hook,
        });
        debug!(hook = name, "registered pre_create hook");
    }

    /// Register a hook that runs after the insert commits.
    pub fn on_post_create<F, Fut>(&self, name: &str, f: F)
    where
        F: Fn(QueuedTask) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        let hook: TaskHook = Arc::new(move |task| Box::pin(f(task)));
        self.post_create.write().push(Named {
            name: name.to_string(),
            hook,
        });
        debug!(hook = name, "registered post_create hook");
    }

    /// Register a hook that runs inside the worker before the task body.
    pub fn on_pre_run<F, Fut>(&self, name: &str, f: F)
    where
        F: Fn(QueuedTask) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        let hook: TaskHook = Arc::new(move |task| Box::pin(f(task)));
        self.pre_run.write().push(Named {
            name: name.to_string(),
            hook,
        });
        debug!(hook = name, "registered pre_run hook");
    }

    /// Register a hook that runs after the body or the terminal write.
    /// Exactly one of `result` / `error` is set.
    pub fn on_post_run<F, Fut>(&self, name: &str, f: F)
    where
        F: Fn(QueuedTask, Option<Value>, Option<TaskError>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        let hook: PostRunHook = Arc::new(move |task, result, err| Box::pin(f(task, result, err)));
        self.post_run.write().push(Named {
            name: name.to_string(),
            hook,
        });
        debug!(hook = name, "registered post_run hook");
    }

    /// Fold the task through the pre-create hooks in registration order.
    pub async fn trigger_pre_create(&self, mut task: NewTask) -> NewTask {
        let hooks: Vec<(String, PreCreateHook)> = self
            .pre_create
            .read()
            .iter()
            .map(|n| (n.name.clone(), Arc::clone(&n.hook)))
            .collect();

        for (name, hook) in hooks {
            match hook(task.clone()).await {
                Ok(updated) => task = updated,
                Err(e) => error!(hook = %name, error = %e, "error in pre_create hook"),
            }
        }
        task
    }

    pub async fn trigger_post_create(&self, task: &QueuedTask) {
        let hooks: Vec<(String, TaskHook)> = self
            .post_create
            .read()
            .iter()
            .map(|n| (n.name.clone(), Arc::clone(&n.hook)))
            .collect();

        for (name, hook) in hooks {
            if let Err(e) = hook(task.clone()).await {
                error!(hook = %name, error = %e, "error in post_create hook");
            }
        }
    }

    pub async fn trigger_pre_run(&self, task: &QueuedTask) {
        let hooks: Vec<(String, TaskHook)> = self
            .pre_run
            .read()
            .iter()
            .map(|n| (n.name.clone(), Arc::clone(&n.hook)))
            .collect();

        for (name, hook) in hooks {
            if let Err(e) = hook(task.clone()).await {
                error!(hook = %name, error = %e, "error in pre_run hook");
            }
        }
    }

    pub async fn trigger_post_run(
        &self,
        task: &QueuedTask,
        result: Option<&Value>,
        error_value: Option<&TaskError>,
    ) {
        let hooks: Vec<(String, PostRunHook)> = self
            .post_run
            .read()
            .iter()
            .map(|n| (n.name.clone(), Arc::clone(&n.hook)))
            .collect();

        for (name, hook) in hooks {
            if let Err(e) = hook(task.clone(), result.cloned(), error_value.cloned()).await {
                error!(hook = %name, error = %e, "error in post_run hook");
            }
        }
    }

    /// Clear all registered hooks (useful for testing).
    pub fn clear(&self) {
        self.pre_create.write().clear();
        self.post_create.write().clear();
        self.pre_run.write().clear();
        self.post_run.write().clear();
    }
}
