//! Ambient task context
//!
//! Two slots scoped to the running task: the current task handle and a
//! mutable execution context initialized from the row's `context` field.
//! The slots are task-local, so concurrent executions never observe each
//! other; entering a nested scope shadows the outer one and restores it on
//! exit.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use taskmill_storage::{QueuedTask, TaskStore};
use tracing::{debug, error};

tokio::task_local! {
    static TASK_SCOPE: Arc<TaskScope>;
}

/// Per-task ambient state installed by the worker around the task body.
pub struct TaskScope {
    task: QueuedTask,
    context: Mutex<Map<String, Value>>,
    store: Option<Arc<dyn TaskStore>>,
}

impl TaskScope {
    /// Build a scope for `task`, seeding the execution context from its
    /// persisted `context` field. When `store` is given, auto-commit
    /// writes flow back to it.
    pub fn new(task: QueuedTask, store: Option<Arc<dyn TaskStore>>) -> Arc<Self> {
        let context = task
            .context
            .as_object()
            .cloned()
            .unwrap_or_default();
        Arc::new(Self {
            task,
            context: Mutex::new(context),
            store,
        })
    }

    pub fn task(&self) -> &QueuedTask {
        &self.task
    }
}

/// Run `fut` with `scope` installed as the ambient task scope.
pub async fn enter<F>(scope: Arc<TaskScope>, fut: F) -> F::Output
where
    F: std::future::Future,
{
    TASK_SCOPE.scope(scope, fut).await
}

/// The task currently executing in this scope, if any.
pub fn current_task() -> Option<QueuedTask> {
    TASK_SCOPE.try_with(|scope| scope.task.clone()).ok()
}

pub fn current_task_id() -> Option<i64> {
    TASK_SCOPE.try_with(|scope| scope.task.id).ok()
}

fn get_path(map: &Map<String, Value>, path: &str) -> Option<Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut value = map.get(first)?;
    for key in segments {
        value = value.as_object()?.get(key)?;
    }
    Some(value.clone())
}

fn set_path(map: &mut Map<String, Value>, path: &str, value: Value) {
    let segments: Vec<&str> = path.split('.').collect();
    let mut current = map;
    for key in &segments[..segments.len() - 1] {
        let entry = current
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        current = entry.as_object_mut().expect("just ensured object");
    }
    current.insert(segments[segments.len() - 1].to_string(), value);
}

/// Read a value from the execution context using dotted-path notation,
/// e.g. `get_context("user.profile.name")`. Returns `None` when no task
/// scope is active or the path is absent.
pub fn get_context(path: &str) -> Option<Value> {
    TASK_SCOPE
        .try_with(|scope| get_path(&scope.context.lock(), path))
        .ok()
        .flatten()
}

/// Read with a fallback value.
pub fn get_context_or(path: &str, default: Value) -> Value {
    get_context(path).unwrap_or(default)
}

fn commit(scope: &Arc<TaskScope>, snapshot: Map<String, Value>) {
    let Some(store) = scope.store.clone() else {
        return;
    };
    let task_id = scope.task.id;
    // Fire and forget; failures must not break task execution.
    tokio::spawn(async move {
        if let Err(e) = store
            .update_context(task_id, &Value::Object(snapshot))
            .await
        {
            error!(task_id, error = %e, "failed to persist task context");
        }
    });
}

/// Write a value into the execution context using dotted-path notation,
/// creating intermediate objects as needed.
///
/// With `auto_commit`, a background write persists the full context to the
/// task row; write failures are logged, never propagated. Outside a task
/// scope this is a no-op.
pub fn set_context(path: &str, value: Value, auto_commit: bool) {
    let result = TASK_SCOPE.try_with(|scope| {
        let snapshot = {
            let mut context = scope.context.lock();
            set_path(&mut context, path, value);
            context.clone()
        };
        if auto_commit {
            commit(scope, snapshot);
        }
    });
    if result.is_err() {
        debug!(path, "set_context called outside a task scope");
    }
}

/// Clear the execution context. Does not auto-commit.
pub fn clear_context() {
    let _ = TASK_SCOPE.try_with(|scope| scope.context.lock().clear());
}

/// A copy of the complete execution context.
pub fn get_full_context() -> Map<String, Value> {
    TASK_SCOPE
        .try_with(|scope| scope.context.lock().clone())
        .unwrap_or_default()
}

/// Replace the entire execution context.
pub fn set_full_context(context: Map<String, Value>, auto_commit: bool) {
    let result = TASK_SCOPE.try_with(|scope| {
        *scope.context.lock() = context.clone();
        if auto_commit {
            commit(scope, context.clone());
        }
    });
    if result.is_err() {
        debug!("set_full_context called outside a task scope");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use taskmill_storage::{InMemoryTaskStore, NewTask, TaskState};

    fn task_with_context(context: Value) -> QueuedTask {
        let now = chrono::Utc::now();
        QueuedTask {
            id: 7,
            name: "m.f".into(),
            module_name: Some("m".into()),
            function_name: Some("f".into()),
            serialized_function: None,
            state: TaskState::Doing,
            args: json!([]),
            kwargs: json!({}),
            context,
            parent_task_id: None,
            exception_name: None,
            exception_message: None,
            exception_info: None,
            execution_time: 0.0,
            auto_remove: false,
            date_enqueued: Some(now),
            date_started: Some(now),
            date_stopped: None,
            date_ended: None,
            date_done: None,
            date_cancelled: None,
            date_failed: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn scope_exposes_task_and_context() {
        let scope = TaskScope::new(task_with_context(json!({"step": "init"})), None);
        enter(scope, async {
            assert_eq!(current_task_id(), Some(7));
            assert_eq!(current_task().unwrap().name, "m.f");
            assert_eq!(get_context("step"), Some(json!("init")));
        })
        .await;

        assert!(current_task().is_none());
        assert!(get_context("step").is_none());
    }

    #[tokio::test]
    async fn dotted_paths_create_nested_objects() {
        let scope = TaskScope::new(task_with_context(json!({})), None);
        enter(scope, async {
            set_context("user.profile.name", json!("Sam"), false);
            set_context("user.profile.age", json!(30), false);
            assert_eq!(get_context("user.profile.name"), Some(json!("Sam")));
            assert_eq!(
                get_context("user.profile"),
                Some(json!({"name": "Sam", "age": 30}))
            );
            assert!(get_context("user.missing").is_none());
            assert_eq!(get_context_or("user.missing", json!(0)), json!(0));
        })
        .await;
    }

    #[tokio::test]
    async fn concurrent_scopes_do_not_leak() {
        let scope_a = TaskScope::new(task_with_context(json!({})), None);
        let scope_b = TaskScope::new(task_with_context(json!({})), None);

        let a = tokio::spawn(enter(scope_a, async {
            set_context("who", json!("a"), false);
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            get_context("who")
        }));
        let b = tokio::spawn(enter(scope_b, async {
            set_context("who", json!("b"), false);
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            get_context("who")
        }));

        assert_eq!(a.await.unwrap(), Some(json!("a")));
        assert_eq!(b.await.unwrap(), Some(json!("b")));
    }

    #[tokio::test]
    async fn full_context_replace_and_clear() {
        let scope = TaskScope::new(task_with_context(json!({"old": 1})), None);
        enter(scope, async {
            let mut replacement = Map::new();
            replacement.insert("new".into(), json!(2));
            set_full_context(replacement, false);
            assert!(get_context("old").is_none());
            assert_eq!(get_context("new"), Some(json!(2)));

            clear_context();
            assert!(get_full_context().is_empty());
        })
        .await;
    }

    #[tokio::test]
    async fn auto_commit_persists_to_store() {
        let store = Arc::new(InMemoryTaskStore::new());
        let task = store
            .create_task(NewTask::new("m", "f"))
            .await
            .unwrap();
        let scope = TaskScope::new(task.clone(), Some(store.clone() as Arc<dyn TaskStore>));

        enter(scope, async {
            set_context("progress", json!(50), true);
        })
        .await;

        // The commit is a background write; poll briefly.
        let mut persisted = json!({});
        for _ in 0..50 {
            persisted = store.get_task(task.id).await.unwrap().unwrap().context;
            if persisted.get("progress").is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(persisted["progress"], json!(50));
    }

    #[tokio::test]
    async fn writers_outside_scope_are_noops() {
        set_context("anything", json!(1), true);
        clear_context();
        set_full_context(Map::new(), true);
        assert!(get_full_context().is_empty());
        assert!(get_context("anything").is_none());
    }
}
